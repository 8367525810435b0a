//! # Replication Certificates
//!
//! Certificate descriptors, thumbprints and hub certificate generation.
//!
//! The TLS layer that proves possession of a certificate is outside this crate;
//! here a certificate is the opaque public blob the transport authenticated,
//! identified by its thumbprint.
//!
//! ## Invariants
//! - Thumbprints are SHA-256 over the encoded public certificate, upper-case hex
//! - Thumbprint comparison is constant-time

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::replication::{ReplicationError, ReplicationResult};

/// Public description of a certificate, stored on access grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CertificateInfo {
    pub subject: String,
    pub thumbprint: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// Base64 public key material
    pub public_key: String,
}

impl CertificateInfo {
    /// Check the validity window.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now <= self.not_after
    }
}

/// Encoded body of a public certificate.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CertificateBody {
    subject: String,
    serial: Uuid,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    public_key: String,
}

/// Encoded certificate together with its private key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CertificateBundleBody {
    certificate: String,
    private_key: String,
}

/// A parsed public certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCertificate {
    pub info: CertificateInfo,
    /// Base64 of the encoded public certificate, as presented on the wire
    pub encoded: String,
}

/// A certificate with its private key, as held by a sink.
#[derive(Debug, Clone)]
pub struct CertificateBundle {
    pub certificate: ParsedCertificate,
    private_key: Vec<u8>,
}

impl CertificateBundle {
    /// Length of the private key material.
    pub fn private_key_len(&self) -> usize {
        self.private_key.len()
    }
}

/// Output of hub certificate generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GeneratedCertificate {
    /// Base64 public certificate, to register on the hub
    pub public_key: String,
    /// Base64 certificate with private key, to configure on the sink
    pub certificate: String,
    pub thumbprint: String,
}

/// Compute the thumbprint of encoded certificate bytes.
pub fn thumbprint(encoded: &[u8]) -> String {
    let digest = Sha256::digest(encoded);
    digest.iter().map(|b| format!("{:02X}", b)).collect()
}

/// Constant-time comparison of two thumbprints.
///
/// Case-insensitive: thumbprints are normalised to upper case first.
pub fn thumbprints_equal(a: &str, b: &str) -> bool {
    let a = a.to_ascii_uppercase();
    let b = b.to_ascii_uppercase();
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Parse a base64 public certificate.
pub fn parse_certificate(encoded: &str) -> ReplicationResult<ParsedCertificate> {
    let bytes = STANDARD.decode(encoded.trim()).map_err(|e| {
        ReplicationError::invalid_configuration(format!("certificate is not valid base64: {}", e))
    })?;
    let body: CertificateBody = serde_json::from_slice(&bytes).map_err(|e| {
        ReplicationError::invalid_configuration(format!("certificate could not be parsed: {}", e))
    })?;
    if body.not_after <= body.not_before {
        return Err(ReplicationError::invalid_configuration(
            "certificate validity window is empty",
        ));
    }
    Ok(ParsedCertificate {
        info: CertificateInfo {
            subject: body.subject,
            thumbprint: thumbprint(&bytes),
            not_before: body.not_before,
            not_after: body.not_after,
            public_key: body.public_key,
        },
        encoded: encoded.trim().to_string(),
    })
}

/// Parse a base64 certificate bundle carrying a private key.
pub fn parse_bundle(encoded: &str) -> ReplicationResult<CertificateBundle> {
    let bytes = STANDARD.decode(encoded.trim()).map_err(|e| {
        ReplicationError::invalid_configuration(format!("certificate is not valid base64: {}", e))
    })?;
    let body: CertificateBundleBody = serde_json::from_slice(&bytes).map_err(|_| {
        ReplicationError::invalid_configuration("certificate does not contain a private key")
    })?;
    let private_key = STANDARD.decode(&body.private_key).map_err(|e| {
        ReplicationError::invalid_configuration(format!("private key is not valid base64: {}", e))
    })?;
    if private_key.is_empty() {
        return Err(ReplicationError::invalid_configuration(
            "certificate does not contain a private key",
        ));
    }
    Ok(CertificateBundle {
        certificate: parse_certificate(&body.certificate)?,
        private_key,
    })
}

/// Generate a certificate for a sink to present to a hub.
pub fn generate_certificate(subject: &str, validity: Duration) -> ReplicationResult<GeneratedCertificate> {
    if subject.trim().is_empty() {
        return Err(ReplicationError::invalid_configuration(
            "certificate subject must not be empty",
        ));
    }

    let mut private_key = [0u8; 32];
    OsRng.fill_bytes(&mut private_key);
    let public_key = STANDARD.encode(Sha256::digest(private_key));

    let now = Utc::now();
    let body = CertificateBody {
        subject: subject.to_string(),
        serial: Uuid::new_v4(),
        not_before: now - Duration::minutes(5),
        not_after: now + validity,
        public_key,
    };
    let encoded = serde_json::to_vec(&body)
        .map_err(|e| ReplicationError::storage(format!("certificate encoding failed: {}", e)))?;
    let public = STANDARD.encode(&encoded);

    let bundle = CertificateBundleBody {
        certificate: public.clone(),
        private_key: STANDARD.encode(private_key),
    };
    let bundle = serde_json::to_vec(&bundle)
        .map_err(|e| ReplicationError::storage(format!("certificate encoding failed: {}", e)))?;

    Ok(GeneratedCertificate {
        public_key: public,
        certificate: STANDARD.encode(bundle),
        thumbprint: thumbprint(&encoded),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_certificate_round_trips() {
        let generated = generate_certificate("sink-a", Duration::days(30)).unwrap();
        let parsed = parse_certificate(&generated.public_key).unwrap();
        assert_eq!(parsed.info.thumbprint, generated.thumbprint);
        assert_eq!(parsed.info.subject, "sink-a");
        assert!(parsed.info.is_valid_at(Utc::now()));

        let bundle = parse_bundle(&generated.certificate).unwrap();
        assert_eq!(bundle.certificate.info.thumbprint, generated.thumbprint);
        assert_eq!(bundle.private_key_len(), 32);
    }

    #[test]
    fn test_public_certificate_is_not_a_bundle() {
        let generated = generate_certificate("sink-a", Duration::days(1)).unwrap();
        let err = parse_bundle(&generated.public_key).unwrap_err();
        assert!(err.message.contains("private key"));
    }

    #[test]
    fn test_thumbprints_are_unique() {
        let a = generate_certificate("sink", Duration::days(1)).unwrap();
        let b = generate_certificate("sink", Duration::days(1)).unwrap();
        assert_ne!(a.thumbprint, b.thumbprint);
        assert_eq!(a.thumbprint.len(), 64);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(parse_certificate("not base64 at all!").is_err());
        assert!(parse_certificate(&STANDARD.encode(b"{}")).is_err());
    }

    #[test]
    fn test_thumbprint_comparison() {
        assert!(thumbprints_equal("ABCDEF", "abcdef"));
        assert!(!thumbprints_equal("ABCDEF", "ABCDE0"));
        assert!(!thumbprints_equal("ABCDEF", "ABCDEF00"));
    }

    #[test]
    fn test_empty_subject_rejected() {
        assert!(generate_certificate("  ", Duration::days(1)).is_err());
    }
}
