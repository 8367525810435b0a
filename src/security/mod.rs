//! # Security
//!
//! Server security mode and replication certificates.
//!
//! Filtering hubs and sink-initiated push both need a verifiable peer identity,
//! so they are only accepted when the server runs with a node certificate.

pub mod certificate;

pub use certificate::{
    generate_certificate, parse_bundle, parse_certificate, thumbprint, thumbprints_equal,
    CertificateBundle, CertificateInfo, GeneratedCertificate, ParsedCertificate,
};

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::replication::{ReplicationError, ReplicationResult};

/// Security mode as configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    /// Plain transport, no peer identity
    Unsecured,
    /// Mutually authenticated transport
    Secured,
}

impl Default for SecurityMode {
    fn default() -> Self {
        Self::Unsecured
    }
}

/// Security section of the node configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub mode: SecurityMode,

    /// File holding the base64 node certificate bundle (secured mode only)
    #[serde(default)]
    pub certificate_path: Option<PathBuf>,
}

impl SecurityConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> ReplicationResult<()> {
        match (self.mode, &self.certificate_path) {
            (SecurityMode::Secured, None) => Err(ReplicationError::invalid_configuration(
                "secured mode requires security.certificate_path",
            )),
            (SecurityMode::Unsecured, Some(_)) => Err(ReplicationError::invalid_configuration(
                "security.certificate_path is only valid in secured mode",
            )),
            _ => Ok(()),
        }
    }
}

/// Runtime security state of a server node.
#[derive(Debug, Clone)]
pub struct ServerSecurity {
    mode: SecurityMode,
    node_certificate: Option<CertificateBundle>,
}

impl ServerSecurity {
    /// An unsecured server.
    pub fn unsecured() -> Self {
        Self {
            mode: SecurityMode::Unsecured,
            node_certificate: None,
        }
    }

    /// A secured server presenting `node_certificate` to its peers.
    pub fn secured(node_certificate: CertificateBundle) -> Self {
        Self {
            mode: SecurityMode::Secured,
            node_certificate: Some(node_certificate),
        }
    }

    /// Load from configuration, reading the certificate file when secured.
    pub fn from_config(config: &SecurityConfig) -> ReplicationResult<Self> {
        config.validate()?;
        match &config.certificate_path {
            None => Ok(Self::unsecured()),
            Some(path) => {
                let encoded = std::fs::read_to_string(path).map_err(|e| {
                    ReplicationError::invalid_configuration(format!(
                        "cannot read node certificate {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Ok(Self::secured(parse_bundle(&encoded)?))
            }
        }
    }

    /// Check whether peers are mutually authenticated.
    pub fn is_secured(&self) -> bool {
        self.mode == SecurityMode::Secured
    }

    /// The node's own certificate, if secured.
    pub fn node_certificate(&self) -> Option<&CertificateBundle> {
        self.node_certificate.as_ref()
    }
}

impl Default for ServerSecurity {
    fn default() -> Self {
        Self::unsecured()
    }
}
