//! Replication Wire Protocol
//!
//! Node-to-node frames and their encoding.
//!
//! ## Conversation
//! 1. Dialer sends `Handshake`
//! 2. Acceptor replies `HandshakeResponse` (accepted with negotiated mode and
//!    resume point, or rejected with a reason)
//! 3. If the acceptor will send data, the dialer sends `Resume` with the last
//!    etag it accepted from the acceptor
//! 4. Both sides exchange `Batch` / `Ack` / `Heartbeat` until one sends `Close`
//!
//! ## Encoding
//! `[u32 big-endian body length][u8 flags][body]`, body is JSON, deflated when
//! flag bit 0 is set. A peer only acks a batch after applying it.

use std::collections::BTreeSet;
use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::definitions::ReplicationMode;
use super::errors::{ReplicationError, ReplicationErrorKind, ReplicationResult};
use super::topology::TopologyNode;
use crate::storage::{ChangeVector, ReplicationItem};

/// Version spoken by this build. Peers must match exactly.
pub const PROTOCOL_VERSION: u32 = 60_000;

/// Upper bound on a decoded frame body.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

const FLAG_DEFLATE: u8 = 0b0000_0001;

/// Kind of task on the dialing side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionKind {
    /// A sink dialing a hub
    PullReplicationAsSink,
    /// An external replication pushing to a database
    ExternalReplication,
}

/// First frame on every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Handshake {
    pub protocol_version: u32,
    pub kind: ConnectionKind,
    /// Database on the acceptor
    pub database: String,
    /// Hub name, for sinks
    #[serde(default)]
    pub hub_name: Option<String>,
    pub requested_mode: ReplicationMode,
    pub source_database: String,
    pub source_database_id: String,
    #[serde(default)]
    pub source_node: Option<String>,
    /// Base64 public certificate (secured servers only)
    #[serde(default)]
    pub certificate: Option<String>,
    pub compression: bool,
}

/// Why an acceptor refused a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionReason {
    VersionMismatch,
    UnknownHub,
    HubDisabled,
    Unauthorized,
    DatabaseIdle,
    DatabaseMissing,
    /// The node does not host the database; another candidate may
    NotMember,
}

impl RejectionReason {
    /// Error the dialer surfaces for this rejection.
    pub fn into_error(self, message: String) -> ReplicationError {
        match self {
            Self::VersionMismatch => ReplicationError::protocol_mismatch(message),
            Self::UnknownHub => ReplicationError::new(ReplicationErrorKind::UnknownHub, message),
            Self::Unauthorized => ReplicationError::authorization(message),
            Self::DatabaseIdle => ReplicationError::new(ReplicationErrorKind::DatabaseIdle, message),
            Self::DatabaseMissing => {
                ReplicationError::new(ReplicationErrorKind::DatabaseMissing, message)
            }
            Self::HubDisabled | Self::NotMember => ReplicationError::transient(message),
        }
    }

    /// Reason to send for an acceptor-side error.
    pub fn from_error(err: &ReplicationError) -> Self {
        use ReplicationErrorKind as K;
        match err.kind {
            K::ProtocolMismatch => Self::VersionMismatch,
            K::UnknownHub | K::NotFound => Self::UnknownHub,
            K::Authorization | K::InvalidConfiguration | K::DuplicateGrant => Self::Unauthorized,
            K::DatabaseMissing => Self::DatabaseMissing,
            K::TopologyExhausted => Self::NotMember,
            K::DatabaseIdle
            | K::Transient
            | K::ConsensusCommit
            | K::Storage
            | K::Cancelled => Self::DatabaseIdle,
        }
    }
}

/// Acceptor's reply to a handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "Outcome")]
pub enum HandshakeResponse {
    #[serde(rename_all = "PascalCase")]
    Accepted {
        /// Directions both sides agreed on
        mode: ReplicationMode,
        database_id: String,
        /// Last etag the acceptor accepted from the dialer
        last_accepted_etag: u64,
        /// Live nodes hosting the database, in topology order
        topology: Vec<TopologyNode>,
        compression: bool,
        /// Paths the acceptor takes from the dialer; empty means all
        #[serde(default)]
        allowed_paths: BTreeSet<String>,
    },
    #[serde(rename_all = "PascalCase")]
    Rejected {
        reason: RejectionReason,
        message: String,
    },
}

/// Batch of changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Batch {
    pub items: Vec<ReplicationItem>,
    /// Sender etag this batch covers up to, including skipped items
    pub last_etag: u64,
}

/// Acknowledgement of a durably applied batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Ack {
    pub last_etag: u64,
    pub change_vector: ChangeVector,
}

/// Every frame on a replication connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type", content = "Body")]
pub enum Frame {
    Handshake(Handshake),
    HandshakeResponse(HandshakeResponse),
    Resume { last_etag: u64 },
    Batch(Batch),
    Ack(Ack),
    Heartbeat,
    Close { reason: String },
}

impl Frame {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Handshake(_) => "Handshake",
            Self::HandshakeResponse(_) => "HandshakeResponse",
            Self::Resume { .. } => "Resume",
            Self::Batch(_) => "Batch",
            Self::Ack(_) => "Ack",
            Self::Heartbeat => "Heartbeat",
            Self::Close { .. } => "Close",
        }
    }
}

/// Per-connection compression setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCompression {
    pub enabled: bool,
    pub threshold_bytes: usize,
}

impl FrameCompression {
    pub fn off() -> Self {
        Self {
            enabled: false,
            threshold_bytes: usize::MAX,
        }
    }
}

fn encode(frame: &Frame, compression: FrameCompression) -> ReplicationResult<(u8, Vec<u8>)> {
    let json = serde_json::to_vec(frame)
        .map_err(|e| ReplicationError::protocol_mismatch(format!("frame encoding failed: {}", e)))?;
    if !compression.enabled || json.len() < compression.threshold_bytes {
        return Ok((0, json));
    }
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(json.len() / 2), Compression::fast());
    encoder.write_all(&json)?;
    Ok((FLAG_DEFLATE, encoder.finish()?))
}

fn decode(flags: u8, body: Vec<u8>) -> ReplicationResult<Frame> {
    let json = if flags & FLAG_DEFLATE != 0 {
        let mut out = Vec::new();
        DeflateDecoder::new(body.as_slice())
            .take(MAX_FRAME_BYTES as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| ReplicationError::protocol_mismatch(format!("bad compressed frame: {}", e)))?;
        if out.len() > MAX_FRAME_BYTES {
            return Err(ReplicationError::protocol_mismatch("decompressed frame too large"));
        }
        out
    } else {
        body
    };
    serde_json::from_slice(&json)
        .map_err(|e| ReplicationError::protocol_mismatch(format!("malformed frame: {}", e)))
}

/// Write one frame and flush. Returns the bytes written.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame, compression: FrameCompression) -> ReplicationResult<usize>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let (flags, body) = encode(frame, compression)?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(ReplicationError::protocol_mismatch(format!(
            "{} frame of {} bytes exceeds the frame limit",
            frame.name(),
            body.len()
        )));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_u8(flags).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(body.len() + 5)
}

/// Read one frame. `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> ReplicationResult<Option<Frame>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_BYTES {
        return Err(ReplicationError::protocol_mismatch(format!(
            "frame of {} bytes exceeds the frame limit",
            len
        )));
    }
    let flags = reader.read_u8().await?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode(flags, body).map(Some)
}
