//! Replication Task Definitions
//!
//! Definitions live on the database record and change only through committed
//! cluster commands. Runtime state is kept elsewhere and never persisted.
//!
//! - `TaskId` is assigned once, when the definition is first committed, and is
//!   the stable identity used by grants and ongoing-task lookups
//! - Grants are immutable; replacing one is a delete followed by a create

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::errors::{ReplicationError, ReplicationResult};
use super::paths::validate_paths;
use crate::cluster::NodeTag;
use crate::security::{CertificateInfo, ServerSecurity};

/// Stable identity of an ongoing task. Zero means "not yet assigned".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Check whether consensus has assigned this id.
    pub fn is_assigned(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

bitflags! {
    /// Directions a hub/sink pair may replicate in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ReplicationMode: u8 {
        /// Hub pushes its documents to the sink
        const HUB_TO_SINK = 0b01;
        /// Sink pushes its documents to the hub
        const SINK_TO_HUB = 0b10;
    }
}

impl Default for ReplicationMode {
    fn default() -> Self {
        Self::HUB_TO_SINK
    }
}

/// Serialize durations as whole milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

fn validate_task_name(kind: &str, name: &str) -> ReplicationResult<()> {
    if name.trim().is_empty() {
        return Err(ReplicationError::invalid_configuration(format!(
            "{} name must not be empty",
            kind
        )));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(ReplicationError::invalid_configuration(format!(
            "{} name '{}' must not contain path separators",
            kind, name
        )));
    }
    Ok(())
}

/// A database exposing a replication feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HubDefinition {
    pub name: String,
    #[serde(default)]
    pub task_id: TaskId,
    #[serde(default)]
    pub mode: ReplicationMode,
    #[serde(default)]
    pub with_filtering: bool,
    #[serde(default, with = "duration_ms")]
    pub delay_replication_for: Duration,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub mentor_node: Option<NodeTag>,
    /// Pre-grant inline certificates. Hubs still carrying these cannot take grants.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub legacy_certificates: Vec<String>,
}

impl HubDefinition {
    /// Create an enabled hub with default settings.
    pub fn new(name: impl Into<String>, mode: ReplicationMode) -> Self {
        Self {
            name: name.into(),
            task_id: TaskId::default(),
            mode,
            with_filtering: false,
            delay_replication_for: Duration::ZERO,
            disabled: false,
            mentor_node: None,
            legacy_certificates: Vec::new(),
        }
    }

    /// Rules that hold regardless of the server's security mode.
    pub fn validate_shape(&self) -> ReplicationResult<()> {
        validate_task_name("hub", &self.name)?;
        if self.mode.is_empty() {
            return Err(ReplicationError::invalid_configuration(format!(
                "hub '{}' must replicate in at least one direction",
                self.name
            )));
        }
        Ok(())
    }

    /// Validate against the server's security mode.
    pub fn validate(&self, security: &ServerSecurity) -> ReplicationResult<()> {
        self.validate_shape()?;
        if !security.is_secured() {
            if self.with_filtering {
                return Err(ReplicationError::invalid_configuration(format!(
                    "hub '{}' uses filtering, which requires a secured server",
                    self.name
                )));
            }
            if self.mode.contains(ReplicationMode::SINK_TO_HUB) {
                return Err(ReplicationError::invalid_configuration(format!(
                    "hub '{}' accepts sink-to-hub replication, which requires a secured server",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// Check whether the hub still uses inline certificates.
    pub fn has_legacy_certificates(&self) -> bool {
        !self.legacy_certificates.is_empty()
    }
}

/// Certificate-scoped permission for a sink to connect to a hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HubAccessGrant {
    pub hub_name: String,
    pub grant_name: String,
    pub certificate_thumbprint: String,
    pub certificate_public_info: CertificateInfo,
    #[serde(default)]
    pub allowed_hub_to_sink_paths: BTreeSet<String>,
    #[serde(default)]
    pub allowed_sink_to_hub_paths: BTreeSet<String>,
}

impl HubAccessGrant {
    /// Validate the grant against the hub it targets.
    pub fn validate(&self, hub: &HubDefinition) -> ReplicationResult<()> {
        if self.grant_name.trim().is_empty() {
            return Err(ReplicationError::invalid_configuration(
                "access grant name must not be empty",
            ));
        }
        validate_paths(&self.allowed_hub_to_sink_paths, "hub-to-sink")?;
        validate_paths(&self.allowed_sink_to_hub_paths, "sink-to-hub")?;

        if !hub.mode.contains(ReplicationMode::SINK_TO_HUB)
            && !self.allowed_sink_to_hub_paths.is_empty()
        {
            return Err(ReplicationError::invalid_configuration(format!(
                "hub '{}' does not accept sink-to-hub replication, so the grant cannot allow sink-to-hub paths",
                hub.name
            )));
        }
        if hub.with_filtering && self.allowed_hub_to_sink_paths.is_empty() {
            return Err(ReplicationError::invalid_configuration(format!(
                "hub '{}' uses filtering, so the grant must allow at least one hub-to-sink path",
                hub.name
            )));
        }
        Ok(())
    }
}

/// Named pointer at a remote database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReplicationConnectionString {
    pub name: String,
    pub database: String,
    /// Replication endpoints of the destination cluster, in preference order
    pub topology_discovery_urls: Vec<String>,
}

impl ReplicationConnectionString {
    /// Validate the connection string.
    pub fn validate(&self) -> ReplicationResult<()> {
        validate_task_name("connection string", &self.name)?;
        if self.database.trim().is_empty() {
            return Err(ReplicationError::invalid_configuration(format!(
                "connection string '{}' must name a database",
                self.name
            )));
        }
        if self.topology_discovery_urls.iter().all(|u| u.trim().is_empty()) {
            return Err(ReplicationError::invalid_configuration(format!(
                "connection string '{}' must list at least one url",
                self.name
            )));
        }
        Ok(())
    }
}

/// Sink side of a hub/sink pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SinkDefinition {
    pub name: String,
    pub connection_string_name: String,
    pub hub_name: String,
    /// Base64 certificate bundle with private key, presented to the hub
    #[serde(default)]
    pub certificate_with_private_key: Option<String>,
    #[serde(default)]
    pub mode: ReplicationMode,
    /// Hub URL the sink last streamed from; informational, ignored on input
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub task_id: TaskId,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub mentor_node: Option<NodeTag>,
}

impl SinkDefinition {
    /// Validate against the server's security mode.
    pub fn validate(&self, security: &ServerSecurity) -> ReplicationResult<()> {
        validate_task_name("sink", &self.name)?;
        validate_task_name("hub", &self.hub_name)?;
        if self.mode.is_empty() {
            return Err(ReplicationError::invalid_configuration(format!(
                "sink '{}' must replicate in at least one direction",
                self.name
            )));
        }
        if security.is_secured() && self.certificate_with_private_key.is_none() {
            return Err(ReplicationError::invalid_configuration(format!(
                "sink '{}' needs a certificate with a private key on a secured server",
                self.name
            )));
        }
        if !security.is_secured() && self.mode.contains(ReplicationMode::SINK_TO_HUB) {
            return Err(ReplicationError::invalid_configuration(format!(
                "sink '{}' pushes to its hub, which requires a secured server",
                self.name
            )));
        }
        Ok(())
    }
}

/// Unidirectional push of a database to a connection-string destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExternalReplicationDefinition {
    pub name: String,
    pub connection_string_name: String,
    /// Destination database; filled from the connection string on commit
    #[serde(default)]
    pub database: String,
    #[serde(default, with = "duration_ms")]
    pub delay_replication_for: Duration,
    #[serde(default)]
    pub task_id: TaskId,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub mentor_node: Option<NodeTag>,
}

impl ExternalReplicationDefinition {
    /// Validate the definition.
    pub fn validate(&self) -> ReplicationResult<()> {
        validate_task_name("external replication", &self.name)?;
        validate_task_name("connection string", &self.connection_string_name)
    }
}

/// Kind of ongoing task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OngoingTaskType {
    PullReplicationAsHub,
    PullReplicationAsSink,
    Replication,
}

/// Any replication task a database owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OngoingTask {
    Hub(HubDefinition),
    Sink(SinkDefinition),
    External(ExternalReplicationDefinition),
}

impl OngoingTask {
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::Hub(d) => d.task_id,
            Self::Sink(d) => d.task_id,
            Self::External(d) => d.task_id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Hub(d) => &d.name,
            Self::Sink(d) => &d.name,
            Self::External(d) => &d.name,
        }
    }

    pub fn disabled(&self) -> bool {
        match self {
            Self::Hub(d) => d.disabled,
            Self::Sink(d) => d.disabled,
            Self::External(d) => d.disabled,
        }
    }

    pub fn mentor_node(&self) -> Option<&NodeTag> {
        match self {
            Self::Hub(d) => d.mentor_node.as_ref(),
            Self::Sink(d) => d.mentor_node.as_ref(),
            Self::External(d) => d.mentor_node.as_ref(),
        }
    }

    pub fn task_type(&self) -> OngoingTaskType {
        match self {
            Self::Hub(_) => OngoingTaskType::PullReplicationAsHub,
            Self::Sink(_) => OngoingTaskType::PullReplicationAsSink,
            Self::External(_) => OngoingTaskType::Replication,
        }
    }

    /// Connection string the task dials, if it dials at all.
    pub fn connection_string_name(&self) -> Option<&str> {
        match self {
            Self::Hub(_) => None,
            Self::Sink(d) => Some(&d.connection_string_name),
            Self::External(d) => Some(&d.connection_string_name),
        }
    }

    /// Check whether the task opens outgoing connections.
    pub fn is_dialer(&self) -> bool {
        !matches!(self, Self::Hub(_))
    }
}
