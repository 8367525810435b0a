//! Node Configuration
//!
//! One JSON file per node. Every field is defaulted, so `{}` boots a
//! standalone unsecured node tagged `A`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cluster::{ClusterNode, ClusterTopology, NodeTag};
use crate::http_server::HttpServerConfig;
use crate::observability::LoggingConfig;
use crate::replication::{ReplicationError, ReplicationResult, ReplicationSettings};
use crate::security::SecurityConfig;

/// Configuration file structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Cluster tag of this node (default: "A")
    #[serde(default = "default_node_tag")]
    pub node_tag: String,

    /// URL other nodes dial for replication (default: "tcp://127.0.0.1:38888")
    #[serde(default = "default_public_url")]
    pub public_url: String,

    /// Address the replication listener binds (default: "0.0.0.0:38888")
    #[serde(default = "default_replication_listen_addr")]
    pub replication_listen_addr: String,

    #[serde(default)]
    pub http: HttpServerConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    /// Other cluster members, tag -> replication URL
    #[serde(default)]
    pub cluster_members: BTreeMap<String, String>,

    /// Databases created on this node at boot
    #[serde(default)]
    pub databases: Vec<String>,

    #[serde(default)]
    pub replication: ReplicationSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_node_tag() -> String {
    "A".to_string()
}
fn default_public_url() -> String {
    "tcp://127.0.0.1:38888".to_string()
}
fn default_replication_listen_addr() -> String {
    "0.0.0.0:38888".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_tag: default_node_tag(),
            public_url: default_public_url(),
            replication_listen_addr: default_replication_listen_addr(),
            http: HttpServerConfig::default(),
            security: SecurityConfig::default(),
            cluster_members: BTreeMap::new(),
            databases: Vec::new(),
            replication: ReplicationSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> ReplicationResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            ReplicationError::invalid_configuration(format!(
                "failed to read config {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: NodeConfig = serde_json::from_str(&content)
            .map_err(|e| ReplicationError::invalid_configuration(format!("invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ReplicationResult<()> {
        if self.node_tag.trim().is_empty() {
            return Err(ReplicationError::invalid_configuration("node_tag must not be empty"));
        }
        if self.cluster_members.keys().any(|t| t.eq_ignore_ascii_case(&self.node_tag)) {
            return Err(ReplicationError::invalid_configuration(format!(
                "cluster_members must not list this node ('{}')",
                self.node_tag
            )));
        }
        if self.databases.iter().any(|d| d.trim().is_empty()) {
            return Err(ReplicationError::invalid_configuration("database names must not be empty"));
        }
        self.http
            .validate()
            .map_err(ReplicationError::invalid_configuration)?;
        self.security.validate()?;
        self.replication.validate()?;
        self.logging
            .validate()
            .map_err(|e| ReplicationError::invalid_configuration(e.message().to_string()))?;
        self.topology().validate()
    }

    pub fn tag(&self) -> NodeTag {
        NodeTag::new(self.node_tag.clone())
    }

    /// Cluster topology: this node followed by the configured members.
    pub fn topology(&self) -> ClusterTopology {
        let local = ClusterNode {
            tag: self.tag(),
            url: self.public_url.clone(),
            alive: true,
        };
        let members = self.cluster_members.iter().map(|(tag, url)| ClusterNode {
            tag: NodeTag::new(tag.clone()),
            url: url.clone(),
            alive: true,
        });
        ClusterTopology {
            nodes: std::iter::once(local).chain(members).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use crate::replication::ReplicationErrorKind;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: NodeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, NodeConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.topology().nodes.len(), 1);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "node_tag": "B",
                "public_url": "tcp://10.0.0.2:38888",
                "cluster_members": {{"A": "tcp://10.0.0.1:38888"}},
                "databases": ["orders"],
                "replication": {{"max_batch_size": 64}},
                "logging": {{"level": "debug", "format": "pretty"}}
            }}"#
        )
        .unwrap();

        let config = NodeConfig::load(file.path()).unwrap();
        assert_eq!(config.tag(), NodeTag::new("B"));
        assert_eq!(config.replication.max_batch_size, 64);
        assert_eq!(config.replication.heartbeat_interval_ms, ReplicationSettings::default().heartbeat_interval_ms);
        let topology = config.topology();
        let tags: Vec<&str> = topology.nodes.iter().map(|n| n.tag.as_str()).collect();
        assert_eq!(tags, vec!["B", "A"]);
    }

    #[test]
    fn test_rejects_self_in_members() {
        let mut config = NodeConfig::default();
        config.cluster_members.insert("a".into(), "tcp://x:1".into());
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind, ReplicationErrorKind::InvalidConfiguration);
    }

    #[test]
    fn test_rejects_malformed_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = NodeConfig::load(file.path()).unwrap_err();
        assert!(err.message.contains("invalid config JSON"));
    }

    #[test]
    fn test_secured_without_certificate_is_invalid() {
        let config: NodeConfig = serde_json::from_str(r#"{"security": {"mode": "secured"}}"#).unwrap();
        assert!(config.validate().is_err());
    }
}
