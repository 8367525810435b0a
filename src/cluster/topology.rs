//! Cluster and Database Topology
//!
//! - Cluster topology: every node of the cluster, in join order, with its URL
//!   and whether it is currently reachable
//! - Database topology: the subset of nodes holding a copy of a database
//!
//! Both are plain snapshots. Nothing here blocks or talks to the network.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::replication::{ReplicationError, ReplicationResult};

/// Cluster node tag (e.g. "A").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeTag(String);

impl NodeTag {
    /// Create a node tag.
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// The tag as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeTag {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

/// A single cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterNode {
    pub tag: NodeTag,
    /// Replication endpoint of the node
    pub url: String,
    #[serde(default = "default_alive")]
    pub alive: bool,
}

fn default_alive() -> bool {
    true
}

/// Cluster topology snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterTopology {
    pub nodes: Vec<ClusterNode>,
}

impl ClusterTopology {
    /// Create a topology from nodes in join order.
    pub fn new(nodes: Vec<ClusterNode>) -> ReplicationResult<Self> {
        let topology = Self { nodes };
        topology.validate()?;
        Ok(topology)
    }

    /// Check that tags and URLs are unique.
    pub fn validate(&self) -> ReplicationResult<()> {
        for (i, node) in self.nodes.iter().enumerate() {
            if node.tag.as_str().is_empty() || node.url.trim().is_empty() {
                return Err(ReplicationError::invalid_configuration(
                    "cluster nodes need a tag and a url",
                ));
            }
            let duplicate = self.nodes[..i]
                .iter()
                .any(|other| other.tag == node.tag || other.url == node.url);
            if duplicate {
                return Err(ReplicationError::invalid_configuration(format!(
                    "cluster node {} ({}) is listed twice",
                    node.tag, node.url
                )));
            }
        }
        Ok(())
    }

    /// Look up a node by tag.
    pub fn node(&self, tag: &NodeTag) -> Option<&ClusterNode> {
        self.nodes.iter().find(|n| &n.tag == tag)
    }

    /// Look up a node by URL.
    pub fn node_by_url(&self, url: &str) -> Option<&ClusterNode> {
        let url = url.trim_end_matches('/');
        self.nodes
            .iter()
            .find(|n| n.url.trim_end_matches('/').eq_ignore_ascii_case(url))
    }

    /// Check whether a node is a reachable member.
    pub fn is_alive(&self, tag: &NodeTag) -> bool {
        self.node(tag).map(|n| n.alive).unwrap_or(false)
    }

    /// Mark a node reachable or unreachable. Returns false for unknown tags.
    pub fn set_alive(&mut self, tag: &NodeTag, alive: bool) -> bool {
        match self.nodes.iter_mut().find(|n| &n.tag == tag) {
            Some(node) => {
                node.alive = alive;
                true
            }
            None => false,
        }
    }
}

/// Nodes holding a copy of one database, in topology order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DatabaseTopology {
    pub members: Vec<NodeTag>,
}

impl DatabaseTopology {
    /// Create a database topology.
    pub fn new(members: Vec<NodeTag>) -> Self {
        Self { members }
    }

    /// Check whether a node holds the database.
    pub fn contains(&self, tag: &NodeTag) -> bool {
        self.members.contains(tag)
    }

    /// Members that are currently reachable, in topology order.
    pub fn live_members(&self, cluster: &ClusterTopology) -> Vec<NodeTag> {
        self.members
            .iter()
            .filter(|tag| cluster.is_alive(tag))
            .cloned()
            .collect()
    }
}
