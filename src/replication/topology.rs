//! Topology Resolver
//!
//! Pure functions from a task and a topology snapshot to:
//! - the ordered list of destination candidates a dialer walks through
//! - the cluster node responsible for running a task
//!
//! Ordering rule for both: the preferred node first when it is live, then the
//! remaining live nodes in topology order. Nothing here blocks.

use serde::{Deserialize, Serialize};

use super::definitions::{OngoingTask, ReplicationConnectionString};
use crate::cluster::{ClusterTopology, DatabaseTopology, NodeTag};

/// A resolved destination. Derived, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnectionEndpoint {
    pub url: String,
    pub database: String,
    #[serde(default)]
    pub node_tag: Option<NodeTag>,
}

/// Destination node announced by a peer during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TopologyNode {
    pub tag: NodeTag,
    pub url: String,
}

/// A node eligible to be picked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateNode {
    pub tag: Option<NodeTag>,
    pub url: String,
    pub alive: bool,
}

/// Compare URLs ignoring case and a trailing slash.
pub(crate) fn same_url(a: &str, b: &str) -> bool {
    a.trim_end_matches('/')
        .eq_ignore_ascii_case(b.trim_end_matches('/'))
}

/// Candidate and responsibility resolution.
pub struct TopologyResolver;

impl TopologyResolver {
    /// Order live nodes: `preferred` first if live, then the rest in input order.
    /// Duplicate URLs are dropped.
    pub fn order<'a>(nodes: &'a [CandidateNode], preferred: Option<&NodeTag>) -> Vec<&'a CandidateNode> {
        let mut ordered: Vec<&CandidateNode> = Vec::with_capacity(nodes.len());
        let live = nodes.iter().filter(|n| n.alive);

        if let Some(tag) = preferred {
            if let Some(first) = live.clone().find(|n| n.tag.as_ref() == Some(tag)) {
                ordered.push(first);
            }
        }
        for node in live {
            if !ordered.iter().any(|o| same_url(&o.url, &node.url)) {
                ordered.push(node);
            }
        }
        ordered
    }

    /// Destination candidates for a dialing task.
    ///
    /// Nodes discovered on the last successful handshake come first, in the
    /// order the destination announced them, followed by connection string URLs
    /// not already covered.
    pub fn candidates(
        connection_string: &ReplicationConnectionString,
        discovered: &[TopologyNode],
        preferred: Option<&NodeTag>,
    ) -> Vec<ConnectionEndpoint> {
        let nodes: Vec<CandidateNode> = discovered
            .iter()
            .map(|n| CandidateNode {
                tag: Some(n.tag.clone()),
                url: n.url.clone(),
                alive: true,
            })
            .chain(
                connection_string
                    .topology_discovery_urls
                    .iter()
                    .filter(|u| !u.trim().is_empty())
                    .map(|u| CandidateNode {
                        tag: None,
                        url: u.trim().to_string(),
                        alive: true,
                    }),
            )
            .collect();

        Self::order(&nodes, preferred)
            .into_iter()
            .map(|n| ConnectionEndpoint {
                url: n.url.clone(),
                database: connection_string.database.clone(),
                node_tag: n.tag.clone(),
            })
            .collect()
    }

    /// Node that runs a task: its mentor when that is a live member of the
    /// database topology, otherwise a live member picked by task id.
    pub fn responsible_node(
        task: &OngoingTask,
        database: &DatabaseTopology,
        cluster: &ClusterTopology,
    ) -> Option<NodeTag> {
        let live = database.live_members(cluster);
        if live.is_empty() {
            return None;
        }
        if let Some(mentor) = task.mentor_node() {
            if live.contains(mentor) {
                return Some(mentor.clone());
            }
        }
        let slot = (task.task_id().0 % live.len() as u64) as usize;
        live.get(slot).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterNode;
    use crate::replication::{HubDefinition, ReplicationMode, TaskId};

    fn cs(urls: &[&str]) -> ReplicationConnectionString {
        ReplicationConnectionString {
            name: "to-hub".into(),
            database: "orders".into(),
            topology_discovery_urls: urls.iter().map(|u| u.to_string()).collect(),
        }
    }

    fn cluster(alive: &[(&str, bool)]) -> ClusterTopology {
        ClusterTopology {
            nodes: alive
                .iter()
                .map(|(tag, alive)| ClusterNode {
                    tag: NodeTag::new(*tag),
                    url: format!("mem://{}", tag),
                    alive: *alive,
                })
                .collect(),
        }
    }

    fn hub(task_id: u64, mentor: Option<&str>) -> OngoingTask {
        let mut hub = HubDefinition::new("h1", ReplicationMode::HUB_TO_SINK);
        hub.task_id = TaskId(task_id);
        hub.mentor_node = mentor.map(NodeTag::new);
        OngoingTask::Hub(hub)
    }

    #[test]
    fn test_connection_string_order_is_kept() {
        let endpoints = TopologyResolver::candidates(&cs(&["mem://bad", "mem://good"]), &[], None);
        let urls: Vec<_> = endpoints.iter().map(|e| e.url.as_str()).collect();
        assert_eq!(urls, vec!["mem://bad", "mem://good"]);
        assert!(endpoints.iter().all(|e| e.database == "orders"));
    }

    #[test]
    fn test_discovered_nodes_first_and_deduplicated() {
        let discovered = vec![
            TopologyNode { tag: NodeTag::new("B"), url: "mem://b".into() },
            TopologyNode { tag: NodeTag::new("A"), url: "mem://a".into() },
        ];
        let endpoints =
            TopologyResolver::candidates(&cs(&["mem://a/", "mem://c"]), &discovered, Some(&NodeTag::new("A")));
        let urls: Vec<_> = endpoints.iter().map(|e| e.url.as_str()).collect();
        assert_eq!(urls, vec!["mem://a", "mem://b", "mem://c"]);
        assert_eq!(endpoints[0].node_tag, Some(NodeTag::new("A")));
    }

    #[test]
    fn test_dead_nodes_are_skipped() {
        let nodes = vec![
            CandidateNode { tag: Some(NodeTag::new("A")), url: "mem://a".into(), alive: false },
            CandidateNode { tag: Some(NodeTag::new("B")), url: "mem://b".into(), alive: true },
        ];
        let ordered = TopologyResolver::order(&nodes, Some(&NodeTag::new("A")));
        assert_eq!(ordered.len(), 1);
        assert_eq!(ordered[0].url, "mem://b");
    }

    #[test]
    fn test_live_mentor_is_responsible() {
        let cluster = cluster(&[("A", true), ("B", true), ("C", true)]);
        let db = DatabaseTopology::new(vec!["A".into(), "B".into(), "C".into()]);
        let node = TopologyResolver::responsible_node(&hub(3, Some("C")), &db, &cluster);
        assert_eq!(node, Some(NodeTag::new("C")));
    }

    #[test]
    fn test_dead_mentor_falls_back_to_task_slot() {
        let cluster = cluster(&[("A", true), ("B", true), ("C", false)]);
        let db = DatabaseTopology::new(vec!["A".into(), "B".into(), "C".into()]);
        // live = [A, B]; 3 % 2 = 1
        let node = TopologyResolver::responsible_node(&hub(3, Some("C")), &db, &cluster);
        assert_eq!(node, Some(NodeTag::new("B")));
    }

    #[test]
    fn test_no_live_members() {
        let cluster = cluster(&[("A", false)]);
        let db = DatabaseTopology::new(vec!["A".into()]);
        assert_eq!(TopologyResolver::responsible_node(&hub(1, None), &db, &cluster), None);
    }
}
