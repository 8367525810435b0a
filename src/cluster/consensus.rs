//! Consensus Collaborator
//!
//! The replication subsystem only needs "commit this change, tell me when it is
//! applied". `ConsensusLog` is that seam. `InMemoryConsensus` is a single
//! in-process log that any number of nodes can share; it applies commands
//! synchronously in proposal order and publishes every applied state.
//!
//! ## Guarantees
//! - A request id is applied at most once; retries return the first outcome
//! - Apply-time rule violations are returned to the proposer, the state is not changed
//! - Snapshots are immutable; readers never block the apply path

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use super::commands::{ClusterChange, ClusterCommand};
use super::state::ClusterState;
use crate::observability::Event;
use crate::replication::{ReplicationError, ReplicationResult};

const REQUEST_HISTORY: usize = 4096;

/// Opaque configuration-commit service.
#[async_trait]
pub trait ConsensusLog: Send + Sync {
    /// Submit a command. Returns the log index it was applied at.
    async fn propose(&self, request_id: &str, command: ClusterCommand) -> ReplicationResult<u64>;

    /// Wait until `index` has been applied locally.
    async fn wait_for_index(&self, index: u64, timeout: Duration) -> ReplicationResult<()>;

    /// Index of the last applied command.
    fn applied_index(&self) -> u64;

    /// Latest applied state.
    fn snapshot(&self) -> Arc<ClusterState>;

    /// Stream of applied changes.
    fn subscribe(&self) -> broadcast::Receiver<ClusterChange>;
}

struct LogInner {
    requests: HashMap<String, ReplicationResult<u64>>,
    request_order: VecDeque<String>,
}

/// Single in-process consensus log.
pub struct InMemoryConsensus {
    inner: Mutex<LogInner>,
    state: watch::Sender<Arc<ClusterState>>,
    changes: broadcast::Sender<ClusterChange>,
    fail_next: AtomicU32,
}

impl InMemoryConsensus {
    /// Create an empty log.
    pub fn new() -> Self {
        let (state, _) = watch::channel(Arc::new(ClusterState::default()));
        let (changes, _) = broadcast::channel(1024);
        Self {
            inner: Mutex::new(LogInner {
                requests: HashMap::new(),
                request_order: VecDeque::new(),
            }),
            state,
            changes,
            fail_next: AtomicU32::new(0),
        }
    }

    /// Make the next `count` proposals fail as if leadership was lost.
    pub fn fail_next_proposals(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for InMemoryConsensus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConsensusLog for InMemoryConsensus {
    async fn propose(&self, request_id: &str, command: ClusterCommand) -> ReplicationResult<u64> {
        if request_id.trim().is_empty() {
            return Err(ReplicationError::invalid_configuration(
                "a request id is required for configuration changes",
            ));
        }
        if self.take_injected_failure() {
            tracing::warn!(
                event = Event::ConsensusCommitFailed.as_str(),
                request_id,
                command = command.name(),
                "leader changed before the command was committed"
            );
            return Err(ReplicationError::consensus_commit(
                "leader changed before the command was committed",
            ));
        }

        let mut inner = self
            .inner
            .lock()
            .map_err(|_| ReplicationError::storage("consensus log lock poisoned"))?;

        if let Some(previous) = inner.requests.get(request_id) {
            tracing::debug!(
                event = Event::ConsensusDuplicateRequest.as_str(),
                request_id,
                command = command.name(),
                "request already applied"
            );
            return previous.clone();
        }

        let current = self.state.borrow().clone();
        let index = current.last_index + 1;
        let mut next = (*current).clone();
        let result = match next.apply(index, &command) {
            Ok(_) => Ok(index),
            Err(err) => {
                next = (*current).clone();
                next.last_index = index;
                Err(err)
            }
        };
        self.state.send_replace(Arc::new(next));

        match &result {
            Ok(_) => {
                tracing::info!(
                    event = Event::ConsensusApplied.as_str(),
                    index,
                    request_id,
                    command = command.name(),
                    database = command.database().unwrap_or(""),
                    "command applied"
                );
                // No subscribers is fine
                let _ = self.changes.send(ClusterChange {
                    index,
                    database: command.database().map(str::to_string),
                    command: command.name(),
                });
            }
            Err(err) => {
                tracing::warn!(
                    event = Event::ConsensusApplyRejected.as_str(),
                    index,
                    request_id,
                    command = command.name(),
                    error = %err,
                    "command rejected at apply time"
                );
            }
        }

        inner.requests.insert(request_id.to_string(), result.clone());
        inner.request_order.push_back(request_id.to_string());
        while inner.request_order.len() > REQUEST_HISTORY {
            if let Some(old) = inner.request_order.pop_front() {
                inner.requests.remove(&old);
            }
        }
        result
    }

    async fn wait_for_index(&self, index: u64, timeout: Duration) -> ReplicationResult<()> {
        let mut rx = self.state.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|s| s.last_index >= index)).await;
        match waited {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(ReplicationError::consensus_commit("consensus log closed")),
            Err(_) => Err(ReplicationError::consensus_commit(format!(
                "index {} was not applied within {:?}",
                index, timeout
            ))),
        }
    }

    fn applied_index(&self) -> u64 {
        self.state.borrow().last_index
    }

    fn snapshot(&self) -> Arc<ClusterState> {
        self.state.borrow().clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<ClusterChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterNode, ClusterTopology, DatabaseTopology, NodeTag};
    use crate::replication::ReplicationErrorKind;

    fn topology() -> ClusterCommand {
        ClusterCommand::PutClusterTopology {
            topology: ClusterTopology {
                nodes: vec![ClusterNode {
                    tag: NodeTag::new("A"),
                    url: "mem://a".into(),
                    alive: true,
                }],
            },
        }
    }

    #[tokio::test]
    async fn test_propose_and_wait() {
        let log = InMemoryConsensus::new();
        let index = log.propose("r1", topology()).await.unwrap();
        assert_eq!(index, 1);
        log.wait_for_index(index, Duration::from_millis(100)).await.unwrap();
        assert_eq!(log.applied_index(), 1);
        assert_eq!(log.snapshot().topology.nodes.len(), 1);
    }

    #[tokio::test]
    async fn test_request_id_is_idempotent() {
        let log = InMemoryConsensus::new();
        let first = log.propose("r1", topology()).await.unwrap();
        let second = log.propose("r1", topology()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(log.applied_index(), 1);
    }

    #[tokio::test]
    async fn test_apply_error_reaches_proposer() {
        let log = InMemoryConsensus::new();
        let err = log
            .propose(
                "r1",
                ClusterCommand::PutDatabase {
                    database: "orders".into(),
                    topology: DatabaseTopology::new(vec![NodeTag::new("A")]),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ReplicationErrorKind::InvalidConfiguration);
        assert!(log.snapshot().databases.is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure_is_retriable() {
        let log = InMemoryConsensus::new();
        log.fail_next_proposals(1);
        let err = log.propose("r1", topology()).await.unwrap_err();
        assert_eq!(err.kind, ReplicationErrorKind::ConsensusCommit);
        assert!(err.is_retriable());
        assert!(log.propose("r1", topology()).await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let log = InMemoryConsensus::new();
        let err = log
            .wait_for_index(5, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ReplicationErrorKind::ConsensusCommit);
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let log = InMemoryConsensus::new();
        let mut rx = log.subscribe();
        log.propose("r1", topology()).await.unwrap();
        let change = rx.recv().await.unwrap();
        assert_eq!(change.index, 1);
        assert!(change.is_topology_change());
    }
}
