//! Outgoing Connections
//!
//! Drives the dialing side of the state machine for one sink or external
//! replication task:
//!
//! 1. Resolve candidates (last discovered topology, then connection string URLs)
//! 2. Walk them in order; a retriable failure moves to the next one
//! 3. When all fail, back off exponentially and re-resolve
//! 4. A fatal failure parks the machine in `Error` until it is cancelled
//!
//! The worker owns its runtime state; the orchestrator only reads it.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::definitions::{OngoingTask, ReplicationConnectionString, ReplicationMode};
use super::errors::{ReplicationError, ReplicationResult};
use super::failure::FailureTracker;
use super::orchestrator::ReplicationContext;
use super::protocol::{
    read_frame, write_frame, ConnectionKind, Frame, FrameCompression, Handshake, HandshakeResponse,
    PROTOCOL_VERSION,
};
use super::session::{InboundPlan, OutboundPlan, StreamSession};
use super::state::{ConnectionStatus, SharedRuntimeState};
use super::topology::{same_url, ConnectionEndpoint, TopologyNode, TopologyResolver};
use super::transport::BoxedStream;
use crate::cluster::NodeTag;
use crate::observability::Event;
use crate::security::parse_bundle;
use crate::storage::DocumentStore;

/// Result of one candidate attempt.
enum Attempt {
    Cancelled,
    Failed(ReplicationError),
    Streamed {
        topology: Vec<TopologyNode>,
        node_tag: Option<NodeTag>,
        result: ReplicationResult<()>,
    },
}

/// Negotiated parameters of an accepted handshake.
struct Accepted {
    mode: ReplicationMode,
    database_id: String,
    last_accepted_etag: u64,
    compression: bool,
    allowed_paths: BTreeSet<String>,
}

/// Dialer for one task.
pub struct OutgoingWorker {
    pub database: String,
    pub task: OngoingTask,
    pub connection_string: ReplicationConnectionString,
    pub store: Arc<dyn DocumentStore>,
    pub context: Arc<ReplicationContext>,
    pub failures: Arc<FailureTracker>,
    pub runtime: SharedRuntimeState,
}

impl OutgoingWorker {
    /// Run until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        if let Err(err) = self.drive(&cancel).await {
            self.park(err, &cancel).await;
        }
        let _ = self.runtime.transition(|s| Ok(s.dispose()));
        tracing::info!(
            event = Event::ConnectionDisposed.as_str(),
            database = %self.database,
            task_id = %self.task.task_id(),
            task = %self.task.name(),
            "outgoing connection disposed"
        );
    }

    async fn drive(&self, cancel: &CancellationToken) -> ReplicationResult<()> {
        let settings = &self.context.settings;
        let retry = settings.retry_policy();
        let mut discovered: Vec<TopologyNode> = Vec::new();
        let mut preferred: Option<NodeTag> = None;
        let mut round: u32 = 0;

        loop {
            let candidates =
                TopologyResolver::candidates(&self.connection_string, &discovered, preferred.as_ref());
            let mut streamed = false;

            for endpoint in candidates {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                self.runtime.transition(ConnectionStatus::connect)?;
                self.runtime.set_destination(Some(endpoint.clone()));

                match self.attempt(&endpoint, cancel).await? {
                    Attempt::Cancelled => return Ok(()),
                    Attempt::Failed(err) if err.is_fatal() => return Err(err),
                    Attempt::Failed(err) => {
                        self.context.metrics.increment_connection_failures();
                        self.failures.record_outgoing(&endpoint.url, &err);
                        self.runtime.record_error(&err);
                        tracing::warn!(
                            event = Event::ConnectionFailed.as_str(),
                            database = %self.database,
                            task_id = %self.task.task_id(),
                            url = %endpoint.url,
                            code = err.kind.code(),
                            error = %err.message,
                            "candidate failed"
                        );
                    }
                    Attempt::Streamed {
                        topology,
                        node_tag,
                        result,
                    } => {
                        if !topology.is_empty() {
                            discovered = topology;
                        }
                        preferred = node_tag;
                        round = 0;
                        match result {
                            Ok(()) => return Ok(()),
                            Err(err) if err.is_fatal() => return Err(err),
                            Err(err) => {
                                self.failures.record_outgoing(&endpoint.url, &err);
                                self.runtime.record_error(&err);
                                tracing::warn!(
                                    event = Event::StreamingStopped.as_str(),
                                    database = %self.database,
                                    task_id = %self.task.task_id(),
                                    url = %endpoint.url,
                                    error = %err.message,
                                    "streaming interrupted"
                                );
                            }
                        }
                        streamed = true;
                        break;
                    }
                }
            }

            if !streamed {
                let err = ReplicationError::topology_exhausted(format!(
                    "no candidate of connection string '{}' accepted task '{}'",
                    self.connection_string.name,
                    self.task.name()
                ));
                self.runtime.record_error(&err);
                tracing::warn!(
                    event = Event::TopologyExhausted.as_str(),
                    database = %self.database,
                    task_id = %self.task.task_id(),
                    "all candidates failed"
                );
            }

            round = round.saturating_add(1);
            let delay = retry.delay_for_attempt(round);
            match self.runtime.status() {
                ConnectionStatus::Idle | ConnectionStatus::BackingOff => {}
                _ => {
                    self.runtime.transition(ConnectionStatus::back_off)?;
                }
            }
            let retry_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            self.runtime.schedule_retry(round, retry_at);
            self.context.metrics.increment_retries();
            tracing::info!(
                event = Event::Backoff.as_str(),
                database = %self.database,
                task_id = %self.task.task_id(),
                attempt = round,
                delay_ms = delay.as_millis() as u64,
                "backing off"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn park(&self, err: ReplicationError, cancel: &CancellationToken) {
        let _ = self.runtime.transition(ConnectionStatus::fail);
        self.runtime.record_error(&err);
        if let Some(endpoint) = self.runtime.snapshot().destination {
            self.failures.record_outgoing(&endpoint.url, &err);
        }
        tracing::error!(
            event = Event::ConnectionParked.as_str(),
            database = %self.database,
            task_id = %self.task.task_id(),
            task = %self.task.name(),
            code = err.kind.code(),
            error = %err.message,
            "replication stopped until the task definition changes"
        );
        cancel.cancelled().await;
    }

    async fn attempt(
        &self,
        endpoint: &ConnectionEndpoint,
        cancel: &CancellationToken,
    ) -> ReplicationResult<Attempt> {
        let settings = &self.context.settings;
        self.context.metrics.increment_connection_attempts();
        tracing::info!(
            event = Event::ConnectionAttempt.as_str(),
            database = %self.database,
            task_id = %self.task.task_id(),
            url = %endpoint.url,
            destination = %endpoint.database,
            "connecting"
        );

        let connect = tokio::time::timeout(
            settings.connect_timeout(),
            self.context.connector.connect(&endpoint.url),
        );
        let mut stream = tokio::select! {
            _ = cancel.cancelled() => return Ok(Attempt::Cancelled),
            connected = connect => match connected {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => return Ok(Attempt::Failed(err)),
                Err(_) => {
                    return Ok(Attempt::Failed(ReplicationError::transient(format!(
                        "connect to {} timed out", endpoint.url
                    ))))
                }
            },
        };

        self.runtime.transition(ConnectionStatus::handshake)?;
        let handshake = match self.handshake(endpoint) {
            Ok(handshake) => handshake,
            Err(err) => return Ok(Attempt::Failed(err)),
        };
        let requested = handshake.requested_mode;

        let exchange = tokio::time::timeout(
            settings.handshake_timeout(),
            exchange_handshake(&mut stream, handshake),
        );
        let response = tokio::select! {
            _ = cancel.cancelled() => return Ok(Attempt::Cancelled),
            response = exchange => match response {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => return Ok(Attempt::Failed(err)),
                Err(_) => {
                    return Ok(Attempt::Failed(ReplicationError::transient(format!(
                        "handshake with {} timed out", endpoint.url
                    ))))
                }
            },
        };

        let (accepted, topology) = match response {
            HandshakeResponse::Rejected { reason, message } => {
                return Ok(Attempt::Failed(reason.into_error(message)))
            }
            HandshakeResponse::Accepted {
                mode,
                database_id,
                last_accepted_etag,
                topology,
                compression,
                allowed_paths,
            } => (
                Accepted {
                    mode,
                    database_id,
                    last_accepted_etag,
                    compression,
                    allowed_paths,
                },
                topology,
            ),
        };
        if accepted.mode.is_empty() || !requested.contains(accepted.mode) {
            return Ok(Attempt::Failed(ReplicationError::protocol_mismatch(format!(
                "{} accepted mode {:?}, requested {:?}",
                endpoint.url, accepted.mode, requested
            ))));
        }

        if accepted.mode.contains(ReplicationMode::HUB_TO_SINK) {
            let resume = match self.store.last_replicated_etag(&accepted.database_id) {
                Ok(etag) => etag,
                Err(err) => return Ok(Attempt::Failed(err)),
            };
            let frame = Frame::Resume { last_etag: resume };
            if let Err(err) = write_frame(&mut stream, &frame, FrameCompression::off()).await {
                return Ok(Attempt::Failed(err));
            }
        }

        let node_tag = endpoint.node_tag.clone().or_else(|| {
            topology
                .iter()
                .find(|n| same_url(&n.url, &endpoint.url))
                .map(|n| n.tag.clone())
        });
        self.runtime.set_destination(Some(ConnectionEndpoint {
            node_tag: node_tag.clone(),
            ..endpoint.clone()
        }));
        self.runtime.transition(ConnectionStatus::stream)?;
        self.runtime.reset_retries();
        self.failures.record_outgoing_success(&endpoint.url);
        tracing::info!(
            event = Event::StreamingStarted.as_str(),
            database = %self.database,
            task_id = %self.task.task_id(),
            url = %endpoint.url,
            mode = ?accepted.mode,
            "streaming"
        );

        let _active = self.context.idle.register(&self.database);
        let result = self.session(endpoint, accepted).run(stream, cancel.clone()).await;

        Ok(Attempt::Streamed {
            topology,
            node_tag,
            result,
        })
    }

    fn handshake(&self, endpoint: &ConnectionEndpoint) -> ReplicationResult<Handshake> {
        let security = &self.context.security;
        let (kind, hub_name, requested_mode, certificate) = match &self.task {
            OngoingTask::Sink(sink) => {
                let certificate = match &sink.certificate_with_private_key {
                    Some(bundle) => Some(parse_bundle(bundle)?.certificate.encoded),
                    None => None,
                };
                (
                    ConnectionKind::PullReplicationAsSink,
                    Some(sink.hub_name.clone()),
                    sink.mode,
                    certificate,
                )
            }
            // Pushing is the dialer-to-acceptor direction
            OngoingTask::External(_) => (
                ConnectionKind::ExternalReplication,
                None,
                ReplicationMode::SINK_TO_HUB,
                security
                    .node_certificate()
                    .map(|bundle| bundle.certificate.encoded.clone()),
            ),
            OngoingTask::Hub(hub) => {
                return Err(ReplicationError::invalid_configuration(format!(
                    "hub '{}' does not dial out",
                    hub.name
                )))
            }
        };

        Ok(Handshake {
            protocol_version: PROTOCOL_VERSION,
            kind,
            database: endpoint.database.clone(),
            hub_name,
            requested_mode,
            source_database: self.database.clone(),
            source_database_id: self.store.database_id().to_string(),
            source_node: Some(self.context.node_tag.to_string()),
            certificate,
            compression: self.context.settings.compression,
        })
    }

    fn session(&self, endpoint: &ConnectionEndpoint, accepted: Accepted) -> StreamSession {
        let settings = &self.context.settings;
        let delay = match &self.task {
            OngoingTask::External(external) => external.delay_replication_for,
            _ => Duration::ZERO,
        };
        StreamSession {
            database: self.database.clone(),
            peer: endpoint.url.clone(),
            store: Arc::clone(&self.store),
            runtime: self.runtime.clone(),
            metrics: Arc::clone(&self.context.metrics),
            compression: FrameCompression {
                enabled: accepted.compression && settings.compression,
                threshold_bytes: settings.compression_threshold_bytes,
            },
            heartbeat: settings.heartbeat_interval(),
            max_batch_size: settings.max_batch_size,
            outbound: accepted
                .mode
                .contains(ReplicationMode::SINK_TO_HUB)
                .then(|| OutboundPlan {
                    start_etag: accepted.last_accepted_etag,
                    allowed_paths: accepted.allowed_paths.clone(),
                    delay,
                }),
            inbound: accepted
                .mode
                .contains(ReplicationMode::HUB_TO_SINK)
                .then(|| InboundPlan {
                    source_database_id: accepted.database_id.clone(),
                    allowed_paths: BTreeSet::new(),
                }),
        }
    }
}

async fn exchange_handshake(
    stream: &mut BoxedStream,
    handshake: Handshake,
) -> ReplicationResult<HandshakeResponse> {
    write_frame(stream, &Frame::Handshake(handshake), FrameCompression::off()).await?;
    match read_frame(stream).await? {
        Some(Frame::HandshakeResponse(response)) => Ok(response),
        Some(other) => Err(ReplicationError::protocol_mismatch(format!(
            "expected HandshakeResponse, got {}",
            other.name()
        ))),
        None => Err(ReplicationError::transient(
            "connection closed during handshake",
        )),
    }
}
