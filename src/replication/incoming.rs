//! Incoming Connections
//!
//! The accepting side: the passive mirror of the outgoing worker.
//!
//! 1. Read the handshake
//! 2. Check the database exists and this node hosts it, then load it on
//!    demand; a load failure is a retriable `DatabaseIdle` rejection
//! 3. Authorize: hub, grant, certificate validity, requested mode. A grant
//!    on a filtered hub must name paths for every direction it is used in
//! 4. Reply, wait for `Resume` when this side sends, then stream
//!
//! Every rejection is recorded in the database's failure tracker when the
//! database could be loaded, and always counted in the node metrics.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::definitions::ReplicationMode;
use super::errors::{ReplicationError, ReplicationErrorKind, ReplicationResult};
use super::orchestrator::{IncomingTerms, ReplicationContext, ReplicationOrchestrator};
use super::protocol::{
    read_frame, write_frame, ConnectionKind, Frame, FrameCompression, Handshake, HandshakeResponse,
    RejectionReason, PROTOCOL_VERSION,
};
use super::session::{InboundPlan, OutboundPlan, StreamSession};
use super::state::{ConnectionStatus, SharedRuntimeState};
use super::topology::TopologyNode;
use super::transport::BoxedStream;
use crate::cluster::{ClusterState, ConsensusLog, DatabaseRecord};
use crate::observability::Event;
use crate::security::parse_certificate;

/// Loads databases on demand for the acceptor.
#[async_trait]
pub trait DatabaseResolver: Send + Sync {
    /// Orchestrator of a loaded database, loading it first if idle.
    async fn load(&self, database: &str) -> ReplicationResult<Arc<ReplicationOrchestrator>>;
}

/// Refused handshake.
struct Rejection {
    reason: RejectionReason,
    error: ReplicationError,
}

impl From<ReplicationError> for Rejection {
    fn from(error: ReplicationError) -> Self {
        Self {
            reason: RejectionReason::from_error(&error),
            error,
        }
    }
}

/// What an authorized dialer may do.
struct Admission {
    mode: ReplicationMode,
    terms: IncomingTerms,
    /// Paths this side may send
    outbound_paths: BTreeSet<String>,
    /// Paths this side takes
    inbound_paths: BTreeSet<String>,
    delay: Duration,
}

/// Accepts replication connections for every database on this node.
pub struct IncomingHandler {
    context: Arc<ReplicationContext>,
    consensus: Arc<dyn ConsensusLog>,
    databases: Arc<dyn DatabaseResolver>,
}

impl IncomingHandler {
    pub fn new(
        context: Arc<ReplicationContext>,
        consensus: Arc<dyn ConsensusLog>,
        databases: Arc<dyn DatabaseResolver>,
    ) -> Self {
        Self {
            context,
            consensus,
            databases,
        }
    }

    /// Serve one connection until it ends.
    pub async fn handle(&self, mut stream: BoxedStream, peer: String) {
        let settings = &self.context.settings;
        let handshake = match tokio::time::timeout(settings.handshake_timeout(), read_frame(&mut stream)).await {
            Ok(Ok(Some(Frame::Handshake(handshake)))) => handshake,
            Ok(Ok(Some(other))) => {
                tracing::warn!(peer = %peer, frame = other.name(), "expected a handshake");
                return;
            }
            Ok(Ok(None)) => return,
            Ok(Err(err)) => {
                tracing::warn!(peer = %peer, error = %err.message, "unreadable handshake");
                return;
            }
            Err(_) => {
                tracing::warn!(peer = %peer, "handshake timed out");
                return;
            }
        };

        let runtime = SharedRuntimeState::new();
        if runtime.transition(ConnectionStatus::handshake).is_err() {
            return;
        }

        let orchestrator = match self.admit_database(&handshake).await {
            Ok(orchestrator) => orchestrator,
            Err(rejection) => {
                self.reject(&mut stream, &handshake, None, &runtime, rejection).await;
                return;
            }
        };

        let state = self.consensus.snapshot();
        let Some(record) = state.database(&handshake.database) else {
            let rejection = Rejection::from(ReplicationError::database_missing(&handshake.database));
            self.reject(&mut stream, &handshake, Some(&orchestrator), &runtime, rejection).await;
            return;
        };

        if runtime.transition(ConnectionStatus::authorize).is_err() {
            return;
        }
        let admission = match self.authorize(&handshake, record) {
            Ok(admission) => admission,
            Err(rejection) => {
                self.reject(&mut stream, &handshake, Some(&orchestrator), &runtime, rejection).await;
                return;
            }
        };

        if let Err(err) = self
            .stream(stream, peer, &handshake, &state, record, &orchestrator, admission, runtime)
            .await
        {
            tracing::warn!(
                event = Event::StreamingStopped.as_str(),
                database = %handshake.database,
                source = %handshake.source_database,
                code = err.kind.code(),
                error = %err.message,
                "incoming connection ended"
            );
        }
    }

    async fn admit_database(&self, handshake: &Handshake) -> Result<Arc<ReplicationOrchestrator>, Rejection> {
        if handshake.protocol_version != PROTOCOL_VERSION {
            return Err(Rejection::from(ReplicationError::protocol_mismatch(format!(
                "peer speaks protocol {}, this node speaks {}",
                handshake.protocol_version, PROTOCOL_VERSION
            ))));
        }

        let state = self.consensus.snapshot();
        if state.database(&handshake.database).is_none() {
            return Err(ReplicationError::database_missing(&handshake.database).into());
        }
        if !state.hosts(&self.context.node_tag, &handshake.database) {
            return Err(ReplicationError::topology_exhausted(format!(
                "node {} does not host database '{}'",
                self.context.node_tag, handshake.database
            ))
            .into());
        }

        let load_timeout = self.context.settings.database_load_timeout();
        match tokio::time::timeout(load_timeout, self.databases.load(&handshake.database)).await {
            Ok(Ok(orchestrator)) => Ok(orchestrator),
            Ok(Err(err)) if err.kind == ReplicationErrorKind::DatabaseMissing => Err(err.into()),
            Ok(Err(err)) => Err(ReplicationError::new(
                ReplicationErrorKind::DatabaseIdle,
                format!("database '{}' could not be loaded: {}", handshake.database, err.message),
            )
            .into()),
            Err(_) => Err(ReplicationError::new(
                ReplicationErrorKind::DatabaseIdle,
                format!(
                    "database '{}' did not load within {:?}",
                    handshake.database, load_timeout
                ),
            )
            .into()),
        }
    }

    fn authorize(&self, handshake: &Handshake, record: &DatabaseRecord) -> Result<Admission, Rejection> {
        match handshake.kind {
            ConnectionKind::PullReplicationAsSink => self.authorize_sink(handshake, record),
            ConnectionKind::ExternalReplication => self.authorize_external(handshake),
        }
    }

    fn authorize_sink(&self, handshake: &Handshake, record: &DatabaseRecord) -> Result<Admission, Rejection> {
        let hub_name = handshake.hub_name.as_deref().unwrap_or_default();
        let hub = record
            .hub(hub_name)
            .ok_or_else(|| ReplicationError::unknown_hub(hub_name, &handshake.database))?;
        if hub.disabled {
            return Err(Rejection {
                reason: RejectionReason::HubDisabled,
                error: ReplicationError::transient(format!("hub '{}' is disabled", hub.name)),
            });
        }

        let requested = handshake.requested_mode;
        if requested.is_empty() || !hub.mode.contains(requested) {
            return Err(ReplicationError::authorization(format!(
                "hub '{}' does not allow mode {:?}",
                hub.name, requested
            ))
            .into());
        }

        let mut admission = Admission {
            mode: requested,
            terms: IncomingTerms {
                hub_name: Some(hub.name.clone()),
                thumbprint: None,
                hub_mode: hub.mode,
                with_filtering: hub.with_filtering,
                hub_to_sink_paths: BTreeSet::new(),
                sink_to_hub_paths: BTreeSet::new(),
            },
            outbound_paths: BTreeSet::new(),
            inbound_paths: BTreeSet::new(),
            delay: hub.delay_replication_for,
        };
        if !self.context.security.is_secured() {
            return Ok(admission);
        }

        let encoded = handshake.certificate.as_deref().ok_or_else(|| {
            ReplicationError::authorization(format!("hub '{}' requires a client certificate", hub.name))
        })?;
        let certificate = parse_certificate(encoded)
            .map_err(|e| ReplicationError::authorization(format!("unreadable certificate: {}", e.message)))?;
        let thumbprint = &certificate.info.thumbprint;
        let grant = record.grant(&hub.name, thumbprint).ok_or_else(|| {
            ReplicationError::authorization(format!(
                "certificate {} has no access to hub '{}'",
                thumbprint, hub.name
            ))
        })?;
        let now = Utc::now();
        if !certificate.info.is_valid_at(now) || !grant.certificate_public_info.is_valid_at(now) {
            return Err(ReplicationError::authorization(format!(
                "certificate {} is outside its validity period",
                thumbprint
            ))
            .into());
        }

        if hub.with_filtering {
            // An empty set would read as unfiltered
            if grant.allowed_hub_to_sink_paths.is_empty() {
                return Err(ReplicationError::authorization(format!(
                    "grant for certificate {} on filtered hub '{}' allows no hub-to-sink paths",
                    thumbprint, hub.name
                ))
                .into());
            }
            if requested.contains(ReplicationMode::SINK_TO_HUB) && grant.allowed_sink_to_hub_paths.is_empty() {
                return Err(ReplicationError::authorization(format!(
                    "grant for certificate {} on filtered hub '{}' allows no sink-to-hub paths",
                    thumbprint, hub.name
                ))
                .into());
            }
            admission.outbound_paths = grant.allowed_hub_to_sink_paths.clone();
        }
        admission.inbound_paths = grant.allowed_sink_to_hub_paths.clone();
        admission.terms.thumbprint = Some(thumbprint.clone());
        admission.terms.hub_to_sink_paths = grant.allowed_hub_to_sink_paths.clone();
        admission.terms.sink_to_hub_paths = grant.allowed_sink_to_hub_paths.clone();
        Ok(admission)
    }

    fn authorize_external(&self, handshake: &Handshake) -> Result<Admission, Rejection> {
        if handshake.requested_mode != ReplicationMode::SINK_TO_HUB {
            return Err(ReplicationError::authorization(
                "external replication may only push to its destination",
            )
            .into());
        }
        let mut thumbprint = None;
        if self.context.security.is_secured() {
            let encoded = handshake.certificate.as_deref().ok_or_else(|| {
                ReplicationError::authorization("external replication requires a node certificate")
            })?;
            let certificate = parse_certificate(encoded)
                .map_err(|e| ReplicationError::authorization(format!("unreadable certificate: {}", e.message)))?;
            if !certificate.info.is_valid_at(Utc::now()) {
                return Err(ReplicationError::authorization(format!(
                    "certificate {} is outside its validity period",
                    certificate.info.thumbprint
                ))
                .into());
            }
            thumbprint = Some(certificate.info.thumbprint);
        }
        Ok(Admission {
            mode: ReplicationMode::SINK_TO_HUB,
            terms: IncomingTerms {
                thumbprint,
                ..IncomingTerms::default()
            },
            outbound_paths: BTreeSet::new(),
            inbound_paths: BTreeSet::new(),
            delay: Duration::ZERO,
        })
    }

    async fn reject(
        &self,
        stream: &mut BoxedStream,
        handshake: &Handshake,
        orchestrator: Option<&Arc<ReplicationOrchestrator>>,
        runtime: &SharedRuntimeState,
        rejection: Rejection,
    ) {
        let Rejection { reason, error } = rejection;
        let _ = runtime.transition(ConnectionStatus::fail);
        runtime.record_error(&error);
        self.context.metrics.increment_handshakes_rejected();
        if let Some(orchestrator) = orchestrator {
            orchestrator
                .failures()
                .record_rejection(&handshake.source_database, &error);
        }
        if error.is_fatal() {
            tracing::error!(
                event = Event::HandshakeRejected.as_str(),
                database = %handshake.database,
                source = %handshake.source_database,
                hub = handshake.hub_name.as_deref().unwrap_or(""),
                reason = ?reason,
                error = %error.message,
                "handshake rejected"
            );
        } else {
            tracing::warn!(
                event = Event::HandshakeRejected.as_str(),
                database = %handshake.database,
                source = %handshake.source_database,
                reason = ?reason,
                error = %error.message,
                "handshake refused for now"
            );
        }

        let response = Frame::HandshakeResponse(HandshakeResponse::Rejected {
            reason,
            message: error.message,
        });
        let _ = write_frame(stream, &response, FrameCompression::off()).await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream(
        &self,
        mut stream: BoxedStream,
        peer: String,
        handshake: &Handshake,
        state: &ClusterState,
        record: &DatabaseRecord,
        orchestrator: &Arc<ReplicationOrchestrator>,
        admission: Admission,
        runtime: SharedRuntimeState,
    ) -> ReplicationResult<()> {
        let settings = &self.context.settings;
        let store = Arc::clone(orchestrator.store());
        let last_accepted_etag = store.last_replicated_etag(&handshake.source_database_id)?;
        let topology: Vec<TopologyNode> = record
            .topology
            .live_members(&state.topology)
            .into_iter()
            .filter_map(|tag| {
                state.topology.node(&tag).map(|node| TopologyNode {
                    tag,
                    url: node.url.clone(),
                })
            })
            .collect();
        let compression = handshake.compression && settings.compression;

        let accepted = Frame::HandshakeResponse(HandshakeResponse::Accepted {
            mode: admission.mode,
            database_id: store.database_id().to_string(),
            last_accepted_etag,
            topology,
            compression,
            allowed_paths: admission.inbound_paths.clone(),
        });
        write_frame(&mut stream, &accepted, FrameCompression::off()).await?;
        self.context.metrics.increment_handshakes_accepted();
        tracing::info!(
            event = Event::HandshakeAccepted.as_str(),
            database = %handshake.database,
            source = %handshake.source_database,
            peer = %peer,
            hub = admission.terms.hub_name.as_deref().unwrap_or(""),
            mode = ?admission.mode,
            "handshake accepted"
        );

        let sends = admission.mode.contains(ReplicationMode::HUB_TO_SINK);
        let start_etag = if sends {
            match tokio::time::timeout(settings.handshake_timeout(), read_frame(&mut stream)).await {
                Ok(Ok(Some(Frame::Resume { last_etag }))) => last_etag,
                Ok(Ok(Some(other))) => {
                    return Err(ReplicationError::protocol_mismatch(format!(
                        "expected Resume, got {}",
                        other.name()
                    )))
                }
                Ok(Ok(None)) => return Err(ReplicationError::transient("peer left before resuming")),
                Ok(Err(err)) => return Err(err),
                Err(_) => return Err(ReplicationError::transient("peer did not resume in time")),
            }
        } else {
            0
        };

        runtime.transition(ConnectionStatus::stream)?;
        let registration = orchestrator.register_incoming(
            admission.terms.clone(),
            handshake.source_database.clone(),
            runtime.clone(),
            self.consensus.as_ref(),
        );
        let _active = self.context.idle.register(&handshake.database);
        tracing::info!(
            event = Event::StreamingStarted.as_str(),
            database = %handshake.database,
            source = %handshake.source_database,
            connection = %registration.id(),
            "streaming"
        );

        let session = StreamSession {
            database: handshake.database.clone(),
            peer,
            store,
            runtime: runtime.clone(),
            metrics: Arc::clone(&self.context.metrics),
            compression: FrameCompression {
                enabled: compression,
                threshold_bytes: settings.compression_threshold_bytes,
            },
            heartbeat: settings.heartbeat_interval(),
            max_batch_size: settings.max_batch_size,
            outbound: sends.then(|| OutboundPlan {
                start_etag,
                allowed_paths: admission.outbound_paths.clone(),
                delay: admission.delay,
            }),
            inbound: admission
                .mode
                .contains(ReplicationMode::SINK_TO_HUB)
                .then(|| InboundPlan {
                    source_database_id: handshake.source_database_id.clone(),
                    allowed_paths: admission.inbound_paths.clone(),
                }),
        };
        let result = session.run(stream, registration.cancellation()).await;
        let _ = runtime.transition(|s| Ok(s.dispose()));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{DatabaseTopology, InMemoryConsensus, NodeTag};
    use crate::observability::ReplicationMetrics;
    use crate::replication::{
        HubAccessGrant, HubDefinition, IdleCoordinator, MemoryNetwork, ReplicationSettings, TaskId,
    };
    use crate::security::{generate_certificate, parse_bundle, parse_certificate, ServerSecurity};

    struct NoDatabases;

    #[async_trait]
    impl DatabaseResolver for NoDatabases {
        async fn load(&self, database: &str) -> ReplicationResult<Arc<ReplicationOrchestrator>> {
            Err(ReplicationError::database_missing(database))
        }
    }

    fn handler() -> IncomingHandler {
        let node = generate_certificate("node-a", chrono::Duration::days(1)).unwrap();
        let context = Arc::new(ReplicationContext {
            node_tag: NodeTag::new("A"),
            security: ServerSecurity::secured(parse_bundle(&node.certificate).unwrap()),
            settings: ReplicationSettings::fast(),
            connector: MemoryNetwork::new(),
            idle: IdleCoordinator::new(),
            metrics: Arc::new(ReplicationMetrics::new()),
        });
        IncomingHandler::new(context, Arc::new(InMemoryConsensus::new()), Arc::new(NoDatabases))
    }

    fn paths(paths: &[&str]) -> BTreeSet<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    /// Filtered hub `h1` with one grant, written straight into the record.
    /// Returns the record and the certificate the sink presents.
    fn filtered_record(mode: ReplicationMode, hub_to_sink: &[&str], sink_to_hub: &[&str]) -> (DatabaseRecord, String) {
        let sink = generate_certificate("sink-eu", chrono::Duration::days(1)).unwrap();
        let mut hub = HubDefinition::new("h1", mode);
        hub.task_id = TaskId(1);
        hub.with_filtering = true;

        let mut record = DatabaseRecord::new("orders", DatabaseTopology::new(vec![NodeTag::new("A")]));
        record.hubs.push(hub);
        record.hub_grants.insert(
            "h1".to_string(),
            vec![HubAccessGrant {
                hub_name: "h1".to_string(),
                grant_name: "sink-eu".to_string(),
                certificate_thumbprint: sink.thumbprint.clone(),
                certificate_public_info: parse_certificate(&sink.public_key).unwrap().info,
                allowed_hub_to_sink_paths: paths(hub_to_sink),
                allowed_sink_to_hub_paths: paths(sink_to_hub),
            }],
        );
        let presented = parse_bundle(&sink.certificate).unwrap().certificate.encoded;
        (record, presented)
    }

    fn handshake(mode: ReplicationMode, certificate: String) -> Handshake {
        Handshake {
            protocol_version: PROTOCOL_VERSION,
            kind: ConnectionKind::PullReplicationAsSink,
            database: "orders".to_string(),
            hub_name: Some("h1".to_string()),
            requested_mode: mode,
            source_database: "orders-eu".to_string(),
            source_database_id: "db-orders-eu".to_string(),
            source_node: None,
            certificate: Some(certificate),
            compression: false,
        }
    }

    #[test]
    fn test_filtered_hub_refuses_grant_without_outbound_paths() {
        let (record, certificate) = filtered_record(ReplicationMode::HUB_TO_SINK, &[], &[]);
        let Err(rejection) = handler().authorize(&handshake(ReplicationMode::HUB_TO_SINK, certificate), &record) else {
            panic!("a path-less grant was admitted on a filtered hub");
        };
        assert_eq!(rejection.error.kind, ReplicationErrorKind::Authorization);
        assert!(rejection.error.message.contains("hub-to-sink"));
    }

    #[test]
    fn test_filtered_hub_refuses_push_without_inbound_paths() {
        let (record, certificate) = filtered_record(ReplicationMode::all(), &["users/*"], &[]);
        let handler = handler();

        let Err(rejection) = handler.authorize(&handshake(ReplicationMode::all(), certificate.clone()), &record) else {
            panic!("a push was admitted without sink-to-hub paths");
        };
        assert_eq!(rejection.error.kind, ReplicationErrorKind::Authorization);
        assert!(rejection.error.message.contains("sink-to-hub"));

        // Pulling alone is still fine
        let Ok(admission) = handler.authorize(&handshake(ReplicationMode::HUB_TO_SINK, certificate), &record) else {
            panic!("pull was refused");
        };
        assert_eq!(admission.outbound_paths, paths(&["users/*"]));
    }

    #[test]
    fn test_admission_records_hub_terms() {
        let (record, certificate) = filtered_record(ReplicationMode::all(), &["users/*"], &["inbox/*"]);
        let Ok(admission) = handler().authorize(&handshake(ReplicationMode::all(), certificate), &record) else {
            panic!("grant with paths for both directions was refused");
        };
        assert_eq!(admission.inbound_paths, paths(&["inbox/*"]));
        assert_eq!(admission.terms.hub_name.as_deref(), Some("h1"));
        assert!(admission.terms.with_filtering);
        assert_eq!(admission.terms.hub_mode, ReplicationMode::all());
        assert_eq!(admission.terms.sink_to_hub_paths, paths(&["inbox/*"]));
        assert!(admission.terms.thumbprint.is_some());
    }
}
