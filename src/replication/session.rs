//! Streaming Session
//!
//! The `Streaming` state of a connection, shared by both ends. A session may
//! send, receive, or both, depending on the negotiated mode.
//!
//! # Rules
//!
//! - One batch in flight; the next is built only after the peer's `Ack`
//! - A received batch is applied before it is acked, and acked before the
//!   next frame is read
//! - Items outside the outbound path filter are never sent, but the batch
//!   `LastEtag` still covers them so the cursor moves past
//! - Items younger than the replication delay stop the scan; the session
//!   wakes up when the first of them is old enough
//! - Cancellation waits a bounded time for the in-flight ack, then sends `Close`

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::errors::{ReplicationError, ReplicationResult};
use super::paths::is_allowed;
use super::protocol::{read_frame, write_frame, Ack, Batch, Frame, FrameCompression};
use super::state::SharedRuntimeState;
use super::transport::BoxedStream;
use crate::observability::{Event, ReplicationMetrics};
use crate::storage::DocumentStore;

/// Missed heartbeats before the peer is considered gone.
const HEARTBEAT_MISSES: u32 = 3;

/// What this side sends.
#[derive(Debug, Clone, Default)]
pub struct OutboundPlan {
    /// Etag the peer already has everything up to
    pub start_etag: u64,
    /// Empty means unfiltered
    pub allowed_paths: BTreeSet<String>,
    pub delay: Duration,
}

/// What this side receives.
#[derive(Debug, Clone, Default)]
pub struct InboundPlan {
    /// Database id the peer writes change vectors under
    pub source_database_id: String,
    /// Empty means unfiltered
    pub allowed_paths: BTreeSet<String>,
}

/// A negotiated streaming connection.
pub struct StreamSession {
    pub database: String,
    pub peer: String,
    pub store: Arc<dyn DocumentStore>,
    pub runtime: SharedRuntimeState,
    pub metrics: Arc<ReplicationMetrics>,
    pub compression: FrameCompression,
    pub heartbeat: Duration,
    pub max_batch_size: usize,
    pub outbound: Option<OutboundPlan>,
    pub inbound: Option<InboundPlan>,
}

type Incoming = mpsc::Receiver<ReplicationResult<Frame>>;

struct Progress {
    cursor: u64,
    in_flight: Option<u64>,
    wake_at: Option<Instant>,
    scan: bool,
}

impl StreamSession {
    /// Stream until cancelled (`Ok`) or the connection fails (`Err`).
    pub async fn run(self, stream: BoxedStream, cancel: CancellationToken) -> ReplicationResult<()> {
        let (reader, mut writer) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::channel(16);
        let reader_task = tokio::spawn(read_loop(reader, tx));

        let result = self.stream(&mut writer, &mut rx, &cancel).await;
        reader_task.abort();
        result
    }

    async fn stream(
        &self,
        writer: &mut WriteHalf<BoxedStream>,
        rx: &mut Incoming,
        cancel: &CancellationToken,
    ) -> ReplicationResult<()> {
        let mut progress = Progress {
            cursor: self.outbound.as_ref().map(|o| o.start_etag).unwrap_or(0),
            in_flight: None,
            wake_at: None,
            scan: self.outbound.is_some(),
        };
        let mut changes = self.store.subscribe();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();

        loop {
            if progress.scan && progress.in_flight.is_none() {
                progress.scan = false;
                self.send_next_batch(writer, &mut progress).await?;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.drain_in_flight(rx, &mut progress).await;
                    let close = Frame::Close { reason: "replication stopped".to_string() };
                    // Best effort: the peer may already be gone
                    let _ = write_frame(writer, &close, self.compression).await;
                    return Ok(());
                }
                frame = rx.recv() => {
                    last_seen = Instant::now();
                    match frame {
                        None => {
                            return Err(ReplicationError::transient(format!(
                                "connection to {} closed", self.peer
                            )))
                        }
                        Some(Err(err)) => return Err(err),
                        Some(Ok(frame)) => self.handle_frame(writer, frame, &mut progress).await?,
                    }
                }
                changed = changes.changed(), if self.outbound.is_some() => {
                    if changed.is_err() {
                        return Err(ReplicationError::storage(format!(
                            "document store of '{}' went away", self.database
                        )));
                    }
                    progress.scan = true;
                }
                _ = tokio::time::sleep_until(progress.wake_at.unwrap_or_else(Instant::now)),
                    if progress.wake_at.is_some() => {
                    progress.wake_at = None;
                    progress.scan = true;
                }
                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > self.heartbeat * HEARTBEAT_MISSES {
                        return Err(ReplicationError::transient(format!(
                            "no frames from {} for {:?}", self.peer, last_seen.elapsed()
                        )));
                    }
                    write_frame(writer, &Frame::Heartbeat, self.compression).await?;
                }
            }
        }
    }

    async fn handle_frame(
        &self,
        writer: &mut WriteHalf<BoxedStream>,
        frame: Frame,
        progress: &mut Progress,
    ) -> ReplicationResult<()> {
        match frame {
            Frame::Heartbeat => Ok(()),
            Frame::Ack(ack) => self.acknowledged(ack, progress),
            Frame::Batch(batch) => self.apply(writer, batch).await,
            Frame::Close { reason } => Err(ReplicationError::transient(format!(
                "{} closed the connection: {}",
                self.peer, reason
            ))),
            other => Err(ReplicationError::protocol_mismatch(format!(
                "unexpected {} frame while streaming",
                other.name()
            ))),
        }
    }

    fn acknowledged(&self, ack: Ack, progress: &mut Progress) -> ReplicationResult<()> {
        match progress.in_flight {
            Some(expected) if expected == ack.last_etag => {
                progress.cursor = ack.last_etag;
                progress.in_flight = None;
                progress.scan = true;
                self.runtime.set_last_sent(ack.change_vector);
                Ok(())
            }
            _ => Err(ReplicationError::protocol_mismatch(format!(
                "unexpected ack for etag {} from {}",
                ack.last_etag, self.peer
            ))),
        }
    }

    async fn apply(&self, writer: &mut WriteHalf<BoxedStream>, batch: Batch) -> ReplicationResult<()> {
        let plan = self.inbound.as_ref().ok_or_else(|| {
            ReplicationError::protocol_mismatch(format!("{} sent a batch in a direction not granted", self.peer))
        })?;
        if let Some(item) = batch.items.iter().find(|i| !is_allowed(&plan.allowed_paths, &i.id)) {
            return Err(ReplicationError::authorization(format!(
                "'{}' from {} is outside the allowed paths",
                item.id, self.peer
            )));
        }

        let change_vector = self
            .store
            .apply_batch(&plan.source_database_id, &batch.items, batch.last_etag)?;
        let ack = Frame::Ack(Ack {
            last_etag: batch.last_etag,
            change_vector: change_vector.clone(),
        });
        write_frame(writer, &ack, self.compression).await?;

        self.runtime.set_last_accepted(change_vector);
        self.metrics.record_batch_received(batch.items.len());
        tracing::debug!(
            event = Event::BatchApplied.as_str(),
            database = %self.database,
            peer = %self.peer,
            items = batch.items.len(),
            last_etag = batch.last_etag,
            "batch applied"
        );
        Ok(())
    }

    async fn send_next_batch(
        &self,
        writer: &mut WriteHalf<BoxedStream>,
        progress: &mut Progress,
    ) -> ReplicationResult<()> {
        let Some(plan) = self.outbound.as_ref() else {
            return Ok(());
        };
        let candidates = self.store.changes_after(progress.cursor, self.max_batch_size)?;
        let now = Utc::now();

        let mut items = Vec::new();
        let mut last_etag = progress.cursor;
        for item in candidates {
            if !item.is_older_than(now, plan.delay) {
                let ready_in = chrono::Duration::from_std(plan.delay)
                    .ok()
                    .and_then(|delay| (item.last_modified + delay - now).to_std().ok())
                    .unwrap_or(plan.delay);
                progress.wake_at = Some(Instant::now() + ready_in);
                break;
            }
            last_etag = item.etag;
            if is_allowed(&plan.allowed_paths, &item.id) {
                items.push(item);
            }
        }
        if last_etag == progress.cursor {
            return Ok(());
        }

        let count = items.len();
        let frame = Frame::Batch(Batch { items, last_etag });
        let bytes = write_frame(writer, &frame, self.compression).await?;
        progress.in_flight = Some(last_etag);
        self.metrics.record_batch_sent(count, bytes);
        tracing::debug!(
            event = Event::BatchSent.as_str(),
            database = %self.database,
            peer = %self.peer,
            items = count,
            last_etag,
            "batch sent"
        );
        Ok(())
    }

    async fn drain_in_flight(&self, rx: &mut Incoming, progress: &mut Progress) {
        let deadline = Instant::now() + self.heartbeat * HEARTBEAT_MISSES;
        while progress.in_flight.is_some() {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(Ok(Frame::Ack(ack)))) => {
                    if self.acknowledged(ack, progress).is_err() {
                        return;
                    }
                }
                Ok(Some(Ok(_))) => {}
                _ => return,
            }
        }
    }
}

async fn read_loop(mut reader: ReadHalf<BoxedStream>, tx: mpsc::Sender<ReplicationResult<Frame>>) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => {
                if tx.send(Ok(frame)).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
        }
    }
}
