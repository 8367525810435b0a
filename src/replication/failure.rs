//! Failure Tracking and Retry Policy
//!
//! Rolling, bounded error logs per destination (outgoing) and per source
//! (incoming). They are diagnostic only; nothing decides correctness from them.

use std::collections::{HashMap, VecDeque};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::{thread_rng, Rng};
use serde::Serialize;

use super::errors::ReplicationError;

/// Exponential backoff with a cap and optional jitter.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Option<Duration>,
    jitter_fraction: f64,
}

impl RetryPolicy {
    pub fn exponential(base_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: None,
            jitter_fraction: 0.0,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = if max_delay.is_zero() {
            None
        } else {
            Some(max_delay)
        };
        self
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (1-based). Never exceeds the cap.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let shift = attempt.saturating_sub(1).min(31);
        let scaled = self.base_delay.as_millis().saturating_mul(1u128 << shift);
        let raw = Duration::from_millis(scaled.min(u128::from(u64::MAX)) as u64);
        let bounded = match self.max_delay {
            Some(max) => raw.min(max),
            None => raw,
        };
        if bounded.is_zero() || self.jitter_fraction <= 0.0 {
            return bounded;
        }
        // Jitter only shortens so the cap holds
        let factor = thread_rng().gen_range((1.0 - self.jitter_fraction)..=1.0);
        Duration::from_millis((bounded.as_millis() as f64 * factor).round() as u64)
    }
}

/// One recorded failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct FailureRecord {
    pub at: DateTime<Utc>,
    pub code: &'static str,
    pub message: String,
}

impl FailureRecord {
    fn from_error(err: &ReplicationError) -> Self {
        Self {
            at: Utc::now(),
            code: err.kind.code(),
            message: err.message.clone(),
        }
    }
}

/// Failures seen dialing one destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct OutgoingFailureInfo {
    pub destination: String,
    /// Failures since the last successful connection
    pub consecutive_failures: u32,
    pub errors: VecDeque<FailureRecord>,
}

/// Handshakes rejected from one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct IncomingRejectionStats {
    pub source: String,
    pub total_rejections: u64,
    pub rejections: VecDeque<FailureRecord>,
}

/// Copy of both logs for status queries.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct FailureSnapshot {
    pub outgoing: Vec<OutgoingFailureInfo>,
    pub incoming: Vec<IncomingRejectionStats>,
}

fn push_bounded(log: &mut VecDeque<FailureRecord>, record: FailureRecord, capacity: usize) {
    log.push_back(record);
    while log.len() > capacity {
        log.pop_front();
    }
}

/// Per-database failure logs shared by both directions.
#[derive(Debug)]
pub struct FailureTracker {
    capacity: usize,
    outgoing: RwLock<HashMap<String, OutgoingFailureInfo>>,
    incoming: RwLock<HashMap<String, IncomingRejectionStats>>,
}

impl FailureTracker {
    /// Create a tracker keeping at most `capacity` entries per key.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            outgoing: RwLock::new(HashMap::new()),
            incoming: RwLock::new(HashMap::new()),
        }
    }

    // Diagnostics survive a panicked writer
    fn outgoing_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, OutgoingFailureInfo>> {
        self.outgoing.write().unwrap_or_else(|p| p.into_inner())
    }

    fn outgoing_ref(&self) -> RwLockReadGuard<'_, HashMap<String, OutgoingFailureInfo>> {
        self.outgoing.read().unwrap_or_else(|p| p.into_inner())
    }

    fn incoming_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, IncomingRejectionStats>> {
        self.incoming.write().unwrap_or_else(|p| p.into_inner())
    }

    fn incoming_ref(&self) -> RwLockReadGuard<'_, HashMap<String, IncomingRejectionStats>> {
        self.incoming.read().unwrap_or_else(|p| p.into_inner())
    }

    /// Record a failed attempt against a destination. Returns the consecutive count.
    pub fn record_outgoing(&self, destination: &str, err: &ReplicationError) -> u32 {
        let mut map = self.outgoing_mut();
        let info = map
            .entry(destination.to_string())
            .or_insert_with(|| OutgoingFailureInfo {
                destination: destination.to_string(),
                consecutive_failures: 0,
                errors: VecDeque::new(),
            });
        info.consecutive_failures = info.consecutive_failures.saturating_add(1);
        push_bounded(&mut info.errors, FailureRecord::from_error(err), self.capacity);
        info.consecutive_failures
    }

    /// Reset the consecutive count after a successful connection. History is kept.
    pub fn record_outgoing_success(&self, destination: &str) {
        if let Some(info) = self.outgoing_mut().get_mut(destination) {
            info.consecutive_failures = 0;
        }
    }

    /// Record a rejected inbound handshake.
    pub fn record_rejection(&self, source: &str, err: &ReplicationError) {
        let mut map = self.incoming_mut();
        let stats = map
            .entry(source.to_string())
            .or_insert_with(|| IncomingRejectionStats {
                source: source.to_string(),
                total_rejections: 0,
                rejections: VecDeque::new(),
            });
        stats.total_rejections = stats.total_rejections.saturating_add(1);
        push_bounded(&mut stats.rejections, FailureRecord::from_error(err), self.capacity);
    }

    pub fn outgoing(&self, destination: &str) -> Option<OutgoingFailureInfo> {
        self.outgoing_ref().get(destination).cloned()
    }

    pub fn incoming(&self, source: &str) -> Option<IncomingRejectionStats> {
        self.incoming_ref().get(source).cloned()
    }

    /// Copy of both logs, sorted by key.
    pub fn snapshot(&self) -> FailureSnapshot {
        let mut outgoing: Vec<_> = self.outgoing_ref().values().cloned().collect();
        outgoing.sort_by(|a, b| a.destination.cmp(&b.destination));
        let mut incoming: Vec<_> = self.incoming_ref().values().cloned().collect();
        incoming.sort_by(|a, b| a.source.cmp(&b.source));
        FailureSnapshot { outgoing, incoming }
    }
}
