//! Delivery engine: one flush cycle at a time.
//!
//! ```text
//! IDLE ──► BATCHING ──► SENDING ──► ACKED  ──► IDLE
//!              │                 └─► FAILED ──► IDLE (requeue + backoff)
//!              └── empty queue ──► IDLE
//! ```
//!
//! The engine is synchronous: [`DeliveryEngine::begin`] drains and serializes a
//! batch, the caller submits it through a [`crate::transport::Transport`], and
//! [`DeliveryEngine::complete`] applies the outcome to the queue.

use std::time::{Duration, Instant};

use crate::config::BackoffConfig;
use crate::queue::EventQueue;
use crate::transport::{AckInfo, TransportError};

/// Capped exponential backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&BackoffConfig::default())
    }
}

impl From<&BackoffConfig> for BackoffPolicy {
    fn from(config: &BackoffConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_ms),
            max: Duration::from_millis(config.max_ms),
            multiplier: config.multiplier.max(1),
        }
    }
}

impl BackoffPolicy {
    /// Delay after `failures` consecutive failures (`failures >= 1`).
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1);
        let factor = self.multiplier.saturating_pow(exponent);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug)]
struct Backoff {
    policy: BackoffPolicy,
    failures: u32,
    until: Option<Instant>,
}

impl Backoff {
    fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: 0,
            until: None,
        }
    }

    fn record_failure(&mut self, now: Instant, retry_after: Option<Duration>) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let mut delay = self.policy.delay(self.failures);
        if let Some(requested) = retry_after {
            delay = delay.max(requested.min(self.policy.max));
        }
        self.until = Some(now + delay);
        delay
    }

    fn reset(&mut self) {
        self.failures = 0;
        self.until = None;
    }

    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.until
            .and_then(|until| until.checked_duration_since(now))
            .filter(|d| !d.is_zero())
    }
}

/// A serialized batch ready for submission.
#[derive(Debug, Clone)]
pub struct PreparedBatch {
    /// Queue entry ids in delivery order
    pub ids: Vec<u64>,
    /// JSON array of wire events
    pub payload: Vec<u8>,
}

impl PreparedBatch {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Why a cycle did or did not start.
#[derive(Debug)]
pub enum CycleStart {
    /// A batch was drained; submit it and report back with `complete`
    Send(PreparedBatch),
    /// A batch is already being sent; this request rides on it
    Coalesced,
    /// Nothing to send
    Empty,
    /// Still backing off from an earlier failure
    BackingOff(Duration),
    /// The drained batch could not be serialized and was dropped
    Dropped(usize),
}

/// What happened to a submitted batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Delivered and removed from the queue
    Acked(usize),
    /// Permanently rejected and removed from the queue
    Dropped(usize),
    /// Returned to the queue; next attempt not before `retry_in`
    Requeued { count: usize, retry_in: Duration },
}

/// Engine phase between calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryPhase {
    Idle,
    Sending { ids: Vec<u64> },
}

/// Batches queued events and applies submission outcomes.
#[derive(Debug)]
pub struct DeliveryEngine {
    batch_size: usize,
    phase: DeliveryPhase,
    backoff: Backoff,
}

impl DeliveryEngine {
    pub fn new(batch_size: usize, policy: BackoffPolicy) -> Self {
        Self {
            batch_size: batch_size.max(1),
            phase: DeliveryPhase::Idle,
            backoff: Backoff::new(policy),
        }
    }

    pub fn phase(&self) -> &DeliveryPhase {
        &self.phase
    }

    pub fn is_sending(&self) -> bool {
        matches!(self.phase, DeliveryPhase::Sending { .. })
    }

    /// Time left before an automatic attempt may start.
    pub fn backoff_remaining(&self, now: Instant) -> Option<Duration> {
        self.backoff.remaining(now)
    }

    /// Consecutive failed cycles since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.backoff.failures
    }

    /// Start a cycle. `bypass_backoff` is set for explicit flush requests.
    pub fn begin(
        &mut self,
        queue: &mut EventQueue,
        bypass_backoff: bool,
        now: Instant,
    ) -> CycleStart {
        if self.is_sending() {
            tracing::debug!("Flush requested while sending, coalescing");
            return CycleStart::Coalesced;
        }
        if !bypass_backoff {
            if let Some(remaining) = self.backoff.remaining(now) {
                tracing::debug!(?remaining, "Flush skipped, backing off");
                return CycleStart::BackingOff(remaining);
            }
        }

        let entries = queue.drain_batch(self.batch_size);
        if entries.is_empty() {
            return CycleStart::Empty;
        }

        let ids: Vec<u64> = entries.iter().map(|e| e.id).collect();
        let wire: Vec<serde_json::Value> = entries.iter().map(|e| e.event.to_json()).collect();
        match serde_json::to_vec(&wire) {
            Ok(payload) => {
                tracing::debug!(count = ids.len(), bytes = payload.len(), "Sending batch");
                self.phase = DeliveryPhase::Sending { ids: ids.clone() };
                CycleStart::Send(PreparedBatch { ids, payload })
            }
            Err(e) => {
                tracing::error!(error = %e, count = ids.len(), "Failed to serialize batch, dropping it");
                CycleStart::Dropped(queue.acknowledge(&ids))
            }
        }
    }

    /// Apply the outcome of the in-flight submission and return to idle.
    pub fn complete(
        &mut self,
        queue: &mut EventQueue,
        result: std::result::Result<AckInfo, TransportError>,
        now: Instant,
    ) -> Disposition {
        let ids = match std::mem::replace(&mut self.phase, DeliveryPhase::Idle) {
            DeliveryPhase::Sending { ids } => ids,
            DeliveryPhase::Idle => {
                tracing::warn!("Submission outcome arrived with no batch in flight");
                Vec::new()
            }
        };

        match result {
            Ok(ack) => {
                self.backoff.reset();
                let count = queue.acknowledge(&ids);
                tracing::info!(count, status = ack.status, "Batch delivered");
                Disposition::Acked(count)
            }
            Err(e) if e.is_permanent() => {
                self.backoff.reset();
                let count = queue.acknowledge(&ids);
                tracing::warn!(count, error = %e, "Batch permanently rejected, dropping it");
                Disposition::Dropped(count)
            }
            Err(e) => {
                let retry_in = self.backoff.record_failure(now, e.retry_after());
                let count = queue.requeue(&ids);
                tracing::warn!(
                    count,
                    error = %e,
                    failures = self.backoff.failures,
                    ?retry_in,
                    "Batch delivery failed, requeued"
                );
                Disposition::Requeued { count, retry_in }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Event, Properties};
    use chrono::Utc;

    fn queue_with(names: &[&str]) -> EventQueue {
        let mut queue = EventQueue::new(100);
        for name in names {
            queue.enqueue(
                Event {
                    name: name.to_string(),
                    timestamp: Utc::now(),
                    properties: Properties::new(),
                    custom: Properties::new(),
                },
                Utc::now(),
            );
        }
        queue
    }

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(8),
            multiplier: 2,
        }
    }

    fn sent(start: CycleStart) -> PreparedBatch {
        match start {
            CycleStart::Send(batch) => batch,
            other => panic!("expected a batch, got {:?}", other),
        }
    }

    #[test]
    fn test_backoff_growth_is_capped() {
        let policy = policy();
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(4), Duration::from_secs(8));
        assert_eq!(policy.delay(40), Duration::from_secs(8));
    }

    #[test]
    fn test_empty_queue_returns_to_idle() {
        let mut engine = DeliveryEngine::new(10, policy());
        let mut queue = EventQueue::new(10);
        assert!(matches!(
            engine.begin(&mut queue, false, Instant::now()),
            CycleStart::Empty
        ));
        assert_eq!(engine.phase(), &DeliveryPhase::Idle);
    }

    #[test]
    fn test_ack_removes_batch() {
        let mut engine = DeliveryEngine::new(2, policy());
        let mut queue = queue_with(&["a", "b", "c"]);

        let batch = sent(engine.begin(&mut queue, false, Instant::now()));
        assert_eq!(batch.len(), 2);
        let wire: serde_json::Value = serde_json::from_slice(&batch.payload).unwrap();
        assert_eq!(wire[0]["event"], "a");
        assert_eq!(wire[1]["event"], "b");

        let outcome = engine.complete(&mut queue, Ok(AckInfo { status: 200 }), Instant::now());
        assert_eq!(outcome, Disposition::Acked(2));
        assert_eq!(queue.len(), 1);
        assert!(!engine.is_sending());
    }

    #[test]
    fn test_second_request_is_coalesced() {
        let mut engine = DeliveryEngine::new(10, policy());
        let mut queue = queue_with(&["a"]);
        let _batch = sent(engine.begin(&mut queue, true, Instant::now()));
        assert!(matches!(
            engine.begin(&mut queue, true, Instant::now()),
            CycleStart::Coalesced
        ));
    }

    #[test]
    fn test_timeout_requeues_in_order_and_backs_off() {
        let mut engine = DeliveryEngine::new(10, policy());
        let mut queue = queue_with(&["a", "b", "c"]);
        let now = Instant::now();

        let batch = sent(engine.begin(&mut queue, false, now));
        assert_eq!(batch.len(), 3);
        let outcome = engine.complete(&mut queue, Err(TransportError::Timeout), now);
        assert_eq!(
            outcome,
            Disposition::Requeued {
                count: 3,
                retry_in: Duration::from_secs(1)
            }
        );

        queue.enqueue(
            Event {
                name: "d".to_string(),
                timestamp: Utc::now(),
                properties: Properties::new(),
                custom: Properties::new(),
            },
            Utc::now(),
        );

        assert!(matches!(
            engine.begin(&mut queue, false, now),
            CycleStart::BackingOff(_)
        ));

        let later = now + Duration::from_secs(2);
        let retry = sent(engine.begin(&mut queue, false, later));
        let wire: serde_json::Value = serde_json::from_slice(&retry.payload).unwrap();
        let names: Vec<&str> = wire
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["event"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
        let attempts: Vec<u32> = queue.iter().map(|e| e.attempts).collect();
        assert_eq!(attempts, vec![1, 1, 1, 0]);
    }

    #[test]
    fn test_manual_flush_bypasses_backoff() {
        let mut engine = DeliveryEngine::new(10, policy());
        let mut queue = queue_with(&["a"]);
        let now = Instant::now();
        let _ = sent(engine.begin(&mut queue, false, now));
        engine.complete(&mut queue, Err(TransportError::Timeout), now);

        assert!(engine.backoff_remaining(now).is_some());
        assert!(matches!(
            engine.begin(&mut queue, true, now),
            CycleStart::Send(_)
        ));
    }

    #[test]
    fn test_permanent_rejection_drops_batch() {
        let mut engine = DeliveryEngine::new(10, policy());
        let mut queue = queue_with(&["a", "b"]);
        let now = Instant::now();
        let _ = sent(engine.begin(&mut queue, false, now));

        let outcome = engine.complete(
            &mut queue,
            Err(TransportError::Rejected {
                status: 400,
                message: "malformed".to_string(),
                retry_after: None,
            }),
            now,
        );
        assert_eq!(outcome, Disposition::Dropped(2));
        assert!(queue.is_empty());
        assert!(engine.backoff_remaining(now).is_none());
    }

    #[test]
    fn test_retry_after_extends_backoff() {
        let mut engine = DeliveryEngine::new(10, policy());
        let mut queue = queue_with(&["a"]);
        let now = Instant::now();
        let _ = sent(engine.begin(&mut queue, false, now));

        let outcome = engine.complete(
            &mut queue,
            Err(TransportError::Rejected {
                status: 429,
                message: "slow down".to_string(),
                retry_after: Some(Duration::from_secs(5)),
            }),
            now,
        );
        assert_eq!(
            outcome,
            Disposition::Requeued {
                count: 1,
                retry_in: Duration::from_secs(5)
            }
        );
    }

    #[test]
    fn test_success_resets_backoff() {
        let mut engine = DeliveryEngine::new(10, policy());
        let mut queue = queue_with(&["a"]);
        let now = Instant::now();
        let _ = sent(engine.begin(&mut queue, true, now));
        engine.complete(&mut queue, Err(TransportError::Timeout), now);
        let _ = sent(engine.begin(&mut queue, true, now));
        engine.complete(&mut queue, Err(TransportError::Timeout), now);
        assert_eq!(engine.consecutive_failures(), 2);

        let _ = sent(engine.begin(&mut queue, true, now));
        engine.complete(&mut queue, Ok(AckInfo { status: 200 }), now);
        assert_eq!(engine.consecutive_failures(), 0);
        assert!(engine.backoff_remaining(now).is_none());
    }
}
