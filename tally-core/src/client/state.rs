//! Client state owned by the worker.
//!
//! Every mutation runs here, one at a time, on the worker thread. Network I/O
//! is the only thing that happens elsewhere; its outcome comes back through
//! [`ClientState::complete_submission`].

use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::delivery::{CycleStart, DeliveryEngine, Disposition, PreparedBatch};
use crate::enrich::{DeviceContext, Enricher, EventDraft};
use crate::error::Result;
use crate::identity::{fresh_identifier, IdentifierProvider, IdentityStore};
use crate::persistence::{PersistenceManager, Snapshot, SNAPSHOT_VERSION};
use crate::push::{campaign_properties, CAMPAIGN_EVENT};
use crate::queue::EventQueue;
use crate::scheduler::{FlushScheduler, FlushTrigger};
use crate::timer::TimerRegistry;
use crate::transport::{track_endpoint, AckInfo, TransportError};
use crate::types::{validate_properties, Properties, Value};

use super::options::ClientOptions;
use super::{FlushReport, Settings};

/// Event used to link an alias to a distinct id.
pub const ALIAS_EVENT: &str = "$create_alias";

/// Bookkeeping for one flush request, which may span several batches.
struct FlushChain {
    report: FlushReport,
    waiters: Vec<Sender<FlushReport>>,
}

pub(crate) struct ClientState {
    token: String,
    server_url: String,
    context: DeviceContext,
    identity: IdentityStore,
    timers: TimerRegistry,
    queue: EventQueue,
    engine: DeliveryEngine,
    pub(crate) scheduler: FlushScheduler,
    persistence: PersistenceManager,
    identifiers: Box<dyn IdentifierProvider>,
    show_network_activity_indicator: bool,
    dirty: bool,
    chain: Option<FlushChain>,
}

impl ClientState {
    /// Build state from options, restoring the last snapshot for the token.
    pub(crate) fn new(
        options: &ClientOptions,
        persistence: PersistenceManager,
        identifiers: Box<dyn IdentifierProvider>,
    ) -> Self {
        let restored = persistence.restore();

        let (identity, timers, queue) = match restored {
            Some(snapshot) => (
                IdentityStore::from_parts(
                    snapshot.distinct_id,
                    snapshot.name_tag,
                    snapshot.super_properties,
                    || fresh_identifier(identifiers.as_ref()),
                ),
                TimerRegistry::from_map(snapshot.timed_events),
                EventQueue::restore(options.max_queue_size, snapshot.queue),
            ),
            None => (
                IdentityStore::new(fresh_identifier(identifiers.as_ref())),
                TimerRegistry::new(),
                EventQueue::new(options.max_queue_size),
            ),
        };

        Self {
            token: options.token.clone(),
            server_url: options.server_url.clone(),
            context: options.context.clone(),
            identity,
            timers,
            queue,
            engine: DeliveryEngine::new(options.batch_size, options.backoff),
            scheduler: FlushScheduler::new(options.flush_interval, options.flush_on_background),
            persistence,
            identifiers,
            show_network_activity_indicator: options.show_network_activity_indicator,
            dirty: false,
            chain: None,
        }
    }

    // ============================================
    // Tracking
    // ============================================

    /// Enrich and enqueue. Invalid properties make this a logged no-op.
    pub(crate) fn track(&mut self, draft: EventDraft) -> bool {
        if let Err(e) = validate_properties(&draft.properties)
            .and_then(|_| validate_properties(&draft.custom))
        {
            tracing::warn!(event = %draft.name, error = %e, "Rejected event");
            return false;
        }

        let enricher = Enricher {
            token: &self.token,
            context: &self.context,
            identity: &self.identity,
        };
        let event = enricher.enrich(draft, &mut self.timers);
        tracing::trace!(event = %event.name, "Enqueued event");
        self.queue.enqueue(event, Utc::now());
        self.dirty = true;
        true
    }

    pub(crate) fn track_push_notification(&mut self, payload: &Properties) -> bool {
        match campaign_properties(payload) {
            Some(props) => self.track(EventDraft::named(CAMPAIGN_EVENT, props)),
            None => {
                tracing::debug!("Push payload has no campaign identifiers, not tracking");
                false
            }
        }
    }

    pub(crate) fn create_alias(&mut self, alias: &str, distinct_id: &str) -> bool {
        if alias.is_empty() || distinct_id.is_empty() {
            tracing::warn!("createAlias needs a non-empty alias and distinct id, ignoring");
            return false;
        }
        let props = Properties::from([
            ("alias".to_string(), Value::from(alias)),
            ("distinct_id".to_string(), Value::from(distinct_id)),
        ]);
        self.track(EventDraft::named(ALIAS_EVENT, props))
    }

    // ============================================
    // Identity & timers
    // ============================================

    pub(crate) fn identify(&mut self, distinct_id: &str) {
        if self.identity.identify(distinct_id) {
            self.dirty = true;
        }
    }

    pub(crate) fn distinct_id(&self) -> &str {
        self.identity.distinct_id()
    }

    pub(crate) fn set_name_tag(&mut self, name_tag: Option<String>) {
        self.identity.set_name_tag(name_tag);
        self.dirty = true;
    }

    pub(crate) fn register_super_properties(&mut self, props: Properties) {
        if let Err(e) = validate_properties(&props) {
            tracing::warn!(error = %e, "Rejected super properties");
            return;
        }
        self.identity.register_super_properties(props);
        self.dirty = true;
    }

    pub(crate) fn register_super_properties_once(
        &mut self,
        props: Properties,
        default_value: Option<Value>,
    ) {
        if let Err(e) = validate_properties(&props) {
            tracing::warn!(error = %e, "Rejected super properties");
            return;
        }
        self.identity
            .register_super_properties_once(props, default_value.as_ref());
        self.dirty = true;
    }

    pub(crate) fn unregister_super_property(&mut self, name: &str) {
        self.identity.unregister_super_property(name);
        self.dirty = true;
    }

    pub(crate) fn clear_super_properties(&mut self) {
        self.identity.clear_super_properties();
        self.dirty = true;
    }

    pub(crate) fn current_super_properties(&self) -> Properties {
        self.identity.current_super_properties()
    }

    pub(crate) fn time_event(&mut self, name: &str, at: DateTime<Utc>) {
        self.timers.time_event(name, at);
        self.dirty = true;
    }

    pub(crate) fn clear_timed_events(&mut self) {
        self.timers.clear();
        self.dirty = true;
    }

    /// Forget identity, timers and every queued event; start from a fresh id.
    pub(crate) fn reset(&mut self) {
        let fresh = fresh_identifier(self.identifiers.as_ref());
        self.identity.reset(fresh);
        self.timers.clear();
        self.queue.clear();
        self.dirty = true;
        tracing::info!("Client state reset");
        self.archive_logged();
    }

    // ============================================
    // Settings
    // ============================================

    pub(crate) fn endpoint(&self) -> String {
        track_endpoint(&self.server_url, &self.token)
    }

    pub(crate) fn set_server_url(&mut self, server_url: String) {
        if server_url.trim().is_empty() {
            tracing::warn!("Ignoring empty server URL");
            return;
        }
        self.server_url = server_url;
    }

    pub(crate) fn show_network_activity_indicator(&self) -> bool {
        self.show_network_activity_indicator
    }

    pub(crate) fn set_show_network_activity_indicator(&mut self, enabled: bool) {
        self.show_network_activity_indicator = enabled;
    }

    pub(crate) fn settings(&self) -> Settings {
        Settings {
            server_url: self.server_url.clone(),
            flush_interval: self.scheduler.flush_interval().unwrap_or(Duration::ZERO),
            flush_on_background: self.scheduler.flush_on_background(),
            show_network_activity_indicator: self.show_network_activity_indicator,
            has_delegate: self.scheduler.has_delegate(),
        }
    }

    pub(crate) fn queued_count(&self) -> usize {
        self.queue.len()
    }

    // ============================================
    // Flushing
    // ============================================

    /// Handle a flush request. Returns a batch when one should be submitted.
    pub(crate) fn request_flush(
        &mut self,
        trigger: FlushTrigger,
        waiter: Option<Sender<FlushReport>>,
        now: Instant,
    ) -> Option<PreparedBatch> {
        if let Some(chain) = self.chain.as_mut() {
            tracing::debug!(?trigger, "Flush already in progress, coalescing");
            chain.waiters.extend(waiter);
            return None;
        }

        if !self.scheduler.permits(trigger) {
            reply(
                waiter,
                FlushReport {
                    deferred: true,
                    ..Default::default()
                },
            );
            return None;
        }

        let mut report = FlushReport::default();
        loop {
            match self
                .engine
                .begin(&mut self.queue, trigger.bypasses_backoff(), now)
            {
                CycleStart::Send(batch) => {
                    self.chain = Some(FlushChain {
                        report,
                        waiters: waiter.into_iter().collect(),
                    });
                    return Some(batch);
                }
                CycleStart::Dropped(count) => {
                    report.dropped += count;
                    self.dirty = true;
                }
                CycleStart::BackingOff(remaining) => {
                    report.backing_off = Some(remaining);
                    break;
                }
                CycleStart::Empty | CycleStart::Coalesced => break,
            }
        }

        reply(waiter, report);
        None
    }

    /// Apply a submission outcome. Returns the next batch of the same flush
    /// when the last one was accepted and more events are waiting.
    pub(crate) fn complete_submission(
        &mut self,
        result: std::result::Result<AckInfo, TransportError>,
        now: Instant,
    ) -> Option<PreparedBatch> {
        let disposition = self.engine.complete(&mut self.queue, result, now);
        self.dirty = true;

        let Some(mut chain) = self.chain.take() else {
            return None;
        };

        let keep_going = match disposition {
            Disposition::Acked(count) => {
                chain.report.acknowledged += count;
                true
            }
            Disposition::Dropped(count) => {
                chain.report.dropped += count;
                true
            }
            Disposition::Requeued { count, retry_in } => {
                chain.report.requeued += count;
                chain.report.backing_off = Some(retry_in);
                false
            }
        };

        if keep_going {
            loop {
                match self.engine.begin(&mut self.queue, true, now) {
                    CycleStart::Send(batch) => {
                        self.chain = Some(chain);
                        return Some(batch);
                    }
                    CycleStart::Dropped(count) => chain.report.dropped += count,
                    _ => break,
                }
            }
        }

        if chain.report.acknowledged + chain.report.dropped > 0 {
            self.archive_logged();
        }
        tracing::debug!(report = ?chain.report, "Flush finished");
        for waiter in chain.waiters {
            let _ = waiter.send(chain.report.clone());
        }
        None
    }

    // ============================================
    // Persistence
    // ============================================

    pub(crate) fn snapshot(&self) -> Snapshot {
        Snapshot {
            version: SNAPSHOT_VERSION,
            token: self.token.clone(),
            distinct_id: self.identity.distinct_id().to_string(),
            name_tag: self.identity.name_tag().map(str::to_string),
            super_properties: self.identity.current_super_properties(),
            timed_events: self.timers.as_map().clone(),
            queue: self.queue.iter().cloned().collect(),
        }
    }

    pub(crate) fn archive(&mut self) -> Result<()> {
        self.persistence.archive(&self.snapshot())?;
        self.dirty = false;
        Ok(())
    }

    /// Archive, logging instead of returning failures.
    pub(crate) fn archive_logged(&mut self) {
        if let Err(e) = self.archive() {
            tracing::warn!(error = %e, "Failed to archive client state");
        }
    }

    pub(crate) fn archive_if_dirty(&mut self) {
        if self.dirty {
            self.archive_logged();
        }
    }
}

fn reply(waiter: Option<Sender<FlushReport>>, report: FlushReport) {
    if let Some(waiter) = waiter {
        let _ = waiter.send(report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::BackoffPolicy;
    use crate::persistence::MemoryStore;
    use crate::scheduler::{weak_delegate, FlushDelegate};
    use crate::timer::DURATION_PROPERTY;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};

    struct Sequence(AtomicUsize);

    impl IdentifierProvider for Arc<Sequence> {
        fn default_identifier(&self) -> String {
            format!("device-{}", self.0.fetch_add(1, Ordering::SeqCst))
        }
    }

    struct Deny;

    impl FlushDelegate for Deny {
        fn should_flush(&self) -> bool {
            false
        }
    }

    fn options() -> ClientOptions {
        ClientOptions::new("tok", "https://ingest.example.com")
            .with_batch_size(2)
            .with_max_queue_size(5)
            .with_backoff(BackoffPolicy {
                initial: Duration::from_secs(10),
                max: Duration::from_secs(60),
                multiplier: 2,
            })
    }

    fn state_with(store: &MemoryStore) -> ClientState {
        ClientState::new(
            &options(),
            PersistenceManager::new("tok", Box::new(store.clone())),
            Box::new(Arc::new(Sequence(AtomicUsize::new(0)))),
        )
    }

    fn props(pairs: &[(&str, Value)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn queued_names(state: &ClientState) -> Vec<String> {
        state.queue.iter().map(|e| e.event.name.clone()).collect()
    }

    fn ok() -> std::result::Result<AckInfo, TransportError> {
        Ok(AckInfo { status: 200 })
    }

    #[test]
    fn test_identify_then_track() {
        let mut state = state_with(&MemoryStore::new());
        assert_eq!(state.distinct_id(), "device-0");

        state.identify("u1");
        state.track(EventDraft::named("Signup", Properties::new()));
        state.identify("u2");

        let entry = state.queue.iter().next().unwrap();
        assert_eq!(entry.event.properties["distinct_id"], Value::from("u1"));
    }

    #[test]
    fn test_reset_regenerates_identity_and_clears_queue() {
        let mut state = state_with(&MemoryStore::new());
        state.identify("u1");
        state.register_super_properties(props(&[("plan", "pro".into())]));
        state.time_event("Upload", Utc::now());
        state.track(EventDraft::named("Signup", Properties::new()));

        state.reset();
        assert_eq!(state.distinct_id(), "device-1");
        assert_eq!(state.queued_count(), 0);
        assert!(state.current_super_properties().is_empty());
        assert!(state.timers.is_empty());
    }

    #[test]
    fn test_invalid_properties_are_dropped() {
        let mut state = state_with(&MemoryStore::new());
        assert!(!state.track(EventDraft::named(
            "Bad",
            props(&[("ratio", Value::Float(f64::NAN))])
        )));
        state.register_super_properties(props(&[("x", Value::Float(f64::INFINITY))]));

        assert_eq!(state.queued_count(), 0);
        assert!(state.current_super_properties().is_empty());
    }

    #[test]
    fn test_timed_event_duration() {
        let mut state = state_with(&MemoryStore::new());
        state.time_event("Upload", Utc::now() - chrono::Duration::seconds(1));
        state.track(EventDraft::named("Upload", Properties::new()));
        state.track(EventDraft::named("Upload", Properties::new()));

        let durations: Vec<bool> = state
            .queue
            .iter()
            .map(|e| e.event.properties.contains_key(DURATION_PROPERTY))
            .collect();
        assert_eq!(durations, vec![true, false]);
        match &state.queue.iter().next().unwrap().event.properties[DURATION_PROPERTY] {
            Value::Float(secs) => assert!(*secs >= 0.0),
            other => panic!("unexpected duration {:?}", other),
        };
    }

    #[test]
    fn test_alias_and_push_events() {
        let mut state = state_with(&MemoryStore::new());
        assert!(state.create_alias("ada@example.com", "u1"));
        assert!(!state.create_alias("", "u1"));

        let payload = props(&[(
            "mp",
            Value::Map(props(&[("m", 7.into()), ("c", 3.into())])),
        )]);
        assert!(state.track_push_notification(&payload));
        assert!(!state.track_push_notification(&Properties::new()));

        assert_eq!(queued_names(&state), vec![ALIAS_EVENT, CAMPAIGN_EVENT]);
        let alias = state.queue.iter().next().unwrap();
        assert_eq!(alias.event.properties["distinct_id"], Value::from("u1"));
        assert_eq!(alias.event.properties["alias"], Value::from("ada@example.com"));
        assert_eq!(state.distinct_id(), "device-0");
    }

    #[test]
    fn test_flush_chain_drains_queue() {
        let mut state = state_with(&MemoryStore::new());
        for name in ["a", "b", "c"] {
            state.track(EventDraft::named(name, Properties::new()));
        }

        let (tx, rx) = mpsc::channel();
        let now = Instant::now();
        let first = state
            .request_flush(FlushTrigger::Manual, Some(tx), now)
            .unwrap();
        assert_eq!(first.len(), 2);

        let second = state.complete_submission(ok(), now).unwrap();
        assert_eq!(second.len(), 1);
        assert!(rx.try_recv().is_err());

        assert!(state.complete_submission(ok(), now).is_none());
        let report = rx.try_recv().unwrap();
        assert_eq!(report.acknowledged, 3);
        assert_eq!(state.queued_count(), 0);
    }

    #[test]
    fn test_flush_coalesces_while_sending() {
        let mut state = state_with(&MemoryStore::new());
        state.track(EventDraft::named("a", Properties::new()));
        let now = Instant::now();

        assert!(state.request_flush(FlushTrigger::Manual, None, now).is_some());
        let (tx, rx) = mpsc::channel();
        assert!(state
            .request_flush(FlushTrigger::Periodic, Some(tx), now)
            .is_none());

        assert!(state.complete_submission(ok(), now).is_none());
        assert_eq!(rx.try_recv().unwrap().acknowledged, 1);
    }

    #[test]
    fn test_delegate_defers_without_draining() {
        let mut state = state_with(&MemoryStore::new());
        state.track(EventDraft::named("a", Properties::new()));
        let deny = Arc::new(Deny);
        state.scheduler.set_delegate(Some(weak_delegate(&deny)));

        let (tx, rx) = mpsc::channel();
        assert!(state
            .request_flush(FlushTrigger::Manual, Some(tx), Instant::now())
            .is_none());
        assert!(rx.try_recv().unwrap().deferred);
        assert!(!state.queue.has_in_flight());
        assert_eq!(state.engine.consecutive_failures(), 0);
    }

    #[test]
    fn test_failed_batch_retried_before_newer_events() {
        let mut state = state_with(&MemoryStore::new());
        for name in ["a", "b"] {
            state.track(EventDraft::named(name, Properties::new()));
        }
        let now = Instant::now();

        state.request_flush(FlushTrigger::Periodic, None, now).unwrap();
        assert!(state
            .complete_submission(Err(TransportError::Timeout), now)
            .is_none());
        state.track(EventDraft::named("c", Properties::new()));

        // Periodic trigger waits out the backoff
        assert!(state
            .request_flush(FlushTrigger::Periodic, None, now)
            .is_none());

        let later = now + Duration::from_secs(11);
        let retry = state
            .request_flush(FlushTrigger::Periodic, None, later)
            .unwrap();
        let wire: serde_json::Value = serde_json::from_slice(&retry.payload).unwrap();
        assert_eq!(wire[0]["event"], "a");
        assert_eq!(wire[1]["event"], "b");
        assert_eq!(queued_names(&state), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_archive_and_restore_round_trip() {
        let store = MemoryStore::new();
        let mut state = state_with(&store);
        state.identify("u1");
        state.set_name_tag(Some("Ada".to_string()));
        state.register_super_properties(props(&[("plan", "pro".into())]));
        state.time_event("Upload", Utc::now());
        for name in ["a", "b", "c"] {
            state.track(EventDraft::named(name, Properties::new()));
        }

        // In-flight entries are persisted too
        let now = Instant::now();
        state.request_flush(FlushTrigger::Manual, None, now).unwrap();
        state.archive().unwrap();

        let restored = state_with(&store);
        assert_eq!(restored.distinct_id(), "u1");
        assert_eq!(restored.identity.name_tag(), Some("Ada"));
        assert_eq!(
            restored.current_super_properties()["plan"],
            Value::from("pro")
        );
        assert!(restored.timers.contains("Upload"));
        assert_eq!(queued_names(&restored), vec!["a", "b", "c"]);
        assert!(!restored.queue.has_in_flight());
    }

    #[test]
    fn test_successful_flush_archives() {
        let store = MemoryStore::new();
        let mut state = state_with(&store);
        state.track(EventDraft::named("a", Properties::new()));
        let now = Instant::now();

        state.request_flush(FlushTrigger::Manual, None, now).unwrap();
        state.complete_submission(ok(), now);

        let snapshot = Snapshot::decode(&store.contents().unwrap()).unwrap();
        assert!(snapshot.queue.is_empty());
        assert!(!state.dirty);
    }
}
