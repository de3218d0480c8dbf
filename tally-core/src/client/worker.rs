//! The per-client worker loop.
//!
//! Commands from [`super::Tally`] handles, periodic timers and submission
//! outcomes are all processed here, strictly one after another. Submissions run
//! as separate tasks so a slow endpoint never stalls tracking calls.

use std::sync::mpsc::Sender;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};

use crate::delivery::PreparedBatch;
use crate::enrich::EventDraft;
use crate::error::Result;
use crate::scheduler::{FlushDelegate, FlushTrigger, LifecycleEvent};
use crate::transport::{ActivityIndicator, AckInfo, Transport, TransportError};
use crate::types::{Properties, Value};

use super::state::ClientState;
use super::{FlushReport, Settings};

type SubmitResult = std::result::Result<AckInfo, TransportError>;

/// Work marshaled onto the worker.
pub(crate) enum Command {
    Track(EventDraft),
    TrackPush(Properties),
    CreateAlias {
        alias: String,
        distinct_id: String,
    },
    Identify(String),
    SetNameTag(Option<String>),
    RegisterSuperProperties(Properties),
    RegisterSuperPropertiesOnce {
        props: Properties,
        default_value: Option<Value>,
    },
    UnregisterSuperProperty(String),
    ClearSuperProperties,
    TimeEvent {
        name: String,
        at: DateTime<Utc>,
    },
    ClearTimedEvents,
    Reset,
    Flush(Option<Sender<FlushReport>>),
    Archive(Option<Sender<Result<()>>>),
    Lifecycle(LifecycleEvent),
    SetServerUrl(String),
    SetFlushInterval(Duration),
    SetFlushOnBackground(bool),
    SetShowNetworkActivityIndicator(bool),
    SetDelegate(Option<Weak<dyn FlushDelegate>>),
    DistinctId(Sender<String>),
    SuperProperties(Sender<Properties>),
    Settings(Sender<Settings>),
    QueuedCount(Sender<usize>),
    Shutdown,
}

enum Wake {
    Command(Option<Command>),
    Submitted(SubmitResult),
    FlushTimer,
    ArchiveTimer,
}

pub(crate) struct Worker {
    state: ClientState,
    transport: Arc<dyn Transport>,
    indicator: Option<Arc<dyn ActivityIndicator>>,
    indicator_active: bool,
    commands: mpsc::UnboundedReceiver<Command>,
    submitted_tx: mpsc::UnboundedSender<SubmitResult>,
    submitted_rx: mpsc::UnboundedReceiver<SubmitResult>,
    flush_timer: Option<Interval>,
    archive_timer: Option<Interval>,
    backgrounded: bool,
}

/// Interval whose first tick is one full period away.
fn interval(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

impl Worker {
    /// Must be called inside the worker's runtime (timers register with it).
    pub(crate) fn new(
        state: ClientState,
        transport: Arc<dyn Transport>,
        indicator: Option<Arc<dyn ActivityIndicator>>,
        commands: mpsc::UnboundedReceiver<Command>,
        archive_interval: Duration,
    ) -> Self {
        let (submitted_tx, submitted_rx) = mpsc::unbounded_channel();
        let flush_timer = state.scheduler.flush_interval().and_then(interval);
        Self {
            state,
            transport,
            indicator,
            indicator_active: false,
            commands,
            submitted_tx,
            submitted_rx,
            flush_timer,
            archive_timer: interval(archive_interval),
            backgrounded: false,
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::debug!("Worker started");
        loop {
            let wake = tokio::select! {
                command = self.commands.recv() => Wake::Command(command),
                Some(result) = self.submitted_rx.recv() => Wake::Submitted(result),
                _ = next_tick(&mut self.flush_timer) => Wake::FlushTimer,
                _ = next_tick(&mut self.archive_timer) => Wake::ArchiveTimer,
            };

            match wake {
                Wake::Command(None) | Wake::Command(Some(Command::Shutdown)) => break,
                Wake::Command(Some(command)) => self.handle(command),
                Wake::Submitted(result) => self.on_submitted(result),
                Wake::FlushTimer => self.flush(FlushTrigger::Periodic, None),
                Wake::ArchiveTimer => self.state.archive_if_dirty(),
            }
        }

        // An unfinished submission is abandoned; its events are still queued.
        self.state.archive_logged();
        tracing::debug!("Worker stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Track(draft) => {
                self.state.track(draft);
            }
            Command::TrackPush(payload) => {
                self.state.track_push_notification(&payload);
            }
            Command::CreateAlias { alias, distinct_id } => {
                self.state.create_alias(&alias, &distinct_id);
            }
            Command::Identify(id) => self.state.identify(&id),
            Command::SetNameTag(tag) => self.state.set_name_tag(tag),
            Command::RegisterSuperProperties(props) => {
                self.state.register_super_properties(props)
            }
            Command::RegisterSuperPropertiesOnce {
                props,
                default_value,
            } => self
                .state
                .register_super_properties_once(props, default_value),
            Command::UnregisterSuperProperty(name) => {
                self.state.unregister_super_property(&name)
            }
            Command::ClearSuperProperties => self.state.clear_super_properties(),
            Command::TimeEvent { name, at } => self.state.time_event(&name, at),
            Command::ClearTimedEvents => self.state.clear_timed_events(),
            Command::Reset => self.state.reset(),
            Command::Flush(waiter) => self.flush(FlushTrigger::Manual, waiter),
            Command::Archive(waiter) => {
                let result = self.state.archive();
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            tracing::warn!(error = %e, "Failed to archive client state");
                        }
                    }
                }
            }
            Command::Lifecycle(event) => self.on_lifecycle(event),
            Command::SetServerUrl(url) => self.state.set_server_url(url),
            Command::SetFlushInterval(period) => {
                self.state.scheduler.set_flush_interval(period);
                if !self.backgrounded {
                    self.flush_timer = self.state.scheduler.flush_interval().and_then(interval);
                }
            }
            Command::SetFlushOnBackground(enabled) => {
                self.state.scheduler.set_flush_on_background(enabled)
            }
            Command::SetShowNetworkActivityIndicator(enabled) => {
                self.state.set_show_network_activity_indicator(enabled)
            }
            Command::SetDelegate(delegate) => self.state.scheduler.set_delegate(delegate),
            Command::DistinctId(reply) => {
                let _ = reply.send(self.state.distinct_id().to_string());
            }
            Command::SuperProperties(reply) => {
                let _ = reply.send(self.state.current_super_properties());
            }
            Command::Settings(reply) => {
                let _ = reply.send(self.state.settings());
            }
            Command::QueuedCount(reply) => {
                let _ = reply.send(self.state.queued_count());
            }
            Command::Shutdown => {}
        }
    }

    fn on_lifecycle(&mut self, event: LifecycleEvent) {
        tracing::debug!(?event, "Lifecycle signal");
        let action = self.state.scheduler.on_lifecycle(event);

        if action.stop_timer {
            self.backgrounded = true;
            self.flush_timer = None;
        }
        if action.restart_timer {
            self.backgrounded = false;
            self.flush_timer = self.state.scheduler.flush_interval().and_then(interval);
        }
        if action.flush {
            self.flush(FlushTrigger::Background, None);
        }
        if action.archive {
            self.state.archive_logged();
        }
    }

    fn flush(&mut self, trigger: FlushTrigger, waiter: Option<Sender<FlushReport>>) {
        if let Some(batch) = self.state.request_flush(trigger, waiter, Instant::now()) {
            self.submit(batch);
        }
    }

    fn submit(&mut self, batch: PreparedBatch) {
        if self.state.show_network_activity_indicator() {
            if let Some(indicator) = &self.indicator {
                indicator.set_active(true);
                self.indicator_active = true;
            }
        }

        let transport = Arc::clone(&self.transport);
        let endpoint = self.state.endpoint();
        let done = self.submitted_tx.clone();
        tokio::spawn(async move {
            let result = transport.submit(&endpoint, &batch.payload).await;
            let _ = done.send(result);
        });
    }

    fn on_submitted(&mut self, result: SubmitResult) {
        if self.indicator_active {
            if let Some(indicator) = &self.indicator {
                indicator.set_active(false);
            }
            self.indicator_active = false;
        }

        if let Some(next) = self.state.complete_submission(result, Instant::now()) {
            self.submit(next);
        }
    }
}
