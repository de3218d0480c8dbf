//! The tracking client handle.
//!
//! A [`Tally`] owns a dedicated worker thread running a single-threaded tokio
//! runtime. Every public method is marshaled onto that worker as a command, so
//! state changes are applied one at a time in call order and no caller ever
//! waits on the network. Methods ending in `_and_wait` are the exception: they
//! block until the worker reports back, up to the given timeout.
//!
//! ```rust,no_run
//! use tally_core::{ClientOptions, Properties, Tally, Value};
//!
//! let tally = Tally::builder(ClientOptions::new("project-token", "https://inputs.example.com"))
//!     .build()
//!     .expect("failed to start client");
//!
//! tally.identify("user-42");
//! tally.track_with_properties(
//!     "Signed Up",
//!     Properties::from([("plan".to_string(), Value::from("pro"))]),
//! );
//! tally.flush();
//! ```

mod options;
mod registry;
mod state;
mod worker;

pub use options::ClientOptions;
pub use registry::ClientRegistry;
pub use state::ALIAS_EVENT;

use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::enrich::EventDraft;
use crate::error::{Error, Result};
use crate::identity::{DeviceIdentifierProvider, IdentifierProvider};
use crate::persistence::{DurableStore, FileStore, PersistenceManager};
use crate::scheduler::{weak_delegate, FlushDelegate, LifecycleEvent};
use crate::transport::{ActivityIndicator, HttpTransport, Transport};
use crate::types::{Properties, Value};

use state::ClientState;
use worker::{Command, Worker};

/// How long state queries wait for the worker.
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one flush request, which may have sent several batches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    /// Events the endpoint accepted
    pub acknowledged: usize,
    /// Events discarded after a permanent rejection
    pub dropped: usize,
    /// Events put back for a later attempt
    pub requeued: usize,
    /// The flush delegate declined the flush
    pub deferred: bool,
    /// Set when the next automatic attempt is held back
    pub backing_off: Option<Duration>,
}

/// Runtime-adjustable settings, as currently applied by the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub server_url: String,
    /// Zero when periodic flushing is disabled
    pub flush_interval: Duration,
    pub flush_on_background: bool,
    pub show_network_activity_indicator: bool,
    pub has_delegate: bool,
}

/// Handle to one tracking client instance.
///
/// Dropping the handle stops the worker after it archives the current state.
pub struct Tally {
    token: String,
    commands: mpsc::UnboundedSender<Command>,
    worker: Option<JoinHandle<()>>,
}

impl Tally {
    pub fn builder(options: ClientOptions) -> TallyBuilder {
        TallyBuilder::new(options)
    }

    /// Client registered under the options' token in the process-wide
    /// registry, started with default collaborators on first use.
    pub fn shared_instance_with_token(options: ClientOptions) -> Result<Arc<Tally>> {
        let token = options.token.clone();
        ClientRegistry::global().get_or_init(&token, || Tally::builder(options).build())
    }

    pub fn lib_version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::warn!(token = %self.token, "Client worker has stopped, dropping call");
        }
    }

    fn query<T>(&self, make: impl FnOnce(std_mpsc::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = std_mpsc::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| Error::Runtime("client worker has stopped".to_string()))?;
        rx.recv_timeout(QUERY_TIMEOUT)
            .map_err(|e| Error::Runtime(format!("no reply from client worker: {}", e)))
    }

    // ============================================
    // Identity & super properties
    // ============================================

    /// Attribute future events to `distinct_id`. Events already queued keep
    /// the id they were tracked with.
    pub fn identify(&self, distinct_id: impl Into<String>) {
        let distinct_id = distinct_id.into();
        if distinct_id.is_empty() {
            tracing::warn!("identify called with an empty id, ignoring");
            return;
        }
        self.send(Command::Identify(distinct_id));
    }

    pub fn distinct_id(&self) -> Result<String> {
        self.query(Command::DistinctId)
    }

    pub fn set_name_tag(&self, name_tag: impl Into<String>) {
        self.send(Command::SetNameTag(Some(name_tag.into())));
    }

    pub fn clear_name_tag(&self) {
        self.send(Command::SetNameTag(None));
    }

    pub fn register_super_properties(&self, props: Properties) {
        self.send(Command::RegisterSuperProperties(props));
    }

    /// Register only the keys that are absent, or whose current value equals
    /// `default_value` when one is given.
    pub fn register_super_properties_once(&self, props: Properties, default_value: Option<Value>) {
        self.send(Command::RegisterSuperPropertiesOnce {
            props,
            default_value,
        });
    }

    pub fn unregister_super_property(&self, name: impl Into<String>) {
        self.send(Command::UnregisterSuperProperty(name.into()));
    }

    pub fn clear_super_properties(&self) {
        self.send(Command::ClearSuperProperties);
    }

    pub fn current_super_properties(&self) -> Result<Properties> {
        self.query(Command::SuperProperties)
    }

    // ============================================
    // Tracking
    // ============================================

    pub fn track(&self, event: impl Into<String>) {
        self.track_with_properties(event, Properties::new());
    }

    pub fn track_with_properties(&self, event: impl Into<String>, properties: Properties) {
        let event = event.into();
        if event.is_empty() {
            tracing::warn!("track called with an empty event name, ignoring");
            return;
        }
        self.send(Command::Track(EventDraft::named(event, properties)));
    }

    /// Track a caller-shaped event. Top-level keys are kept; a `properties`
    /// map is merged with the usual context and super properties. A string
    /// `event` key names the event; without one it is sent unnamed.
    pub fn track_custom_event(&self, custom: Properties) {
        self.send(Command::Track(EventDraft::custom(None, custom)));
    }

    /// Like [`Tally::track_custom_event`], with the event name given explicitly.
    pub fn track_with_custom_event(&self, event: impl Into<String>, custom: Properties) {
        let event = event.into();
        if event.is_empty() {
            tracing::warn!("track called with an empty event name, ignoring");
            return;
        }
        self.send(Command::Track(EventDraft::custom(Some(event), custom)));
    }

    /// Track a received push notification. Payloads without campaign
    /// identifiers are ignored.
    pub fn track_push_notification(&self, payload: Properties) {
        self.send(Command::TrackPush(payload));
    }

    /// Link `alias` to `distinct_id` on the server side. Local identity is
    /// unchanged.
    pub fn create_alias(&self, alias: impl Into<String>, distinct_id: impl Into<String>) {
        self.send(Command::CreateAlias {
            alias: alias.into(),
            distinct_id: distinct_id.into(),
        });
    }

    // ============================================
    // Timers
    // ============================================

    /// Start timing `event`; the next matching track carries `$duration`.
    pub fn time_event(&self, event: impl Into<String>) {
        let name = event.into();
        if name.is_empty() {
            tracing::warn!("time_event called with an empty event name, ignoring");
            return;
        }
        self.send(Command::TimeEvent {
            name,
            at: Utc::now(),
        });
    }

    pub fn clear_timed_events(&self) {
        self.send(Command::ClearTimedEvents);
    }

    /// Drop identity, super properties, timers and all queued events.
    pub fn reset(&self) {
        self.send(Command::Reset);
    }

    // ============================================
    // Flushing & archiving
    // ============================================

    /// Ask the worker to send queued events now.
    pub fn flush(&self) {
        self.send(Command::Flush(None));
    }

    /// Flush and block until the flush finishes or `timeout` passes.
    pub fn flush_and_wait(&self, timeout: Duration) -> Result<FlushReport> {
        let (tx, rx) = std_mpsc::channel();
        self.commands
            .send(Command::Flush(Some(tx)))
            .map_err(|_| Error::Runtime("client worker has stopped".to_string()))?;
        rx.recv_timeout(timeout)
            .map_err(|e| Error::Runtime(format!("flush did not finish: {}", e)))
    }

    /// Write a snapshot of the current state.
    pub fn archive(&self) {
        self.send(Command::Archive(None));
    }

    pub fn archive_and_wait(&self, timeout: Duration) -> Result<()> {
        let (tx, rx) = std_mpsc::channel();
        self.commands
            .send(Command::Archive(Some(tx)))
            .map_err(|_| Error::Runtime("client worker has stopped".to_string()))?;
        rx.recv_timeout(timeout)
            .map_err(|e| Error::Runtime(format!("archive did not finish: {}", e)))?
    }

    pub fn notify_lifecycle(&self, event: LifecycleEvent) {
        self.send(Command::Lifecycle(event));
    }

    // ============================================
    // Settings
    // ============================================

    pub fn set_server_url(&self, server_url: impl Into<String>) {
        self.send(Command::SetServerUrl(server_url.into()));
    }

    /// Zero disables periodic flushing.
    pub fn set_flush_interval(&self, interval: Duration) {
        self.send(Command::SetFlushInterval(interval));
    }

    pub fn set_flush_on_background(&self, enabled: bool) {
        self.send(Command::SetFlushOnBackground(enabled));
    }

    pub fn set_show_network_activity_indicator(&self, enabled: bool) {
        self.send(Command::SetShowNetworkActivityIndicator(enabled));
    }

    /// Consult `delegate` before each flush. Only a weak reference is kept;
    /// once the delegate is dropped, flushing is always permitted.
    pub fn set_delegate<D: FlushDelegate + 'static>(&self, delegate: &Arc<D>) {
        self.send(Command::SetDelegate(Some(weak_delegate(delegate))));
    }

    pub fn clear_delegate(&self) {
        self.send(Command::SetDelegate(None));
    }

    pub fn settings(&self) -> Result<Settings> {
        self.query(Command::Settings)
    }

    /// Events waiting for delivery, including any batch in flight.
    pub fn queued_count(&self) -> Result<usize> {
        self.query(Command::QueuedCount)
    }
}

impl Drop for Tally {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                tracing::error!(token = %self.token, "Client worker panicked");
            }
        }
    }
}

/// Builder for [`Tally`] with replaceable collaborators.
pub struct TallyBuilder {
    options: ClientOptions,
    transport: Option<Arc<dyn Transport>>,
    store: Option<Box<dyn DurableStore>>,
    identifiers: Option<Box<dyn IdentifierProvider>>,
    indicator: Option<Arc<dyn ActivityIndicator>>,
}

impl TallyBuilder {
    fn new(options: ClientOptions) -> Self {
        Self {
            options,
            transport: None,
            store: None,
            identifiers: None,
            indicator: None,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn store(mut self, store: Box<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn identifier_provider(mut self, identifiers: Box<dyn IdentifierProvider>) -> Self {
        self.identifiers = Some(identifiers);
        self
    }

    pub fn activity_indicator(mut self, indicator: Arc<dyn ActivityIndicator>) -> Self {
        self.indicator = Some(indicator);
        self
    }

    /// Restore persisted state and start the worker.
    pub fn build(self) -> Result<Tally> {
        let options = self.options;
        options.validate()?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(options.timeout)?),
        };
        let store = self
            .store
            .unwrap_or_else(|| Box::new(FileStore::for_token(&Config::data_dir(), &options.token)));
        let identifiers = self
            .identifiers
            .unwrap_or_else(|| Box::new(DeviceIdentifierProvider));

        let mut state = ClientState::new(
            &options,
            PersistenceManager::new(options.token.clone(), store),
            identifiers,
        );
        if let Some(payload) = &options.launch_payload {
            state.track_push_notification(payload);
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Runtime(format!("failed to create runtime: {}", e)))?;

        let (commands, receiver) = mpsc::unbounded_channel();
        let indicator = self.indicator;
        let archive_interval = options.archive_interval;
        let handle = std::thread::Builder::new()
            .name("tally-worker".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    Worker::new(state, transport, indicator, receiver, archive_interval)
                        .run()
                        .await
                })
            })
            .map_err(|e| Error::Runtime(format!("failed to spawn worker thread: {}", e)))?;

        tracing::info!(token = %options.token, server = %options.server_url, "Client started");
        Ok(Tally {
            token: options.token,
            commands,
            worker: Some(handle),
        })
    }
}
