//! Flush scheduling: periodic timer settings, lifecycle reactions and the
//! optional delegate gate.

use std::sync::{Arc, Weak};
use std::time::Duration;

/// Optional capability that can veto a flush attempt.
///
/// The client only keeps a weak reference; once the owner drops the delegate,
/// flushing is permitted again.
pub trait FlushDelegate: Send + Sync {
    /// Return `false` to defer this attempt until the next trigger.
    fn should_flush(&self) -> bool {
        true
    }
}

/// Host application lifecycle signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    EnteredBackground,
    EnteredForeground,
    WillTerminate,
}

/// What started a flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Periodic,
    Background,
    Manual,
}

impl FlushTrigger {
    /// Explicit requests attempt immediately, ignoring any backoff.
    pub fn bypasses_backoff(&self) -> bool {
        matches!(self, FlushTrigger::Manual)
    }
}

/// How the worker should react to a lifecycle signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifecycleAction {
    pub flush: bool,
    pub archive: bool,
    pub stop_timer: bool,
    pub restart_timer: bool,
}

/// Flush policy shared by every trigger.
pub struct FlushScheduler {
    flush_interval: Duration,
    flush_on_background: bool,
    delegate: Option<Weak<dyn FlushDelegate>>,
}

impl FlushScheduler {
    pub fn new(flush_interval: Duration, flush_on_background: bool) -> Self {
        Self {
            flush_interval,
            flush_on_background,
            delegate: None,
        }
    }

    /// Periodic interval, `None` when disabled.
    pub fn flush_interval(&self) -> Option<Duration> {
        (!self.flush_interval.is_zero()).then_some(self.flush_interval)
    }

    pub fn set_flush_interval(&mut self, interval: Duration) {
        self.flush_interval = interval;
    }

    pub fn flush_on_background(&self) -> bool {
        self.flush_on_background
    }

    pub fn set_flush_on_background(&mut self, enabled: bool) {
        self.flush_on_background = enabled;
    }

    pub fn set_delegate(&mut self, delegate: Option<Weak<dyn FlushDelegate>>) {
        self.delegate = delegate;
    }

    pub fn has_delegate(&self) -> bool {
        self.delegate
            .as_ref()
            .is_some_and(|d| d.strong_count() > 0)
    }

    /// Consult the delegate, if one is still alive.
    pub fn permits(&self, trigger: FlushTrigger) -> bool {
        let Some(delegate) = self.delegate.as_ref().and_then(Weak::upgrade) else {
            return true;
        };
        let allowed = delegate.should_flush();
        if !allowed {
            tracing::debug!(?trigger, "Delegate deferred flush");
        }
        allowed
    }

    pub fn on_lifecycle(&self, event: LifecycleEvent) -> LifecycleAction {
        match event {
            LifecycleEvent::EnteredBackground => LifecycleAction {
                flush: self.flush_on_background,
                archive: true,
                stop_timer: true,
                restart_timer: false,
            },
            LifecycleEvent::EnteredForeground => LifecycleAction {
                restart_timer: true,
                ..Default::default()
            },
            LifecycleEvent::WillTerminate => LifecycleAction {
                archive: true,
                stop_timer: true,
                ..Default::default()
            },
        }
    }
}

/// Downgrade a concrete delegate into the weak trait object the scheduler keeps.
pub fn weak_delegate<D: FlushDelegate + 'static>(delegate: &Arc<D>) -> Weak<dyn FlushDelegate> {
    let strong: Arc<dyn FlushDelegate> = delegate.clone();
    Arc::downgrade(&strong)
}
