//! Timer registry for measuring event durations.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Property attached to a timed event, in seconds.
pub const DURATION_PROPERTY: &str = "$duration";

/// Start instants keyed by event name. Timers are one-shot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimerRegistry {
    timers: BTreeMap<String, DateTime<Utc>>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(timers: BTreeMap<String, DateTime<Utc>>) -> Self {
        Self { timers }
    }

    /// Start (or restart) the timer for `name`.
    pub fn time_event(&mut self, name: &str, now: DateTime<Utc>) {
        if name.is_empty() {
            tracing::warn!("timeEvent called with an empty event name, ignoring");
            return;
        }
        self.timers.insert(name.to_string(), now);
    }

    pub fn clear(&mut self) {
        self.timers.clear();
    }

    /// Stop the timer for `name`, returning the elapsed seconds (never negative).
    pub fn consume(&mut self, name: &str, now: DateTime<Utc>) -> Option<f64> {
        let started = self.timers.remove(name)?;
        let elapsed_ms = (now - started).num_milliseconds().max(0);
        Some(elapsed_ms as f64 / 1000.0)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.timers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn as_map(&self) -> &BTreeMap<String, DateTime<Utc>> {
        &self.timers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_consume_is_one_shot() {
        let start = Utc::now();
        let mut timers = TimerRegistry::new();
        timers.time_event("Upload", start);

        let elapsed = timers.consume("Upload", start + Duration::milliseconds(1500));
        assert_eq!(elapsed, Some(1.5));
        assert!(timers.consume("Upload", start + Duration::seconds(3)).is_none());
    }

    #[test]
    fn test_restart_overwrites() {
        let start = Utc::now();
        let mut timers = TimerRegistry::new();
        timers.time_event("Upload", start);
        timers.time_event("Upload", start + Duration::seconds(10));

        let elapsed = timers.consume("Upload", start + Duration::seconds(12));
        assert_eq!(elapsed, Some(2.0));
    }

    #[test]
    fn test_clock_skew_never_negative() {
        let start = Utc::now();
        let mut timers = TimerRegistry::new();
        timers.time_event("Upload", start);
        assert_eq!(timers.consume("Upload", start - Duration::seconds(5)), Some(0.0));
    }

    #[test]
    fn test_clear() {
        let mut timers = TimerRegistry::new();
        timers.time_event("a", Utc::now());
        timers.time_event("b", Utc::now());
        timers.time_event("", Utc::now());
        assert_eq!(timers.len(), 2);
        timers.clear();
        assert!(timers.is_empty());
        assert!(!timers.contains("a"));
    }
}
