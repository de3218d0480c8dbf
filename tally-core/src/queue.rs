//! Bounded FIFO queue of events awaiting upload.
//!
//! Entries stay in place while a batch is in flight, so a failed batch keeps
//! its position ahead of anything enqueued later. Only one batch can be in
//! flight at a time.

use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};

use crate::types::{Event, QueueEntry};

/// Ordered, bounded buffer with drop-oldest eviction.
#[derive(Debug)]
pub struct EventQueue {
    entries: VecDeque<QueueEntry>,
    capacity: usize,
    next_id: u64,
    in_flight: Option<HashSet<u64>>,
    evicted: u64,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            next_id: 1,
            in_flight: None,
            evicted: 0,
        }
    }

    /// Rebuild a queue from persisted entries, keeping their order.
    ///
    /// If more entries were persisted than `capacity` allows, the oldest are dropped.
    pub fn restore(capacity: usize, entries: Vec<QueueEntry>) -> Self {
        let mut queue = Self::new(capacity);
        queue.next_id = entries.iter().map(|e| e.id).max().unwrap_or(0) + 1;
        queue.entries = entries.into();
        while queue.entries.len() > queue.capacity {
            queue.entries.pop_front();
            queue.evicted += 1;
        }
        queue
    }

    /// Append an event, evicting the oldest entry when full.
    pub fn enqueue(&mut self, event: Event, now: DateTime<Utc>) {
        if self.entries.len() >= self.capacity {
            if let Some(dropped) = self.entries.pop_front() {
                self.evicted += 1;
                if let Some(in_flight) = self.in_flight.as_mut() {
                    in_flight.remove(&dropped.id);
                }
                tracing::warn!(
                    event = %dropped.event.name,
                    attempts = dropped.attempts,
                    capacity = self.capacity,
                    "Queue full, dropped oldest event"
                );
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        self.entries.push_back(QueueEntry {
            id,
            event,
            enqueued_at: now,
            attempts: 0,
        });
    }

    /// Hand out up to `max_count` entries from the head for delivery.
    ///
    /// Entries are not removed. While a batch is in flight, further drains
    /// return nothing until it is acknowledged or requeued.
    pub fn drain_batch(&mut self, max_count: usize) -> Vec<QueueEntry> {
        if self.in_flight.is_some() || max_count == 0 {
            return Vec::new();
        }

        let batch: Vec<QueueEntry> = self.entries.iter().take(max_count).cloned().collect();
        if !batch.is_empty() {
            self.in_flight = Some(batch.iter().map(|e| e.id).collect());
        }
        batch
    }

    /// Permanently remove delivered entries and end the in-flight batch.
    ///
    /// Returns how many entries were still present.
    pub fn acknowledge(&mut self, ids: &[u64]) -> usize {
        let ids: HashSet<u64> = ids.iter().copied().collect();
        let before = self.entries.len();
        self.entries.retain(|e| !ids.contains(&e.id));
        self.in_flight = None;
        before - self.entries.len()
    }

    /// Return entries to the queue after a failed attempt.
    ///
    /// They never moved, so order relative to older and newer entries is
    /// unchanged; only their attempt counters grow.
    pub fn requeue(&mut self, ids: &[u64]) -> usize {
        let ids: HashSet<u64> = ids.iter().copied().collect();
        let mut requeued = 0;
        for entry in self.entries.iter_mut().filter(|e| ids.contains(&e.id)) {
            entry.attempts = entry.attempts.saturating_add(1);
            requeued += 1;
        }
        self.in_flight = None;
        requeued
    }

    /// Drop every entry, including an in-flight batch.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.in_flight = None;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Number of entries dropped by eviction since construction.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }
}
