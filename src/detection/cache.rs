use dashmap::DashMap;
use std::collections::VecDeque;

use crate::detection::types::TransitionEvent;

pub const HISTORY_CAPACITY: usize = 100;

/// Bounded per-instrument transition history, newest first.
pub struct HistoryCache {
    cache: DashMap<String, CachedHistory>,
    capacity: usize,
}

#[derive(Default)]
struct CachedHistory {
    events: VecDeque<TransitionEvent>,
    /// Set once the instrument's history was loaded from the event log.
    hydrated: bool,
}

impl HistoryCache {
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cache: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record a freshly detected event at the front of its instrument's list.
    pub fn push(&self, event: TransitionEvent) {
        let mut entry = self.cache.entry(event.instrument.clone()).or_default();
        entry.events.push_front(event);
        entry.events.truncate(self.capacity);
    }

    /// Cached history, only once it reflects the full event log.
    pub fn get(&self, key: &str) -> Option<Vec<TransitionEvent>> {
        self.cache
            .get(key)
            .filter(|entry| entry.hydrated)
            .map(|entry| entry.events.iter().cloned().collect())
    }

    /// Install the history scanned from disk (oldest first), keeping any
    /// cached event the scan did not contain.
    pub fn hydrate(&self, key: &str, scanned: Vec<TransitionEvent>) -> Vec<TransitionEvent> {
        let mut entry = self.cache.entry(key.to_string()).or_default();

        let mut merged: Vec<TransitionEvent> = scanned.into_iter().rev().collect();
        for event in entry.events.iter() {
            if !merged.contains(event) {
                merged.push(event.clone());
            }
        }
        merged.sort_by(|a, b| b.change_time.cmp(&a.change_time));
        merged.truncate(self.capacity);

        entry.events = merged.iter().cloned().collect();
        entry.hydrated = true;
        merged
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl Default for HistoryCache {
    fn default() -> Self {
        Self::new()
    }
}
