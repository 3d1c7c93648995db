//! Bounded history of emitted events.
//!
//! The ring keeps the last `capacity` events in emission order. Pushing into
//! a full ring evicts the oldest entry.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::core::Event;

/// Default number of events retained by the bus.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Append-only FIFO of the most recent events.
///
/// # Invariant
///
/// `len() <= capacity()` at all times. A capacity of zero keeps nothing.
#[derive(Debug, Clone)]
pub struct HistoryRing {
    events: VecDeque<Arc<Event>>,
    capacity: usize,
}

impl HistoryRing {
    /// Create an empty ring holding at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            // Don't preallocate huge rings up front
            events: VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY)),
            capacity,
        }
    }

    /// Append an event, evicting the oldest when full.
    ///
    /// Returns the evicted event, if any.
    pub fn push(&mut self, event: Arc<Event>) -> Option<Arc<Event>> {
        if self.capacity == 0 {
            return Some(event);
        }

        let evicted = if self.events.len() >= self.capacity {
            self.events.pop_front()
        } else {
            None
        };
        self.events.push_back(event);
        evicted
    }

    /// The last `limit` events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<Arc<Event>> {
        let skip = self.events.len().saturating_sub(limit);
        self.events.iter().skip(skip).cloned().collect()
    }

    /// Every retained event, oldest first.
    pub fn all(&self) -> Vec<Arc<Event>> {
        self.events.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for HistoryRing {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
