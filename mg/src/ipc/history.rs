//! Bounded history of messages seen by the monitor server
//!
//! A fixed-size ring: once full, each push overwrites the oldest entry in
//! O(1). Live subscribers hang off the same lock so a viewer can take a
//! snapshot and start following without missing or repeating a message.

use std::sync::{PoisonError, RwLock};

use tokio::sync::broadcast;

use super::messages::IpcMessage;

/// Default number of messages retained for replay
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Live fan-out buffer per viewer before it starts lagging
const LIVE_CHANNEL_CAPACITY: usize = 1024;

struct Ring {
    slots: Vec<Option<IpcMessage>>,
    /// Next slot to write
    head: usize,
    len: usize,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            head: 0,
            len: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn push(&mut self, message: IpcMessage) {
        let capacity = self.capacity();
        self.slots[self.head] = Some(message);
        self.head = (self.head + 1) % capacity;
        self.len = (self.len + 1).min(capacity);
    }

    fn to_vec(&self) -> Vec<IpcMessage> {
        let capacity = self.capacity();
        let start = (self.head + capacity - self.len) % capacity;
        (0..self.len)
            .filter_map(|i| self.slots[(start + i) % capacity].clone())
            .collect()
    }
}

/// Ring buffer of recent messages plus a live broadcast of new ones
pub struct EventHistory {
    ring: RwLock<Ring>,
    live: broadcast::Sender<IpcMessage>,
}

impl EventHistory {
    /// A capacity of zero is raised to one
    pub fn new(capacity: usize) -> Self {
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self {
            ring: RwLock::new(Ring::new(capacity.max(1))),
            live,
        }
    }

    /// Record a message and fan it out to live subscribers
    pub fn push(&self, message: IpcMessage) {
        let mut ring = self.ring.write().unwrap_or_else(PoisonError::into_inner);
        ring.push(message.clone());
        // Sent under the lock so snapshot_and_subscribe sees a consistent cut
        let _ = self.live.send(message);
    }

    /// Retained messages, oldest first
    pub fn snapshot(&self) -> Vec<IpcMessage> {
        self.ring.read().unwrap_or_else(PoisonError::into_inner).to_vec()
    }

    /// Retained messages plus a receiver for everything pushed afterwards
    pub fn snapshot_and_subscribe(&self) -> (Vec<IpcMessage>, broadcast::Receiver<IpcMessage>) {
        let ring = self.ring.read().unwrap_or_else(PoisonError::into_inner);
        (ring.to_vec(), self.live.subscribe())
    }

    pub fn len(&self) -> usize {
        self.ring.read().unwrap_or_else(PoisonError::into_inner).len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.read().unwrap_or_else(PoisonError::into_inner).capacity()
    }
}

impl Default for EventHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
