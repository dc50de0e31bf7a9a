//! Task ID generation

use std::sync::atomic::{AtomicU64, Ordering};

/// Generates process-unique task IDs of the form `task_<counter>_<8 hex>`
///
/// The counter makes IDs unique within a generator; the random suffix keeps
/// IDs from separate processes writing to the same monitor apart.
#[derive(Debug, Default)]
pub struct TaskIdGenerator {
    counter: AtomicU64,
}

impl TaskIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce the next ID
    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("task_{}_{:08x}", n, rand::random::<u32>())
    }
}
