//! Bounded multi-priority FIFO queue with overflow policy
//!
//! Conceptually four FIFO buckets keyed by priority. All operations are
//! atomic under a single mutex and none of them block on external I/O -
//! the queue is pure in-memory bookkeeping, matching the deadlock-avoidance
//! rule that the core never holds this lock while publishing.

use crate::error::QueueError;
use crate::mesh::{MeshMessage, Priority};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;
use tracing::warn;

/// Maximum retry attempts for a queued item before it is dropped.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// An item waiting to be published, or retried after a failed publish.
#[derive(Debug, Clone)]
pub struct QueuedItem {
    pub mesh_message: MeshMessage,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub priority: Priority,
    pub enqueued_at: Instant,
    pub retries: u32,
    pub max_retries: u32,
}

impl QueuedItem {
    pub fn new(mesh_message: MeshMessage, topic: String, payload: Vec<u8>, qos: u8) -> Self {
        let priority = mesh_message.priority;
        Self {
            mesh_message,
            topic,
            payload,
            qos,
            priority,
            enqueued_at: Instant::now(),
            retries: 0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct QueueStats {
    pub dropped: u64,
    pub overflow_drops: u64,
}

struct Buckets {
    emergency: VecDeque<QueuedItem>,
    high: VecDeque<QueuedItem>,
    normal: VecDeque<QueuedItem>,
    low: VecDeque<QueuedItem>,
    stats: QueueStats,
}

impl Buckets {
    fn bucket_mut(&mut self, priority: Priority) -> &mut VecDeque<QueuedItem> {
        match priority {
            Priority::Emergency => &mut self.emergency,
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    fn size(&self) -> usize {
        self.emergency.len() + self.high.len() + self.normal.len() + self.low.len()
    }

    /// Drop the oldest item from the lowest-priority non-empty bucket: Low,
    /// else Normal, else High, else Emergency. Returns false if nothing
    /// could be dropped (every bucket empty).
    fn drop_lowest(&mut self) -> bool {
        for priority in [
            Priority::Low,
            Priority::Normal,
            Priority::High,
            Priority::Emergency,
        ] {
            let bucket = self.bucket_mut(priority);
            if bucket.pop_front().is_some() {
                return true;
            }
        }
        false
    }

    fn bucket_sizes(&self) -> [(Priority, usize); 4] {
        [
            (Priority::Emergency, self.emergency.len()),
            (Priority::High, self.high.len()),
            (Priority::Normal, self.normal.len()),
            (Priority::Low, self.low.len()),
        ]
    }
}

/// Bounded, multi-priority FIFO queue.
pub struct PriorityQueue {
    max_size: usize,
    inner: Mutex<Buckets>,
}

impl PriorityQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            inner: Mutex::new(Buckets {
                emergency: VecDeque::new(),
                high: VecDeque::new(),
                normal: VecDeque::new(),
                low: VecDeque::new(),
                stats: QueueStats::default(),
            }),
        }
    }

    /// Enqueue `item`. If the queue is at capacity, the overflow policy
    /// drops the oldest item from the lowest-priority non-empty bucket
    /// before appending. Returns `Err(QueueError::Overflow)` only when
    /// nothing at all could be dropped to make room (every bucket empty,
    /// `max_size == 0`).
    pub fn enqueue(&self, item: QueuedItem) -> Result<(), QueueError> {
        let mut buckets = self.inner.lock().unwrap();
        if buckets.size() >= self.max_size {
            if !buckets.drop_lowest() {
                return Err(QueueError::Overflow);
            }
            buckets.stats.dropped += 1;
            buckets.stats.overflow_drops += 1;
            let sizes = buckets.bucket_sizes();
            warn!(
                ?sizes,
                "priority queue overflow: dropped oldest lowest-priority item to make room"
            );
        }
        buckets.bucket_mut(item.priority).push_back(item);
        Ok(())
    }

    /// Remove and return the oldest item from the highest-priority
    /// non-empty bucket.
    pub fn dequeue(&self) -> Option<QueuedItem> {
        let mut buckets = self.inner.lock().unwrap();
        for priority in [
            Priority::Emergency,
            Priority::High,
            Priority::Normal,
            Priority::Low,
        ] {
            if let Some(item) = buckets.bucket_mut(priority).pop_front() {
                return Some(item);
            }
        }
        None
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().size()
    }

    /// Discard all items, logging the count lost.
    pub fn clear(&self) {
        let mut buckets = self.inner.lock().unwrap();
        let lost = buckets.size();
        buckets.emergency.clear();
        buckets.high.clear();
        buckets.normal.clear();
        buckets.low.clear();
        if lost > 0 {
            warn!(lost, "priority queue cleared");
        }
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.lock().unwrap().stats
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}
