//! Bounded hand-off between an acquisition thread and the consumer.
//!
//! The producer never blocks under the default [`OverflowPolicy::DropOldest`]:
//! when the channel is full the oldest item is evicted so the newest data
//! always survives. [`OverflowPolicy::Block`] instead waits for the consumer,
//! re-checking the producer's [`CancelToken`] so a stalled consumer cannot
//! keep a closed source alive.

use super::worker::CancelToken;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How long a blocked producer sleeps before re-checking cancellation.
const BLOCK_SLICE: Duration = Duration::from_millis(50);

/// What to do when `put` finds the channel full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest item to make room
    DropOldest,
    /// Wait until the consumer drains
    Block,
}

/// Result of a single `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Stored without loss
    Enqueued,
    /// Stored after evicting the oldest item
    EvictedOldest,
    /// Cancelled while waiting for room; the item was discarded
    Cancelled,
}

#[derive(Debug)]
struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    not_full: Condvar,
    capacity: usize,
    policy: OverflowPolicy,
    evicted: AtomicU64,
}

/// FIFO with a fixed capacity, shared by cloning.
#[derive(Debug)]
pub struct BufferedChannel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for BufferedChannel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> BufferedChannel<T> {
    /// Create a channel holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
                not_full: Condvar::new(),
                capacity,
                policy,
                evicted: AtomicU64::new(0),
            }),
        }
    }

    /// Shorthand for a drop-oldest channel.
    pub fn drop_oldest(capacity: usize) -> Self {
        Self::new(capacity, OverflowPolicy::DropOldest)
    }

    /// Append an item, applying the overflow policy when full.
    pub fn put(&self, item: T, cancel: &CancelToken) -> PutOutcome {
        let mut queue = self.shared.queue.lock();
        match self.shared.policy {
            OverflowPolicy::DropOldest => {
                let outcome = if queue.len() >= self.shared.capacity {
                    queue.pop_front();
                    self.shared.evicted.fetch_add(1, Ordering::Relaxed);
                    PutOutcome::EvictedOldest
                } else {
                    PutOutcome::Enqueued
                };
                queue.push_back(item);
                outcome
            }
            OverflowPolicy::Block => {
                while queue.len() >= self.shared.capacity {
                    if cancel.is_cancelled() {
                        return PutOutcome::Cancelled;
                    }
                    self.shared.not_full.wait_for(&mut queue, BLOCK_SLICE);
                }
                queue.push_back(item);
                PutOutcome::Enqueued
            }
        }
    }

    /// Remove and return everything buffered, oldest first. Never blocks on data.
    pub fn drain(&self) -> Vec<T> {
        let items: Vec<T> = {
            let mut queue = self.shared.queue.lock();
            queue.drain(..).collect()
        };
        if !items.is_empty() {
            self.shared.not_full.notify_all();
        }
        items
    }

    /// Discard everything buffered.
    pub fn clear(&self) {
        self.shared.queue.lock().clear();
        self.shared.not_full.notify_all();
    }

    /// Items currently buffered.
    pub fn len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of buffered items.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Total items evicted by the drop-oldest policy.
    pub fn evicted(&self) -> u64 {
        self.shared.evicted.load(Ordering::Relaxed)
    }
}
