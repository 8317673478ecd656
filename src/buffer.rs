//! Bounded inbound queue that sheds the oldest items when full.
//!
//! Sits between a stream function's data stream reader and its handler so a
//! slow handler never stalls the zipper's write path. When the queue is full
//! the oldest fifth of it is dropped before the new item is pushed.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;
use tracing::warn;

/// Share of a full queue dropped at once, in percent.
pub const DROP_PERCENT: usize = 20;

/// Multi-producer, single-consumer queue with a drop-oldest overflow policy.
#[derive(Debug)]
pub struct DropOldestQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    ready: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl<T> DropOldestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            ready: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        // A poisoned queue still holds valid items.
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Push an item, shedding the oldest items first if the queue is full.
    ///
    /// Returns the number of items dropped to make room.
    pub fn push(&self, item: T) -> usize {
        let shed = {
            let mut items = self.lock();
            let shed = if items.len() >= self.capacity {
                let shed = (self.capacity * DROP_PERCENT).div_ceil(100).min(items.len());
                items.drain(..shed);
                shed
            } else {
                0
            };
            items.push_back(item);
            shed
        };
        if shed > 0 {
            let total = self.dropped.fetch_add(shed as u64, Ordering::Relaxed) + shed as u64;
            warn!(shed, total, capacity = self.capacity, "Inbound buffer full, dropped oldest items");
        }
        self.ready.notify_one();
        shed
    }

    /// Wait for the next item. Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.ready.notified();
            if let Some(item) = self.lock().pop_front() {
                return Some(item);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Stop accepting waits; pending items can still be drained.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.ready.notify_waiters();
        self.ready.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total items shed since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
