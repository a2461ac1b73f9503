//! Blocking request deque for region decoding.
//!
//! - Producers insert at the front with `push_urgent` (latest viewport wins) or at
//!   the back with `push`
//! - A single consumer blocks in `take` until something is queued
//! - Pending items can be cancelled with `remove` before they are served
//!
//! Waiting in `take` releases the lock, so producers never block on a parked consumer.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

/// Default maximum number of pending requests.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Front-priority work queue with a blocking consumer side.
pub struct PriorityRequestQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T> PriorityRequestQueue<T> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a queue holding at most `capacity` pending items (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_QUEUE_CAPACITY))),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Insert at the front so the item is served next.
    ///
    /// When the queue is full the oldest item is evicted and returned.
    pub fn push_urgent(&self, item: T) -> Option<T> {
        let evicted = {
            let mut items = self.items.lock();
            let evicted = if items.len() >= self.capacity {
                items.pop_back()
            } else {
                None
            };
            items.push_front(item);
            evicted
        };
        self.available.notify_one();
        evicted
    }

    /// Insert at the back, behind everything already queued.
    ///
    /// Returns the item itself if the queue is full.
    pub fn push(&self, item: T) -> Result<(), T> {
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity {
                return Err(item);
            }
            items.push_back(item);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Remove and return the oldest (back) item without waiting.
    pub fn pop_oldest(&self) -> Option<T> {
        self.items.lock().pop_back()
    }

    /// Remove and return the front item without waiting.
    pub fn try_take(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Block until an item is available, then remove and return the front item.
    pub fn take(&self) -> T {
        let mut items = self.items.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return item;
            }
            trace!("Request queue empty, waiting");
            self.available.wait(&mut items);
        }
    }

    /// Like `take`, but gives up after `timeout`.
    pub fn take_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            if self.available.wait_until(&mut items, deadline).timed_out() {
                return items.pop_front();
            }
        }
    }

    /// Drop every pending item.
    pub fn clear(&self) {
        self.items.lock().clear();
    }

    /// Remove every pending item, front first.
    pub fn drain(&self) -> Vec<T> {
        self.items.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: PartialEq> PriorityRequestQueue<T> {
    /// Cancel a pending item. Returns false if it was not queued (or already served).
    pub fn remove(&self, item: &T) -> bool {
        let mut items = self.items.lock();
        match items.iter().position(|queued| queued == item) {
            Some(index) => {
                items.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, item: &T) -> bool {
        self.items.lock().contains(item)
    }
}

impl<T: Clone> PriorityRequestQueue<T> {
    /// The item `take` would return next.
    pub fn peek_first(&self) -> Option<T> {
        self.items.lock().front().cloned()
    }

    /// The item `pop_oldest` would return next.
    pub fn peek_last(&self) -> Option<T> {
        self.items.lock().back().cloned()
    }
}

impl<T> Default for PriorityRequestQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
