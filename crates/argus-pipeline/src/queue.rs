//! Bounded hand-off queues between pools.
//!
//! `put` awaits while the queue is full; that backpressure is what throttles
//! the reader against the slowest pool and bounds resident memory. For
//! infinite inputs the queues are LIFO and the reader clears its output
//! queue before each push, which is the only place the pipeline drops data.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Strict order, backpressure. Finite inputs.
    Fifo,
    /// Freshest-first, paired with [`FrameQueue::clear`]. Infinite inputs.
    Lifo,
}

pub struct FrameQueue<T> {
    kind: QueueKind,
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    readable: Notify,
    writable: Notify,
}

impl<T: Send> FrameQueue<T> {
    pub fn new(kind: QueueKind, capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            kind,
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Push an item, waiting for space while the queue is full.
    pub async fn put(&self, item: T) {
        let mut slot = Some(item);
        loop {
            {
                let mut items = self.items.lock().expect("queue poisoned");
                if items.len() < self.capacity {
                    items.push_back(slot.take().expect("item already taken"));
                    drop(items);
                    self.readable.notify_one();
                    return;
                }
            }
            self.writable.notified().await;
        }
    }

    /// Pop an item, waiting up to `timeout`. LIFO queues pop the newest item.
    pub async fn get(&self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, async {
            loop {
                {
                    let mut items = self.items.lock().expect("queue poisoned");
                    let popped = match self.kind {
                        QueueKind::Fifo => items.pop_front(),
                        QueueKind::Lifo => items.pop_back(),
                    };
                    if let Some(item) = popped {
                        drop(items);
                        self.writable.notify_one();
                        return item;
                    }
                }
                self.readable.notified().await;
            }
        })
        .await
        .ok()
    }

    /// Drop everything queued and wake any blocked producers. Returns the
    /// number of discarded items.
    pub fn clear(&self) -> usize {
        let dropped = {
            let mut items = self.items.lock().expect("queue poisoned");
            let n = items.len();
            items.clear();
            n
        };
        self.writable.notify_waiters();
        dropped
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Type-erased view used by the supervisor to clear every queue on a hard
/// stop, whatever their payload types.
pub trait Clearable: Send + Sync {
    fn clear_all(&self) -> usize;
}

impl<T: Send> Clearable for FrameQueue<T> {
    fn clear_all(&self) -> usize {
        self.clear()
    }
}
