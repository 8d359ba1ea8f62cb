//! Bounded per-subscriber buffer.
//!
//! Every client owns one inbox. Stream fan-out pushes into it without ever
//! waiting, so a consumer that stops reading cannot hold up the stream or
//! the other subscribers. What happens when the buffer is full is decided by
//! the [`OverflowPolicy`].
//!
//! The buffer is a `tokio::sync::broadcast` ring with a single receiver. A
//! full ring overwrites its oldest slot and the receiver observes the loss as
//! `Lagged`, which is either skipped or treated as an overflow.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::sync::{watch, Mutex};
use tracing::trace;

/// Default inbox capacity.
pub const DEFAULT_INBOX_CAPACITY: usize = 256;

/// What to do when a subscriber's inbox is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the oldest buffered item to make room.
    #[default]
    DropOldest,
    /// Close the inbox; the owning connection is torn down.
    Disconnect,
}

/// Outcome of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The item was buffered.
    Queued,
    /// The item was buffered after discarding the oldest one.
    DroppedOldest,
    /// The inbox overflowed and has been closed.
    Overflowed,
    /// The inbox was already closed; the item was discarded.
    Closed,
}

struct Shared<T> {
    tx: broadcast::Sender<T>,
    rx: Mutex<broadcast::Receiver<T>>,
    closed: watch::Sender<bool>,
    overflowed: AtomicBool,
    capacity: usize,
    policy: OverflowPolicy,
}

/// A bounded, closable, single-consumer buffer.
///
/// Cloning an inbox yields another handle to the same buffer.
pub struct Inbox<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Inbox<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Inbox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbox")
            .field("capacity", &self.shared.capacity)
            .field("policy", &self.shared.policy)
            .field("len", &self.shared.tx.len())
            .field("closed", &*self.shared.closed.borrow())
            .finish()
    }
}

impl<T: Clone> Inbox<T> {
    /// Create an inbox.
    ///
    /// The capacity is rounded up to a power of two, the granularity of the
    /// underlying ring. A capacity of zero is treated as one.
    #[must_use]
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let (tx, rx) = broadcast::channel(capacity);
        Self {
            shared: Arc::new(Shared {
                tx,
                rx: Mutex::new(rx),
                closed: watch::Sender::new(false),
                overflowed: AtomicBool::new(false),
                capacity,
                policy,
            }),
        }
    }

    /// Push an item. Never waits.
    pub fn push(&self, item: T) -> Delivery {
        if self.is_closed() {
            return Delivery::Closed;
        }

        let full = self.shared.tx.len() >= self.shared.capacity;
        if full && self.shared.policy == OverflowPolicy::Disconnect {
            self.overflow();
            return Delivery::Overflowed;
        }

        if self.shared.tx.send(item).is_err() {
            return Delivery::Closed;
        }
        if full {
            Delivery::DroppedOldest
        } else {
            Delivery::Queued
        }
    }

    /// Receive the next item.
    ///
    /// Returns `None` once the inbox is closed and drained. An inbox closed by
    /// overflow yields `None` immediately.
    pub async fn recv(&self) -> Option<T> {
        let mut rx = self.shared.rx.lock().await;
        let mut closed = self.shared.closed.subscribe();

        loop {
            if self.is_overflowed() {
                return None;
            }

            match rx.try_recv() {
                Ok(item) => return Some(item),
                Err(TryRecvError::Lagged(skipped)) => {
                    if !self.lagged(skipped) {
                        return None;
                    }
                    continue;
                }
                Err(TryRecvError::Closed) => return None,
                Err(TryRecvError::Empty) => {}
            }

            if *closed.borrow_and_update() {
                return None;
            }

            tokio::select! {
                received = rx.recv() => match received {
                    Ok(item) => return Some(item),
                    Err(RecvError::Lagged(skipped)) => {
                        if !self.lagged(skipped) {
                            return None;
                        }
                    }
                    Err(RecvError::Closed) => return None,
                },
                _ = closed.changed() => {}
            }
        }
    }

    /// Take the next item if one is buffered and no receive is in progress.
    pub fn try_recv(&self) -> Option<T> {
        let mut rx = self.shared.rx.try_lock().ok()?;
        loop {
            if self.is_overflowed() {
                return None;
            }
            match rx.try_recv() {
                Ok(item) => return Some(item),
                Err(TryRecvError::Lagged(skipped)) => {
                    if !self.lagged(skipped) {
                        return None;
                    }
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Close the inbox. Buffered items can still be received.
    pub fn close(&self) {
        self.shared.closed.send_replace(true);
    }

    /// Check if the inbox is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Check if the inbox was closed because it overflowed.
    #[must_use]
    pub fn is_overflowed(&self) -> bool {
        self.shared.overflowed.load(Ordering::Acquire)
    }

    /// Number of buffered items.
    #[must_use]
    pub fn len(&self) -> usize {
        if self.is_overflowed() {
            0
        } else {
            self.shared.tx.len()
        }
    }

    /// Check if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Get the overflow policy.
    #[must_use]
    pub fn policy(&self) -> OverflowPolicy {
        self.shared.policy
    }

    fn overflow(&self) {
        self.shared.overflowed.store(true, Ordering::Release);
        self.close();
    }

    /// Handle a lag reported by the ring. Returns `false` if the inbox overflowed.
    fn lagged(&self, skipped: u64) -> bool {
        match self.shared.policy {
            OverflowPolicy::DropOldest => {
                trace!(skipped, "Inbox skipped evicted items");
                true
            }
            // Concurrent pushes can overrun the ring past the capacity check
            OverflowPolicy::Disconnect => {
                self.overflow();
                false
            }
        }
    }
}
