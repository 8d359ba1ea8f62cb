//! Streams.
//!
//! A stream is a named source of items with a set of subscribers. Each
//! subscriber is represented by its client's [`Inbox`]; broadcasting pushes
//! every item into every inbox without waiting on any of them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace, warn};

use crate::client::ClientId;
use crate::inbox::{Delivery, Inbox};
use crate::metrics;
use crate::streamable::Item;

/// Maximum stream name length.
pub const MAX_STREAM_NAME_LENGTH: usize = 256;

/// Validate a stream name.
///
/// # Errors
///
/// Returns an error message if the stream name is invalid.
pub fn validate_stream_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Stream name cannot be empty");
    }
    if name.len() > MAX_STREAM_NAME_LENGTH {
        return Err("Stream name too long");
    }
    if name.starts_with('$') {
        return Err("Stream names starting with '$' are reserved");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Stream name contains invalid characters");
    }
    Ok(())
}

/// Stream errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    /// The client is already a subscriber.
    #[error("already subscribed to `{0}`")]
    AlreadySubscribed(String),

    /// The client is not a subscriber.
    #[error("not subscribed to `{0}`")]
    NotSubscribed(String),

    /// The stream has stopped broadcasting.
    #[error("channel `{0}` is closed")]
    Closed(String),
}

/// Result of pushing one item to every subscriber.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FanOut {
    /// Items buffered without loss.
    pub delivered: usize,
    /// Items buffered after evicting an older one.
    pub dropped: usize,
    /// Subscribers whose inbox overflowed and closed.
    pub overflowed: Vec<ClientId>,
}

/// A named broadcast stream.
#[derive(Debug)]
pub struct Stream {
    name: String,
    subscribers: RwLock<HashMap<ClientId, Inbox<Item>>>,
    closed: AtomicBool,
}

impl Stream {
    /// Create a stream.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscribers: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Get the stream name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if the stream has stopped broadcasting.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Register a subscriber.
    ///
    /// # Errors
    ///
    /// Fails if the client is already registered or the stream is closed.
    pub async fn subscribe(&self, client: &ClientId, inbox: Inbox<Item>) -> Result<(), StreamError> {
        let mut subscribers = self.subscribers.write().await;
        if self.is_closed() {
            return Err(StreamError::Closed(self.name.clone()));
        }
        if subscribers.contains_key(client) {
            return Err(StreamError::AlreadySubscribed(self.name.clone()));
        }

        subscribers.insert(client.clone(), inbox);
        debug!(stream = %self.name, client = %client, "Subscriber registered");
        Ok(())
    }

    /// Remove a subscriber.
    ///
    /// # Errors
    ///
    /// Fails if the client is not registered.
    pub async fn unsubscribe(&self, client: &ClientId) -> Result<(), StreamError> {
        match self.subscribers.write().await.remove(client) {
            Some(_) => {
                debug!(stream = %self.name, client = %client, "Subscriber removed");
                Ok(())
            }
            None => Err(StreamError::NotSubscribed(self.name.clone())),
        }
    }

    /// Check if a client is registered.
    pub async fn is_subscribed(&self, client: &ClientId) -> bool {
        self.subscribers.read().await.contains_key(client)
    }

    /// Get the number of subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Get the ids of all subscribers.
    pub async fn subscribers(&self) -> Vec<ClientId> {
        self.subscribers.read().await.keys().cloned().collect()
    }

    /// Push one item to every subscriber.
    ///
    /// Holds the read lock for a single pass, so registration changes take
    /// effect between items, never during one.
    pub async fn fan_out(&self, item: &Item) -> FanOut {
        let subscribers = self.subscribers.read().await;
        let mut result = FanOut::default();

        for (client, inbox) in subscribers.iter() {
            match inbox.push(Arc::clone(item)) {
                Delivery::Queued => result.delivered += 1,
                Delivery::DroppedOldest => {
                    trace!(stream = %self.name, client = %client, "Inbox full, dropped oldest item");
                    result.dropped += 1;
                }
                Delivery::Overflowed => {
                    warn!(stream = %self.name, client = %client, "Inbox overflowed, disconnecting subscriber");
                    result.overflowed.push(client.clone());
                }
                Delivery::Closed => {}
            }
        }

        result
    }

    /// Broadcast everything from `input` until it ends, then close.
    pub async fn broadcast(self: Arc<Self>, mut input: mpsc::Receiver<Item>) {
        debug!(stream = %self.name, "Broadcast started");

        while let Some(item) = input.recv().await {
            let result = self.fan_out(&item).await;
            metrics::record_fan_out(&self.name, &result);
        }

        self.close().await;
    }

    /// Stop broadcasting and close every subscriber's inbox.
    ///
    /// Subscribers stay registered until their clients tear down.
    pub async fn close(&self) {
        let subscribers = self.subscribers.read().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        for inbox in subscribers.values() {
            inbox.close();
        }
        debug!(stream = %self.name, subscribers = subscribers.len(), "Stream closed");
    }
}
