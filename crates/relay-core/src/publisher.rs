//! Publishers.
//!
//! A publisher names a set of streams and hands out one item source per
//! stream. The hub takes every source once, at start.

use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::stream::validate_stream_name;
use crate::streamable::{Item, Streamable};

/// Publisher errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PublisherError {
    /// No stream with this name.
    #[error("unknown stream `{0}`")]
    UnknownStream(String),

    /// The stream's source has already been taken.
    #[error("stream `{0}` has already been taken")]
    AlreadyTaken(String),

    /// A stream with this name already exists.
    #[error("stream `{0}` already exists")]
    DuplicateStream(String),

    /// The stream name is not valid.
    #[error("invalid stream name `{name}`: {reason}")]
    InvalidName {
        /// Rejected name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Nothing is consuming the stream any more.
    #[error("stream `{0}` is closed")]
    StreamClosed(String),
}

/// A source of named streams.
pub trait Publisher: Send + Sync {
    /// Publisher name, for logs and the stream catalog.
    fn name(&self) -> &str;

    /// Names of all streams this publisher offers.
    fn streams(&self) -> Vec<String>;

    /// Check if a stream exists.
    fn has_stream(&self, name: &str) -> bool {
        self.streams().iter().any(|stream| stream == name)
    }

    /// Take the item source of a stream.
    ///
    /// # Errors
    ///
    /// Fails if the stream is unknown or its source was already taken.
    fn stream(&self, name: &str) -> Result<mpsc::Receiver<Item>, PublisherError>;
}

/// A publisher fed through channels.
///
/// Each stream added returns a [`StreamSender`] the application publishes with.
#[derive(Debug)]
pub struct ChannelPublisher {
    name: String,
    sources: DashMap<String, Option<mpsc::Receiver<Item>>>,
}

impl ChannelPublisher {
    /// Create an empty publisher.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sources: DashMap::new(),
        }
    }

    /// Add a stream whose source buffers up to `capacity` items.
    ///
    /// # Errors
    ///
    /// Fails if the name is invalid or already in use.
    pub fn add_stream(
        &self,
        name: impl Into<String>,
        capacity: usize,
    ) -> Result<StreamSender, PublisherError> {
        let name = name.into();
        validate_stream_name(&name).map_err(|reason| PublisherError::InvalidName {
            name: name.clone(),
            reason,
        })?;

        match self.sources.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(PublisherError::DuplicateStream(name)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                slot.insert(Some(rx));
                debug!(publisher = %self.name, stream = %name, "Stream added");
                Ok(StreamSender {
                    name: Arc::from(name),
                    tx,
                })
            }
        }
    }
}

impl Publisher for ChannelPublisher {
    fn name(&self) -> &str {
        &self.name
    }

    fn streams(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn has_stream(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    fn stream(&self, name: &str) -> Result<mpsc::Receiver<Item>, PublisherError> {
        let mut source = self
            .sources
            .get_mut(name)
            .ok_or_else(|| PublisherError::UnknownStream(name.to_string()))?;
        source
            .take()
            .ok_or_else(|| PublisherError::AlreadyTaken(name.to_string()))
    }
}

/// Publishing handle for one stream of a [`ChannelPublisher`].
#[derive(Debug, Clone)]
pub struct StreamSender {
    name: Arc<str>,
    tx: mpsc::Sender<Item>,
}

impl StreamSender {
    /// Get the stream name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish a value, waiting for buffer space.
    ///
    /// # Errors
    ///
    /// Fails if the stream is no longer consumed.
    pub async fn publish<T: Streamable>(&self, value: T) -> Result<(), PublisherError> {
        self.publish_item(Arc::new(value)).await
    }

    /// Publish a shared item, waiting for buffer space.
    ///
    /// # Errors
    ///
    /// Fails if the stream is no longer consumed.
    pub async fn publish_item(&self, item: Item) -> Result<(), PublisherError> {
        self.tx
            .send(item)
            .await
            .map_err(|_| PublisherError::StreamClosed(self.name.to_string()))
    }

    /// Check if the stream is no longer consumed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_catalog() {
        let publisher = ChannelPublisher::new("market");
        publisher.add_stream("trades", 8).unwrap();
        publisher.add_stream("quotes", 8).unwrap();

        assert_eq!(publisher.name(), "market");
        assert_eq!(publisher.streams(), vec!["quotes", "trades"]);
        assert!(publisher.has_stream("trades"));
        assert!(!publisher.has_stream("orders"));
    }

    #[test]
    fn test_add_stream_rejects_bad_names() {
        let publisher = ChannelPublisher::new("market");
        publisher.add_stream("trades", 8).unwrap();

        assert_eq!(
            publisher.add_stream("trades", 8).unwrap_err(),
            PublisherError::DuplicateStream("trades".into())
        );
        assert!(matches!(
            publisher.add_stream("$sys", 8),
            Err(PublisherError::InvalidName { .. })
        ));
    }

    #[test]
    fn test_source_taken_once() {
        let publisher = ChannelPublisher::new("market");
        publisher.add_stream("trades", 8).unwrap();

        assert!(publisher.stream("trades").is_ok());
        assert_eq!(
            publisher.stream("trades").unwrap_err(),
            PublisherError::AlreadyTaken("trades".into())
        );
        assert_eq!(
            publisher.stream("orders").unwrap_err(),
            PublisherError::UnknownStream("orders".into())
        );
    }

    #[tokio::test]
    async fn test_publish_reaches_source() {
        let publisher = ChannelPublisher::new("market");
        let trades = publisher.add_stream("trades", 8).unwrap();
        let mut source = publisher.stream("trades").unwrap();

        trades.publish(json!({"price": 10})).await.unwrap();
        let item = source.recv().await.unwrap();
        assert_eq!(item.to_json().unwrap(), json!({"price": 10}));

        drop(source);
        assert!(trades.is_closed());
        assert_eq!(
            trades.publish(1).await.unwrap_err(),
            PublisherError::StreamClosed("trades".into())
        );
    }
}
