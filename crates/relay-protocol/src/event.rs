//! Control events for the Relay protocol.
//!
//! Events are JSON objects exchanged over a connection. Clients send
//! `subscribe` / `unsubscribe` requests (or application-defined events);
//! the server answers with `info` and `error` notifications.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Free-form key/value metadata attached to events and connections.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Metadata key naming the target stream of a subscription request.
pub const CHANNEL_KEY: &str = "channel";

/// Code carried by `info` notifications.
pub const INFO_CODE: i64 = 1;

/// Code carried by `error` notifications.
pub const ERROR_CODE: i64 = 2;

/// The kind of an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    /// Request to subscribe to a stream.
    Subscribe,
    /// Request to unsubscribe from a stream.
    Unsubscribe,
    /// Informational notification.
    Info,
    /// Error notification.
    Error,
    /// Any other, application-defined kind.
    Custom(String),
}

impl EventKind {
    /// Get the wire name of this kind.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Subscribe => "subscribe",
            EventKind::Unsubscribe => "unsubscribe",
            EventKind::Info => "info",
            EventKind::Error => "error",
            EventKind::Custom(kind) => kind,
        }
    }

    /// Whether this kind is handled by the hub itself.
    #[must_use]
    pub fn is_control(&self) -> bool {
        matches!(self, EventKind::Subscribe | EventKind::Unsubscribe)
    }
}

impl From<String> for EventKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "subscribe" => EventKind::Subscribe,
            "unsubscribe" => EventKind::Unsubscribe,
            "info" => EventKind::Info,
            "error" => EventKind::Error,
            _ => EventKind::Custom(kind),
        }
    }
}

impl From<&str> for EventKind {
    fn from(kind: &str) -> Self {
        EventKind::from(kind.to_string())
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> String {
        match kind {
            EventKind::Custom(kind) => kind,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A control event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event kind.
    pub event: EventKind,
    /// Numeric code (notifications only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    /// Human-readable message (notifications only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Event metadata. Subscription requests carry the stream name under `channel`.
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub meta: Metadata,
}

impl Event {
    /// Create an event of the given kind with no code, message or metadata.
    #[must_use]
    pub fn new(kind: impl Into<EventKind>) -> Self {
        Self {
            event: kind.into(),
            code: None,
            message: None,
            meta: Metadata::new(),
        }
    }

    /// Create an `info` notification.
    #[must_use]
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            event: EventKind::Info,
            code: Some(INFO_CODE),
            message: Some(message.into()),
            meta: Metadata::new(),
        }
    }

    /// Create an `error` notification.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            event: EventKind::Error,
            code: Some(ERROR_CODE),
            message: Some(message.into()),
            meta: Metadata::new(),
        }
    }

    /// Create a `subscribe` request for a stream.
    #[must_use]
    pub fn subscribe(channel: impl Into<String>) -> Self {
        Self::new(EventKind::Subscribe).with_meta(CHANNEL_KEY, channel.into())
    }

    /// Create an `unsubscribe` request for a stream.
    #[must_use]
    pub fn unsubscribe(channel: impl Into<String>) -> Self {
        Self::new(EventKind::Unsubscribe).with_meta(CHANNEL_KEY, channel.into())
    }

    /// Add a metadata entry.
    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Get the stream name from the `channel` metadata key, if it is a string.
    #[must_use]
    pub fn channel(&self) -> Option<&str> {
        channel_of(&self.meta)
    }

    /// Get the code, defaulting to 0.
    #[must_use]
    pub fn code_or_default(&self) -> i64 {
        self.code.unwrap_or_default()
    }

    /// Get the message, defaulting to empty.
    #[must_use]
    pub fn message_or_default(&self) -> &str {
        self.message.as_deref().unwrap_or_default()
    }
}

/// Read the stream name from a metadata map.
#[must_use]
pub fn channel_of(meta: &Metadata) -> Option<&str> {
    meta.get(CHANNEL_KEY).and_then(serde_json::Value::as_str)
}
