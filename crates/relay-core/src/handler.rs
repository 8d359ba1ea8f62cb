//! Application event handling.

use async_trait::async_trait;
use relay_protocol::Metadata;

use crate::client::ClientId;

/// A non-control event received from a client.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationEvent {
    /// The sending client.
    pub client: ClientId,
    /// Event kind as sent.
    pub kind: String,
    /// Event code, `0` if absent.
    pub code: i64,
    /// Event message, empty if absent.
    pub message: String,
    /// Event metadata merged with the client's connection metadata.
    pub meta: Metadata,
}

/// Receives application events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one event.
    async fn handle_event(&self, event: ApplicationEvent);
}

/// Merge event metadata with connection metadata.
///
/// Connection metadata wins on conflicting keys, so a client cannot spoof
/// values fixed at connect time.
#[must_use]
pub fn merge_metadata(event_meta: &Metadata, connection_meta: &Metadata) -> Metadata {
    let mut merged = event_meta.clone();
    for (key, value) in connection_meta {
        merged.insert(key.clone(), value.clone());
    }
    merged
}
