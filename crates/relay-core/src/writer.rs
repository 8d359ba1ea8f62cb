//! Writers encode stream items onto a client connection.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tenvis_relay_transport::{MessageSink, TransportError};
use thiserror::Error;

use crate::streamable::Streamable;

/// Write errors. Any of them ends the connection.
#[derive(Debug, Error)]
pub enum WriteError {
    /// The item could not be encoded.
    #[error("Encoding failed: {0}")]
    Encode(String),

    /// The connection rejected the write.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<serde_json::Error> for WriteError {
    fn from(e: serde_json::Error) -> Self {
        WriteError::Encode(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for WriteError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        WriteError::Encode(e.to_string())
    }
}

/// Encodes one item and sends it.
#[async_trait]
pub trait Writer: Send + Sync {
    /// Write a single item to the client's connection.
    async fn write_to_client_stream(
        &self,
        sink: &mut dyn MessageSink,
        item: &dyn Streamable,
    ) -> Result<(), WriteError>;
}

/// Sends items as JSON text messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonWriter;

#[async_trait]
impl Writer for JsonWriter {
    async fn write_to_client_stream(
        &self,
        sink: &mut dyn MessageSink,
        item: &dyn Streamable,
    ) -> Result<(), WriteError> {
        let text = serde_json::to_string(&item.to_json()?)?;
        sink.send_text(text).await?;
        Ok(())
    }
}

/// Sends items as MessagePack binary messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessagePackWriter;

#[async_trait]
impl Writer for MessagePackWriter {
    async fn write_to_client_stream(
        &self,
        sink: &mut dyn MessageSink,
        item: &dyn Streamable,
    ) -> Result<(), WriteError> {
        let data = rmp_serde::to_vec_named(&item.to_json()?)?;
        sink.send_binary(Bytes::from(data)).await?;
        Ok(())
    }
}

/// Wire format for stream items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriterFormat {
    /// JSON text.
    #[default]
    Json,
    /// MessagePack binary.
    MessagePack,
}

impl WriterFormat {
    /// Build the writer for this format.
    #[must_use]
    pub fn writer(self) -> Arc<dyn Writer> {
        match self {
            WriterFormat::Json => Arc::new(JsonWriter),
            WriterFormat::MessagePack => Arc::new(MessagePackWriter),
        }
    }
}
