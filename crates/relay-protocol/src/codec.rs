//! Codec for encoding and decoding control events.
//!
//! Events travel as JSON text messages. Decoding enforces a size limit so a
//! misbehaving client cannot make the server buffer arbitrarily large input.

use thiserror::Error;

use crate::event::Event;

/// Default maximum size of an inbound control event in bytes.
pub const MAX_EVENT_SIZE: usize = 512;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Event exceeds the size limit.
    #[error("Event size {size} exceeds maximum {limit}")]
    TooLarge {
        /// Size of the rejected input.
        size: usize,
        /// Limit in effect.
        limit: usize,
    },

    /// Input is not valid UTF-8.
    #[error("Event is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// Input is not a well-formed event.
    #[error("Malformed event: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Encode an event to JSON text.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(event: &Event) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(event)?)
}

/// Decode an event from JSON bytes using the default size limit.
///
/// # Errors
///
/// Returns an error if the input is too large, not UTF-8, or malformed.
pub fn decode(data: &[u8]) -> Result<Event, ProtocolError> {
    decode_with_limit(data, MAX_EVENT_SIZE)
}

/// Decode an event from JSON bytes with an explicit size limit.
///
/// # Errors
///
/// Returns an error if the input is too large, not UTF-8, or malformed.
pub fn decode_with_limit(data: &[u8], limit: usize) -> Result<Event, ProtocolError> {
    if data.len() > limit {
        return Err(ProtocolError::TooLarge {
            size: data.len(),
            limit,
        });
    }

    let text = std::str::from_utf8(data)?;
    Ok(serde_json::from_str(text)?)
}

/// Codec carrying a size limit, for callers that decode many events.
#[derive(Debug, Clone, Copy)]
pub struct EventCodec {
    max_size: usize,
}

impl EventCodec {
    /// Create a codec with the default size limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(MAX_EVENT_SIZE)
    }

    /// Create a codec with a specific size limit.
    #[must_use]
    pub fn with_limit(max_size: usize) -> Self {
        Self { max_size }
    }

    /// Get the size limit.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Encode an event.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self, event: &Event) -> Result<String, ProtocolError> {
        encode(event)
    }

    /// Decode an event.
    ///
    /// # Errors
    ///
    /// Returns an error if decoding fails.
    pub fn decode(&self, data: &[u8]) -> Result<Event, ProtocolError> {
        decode_with_limit(data, self.max_size)
    }
}

impl Default for EventCodec {
    fn default() -> Self {
        Self::new()
    }
}
