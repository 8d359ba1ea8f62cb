//! Transport abstraction traits for Relay.
//!
//! A connection is split into a sending half ([`MessageSink`]) and a receiving
//! half ([`MessageStream`]) so that a client's read and write loops can run
//! concurrently without sharing a lock.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use thiserror::Error;
use url::form_urlencoded;

/// WebSocket close codes used by the server.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Endpoint is going away (server shutdown).
    pub const GOING_AWAY: u16 = 1001;
    /// Abnormal closure. Never sent on the wire; the socket is simply dropped.
    pub const ABNORMAL: u16 = 1006;
    /// Policy violation (e.g. a consumer that cannot keep up).
    pub const POLICY: u16 = 1008;
    /// Message too big.
    pub const TOO_BIG: u16 = 1009;
}

/// Connection parameters captured at upgrade time (query string, headers).
pub type ConnectParams = HashMap<String, String>;

/// A message received from the remote end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Text message.
    Text(String),
    /// Binary message.
    Binary(Bytes),
    /// Pong answering one of our pings.
    Pong,
}

impl Inbound {
    /// Get the payload bytes of a data message.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Inbound::Text(text) => Some(text.as_bytes()),
            Inbound::Binary(data) => Some(data),
            Inbound::Pong => None,
        }
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Operation timed out.
    #[error("Operation timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Inbound message exceeds the configured limit.
    #[error("Message size {size} exceeds maximum {limit}")]
    MessageTooLarge {
        /// Size of the rejected message.
        size: usize,
        /// Limit in effect.
        limit: usize,
    },

    /// Handshake failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// The receiving half of a connection.
#[async_trait]
pub trait MessageStream: Send {
    /// Receive the next message.
    ///
    /// Returns `None` if the connection was closed cleanly by the remote end.
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError>;
}

/// The sending half of a connection.
#[async_trait]
pub trait MessageSink: Send {
    /// Send a text message.
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Send a binary message.
    async fn send_binary(&mut self, data: Bytes) -> Result<(), TransportError>;

    /// Send a liveness probe.
    async fn ping(&mut self) -> Result<(), TransportError>;

    /// Perform a close handshake with the given code and reason.
    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;
}

/// An accepted connection, not yet split.
pub trait Connection: Send {
    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Split the connection into its sending and receiving halves.
    fn split(self: Box<Self>) -> (Box<dyn MessageSink>, Box<dyn MessageStream>);
}

/// A connection together with the parameters it was opened with.
pub struct Accepted {
    /// The connection.
    pub connection: Box<dyn Connection>,
    /// Parameters from the upgrade request.
    pub params: ConnectParams,
}

/// A transport that can accept connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Accept a new connection.
    ///
    /// This method blocks until a new connection is available or an error occurs.
    async fn accept(&self) -> Result<Accepted, TransportError>;

    /// Get the transport name (e.g., "websocket").
    fn name(&self) -> &'static str;
}

/// Parse a raw query string into parameters.
///
/// Keys and values are form-urlencoded, the same decoding axum's `Query`
/// extractor applies. A repeated key keeps its last value.
#[must_use]
pub fn parse_query(query: &str) -> ConnectParams {
    form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

/// Check an inbound message against a size limit.
///
/// # Errors
///
/// Returns [`TransportError::MessageTooLarge`] if the message is too big.
pub fn check_size(size: usize, limit: usize) -> Result<(), TransportError> {
    if size > limit {
        return Err(TransportError::MessageTooLarge { size, limit });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query() {
        let params = parse_query("token=abc&region=eu&flag");
        assert_eq!(params.get("token").map(String::as_str), Some("abc"));
        assert_eq!(params.get("region").map(String::as_str), Some("eu"));
        assert_eq!(params.get("flag").map(String::as_str), Some(""));
        assert!(parse_query("").is_empty());
    }

    #[test]
    fn test_parse_query_decodes() {
        let params = parse_query("token=a%2Bb&name=market+data&pct=100%25");
        assert_eq!(params.get("token").map(String::as_str), Some("a+b"));
        assert_eq!(params.get("name").map(String::as_str), Some("market data"));
        assert_eq!(params.get("pct").map(String::as_str), Some("100%"));
    }

    #[test]
    fn test_check_size() {
        assert!(check_size(10, 10).is_ok());
        assert!(matches!(
            check_size(11, 10),
            Err(TransportError::MessageTooLarge { size: 11, limit: 10 })
        ));
    }

    #[test]
    fn test_inbound_bytes() {
        assert_eq!(Inbound::Text("hi".into()).as_bytes(), Some(&b"hi"[..]));
        assert_eq!(Inbound::Pong.as_bytes(), None);
    }
}
