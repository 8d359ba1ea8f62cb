//! In-memory transport.
//!
//! [`pair`] returns a connection for the hub and a [`MemoryPeer`] that plays
//! the remote end. Useful for embedding the hub in-process and for tests.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::traits::{Connection, Inbound, MessageSink, MessageStream, TransportError};

/// A message the hub sent to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Text message.
    Text(String),
    /// Binary message.
    Binary(Bytes),
    /// Liveness probe.
    Ping,
    /// Close handshake.
    Close {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Create a connected in-memory pair.
#[must_use]
pub fn pair() -> (MemoryConnection, MemoryPeer) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    let connection = MemoryConnection {
        inbound: inbound_rx,
        outbound: outbound_tx,
    };
    let peer = MemoryPeer {
        inbound: Some(inbound_tx),
        outbound: outbound_rx,
    };
    (connection, peer)
}

/// The hub's side of an in-memory pair.
pub struct MemoryConnection {
    inbound: mpsc::UnboundedReceiver<Result<Inbound, TransportError>>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl Connection for MemoryConnection {
    fn remote_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn MessageSink>, Box<dyn MessageStream>) {
        (
            Box::new(MemorySink {
                outbound: self.outbound,
            }),
            Box::new(MemoryStream {
                inbound: self.inbound,
            }),
        )
    }
}

struct MemorySink {
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl MemorySink {
    fn push(&self, message: Outbound) -> Result<(), TransportError> {
        self.outbound
            .send(message)
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

#[async_trait]
impl MessageSink for MemorySink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.push(Outbound::Text(text))
    }

    async fn send_binary(&mut self, data: Bytes) -> Result<(), TransportError> {
        self.push(Outbound::Binary(data))
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.push(Outbound::Ping)
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        self.push(Outbound::Close {
            code,
            reason: reason.to_string(),
        })
    }
}

struct MemoryStream {
    inbound: mpsc::UnboundedReceiver<Result<Inbound, TransportError>>,
}

#[async_trait]
impl MessageStream for MemoryStream {
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        match self.inbound.recv().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

/// The remote end of an in-memory pair.
pub struct MemoryPeer {
    inbound: Option<mpsc::UnboundedSender<Result<Inbound, TransportError>>>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

impl MemoryPeer {
    /// Send a text message to the hub.
    ///
    /// Returns `false` if the hub side is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.deliver(Ok(Inbound::Text(text.into())))
    }

    /// Send a binary message to the hub.
    pub fn send_binary(&self, data: impl Into<Bytes>) -> bool {
        self.deliver(Ok(Inbound::Binary(data.into())))
    }

    /// Answer a ping.
    pub fn pong(&self) -> bool {
        self.deliver(Ok(Inbound::Pong))
    }

    /// Make the hub's next read fail with the given error.
    pub fn fail(&self, error: TransportError) -> bool {
        self.deliver(Err(error))
    }

    /// Close the peer's sending direction; the hub reads end-of-stream.
    pub fn hang_up(&mut self) {
        self.inbound = None;
    }

    /// Stop accepting messages; the hub's writes start failing.
    pub fn stop_reading(&mut self) {
        self.outbound.close();
    }

    /// Receive the next message the hub sent.
    ///
    /// Returns `None` once the hub dropped its sending half.
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.outbound.recv().await
    }

    /// Receive a message if one is already queued.
    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.outbound.try_recv().ok()
    }

    fn deliver(&self, message: Result<Inbound, TransportError>) -> bool {
        self.inbound
            .as_ref()
            .is_some_and(|tx| tx.send(message).is_ok())
    }
}
