//! axum WebSocket adapter.
//!
//! Wraps a socket produced by axum's `WebSocketUpgrade` so the hub can drive
//! it like any other [`Connection`].

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tracing::debug;

use crate::traits::{check_size, Connection, Inbound, MessageSink, MessageStream, TransportError};

/// A WebSocket connection upgraded through axum.
pub struct AxumConnection {
    socket: WebSocket,
    remote_addr: Option<SocketAddr>,
    max_message_size: usize,
}

impl AxumConnection {
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(socket: WebSocket, remote_addr: Option<SocketAddr>, max_message_size: usize) -> Self {
        Self {
            socket,
            remote_addr,
            max_message_size,
        }
    }
}

impl Connection for AxumConnection {
    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn MessageSink>, Box<dyn MessageStream>) {
        let (sink, stream) = self.socket.split();
        (
            Box::new(AxumSink { sink }),
            Box::new(AxumStream {
                stream,
                max_message_size: self.max_message_size,
            }),
        )
    }
}

/// Sending half of an [`AxumConnection`].
pub struct AxumSink {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl MessageSink for AxumSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn send_binary(&mut self, data: Bytes) -> Result<(), TransportError> {
        self.sink
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.sink
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        self.sink
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }
}

/// Receiving half of an [`AxumConnection`].
pub struct AxumStream {
    stream: SplitStream<WebSocket>,
    max_message_size: usize,
}

#[async_trait]
impl MessageStream for AxumStream {
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    check_size(text.len(), self.max_message_size)?;
                    return Ok(Some(Inbound::Text(text)));
                }
                Some(Ok(Message::Binary(data))) => {
                    check_size(data.len(), self.max_message_size)?;
                    return Ok(Some(Inbound::Binary(Bytes::from(data))));
                }
                Some(Ok(Message::Pong(_))) => return Ok(Some(Inbound::Pong)),
                Some(Ok(Message::Ping(_))) => {
                    // axum answers pings automatically
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    return Ok(None);
                }
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
                None => {
                    debug!("WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }
}
