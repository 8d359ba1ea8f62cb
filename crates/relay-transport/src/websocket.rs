//! WebSocket transport implementation.
//!
//! This module provides a standalone WebSocket listener using tokio-tungstenite,
//! for deployments that do not need an HTTP router in front of the hub.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        protocol::{frame::coding::CloseCode, CloseFrame},
        Error as WsError, Message,
    },
    WebSocketStream,
};
use tracing::{debug, error, info};

use crate::traits::{
    check_size, parse_query, Accepted, ConnectParams, Connection, Inbound, MessageSink,
    MessageStream, Transport, TransportError,
};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8081)),
            max_message_size: 512,
        }
    }
}

/// WebSocket transport.
pub struct WebSocketTransport {
    listener: TcpListener,
    config: WebSocketConfig,
}

impl WebSocketTransport {
    /// Create a new WebSocket transport.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn new(config: WebSocketConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(TransportError::Io)?;

        info!("WebSocket transport listening on {}", config.bind_addr);

        Ok(Self { listener, config })
    }

    /// Create a new WebSocket transport with default limits.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        Self::new(WebSocketConfig {
            bind_addr: addr,
            ..Default::default()
        })
        .await
    }

    /// Get the local address this transport is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn accept(&self) -> Result<Accepted, TransportError> {
        let (stream, addr) = self.listener.accept().await.map_err(TransportError::Io)?;

        debug!("Accepted TCP connection from {}", addr);

        let mut query = None;
        let ws_stream = accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                query = request.uri().query().map(str::to_string);
                Ok(response)
            },
        )
        .await
        .map_err(|e| {
            error!("WebSocket handshake failed: {}", e);
            TransportError::Handshake(e.to_string())
        })?;

        debug!("WebSocket handshake completed with {}", addr);

        let params: ConnectParams = query.as_deref().map(parse_query).unwrap_or_default();
        let conn = WebSocketConnection::new(ws_stream, addr, self.config.max_message_size);

        Ok(Accepted {
            connection: Box::new(conn),
            params,
        })
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// A WebSocket connection over a TCP stream.
pub struct WebSocketConnection {
    stream: WebSocketStream<TcpStream>,
    remote_addr: SocketAddr,
    max_message_size: usize,
}

impl WebSocketConnection {
    /// Wrap an established WebSocket stream.
    #[must_use]
    pub fn new(
        stream: WebSocketStream<TcpStream>,
        remote_addr: SocketAddr,
        max_message_size: usize,
    ) -> Self {
        Self {
            stream,
            remote_addr,
            max_message_size,
        }
    }
}

impl Connection for WebSocketConnection {
    fn remote_addr(&self) -> Option<String> {
        Some(self.remote_addr.to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn MessageSink>, Box<dyn MessageStream>) {
        let (sink, stream) = self.stream.split();
        (
            Box::new(WebSocketSink { sink }),
            Box::new(WebSocketReader {
                stream,
                max_message_size: self.max_message_size,
            }),
        )
    }
}

/// Sending half of a [`WebSocketConnection`].
pub struct WebSocketSink {
    sink: SplitSink<WebSocketStream<TcpStream>, Message>,
}

#[async_trait]
impl MessageSink for WebSocketSink {
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
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        self.sink
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }
}

/// Receiving half of a [`WebSocketConnection`].
pub struct WebSocketReader {
    stream: SplitStream<WebSocketStream<TcpStream>>,
    max_message_size: usize,
}

#[async_trait]
impl MessageStream for WebSocketReader {
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
                    // tungstenite queues the pong reply itself
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    return Ok(None);
                }
                Some(Ok(Message::Frame(_))) => {
                    // Raw frame, ignore
                }
                Some(Err(WsError::ConnectionClosed)) | None => {
                    debug!("WebSocket stream ended");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::connect_async;

    #[test]
    fn test_websocket_config_default() {
        let config = WebSocketConfig::default();
        assert_eq!(config.bind_addr.port(), 8081);
        assert_eq!(config.max_message_size, 512);
    }

    #[tokio::test]
    async fn test_accept_captures_query_and_exchanges_messages() {
        let transport = WebSocketTransport::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = transport.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let url = format!("ws://{}/ws?token=secret", addr);
            let (mut ws, _) = connect_async(url).await.unwrap();
            ws.send(Message::Text("hello".into())).await.unwrap();
            let reply = ws.next().await.unwrap().unwrap();
            assert_eq!(reply, Message::Text("welcome".into()));
        });

        let accepted = transport.accept().await.unwrap();
        assert_eq!(
            accepted.params.get("token").map(String::as_str),
            Some("secret")
        );

        let (mut sink, mut stream) = accepted.connection.split();
        assert_eq!(
            stream.recv().await.unwrap(),
            Some(Inbound::Text("hello".into()))
        );
        sink.send_text("welcome".into()).await.unwrap();

        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let transport = WebSocketTransport::new(WebSocketConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_message_size: 4,
        })
        .await
        .unwrap();
        let addr = transport.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let (mut ws, _) = connect_async(format!("ws://{}/", addr)).await.unwrap();
            ws.send(Message::Text("too long".into())).await.unwrap();
            ws
        });

        let accepted = transport.accept().await.unwrap();
        let (_sink, mut stream) = accepted.connection.split();
        assert!(matches!(
            stream.recv().await,
            Err(TransportError::MessageTooLarge { size: 8, limit: 4 })
        ));

        drop(client.await.unwrap());
    }
}
