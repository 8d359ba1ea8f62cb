//! # relay-transport
//!
//! Transport abstraction layer for the Relay broadcast engine.
//!
//! The hub never touches sockets directly. It receives a [`Connection`],
//! splits it into a [`MessageSink`] and a [`MessageStream`], and drives each
//! half from its own task.
//!
//! - **WebSocket** - Standalone tokio-tungstenite listener
//! - **axum** - Adapter for sockets upgraded by an axum route
//! - **Memory** - In-process pair for embedding and tests
//!
//! ```rust,ignore
//! use tenvis_relay_transport::{Connection, Inbound};
//!
//! async fn echo(conn: Box<dyn Connection>) {
//!     let (mut sink, mut stream) = conn.split();
//!     while let Ok(Some(Inbound::Text(text))) = stream.recv().await {
//!         let _ = sink.send_text(text).await;
//!     }
//! }
//! ```

pub mod axum_ws;
pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use axum_ws::AxumConnection;
pub use traits::{
    close_code, parse_query, Accepted, ConnectParams, Connection, Inbound, MessageSink,
    MessageStream, Transport, TransportError,
};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransport;
