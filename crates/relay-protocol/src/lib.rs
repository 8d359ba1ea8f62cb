//! # relay-protocol
//!
//! Control protocol definitions for the Relay broadcast engine.
//!
//! Consumers talk to the server with small JSON events. This crate defines
//! the event shape and the codec used to read and write them.
//!
//! ## Event Kinds
//!
//! - `subscribe` / `unsubscribe` - Stream membership (`meta.channel` names the stream)
//! - `info` / `error` - Notifications sent back to the consumer (codes 1 and 2)
//! - anything else - Application-defined, routed to the server's event handler
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, Event};
//!
//! let request = Event::subscribe("trades");
//!
//! let text = codec::encode(&request).unwrap();
//! let decoded = codec::decode(text.as_bytes()).unwrap();
//! assert_eq!(decoded.channel(), Some("trades"));
//! ```

pub mod codec;
pub mod event;

pub use codec::{decode, encode, EventCodec, ProtocolError};
pub use event::{channel_of, Event, EventKind, Metadata, CHANNEL_KEY, ERROR_CODE, INFO_CODE};
