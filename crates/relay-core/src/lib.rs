//! # relay-core
//!
//! Broadcast hub, stream fan-out and client lifecycle for the Relay engine.
//!
//! This crate provides the building blocks:
//!
//! - **Publisher** - Names streams and supplies their items
//! - **Stream** - Fans every item out to its subscribers
//! - **Inbox** - Bounded per-client buffer that never blocks fan-out
//! - **Client** - One connection with its read and write loops
//! - **Hub** - Registries of streams and clients, subscription bookkeeping
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌───────┐   ┌──────────┐   ┌───────┐   ┌──────────────┐
//! │ Publisher │──▶│ drain │──▶│  Stream  │──▶│ Inbox │──▶│ write loop   │──▶ peer
//! └───────────┘   └───────┘   └──────────┘   └───────┘   └──────────────┘
//!                                   ▲                           ▲
//!                                   │       ┌─────┐             │ notices
//!                                   └───────│ Hub │◀── read loop ◀── peer
//!                                           └─────┘
//! ```

pub mod client;
pub mod handler;
pub mod hub;
pub mod inbox;
pub mod metrics;
pub mod publisher;
pub mod stream;
pub mod streamable;
pub mod writer;

pub use client::{Client, ClientId, ClientState, Termination};
pub use handler::{merge_metadata, ApplicationEvent, EventHandler};
pub use hub::{has_token, metadata_from_params, Hub, HubConfig, HubError, HubStats};
pub use inbox::{Delivery, Inbox, OverflowPolicy};
pub use publisher::{ChannelPublisher, Publisher, PublisherError, StreamSender};
pub use stream::{Stream, StreamError};
pub use streamable::{item, Item, Streamable};
pub use writer::{JsonWriter, MessagePackWriter, WriteError, Writer, WriterFormat};
