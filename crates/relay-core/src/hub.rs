//! The broadcast hub.
//!
//! The hub wires a publisher's streams to connected clients. It owns three
//! registries:
//!
//! - **streams**, created once at [`Hub::start`] from the publisher catalog;
//! - **connections**, every live client from connect until teardown;
//! - **attached clients**, the subset currently holding at least one
//!   subscription.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use relay_protocol::{channel_of, Event, Metadata};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tenvis_relay_transport::{ConnectParams, Connection, Transport};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::client::{self, Client, ClientId, Termination};
use crate::handler::{merge_metadata, ApplicationEvent, EventHandler};
use crate::inbox::{OverflowPolicy, DEFAULT_INBOX_CAPACITY};
use crate::metrics;
use crate::publisher::{Publisher, PublisherError};
use crate::stream::{Stream, StreamError};
use crate::streamable::Item;
use crate::writer::{JsonWriter, Writer};

/// Metadata key carrying the connection token.
pub const TOKEN_KEY: &str = "token";

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// The request names no channel.
    #[error("missing `channel` in metadata")]
    MissingChannel,

    /// No stream with this name.
    #[error("channel `{0}` does not exist")]
    UnknownStream(String),

    /// The client already holds this subscription.
    #[error("already subscribed to `{0}`")]
    AlreadySubscribed(String),

    /// The client does not hold this subscription.
    #[error("not subscribed to `{0}`")]
    NotSubscribed(String),

    /// The stream has stopped broadcasting.
    #[error("channel `{0}` is closed")]
    StreamClosed(String),

    /// The client is already attached.
    #[error("client `{0}` is already attached")]
    AlreadyAttached(ClientId),

    /// The client is not attached.
    #[error("client `{0}` is not attached")]
    NotAttached(ClientId),

    /// The client holds the maximum number of subscriptions.
    #[error("subscription limit of {0} reached")]
    TooManySubscriptions(usize),

    /// The client is shutting down.
    #[error("client `{0}` is closing")]
    ClientClosed(ClientId),

    /// A token is required but none was supplied.
    #[error("missing connection token")]
    MissingToken,

    /// Streams were already started.
    #[error("hub already started")]
    AlreadyStarted,

    /// The publisher refused a stream.
    #[error(transparent)]
    Publisher(#[from] PublisherError),
}

impl From<StreamError> for HubError {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::AlreadySubscribed(name) => HubError::AlreadySubscribed(name),
            StreamError::NotSubscribed(name) => HubError::NotSubscribed(name),
            StreamError::Closed(name) => HubError::StreamClosed(name),
        }
    }
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Per-client inbox capacity.
    pub subscriber_buffer: usize,
    /// What to do when an inbox is full.
    pub overflow_policy: OverflowPolicy,
    /// Per-client notice buffer.
    pub event_buffer: usize,
    /// Buffer between a publisher source and its stream.
    pub stream_buffer: usize,
    /// Maximum subscriptions per client.
    pub max_subscriptions_per_client: usize,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
    /// Refuse connections without a token.
    pub require_token: bool,
    /// Interval between liveness probes.
    pub ping_interval: Duration,
    /// Maximum wait for the next inbound message.
    pub read_timeout: Duration,
    /// Maximum duration of a single write.
    pub write_timeout: Duration,
    /// Maximum duration of a close handshake.
    pub close_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: DEFAULT_INBOX_CAPACITY,
            overflow_policy: OverflowPolicy::default(),
            event_buffer: 32,
            stream_buffer: 1024,
            max_subscriptions_per_client: 100,
            max_message_size: relay_protocol::codec::MAX_EVENT_SIZE,
            require_token: false,
            ping_interval: Duration::from_secs(54),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubStats {
    /// Number of streams.
    pub stream_count: usize,
    /// Number of live connections.
    pub connection_count: usize,
    /// Number of clients holding a subscription.
    pub attached_count: usize,
    /// Total subscriptions across all streams.
    pub total_subscriptions: usize,
}

/// The broadcast hub.
pub struct Hub {
    publisher: Arc<dyn Publisher>,
    writer: Arc<dyn Writer>,
    handler: Option<Arc<dyn EventHandler>>,
    config: HubConfig,
    streams: DashMap<String, Arc<Stream>>,
    connections: DashMap<ClientId, Arc<Client>>,
    attached: DashMap<ClientId, Arc<Client>>,
    drains: DashMap<String, JoinHandle<()>>,
    started: AtomicBool,
}

impl Hub {
    /// Create a hub that writes items as JSON.
    #[must_use]
    pub fn new(publisher: Arc<dyn Publisher>, config: HubConfig) -> Self {
        info!(publisher = %publisher.name(), "Creating hub with config: {:?}", config);
        Self {
            publisher,
            writer: Arc::new(JsonWriter),
            handler: None,
            config,
            streams: DashMap::new(),
            connections: DashMap::new(),
            attached: DashMap::new(),
            drains: DashMap::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Use a different item writer.
    #[must_use]
    pub fn with_writer(mut self, writer: Arc<dyn Writer>) -> Self {
        self.writer = writer;
        self
    }

    /// Forward application events to a handler.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Get the publisher.
    #[must_use]
    pub fn publisher(&self) -> &Arc<dyn Publisher> {
        &self.publisher
    }

    pub(crate) fn writer(&self) -> Arc<dyn Writer> {
        Arc::clone(&self.writer)
    }

    /// Start broadcasting every stream in the publisher catalog.
    ///
    /// Returns the names of the started streams.
    ///
    /// # Errors
    ///
    /// Fails if called twice or if the publisher refuses a stream.
    pub fn start(&self) -> Result<Vec<String>, HubError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(HubError::AlreadyStarted);
        }

        let names = self.publisher.streams();
        for name in &names {
            let source = self.publisher.stream(name)?;
            let (input_tx, input_rx) = mpsc::channel(self.config.stream_buffer.max(1));

            let stream = Arc::new(Stream::new(name.clone()));
            self.streams.insert(name.clone(), Arc::clone(&stream));

            self.drains
                .insert(name.clone(), tokio::spawn(drain(name.clone(), source, input_tx)));
            tokio::spawn(stream.broadcast(input_rx));
        }

        metrics::set_active_streams(self.streams.len());
        info!(
            publisher = %self.publisher.name(),
            streams = names.len(),
            "Broadcasting streams"
        );
        Ok(names)
    }

    /// Accept a connection and start serving it.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::MissingToken`] if a token is required and absent.
    /// The connection is dropped.
    pub fn connect(
        self: &Arc<Self>,
        connection: Box<dyn Connection>,
        meta: Metadata,
    ) -> Result<Arc<Client>, HubError> {
        if self.config.require_token && !has_token(&meta) {
            warn!(remote = ?connection.remote_addr(), "Rejecting connection without token");
            metrics::record_rejection("missing_token");
            return Err(HubError::MissingToken);
        }

        let remote_addr = connection.remote_addr();
        let (sink, stream) = connection.split();

        let (client, events) = loop {
            let id = ClientId::generate();
            match self.connections.entry(id.clone()) {
                Entry::Occupied(_) => warn!(client = %id, "Client id collision, regenerating"),
                Entry::Vacant(slot) => {
                    let (client, events) =
                        Client::new(id, meta.clone(), remote_addr.clone(), &self.config);
                    let client = Arc::new(client);
                    slot.insert(Arc::clone(&client));
                    break (client, events);
                }
            }
        };

        client::start(Arc::clone(self), Arc::clone(&client), sink, stream, events);
        info!(client = %client.id(), remote = ?remote_addr, "Client connected");
        Ok(client)
    }

    /// Accept connections from a transport until it fails permanently.
    pub async fn serve<T: Transport>(self: Arc<Self>, transport: T) {
        info!(transport = transport.name(), "Accepting connections");
        loop {
            match transport.accept().await {
                Ok(accepted) => {
                    let meta = metadata_from_params(accepted.params);
                    if let Err(e) = self.connect(accepted.connection, meta) {
                        debug!(error = %e, "Connection refused");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    metrics::record_error("accept");
                }
            }
        }
    }

    /// Subscribe a client to the stream named in `meta`.
    ///
    /// Returns the stream name.
    ///
    /// # Errors
    ///
    /// Fails if no channel is named, the stream is unknown or closed, the
    /// client already holds the subscription or its limit, or it is closing.
    pub async fn subscribe(&self, client: &Arc<Client>, meta: &Metadata) -> Result<String, HubError> {
        let name = channel_of(meta).ok_or(HubError::MissingChannel)?.to_string();

        let mut subscriptions = client.subscriptions.lock().await;
        if !client.is_open() {
            return Err(HubError::ClientClosed(client.id().clone()));
        }
        if subscriptions.contains_key(&name) {
            return Err(HubError::AlreadySubscribed(name));
        }
        let stream = self
            .stream(&name)
            .ok_or_else(|| HubError::UnknownStream(name.clone()))?;
        if subscriptions.len() >= self.config.max_subscriptions_per_client {
            return Err(HubError::TooManySubscriptions(
                self.config.max_subscriptions_per_client,
            ));
        }

        let attached_here = if self.is_attached(client.id()) {
            false
        } else {
            self.attach(client)?;
            true
        };

        if let Err(e) = stream.subscribe(client.id(), client.data.clone()).await {
            if attached_here {
                let _ = self.detach(client.id());
            }
            return Err(e.into());
        }

        subscriptions.insert(name.clone(), meta.clone());
        metrics::record_subscription(&name);
        debug!(client = %client.id(), stream = %name, "Subscribed");
        Ok(name)
    }

    /// Unsubscribe a client from the stream named in `meta`.
    ///
    /// Detaches the client once it holds no subscriptions.
    ///
    /// # Errors
    ///
    /// Fails if no channel is named or the client is not subscribed.
    pub async fn unsubscribe(&self, client: &Client, meta: &Metadata) -> Result<String, HubError> {
        let name = channel_of(meta).ok_or(HubError::MissingChannel)?.to_string();

        let mut subscriptions = client.subscriptions.lock().await;
        if subscriptions.remove(&name).is_none() {
            return Err(HubError::NotSubscribed(name));
        }

        if let Some(stream) = self.stream(&name) {
            if let Err(e) = stream.unsubscribe(client.id()).await {
                warn!(client = %client.id(), stream = %name, error = %e, "Stream registration out of step");
            }
        }
        metrics::record_unsubscription();

        if subscriptions.is_empty() {
            if let Err(e) = self.detach(client.id()) {
                debug!(client = %client.id(), error = %e, "Detach after last unsubscribe");
            }
        }

        debug!(client = %client.id(), stream = %name, "Unsubscribed");
        Ok(name)
    }

    /// Register a client as holding subscriptions.
    ///
    /// # Errors
    ///
    /// Fails if the client is already attached.
    pub fn attach(&self, client: &Arc<Client>) -> Result<(), HubError> {
        match self.attached.entry(client.id().clone()) {
            Entry::Occupied(_) => Err(HubError::AlreadyAttached(client.id().clone())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(client));
                trace!(client = %client.id(), "Attached");
                Ok(())
            }
        }
    }

    /// Remove a client from the attached set.
    ///
    /// # Errors
    ///
    /// Fails if the client is not attached.
    pub fn detach(&self, id: &ClientId) -> Result<Arc<Client>, HubError> {
        let (_, client) = self
            .attached
            .remove(id)
            .ok_or_else(|| HubError::NotAttached(id.clone()))?;
        trace!(client = %id, "Detached");
        Ok(client)
    }

    /// Tear down a client's registrations. Safe to call more than once.
    pub async fn release(&self, client: &Client) {
        let names: Vec<String> = {
            let mut subscriptions = client.subscriptions.lock().await;
            subscriptions.drain().map(|(name, _)| name).collect()
        };

        for name in &names {
            if let Some(stream) = self.stream(name) {
                if let Err(e) = stream.unsubscribe(client.id()).await {
                    debug!(client = %client.id(), stream = %name, error = %e, "Already unsubscribed");
                }
            }
            metrics::record_unsubscription();
        }

        match self.detach(client.id()) {
            Ok(_) | Err(HubError::NotAttached(_)) => {}
            Err(e) => warn!(client = %client.id(), error = %e, "Detach failed"),
        }
        self.connections.remove(client.id());
    }

    /// Forward an application event to the handler.
    pub async fn route_event(&self, client: &Client, event: Event) {
        let Some(handler) = &self.handler else {
            trace!(client = %client.id(), kind = %event.event, "No handler, event dropped");
            return;
        };

        let application_event = ApplicationEvent {
            client: client.id().clone(),
            kind: event.event.to_string(),
            code: event.code_or_default(),
            message: event.message_or_default().to_string(),
            meta: merge_metadata(&event.meta, client.meta()),
        };
        handler.handle_event(application_event).await;
    }

    /// Stop every stream pipeline and terminate every connection.
    ///
    /// Returns the number of connections terminated.
    pub fn shutdown(&self, termination: Termination) -> usize {
        info!(reason = %termination, "Shutting down hub");

        for drain in self.drains.iter() {
            drain.value().abort();
        }

        let clients: Vec<Arc<Client>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let terminated = clients
            .iter()
            .filter(|client| client.terminate(termination.clone()))
            .count();

        info!(connections = terminated, "Connections terminated");
        terminated
    }

    /// Check if a stream exists.
    #[must_use]
    pub fn has_stream(&self, name: &str) -> bool {
        self.publisher.has_stream(name)
    }

    /// Get a started stream.
    #[must_use]
    pub fn stream(&self, name: &str) -> Option<Arc<Stream>> {
        self.streams.get(name).map(|s| Arc::clone(s.value()))
    }

    /// Names of the started streams.
    #[must_use]
    pub fn stream_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.streams.iter().map(|s| s.key().clone()).collect();
        names.sort();
        names
    }

    /// Get a live client.
    #[must_use]
    pub fn client(&self, id: &ClientId) -> Option<Arc<Client>> {
        self.connections.get(id).map(|c| Arc::clone(c.value()))
    }

    /// Check if a client is attached.
    #[must_use]
    pub fn is_attached(&self, id: &ClientId) -> bool {
        self.attached.contains_key(id)
    }

    /// Number of attached clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.attached.len()
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Get hub statistics.
    pub async fn stats(&self) -> HubStats {
        let streams: Vec<Arc<Stream>> = self.streams.iter().map(|s| Arc::clone(s.value())).collect();
        let mut total_subscriptions = 0;
        for stream in &streams {
            total_subscriptions += stream.subscriber_count().await;
        }

        HubStats {
            stream_count: streams.len(),
            connection_count: self.connection_count(),
            attached_count: self.client_count(),
            total_subscriptions,
        }
    }
}

async fn drain(name: String, mut source: mpsc::Receiver<Item>, input: mpsc::Sender<Item>) {
    while let Some(item) = source.recv().await {
        metrics::record_published(&name);
        if input.send(item).await.is_err() {
            break;
        }
    }
    debug!(stream = %name, "Publisher source ended");
}

/// Check if connection metadata carries a non-empty token.
#[must_use]
pub fn has_token(meta: &Metadata) -> bool {
    match meta.get(TOKEN_KEY) {
        Some(Value::String(token)) => !token.is_empty(),
        Some(Value::Null) | None => false,
        Some(_) => true,
    }
}

/// Convert upgrade parameters into connection metadata.
#[must_use]
pub fn metadata_from_params(params: ConnectParams) -> Metadata {
    params
        .into_iter()
        .map(|(key, value)| (key, Value::String(value)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientState;
    use crate::publisher::{ChannelPublisher, StreamSender};
    use crate::streamable::Streamable;
    use crate::writer::WriteError;
    use async_trait::async_trait;
    use relay_protocol::{decode, encode, EventKind, ERROR_CODE, INFO_CODE};
    use serde_json::json;
    use tenvis_relay_transport::memory::{pair, MemoryPeer, Outbound};
    use tenvis_relay_transport::{close_code, MessageSink, TransportError};
    use tokio::sync::Semaphore;
    use tokio::time::{sleep, timeout};

    const WAIT: Duration = Duration::from_secs(2);

    struct Fixture {
        hub: Arc<Hub>,
        trades: StreamSender,
        quotes: StreamSender,
    }

    fn fixture_with(config: HubConfig, build: impl FnOnce(Hub) -> Hub) -> Fixture {
        let publisher = ChannelPublisher::new("market");
        let trades = publisher.add_stream("trades", 64).unwrap();
        let quotes = publisher.add_stream("quotes", 64).unwrap();

        let hub = Arc::new(build(Hub::new(Arc::new(publisher), config)));
        hub.start().unwrap();
        Fixture { hub, trades, quotes }
    }

    fn fixture() -> Fixture {
        fixture_with(HubConfig::default(), |hub| hub)
    }

    fn meta(value: Value) -> Metadata {
        value.as_object().cloned().unwrap()
    }

    async fn next_message(peer: &mut MemoryPeer) -> Outbound {
        loop {
            let message = timeout(WAIT, peer.recv())
                .await
                .expect("timed out waiting for message")
                .expect("connection dropped");
            if message != Outbound::Ping {
                return message;
            }
        }
    }

    async fn next_event(peer: &mut MemoryPeer) -> Event {
        match next_message(peer).await {
            Outbound::Text(text) => decode(text.as_bytes()).unwrap(),
            other => panic!("Expected event, got {:?}", other),
        }
    }

    async fn next_item(peer: &mut MemoryPeer) -> Value {
        match next_message(peer).await {
            Outbound::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("Expected item, got {:?}", other),
        }
    }

    async fn assert_silent(peer: &mut MemoryPeer) {
        assert!(timeout(Duration::from_millis(100), peer.recv()).await.is_err());
    }

    async fn assert_dropped(peer: &mut MemoryPeer) {
        assert_eq!(timeout(WAIT, peer.recv()).await.unwrap(), None);
    }

    async fn connect(hub: &Arc<Hub>, meta: Metadata) -> (Arc<Client>, MemoryPeer) {
        let (conn, mut peer) = pair();
        let client = hub.connect(Box::new(conn), meta).unwrap();

        let greeting = next_event(&mut peer).await;
        assert_eq!(greeting.event, EventKind::Info);
        assert_eq!(
            greeting.message.as_deref(),
            Some(format!("successfully connected as `{}`", client.id()).as_str())
        );
        (client, peer)
    }

    async fn subscribe(peer: &mut MemoryPeer, channel: &str) -> Event {
        peer.send_text(encode(&Event::subscribe(channel)).unwrap());
        next_event(peer).await
    }

    async fn unsubscribe(peer: &mut MemoryPeer, channel: &str) -> Event {
        peer.send_text(encode(&Event::unsubscribe(channel)).unwrap());
        next_event(peer).await
    }

    async fn wait_closed(client: &Client) {
        timeout(WAIT, client.closed()).await.expect("client never closed");
    }

    /// Blocks every item write until released.
    struct GateWriter {
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl Writer for GateWriter {
        async fn write_to_client_stream(
            &self,
            sink: &mut dyn MessageSink,
            item: &dyn Streamable,
        ) -> Result<(), WriteError> {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| WriteError::Transport(TransportError::ConnectionClosed))?;
            permit.forget();
            JsonWriter.write_to_client_stream(sink, item).await
        }
    }

    struct Recorder {
        tx: mpsc::UnboundedSender<ApplicationEvent>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle_event(&self, event: ApplicationEvent) {
            let _ = self.tx.send(event);
        }
    }

    #[tokio::test]
    async fn test_subscribe_receive_unsubscribe() {
        let f = fixture();
        let (client, mut peer) = connect(&f.hub, Metadata::new()).await;

        let ack = subscribe(&mut peer, "trades").await;
        assert_eq!(ack.event, EventKind::Info);
        assert_eq!(ack.code, Some(INFO_CODE));
        assert_eq!(ack.message.as_deref(), Some("successfully subscribed to `trades`"));
        assert_eq!(ack.channel(), Some("trades"));
        assert!(f.hub.is_attached(client.id()));
        assert!(f.hub.stream("trades").unwrap().is_subscribed(client.id()).await);

        f.trades.publish(json!({"price": 1})).await.unwrap();
        assert_eq!(next_item(&mut peer).await, json!({"price": 1}));

        let ack = unsubscribe(&mut peer, "trades").await;
        assert_eq!(ack.message.as_deref(), Some("successfully unsubscribed from `trades`"));
        assert!(!f.hub.is_attached(client.id()));
        assert!(!f.hub.stream("trades").unwrap().is_subscribed(client.id()).await);

        f.trades.publish(json!({"price": 2})).await.unwrap();
        assert_silent(&mut peer).await;
        assert_eq!(client.state(), ClientState::Connected);
    }

    #[tokio::test]
    async fn test_subscribe_unknown_stream() {
        let f = fixture();
        let (client, mut peer) = connect(&f.hub, Metadata::new()).await;

        let reply = subscribe(&mut peer, "orders").await;
        assert_eq!(reply.event, EventKind::Error);
        assert_eq!(reply.code, Some(ERROR_CODE));
        assert_eq!(
            reply.message.as_deref(),
            Some("could not subscribe: channel `orders` does not exist")
        );
        assert!(!f.hub.is_attached(client.id()));
        assert!(client.subscriptions().await.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_without_channel() {
        let f = fixture();
        let (_client, mut peer) = connect(&f.hub, Metadata::new()).await;

        peer.send_text(r#"{"event":"subscribe"}"#);
        let reply = next_event(&mut peer).await;
        assert_eq!(reply.event, EventKind::Error);
        assert_eq!(
            reply.message.as_deref(),
            Some("could not subscribe: missing `channel` in metadata")
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_not_subscribed() {
        let f = fixture();
        let (_client, mut peer) = connect(&f.hub, Metadata::new()).await;

        let reply = unsubscribe(&mut peer, "trades").await;
        assert_eq!(reply.event, EventKind::Error);
        assert_eq!(
            reply.message.as_deref(),
            Some("could not unsubscribe: not subscribed to `trades`")
        );
    }

    #[tokio::test]
    async fn test_double_subscribe() {
        let f = fixture();
        let (client, _peer) = connect(&f.hub, Metadata::new()).await;
        let request = meta(json!({"channel": "trades", "depth": 5}));

        assert_eq!(f.hub.subscribe(&client, &request).await.unwrap(), "trades");
        assert!(matches!(
            f.hub.subscribe(&client, &request).await,
            Err(HubError::AlreadySubscribed(name)) if name == "trades"
        ));

        assert_eq!(f.hub.stream("trades").unwrap().subscriber_count().await, 1);
        assert_eq!(client.subscriptions().await, vec!["trades"]);
        assert_eq!(client.subscription_meta("trades").await, Some(request));
    }

    #[tokio::test]
    async fn test_subscription_limit() {
        let config = HubConfig {
            max_subscriptions_per_client: 1,
            ..Default::default()
        };
        let f = fixture_with(config, |hub| hub);
        let (client, _peer) = connect(&f.hub, Metadata::new()).await;

        f.hub
            .subscribe(&client, &meta(json!({"channel": "trades"})))
            .await
            .unwrap();
        assert!(matches!(
            f.hub.subscribe(&client, &meta(json!({"channel": "quotes"}))).await,
            Err(HubError::TooManySubscriptions(1))
        ));
    }

    #[tokio::test]
    async fn test_membership_tracks_subscriptions() {
        let f = fixture();
        let (client, mut peer) = connect(&f.hub, Metadata::new()).await;

        subscribe(&mut peer, "trades").await;
        subscribe(&mut peer, "quotes").await;
        assert!(f.hub.is_attached(client.id()));
        assert_eq!(client.subscriptions().await, vec!["quotes", "trades"]);

        unsubscribe(&mut peer, "trades").await;
        assert!(f.hub.is_attached(client.id()));

        unsubscribe(&mut peer, "quotes").await;
        assert!(!f.hub.is_attached(client.id()));
        assert!(client.subscriptions().await.is_empty());

        let stats = f.hub.stats().await;
        assert_eq!(stats.stream_count, 2);
        assert_eq!(stats.connection_count, 1);
        assert_eq!(stats.attached_count, 0);
        assert_eq!(stats.total_subscriptions, 0);
    }

    #[tokio::test]
    async fn test_items_arrive_in_order() {
        let f = fixture();
        let (_client, mut peer) = connect(&f.hub, Metadata::new()).await;
        subscribe(&mut peer, "trades").await;

        for i in 0..50 {
            f.trades.publish(json!({"seq": i})).await.unwrap();
        }
        for i in 0..50 {
            assert_eq!(next_item(&mut peer).await, json!({"seq": i}));
        }
    }

    #[tokio::test]
    async fn test_streams_are_isolated() {
        let f = fixture();
        let (_a, mut peer_a) = connect(&f.hub, Metadata::new()).await;
        let (_b, mut peer_b) = connect(&f.hub, Metadata::new()).await;
        subscribe(&mut peer_a, "trades").await;
        subscribe(&mut peer_b, "quotes").await;

        f.quotes.publish(json!({"bid": 9})).await.unwrap();
        f.trades.publish(json!({"price": 10})).await.unwrap();

        assert_eq!(next_item(&mut peer_a).await, json!({"price": 10}));
        assert_eq!(next_item(&mut peer_b).await, json!({"bid": 9}));
        assert_silent(&mut peer_a).await;
        assert_silent(&mut peer_b).await;
    }

    #[tokio::test]
    async fn test_read_error_tears_down() {
        let f = fixture();
        let (client, mut peer) = connect(&f.hub, Metadata::new()).await;
        subscribe(&mut peer, "trades").await;
        subscribe(&mut peer, "quotes").await;

        peer.fail(TransportError::ReceiveFailed("connection reset".into()));
        wait_closed(&client).await;

        assert!(matches!(client.termination(), Some(Termination::ReadFailed(_))));
        assert!(!f.hub.is_attached(client.id()));
        assert!(!f.hub.stream("trades").unwrap().is_subscribed(client.id()).await);
        assert!(!f.hub.stream("quotes").unwrap().is_subscribed(client.id()).await);
        assert_eq!(f.hub.connection_count(), 0);
        assert!(client.subscriptions().await.is_empty());

        // Abnormal closure: no close frame
        assert_dropped(&mut peer).await;
    }

    #[tokio::test]
    async fn test_peer_hang_up() {
        let f = fixture();
        let (client, mut peer) = connect(&f.hub, Metadata::new()).await;

        peer.hang_up();
        wait_closed(&client).await;

        assert_eq!(client.termination(), Some(Termination::PeerClosed));
        assert!(f.hub.client(client.id()).is_none());
        assert_dropped(&mut peer).await;
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let config = HubConfig {
            read_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let f = fixture_with(config, |hub| hub);
        let (client, _peer) = connect(&f.hub, Metadata::new()).await;

        wait_closed(&client).await;
        assert_eq!(
            client.termination(),
            Some(Termination::ReadFailed("read timed out".into()))
        );
    }

    #[tokio::test]
    async fn test_detach_twice() {
        let f = fixture();
        let (client, mut peer) = connect(&f.hub, Metadata::new()).await;
        subscribe(&mut peer, "trades").await;

        assert!(f.hub.detach(client.id()).is_ok());
        assert!(matches!(
            f.hub.detach(client.id()),
            Err(HubError::NotAttached(_))
        ));

        // Teardown tolerates the missing attachment
        peer.hang_up();
        wait_closed(&client).await;
        assert_eq!(f.hub.connection_count(), 0);
        assert!(!f.hub.stream("trades").unwrap().is_subscribed(client.id()).await);
    }

    #[tokio::test]
    async fn test_token_required() {
        let config = HubConfig {
            require_token: true,
            ..Default::default()
        };
        let f = fixture_with(config, |hub| hub);

        let (conn, _peer) = pair();
        assert!(matches!(
            f.hub.connect(Box::new(conn), Metadata::new()),
            Err(HubError::MissingToken)
        ));
        let (conn, _peer) = pair();
        assert!(matches!(
            f.hub.connect(Box::new(conn), meta(json!({"token": ""}))),
            Err(HubError::MissingToken)
        ));
        assert_eq!(f.hub.connection_count(), 0);

        let (client, _peer) = connect(&f.hub, meta(json!({"token": "secret"}))).await;
        assert_eq!(client.meta().get("token"), Some(&json!("secret")));
        assert_eq!(f.hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_application_events_reach_handler() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let f = fixture_with(HubConfig::default(), |hub| {
            hub.with_handler(Arc::new(Recorder { tx }))
        });
        let (client, peer) = connect(&f.hub, meta(json!({"token": "real"}))).await;

        peer.send_text(
            r#"{"event":"quote","code":7,"message":"hi","meta":{"token":"spoofed","symbol":"ACME"}}"#,
        );
        let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();

        assert_eq!(event.client, *client.id());
        assert_eq!(event.kind, "quote");
        assert_eq!(event.code, 7);
        assert_eq!(event.message, "hi");
        assert_eq!(event.meta, meta(json!({"token": "real", "symbol": "ACME"})));

        peer.send_text(r#"{"event":"ping"}"#);
        let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(event.code, 0);
        assert_eq!(event.message, "");
    }

    #[tokio::test]
    async fn test_malformed_event_ignored() {
        let f = fixture();
        let (client, mut peer) = connect(&f.hub, Metadata::new()).await;

        peer.send_text("not json at all");
        peer.send_text(r#"{"meta":{"channel":"trades"}}"#);
        let ack = subscribe(&mut peer, "trades").await;

        assert_eq!(ack.event, EventKind::Info);
        assert_eq!(client.state(), ClientState::Connected);
    }

    #[tokio::test]
    async fn test_oversized_message_tears_down() {
        let config = HubConfig {
            max_message_size: 32,
            ..Default::default()
        };
        let f = fixture_with(config, |hub| hub);
        let (client, mut peer) = connect(&f.hub, Metadata::new()).await;

        peer.send_text(format!(r#"{{"event":"note","message":"{}"}}"#, "x".repeat(64)));
        wait_closed(&client).await;
        assert!(matches!(client.termination(), Some(Termination::ReadFailed(_))));
        assert_dropped(&mut peer).await;
    }

    #[tokio::test]
    async fn test_overflow_disconnects_slow_consumer() {
        let gate = Arc::new(Semaphore::new(0));
        let config = HubConfig {
            subscriber_buffer: 1,
            overflow_policy: OverflowPolicy::Disconnect,
            ..Default::default()
        };
        let writer = Arc::new(GateWriter {
            gate: Arc::clone(&gate),
        });
        let f = fixture_with(config, |hub| hub.with_writer(writer));
        let (client, mut peer) = connect(&f.hub, Metadata::new()).await;
        subscribe(&mut peer, "trades").await;

        for i in 0..4 {
            f.trades.publish(i).await.unwrap();
        }
        sleep(Duration::from_millis(50)).await;
        gate.add_permits(16);

        let close = loop {
            match next_message(&mut peer).await {
                Outbound::Text(_) => continue,
                other => break other,
            }
        };
        assert_eq!(
            close,
            Outbound::Close {
                code: close_code::POLICY,
                reason: "consumer too slow".into()
            }
        );

        wait_closed(&client).await;
        assert_eq!(client.termination(), Some(Termination::Overflow));
        assert!(!f.hub.is_attached(client.id()));
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_consumer() {
        let gate = Arc::new(Semaphore::new(0));
        let config = HubConfig {
            subscriber_buffer: 2,
            ..Default::default()
        };
        let writer = Arc::new(GateWriter {
            gate: Arc::clone(&gate),
        });
        let f = fixture_with(config, |hub| hub.with_writer(writer));
        let (client, mut peer) = connect(&f.hub, Metadata::new()).await;
        subscribe(&mut peer, "trades").await;

        for i in 0..10 {
            f.trades.publish(i).await.unwrap();
        }
        sleep(Duration::from_millis(50)).await;
        gate.add_permits(16);

        let mut received = Vec::new();
        while received.last() != Some(&json!(9)) {
            received.push(next_item(&mut peer).await);
        }
        assert!(received.len() < 10);
        assert!(received.windows(2).all(|w| w[0].as_i64() < w[1].as_i64()));
        assert_eq!(client.state(), ClientState::Connected);
    }

    #[tokio::test]
    async fn test_write_failure_closes() {
        let f = fixture();
        let (client, mut peer) = connect(&f.hub, Metadata::new()).await;
        subscribe(&mut peer, "trades").await;

        peer.stop_reading();
        f.trades.publish(1).await.unwrap();

        wait_closed(&client).await;
        assert!(matches!(client.termination(), Some(Termination::WriteFailed(_))));
        assert!(!f.hub.is_attached(client.id()));
    }

    #[tokio::test]
    async fn test_liveness_probe() {
        let config = HubConfig {
            ping_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let f = fixture_with(config, |hub| hub);
        let (_client, mut peer) = connect(&f.hub, Metadata::new()).await;

        let probe = timeout(WAIT, async {
            loop {
                if peer.recv().await == Some(Outbound::Ping) {
                    break;
                }
            }
        })
        .await;
        assert!(probe.is_ok());
        assert!(peer.pong());
    }

    /// Sleeps before every item write.
    struct SlowWriter {
        delay: Duration,
    }

    #[async_trait]
    impl Writer for SlowWriter {
        async fn write_to_client_stream(
            &self,
            sink: &mut dyn MessageSink,
            item: &dyn Streamable,
        ) -> Result<(), WriteError> {
            sleep(self.delay).await;
            JsonWriter.write_to_client_stream(sink, item).await
        }
    }

    #[tokio::test]
    async fn test_busy_inbox_keeps_probes_and_notices() {
        let config = HubConfig {
            ping_interval: Duration::from_millis(20),
            read_timeout: Duration::from_millis(300),
            ..Default::default()
        };
        let writer = Arc::new(SlowWriter {
            delay: Duration::from_millis(3),
        });
        let f = fixture_with(config, |hub| hub.with_writer(writer));
        let (client, mut peer) = connect(&f.hub, Metadata::new()).await;
        subscribe(&mut peer, "trades").await;

        // Publish faster than the writer drains
        let trades = f.trades.clone();
        let flood = tokio::spawn(async move {
            for i in 0u64.. {
                if trades.publish(i).await.is_err() {
                    break;
                }
                sleep(Duration::from_millis(1)).await;
            }
        });
        sleep(Duration::from_millis(30)).await;
        peer.send_text(encode(&Event::subscribe("quotes")).unwrap());

        let mut items = 0;
        let mut pings = 0;
        let mut acked = false;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
        while tokio::time::Instant::now() < deadline {
            match timeout(WAIT, peer.recv()).await.unwrap() {
                Some(Outbound::Ping) => {
                    pings += 1;
                    peer.pong();
                }
                Some(Outbound::Text(text)) => match decode(text.as_bytes()) {
                    Ok(event) if event.channel() == Some("quotes") => {
                        assert_eq!(event.event, EventKind::Info);
                        acked = true;
                    }
                    _ => items += 1,
                },
                other => panic!("Unexpected message {:?}", other),
            }
        }
        flood.abort();

        assert!(items > 0);
        assert!(pings > 0);
        assert!(acked);
        assert_eq!(client.state(), ClientState::Connected);
        assert!(client.is_subscribed("quotes").await);
    }

    #[tokio::test]
    async fn test_server_close() {
        let f = fixture();
        let (client, mut peer) = connect(&f.hub, Metadata::new()).await;

        assert!(client.close(close_code::NORMAL, "bye"));
        assert_eq!(
            next_message(&mut peer).await,
            Outbound::Close {
                code: close_code::NORMAL,
                reason: "bye".into()
            }
        );
        wait_closed(&client).await;
    }

    #[tokio::test]
    async fn test_stream_end_closes_subscribers() {
        let Fixture { hub, trades, quotes } = fixture();
        let (client, mut peer) = connect(&hub, Metadata::new()).await;
        subscribe(&mut peer, "trades").await;

        drop(trades);
        wait_closed(&client).await;

        assert_eq!(client.termination(), Some(Termination::StreamsClosed));
        assert!(hub.stream("trades").unwrap().is_closed());
        assert!(!hub.stream("quotes").unwrap().is_closed());
        assert_dropped(&mut peer).await;
        drop(quotes);
    }

    #[tokio::test]
    async fn test_shutdown_terminates_all() {
        let f = fixture();
        let (a, mut peer_a) = connect(&f.hub, Metadata::new()).await;
        let (b, mut peer_b) = connect(&f.hub, Metadata::new()).await;
        subscribe(&mut peer_a, "trades").await;

        assert_eq!(f.hub.shutdown(Termination::Shutdown), 2);
        wait_closed(&a).await;
        wait_closed(&b).await;

        assert_eq!(a.termination(), Some(Termination::Shutdown));
        assert_dropped(&mut peer_a).await;
        assert_dropped(&mut peer_b).await;
        assert_eq!(f.hub.connection_count(), 0);
        assert_eq!(f.hub.client_count(), 0);
    }

    #[tokio::test]
    async fn test_start_twice() {
        let f = fixture();
        assert!(matches!(f.hub.start(), Err(HubError::AlreadyStarted)));
        assert_eq!(f.hub.stream_names(), vec!["quotes", "trades"]);
        assert!(f.hub.has_stream("trades"));
        assert!(!f.hub.has_stream("orders"));
    }

    #[test]
    fn test_metadata_from_params() {
        let params: ConnectParams = [("token".to_string(), "abc".to_string())].into();
        assert_eq!(metadata_from_params(params), meta(json!({"token": "abc"})));
    }

    #[test]
    fn test_has_token() {
        assert!(has_token(&meta(json!({"token": "abc"}))));
        assert!(has_token(&meta(json!({"token": 42}))));
        assert!(!has_token(&meta(json!({"token": ""}))));
        assert!(!has_token(&meta(json!({"token": null}))));
        assert!(!has_token(&Metadata::new()));

        let params: ConnectParams = [("token".to_string(), String::new())].into();
        assert!(!has_token(&metadata_from_params(params)));
    }

    #[test]
    fn test_config_defaults() {
        let config = HubConfig::default();
        assert_eq!(config.ping_interval, Duration::from_secs(54));
        assert_eq!(config.read_timeout, Duration::from_secs(60));
        assert_eq!(config.write_timeout, Duration::from_secs(10));
        assert_eq!(config.close_timeout, Duration::from_secs(5));
        assert_eq!(config.max_message_size, 512);
        assert_eq!(config.overflow_policy, OverflowPolicy::DropOldest);
    }
}
