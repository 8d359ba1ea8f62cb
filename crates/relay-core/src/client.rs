//! Clients.
//!
//! A client is one live connection. It runs two tasks:
//!
//! - the **read loop** decodes inbound events, handles subscribe and
//!   unsubscribe requests and forwards everything else to the event handler;
//! - the **write loop** is the only writer on the connection. It drains the
//!   client's inbox and notices, sends liveness probes and performs teardown.
//!
//! Either loop ends the connection by calling [`Client::terminate`]. The first
//! termination wins; teardown runs exactly once, from the write loop.

use rand::distributions::Alphanumeric;
use rand::Rng;
use relay_protocol::{
    encode, Event, EventCodec, EventKind, Metadata, ProtocolError, CHANNEL_KEY,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tenvis_relay_transport::{close_code, MessageSink, MessageStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::hub::{Hub, HubConfig};
use crate::inbox::Inbox;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::streamable::Item;

/// Length of generated client ids.
pub const CLIENT_ID_LENGTH: usize = 12;

/// A client identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(String);

impl ClientId {
    /// Generate a random alphanumeric id.
    #[must_use]
    pub fn generate() -> Self {
        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(CLIENT_ID_LENGTH)
            .map(char::from)
            .collect();
        Self(id)
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ClientId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Loops are being started.
    Connecting,
    /// Serving.
    Connected,
    /// Terminated, teardown in progress.
    Closing,
    /// Torn down.
    Closed,
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The peer went away.
    PeerClosed,
    /// Reading failed or timed out.
    ReadFailed(String),
    /// Writing an item or notice failed or timed out.
    WriteFailed(String),
    /// A liveness probe could not be sent.
    ProbeFailed(String),
    /// The client's inbox overflowed.
    Overflow,
    /// Every stream feeding the client stopped.
    StreamsClosed,
    /// The process is shutting down.
    Shutdown,
    /// The server closed the connection.
    Closed {
        /// Close code sent to the peer.
        code: u16,
        /// Close reason sent to the peer.
        reason: String,
    },
}

impl Termination {
    /// Check if the peer gets a close handshake.
    ///
    /// Read failures and shutdown drop the connection without one.
    #[must_use]
    pub fn is_graceful(&self) -> bool {
        matches!(
            self,
            Termination::WriteFailed(_) | Termination::Overflow | Termination::Closed { .. }
        )
    }

    /// Close code reported for this termination.
    #[must_use]
    pub fn close_code(&self) -> u16 {
        match self {
            Termination::WriteFailed(_) | Termination::StreamsClosed => close_code::NORMAL,
            Termination::Overflow => close_code::POLICY,
            Termination::Shutdown => close_code::GOING_AWAY,
            Termination::Closed { code, .. } => *code,
            Termination::PeerClosed
            | Termination::ReadFailed(_)
            | Termination::ProbeFailed(_) => close_code::ABNORMAL,
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::PeerClosed => f.write_str("peer closed the connection"),
            Termination::ReadFailed(e) => write!(f, "read failed: {}", e),
            Termination::WriteFailed(e) => write!(f, "write failed: {}", e),
            Termination::ProbeFailed(e) => write!(f, "probe failed: {}", e),
            Termination::Overflow => f.write_str("consumer too slow"),
            Termination::StreamsClosed => f.write_str("streams closed"),
            Termination::Shutdown => f.write_str("server shutting down"),
            Termination::Closed { reason, .. } => f.write_str(reason),
        }
    }
}

/// A connected client.
pub struct Client {
    id: ClientId,
    meta: Metadata,
    remote_addr: Option<String>,
    connected_at: Instant,
    /// Stream name to the metadata it was subscribed with.
    pub(crate) subscriptions: Mutex<HashMap<String, Metadata>>,
    /// Items fanned out by streams.
    pub(crate) data: Inbox<Item>,
    events: mpsc::Sender<Event>,
    state: watch::Sender<ClientState>,
    termination: watch::Sender<Option<Termination>>,
    _metrics: ConnectionMetricsGuard,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Client {
    pub(crate) fn new(
        id: ClientId,
        meta: Metadata,
        remote_addr: Option<String>,
        config: &HubConfig,
    ) -> (Self, mpsc::Receiver<Event>) {
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
        let client = Self {
            id,
            meta,
            remote_addr,
            connected_at: Instant::now(),
            subscriptions: Mutex::new(HashMap::new()),
            data: Inbox::new(config.subscriber_buffer, config.overflow_policy),
            events: events_tx,
            state: watch::Sender::new(ClientState::Connecting),
            termination: watch::Sender::new(None),
            _metrics: ConnectionMetricsGuard::new(),
        };
        (client, events_rx)
    }

    /// Get the client id.
    #[must_use]
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Get the metadata the client connected with.
    #[must_use]
    pub fn meta(&self) -> &Metadata {
        &self.meta
    }

    /// Get the remote address, if known.
    #[must_use]
    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    /// Time since the client connected.
    #[must_use]
    pub fn uptime(&self) -> std::time::Duration {
        self.connected_at.elapsed()
    }

    /// Get the lifecycle state.
    #[must_use]
    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// Check if the client still accepts subscriptions.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self.state(), ClientState::Connecting | ClientState::Connected)
    }

    /// Get why the client was terminated, if it was.
    #[must_use]
    pub fn termination(&self) -> Option<Termination> {
        self.termination.borrow().clone()
    }

    /// Names of the streams the client is subscribed to.
    pub async fn subscriptions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.subscriptions.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if the client is subscribed to a stream.
    pub async fn is_subscribed(&self, stream: &str) -> bool {
        self.subscriptions.lock().await.contains_key(stream)
    }

    /// Get the metadata a subscription was made with.
    pub async fn subscription_meta(&self, stream: &str) -> Option<Metadata> {
        self.subscriptions.lock().await.get(stream).cloned()
    }

    /// Queue a notice for the client.
    ///
    /// Returns `false` if the client is gone.
    pub async fn notify(&self, event: Event) -> bool {
        self.events.send(event).await.is_ok()
    }

    /// Close the connection with a close handshake.
    ///
    /// Returns `false` if the client was already terminating.
    pub fn close(&self, code: u16, reason: impl Into<String>) -> bool {
        self.terminate(Termination::Closed {
            code,
            reason: reason.into(),
        })
    }

    /// End the connection.
    ///
    /// Returns `false` if the client was already terminating; the earlier
    /// termination stands.
    pub fn terminate(&self, termination: Termination) -> bool {
        let moved = self.state.send_if_modified(|state| match *state {
            ClientState::Connecting | ClientState::Connected => {
                *state = ClientState::Closing;
                true
            }
            ClientState::Closing | ClientState::Closed => false,
        });
        if !moved {
            return false;
        }

        debug!(client = %self.id, reason = %termination, "Client terminating");
        self.termination.send_replace(Some(termination));
        true
    }

    /// Wait until teardown has finished.
    pub async fn closed(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == ClientState::Closed).await;
    }

    fn mark_connected(&self) {
        self.state.send_if_modified(|state| {
            if *state == ClientState::Connecting {
                *state = ClientState::Connected;
                true
            } else {
                false
            }
        });
    }

    fn mark_closed(&self) {
        self.state.send_replace(ClientState::Closed);
    }
}

/// Start a client's loops and greet it.
pub(crate) fn start(
    hub: Arc<Hub>,
    client: Arc<Client>,
    sink: Box<dyn MessageSink>,
    stream: Box<dyn MessageStream>,
    events: mpsc::Receiver<Event>,
) {
    let terminated = client.termination.subscribe();

    tokio::spawn(write_loop(
        Arc::clone(&hub),
        Arc::clone(&client),
        sink,
        events,
        terminated.clone(),
    ));
    tokio::spawn(read_loop(hub, Arc::clone(&client), stream, terminated));

    client.mark_connected();
    let greeting = Event::info(format!("successfully connected as `{}`", client.id()));
    if client.events.try_send(greeting).is_err() {
        warn!(client = %client.id(), "Could not queue greeting");
    }
}

async fn wait_terminated(rx: &mut watch::Receiver<Option<Termination>>) {
    let _ = rx.wait_for(Option::is_some).await;
}

async fn read_loop(
    hub: Arc<Hub>,
    client: Arc<Client>,
    mut stream: Box<dyn MessageStream>,
    mut terminated: watch::Receiver<Option<Termination>>,
) {
    let read_timeout = hub.config().read_timeout;
    let codec = EventCodec::with_limit(hub.config().max_message_size);

    loop {
        let next = tokio::select! {
            _ = wait_terminated(&mut terminated) => break,
            next = time::timeout(read_timeout, stream.recv()) => next,
        };

        let message = match next {
            Ok(Ok(Some(message))) => message,
            Ok(Ok(None)) => {
                client.terminate(Termination::PeerClosed);
                break;
            }
            Ok(Err(e)) => {
                metrics::record_error("read");
                client.terminate(Termination::ReadFailed(e.to_string()));
                break;
            }
            Err(_) => {
                client.terminate(Termination::ReadFailed("read timed out".to_string()));
                break;
            }
        };

        let Some(data) = message.as_bytes() else {
            trace!(client = %client.id(), "Pong received");
            continue;
        };

        match codec.decode(data) {
            Ok(event) => dispatch(&hub, &client, event).await,
            Err(e @ ProtocolError::TooLarge { .. }) => {
                metrics::record_error("too_large");
                client.terminate(Termination::ReadFailed(e.to_string()));
                break;
            }
            Err(e) => {
                debug!(client = %client.id(), error = %e, "Discarding malformed event");
                metrics::record_error("protocol");
            }
        }
    }

    trace!(client = %client.id(), "Read loop finished");
}

async fn dispatch(hub: &Hub, client: &Arc<Client>, event: Event) {
    metrics::record_event(event.event.as_str(), "inbound");

    let reply = match event.event {
        EventKind::Subscribe => match hub.subscribe(client, &event.meta).await {
            Ok(name) => Event::info(format!("successfully subscribed to `{}`", name))
                .with_meta(CHANNEL_KEY, name),
            Err(e) => {
                debug!(client = %client.id(), error = %e, "Subscribe refused");
                Event::error(format!("could not subscribe: {}", e))
            }
        },
        EventKind::Unsubscribe => match hub.unsubscribe(client, &event.meta).await {
            Ok(name) => Event::info(format!("successfully unsubscribed from `{}`", name))
                .with_meta(CHANNEL_KEY, name),
            Err(e) => {
                debug!(client = %client.id(), error = %e, "Unsubscribe refused");
                Event::error(format!("could not unsubscribe: {}", e))
            }
        },
        _ => {
            hub.route_event(client, event).await;
            return;
        }
    };

    client.notify(reply).await;
}

async fn write_loop(
    hub: Arc<Hub>,
    client: Arc<Client>,
    mut sink: Box<dyn MessageSink>,
    mut events: mpsc::Receiver<Event>,
    mut terminated: watch::Receiver<Option<Termination>>,
) {
    let config = hub.config();
    let writer = hub.writer();

    let mut probe = time::interval_at(
        time::Instant::now() + config.ping_interval,
        config.ping_interval,
    );
    probe.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            // Notices and probes are polled before data
            biased;

            _ = wait_terminated(&mut terminated) => break,

            Some(event) = events.recv() => {
                let text = match encode(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(client = %client.id(), error = %e, "Failed to encode notice");
                        continue;
                    }
                };
                metrics::record_event(event.event.as_str(), "outbound");

                match time::timeout(config.write_timeout, sink.send_text(text)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        client.terminate(Termination::WriteFailed(e.to_string()));
                        break;
                    }
                    Err(_) => {
                        client.terminate(Termination::WriteFailed("write timed out".to_string()));
                        break;
                    }
                }
            }

            _ = probe.tick() => {
                match time::timeout(config.write_timeout, sink.ping()).await {
                    Ok(Ok(())) => trace!(client = %client.id(), "Ping sent"),
                    Ok(Err(e)) => {
                        client.terminate(Termination::ProbeFailed(e.to_string()));
                        break;
                    }
                    Err(_) => {
                        client.terminate(Termination::ProbeFailed("ping timed out".to_string()));
                        break;
                    }
                }
            }

            item = client.data.recv() => {
                let Some(item) = item else {
                    if client.data.is_overflowed() {
                        client.terminate(Termination::Overflow);
                    } else {
                        client.terminate(Termination::StreamsClosed);
                    }
                    break;
                };

                let started = Instant::now();
                let result = time::timeout(
                    config.write_timeout,
                    writer.write_to_client_stream(sink.as_mut(), item.as_ref()),
                )
                .await;
                match result {
                    Ok(Ok(())) => metrics::record_write(started.elapsed().as_secs_f64()),
                    Ok(Err(e)) => {
                        metrics::record_error("write");
                        client.terminate(Termination::WriteFailed(e.to_string()));
                        break;
                    }
                    Err(_) => {
                        client.terminate(Termination::WriteFailed("write timed out".to_string()));
                        break;
                    }
                }
            }
        }
    }

    let termination = client.termination().unwrap_or(Termination::Shutdown);
    hub.release(&client).await;

    if termination.is_graceful() {
        let reason = termination.to_string();
        let close = sink.close(termination.close_code(), &reason);
        match time::timeout(config.close_timeout, close).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(client = %client.id(), error = %e, "Close handshake failed"),
            Err(_) => debug!(client = %client.id(), "Close handshake timed out"),
        }
    }
    drop(sink);

    client.mark_closed();
    info!(
        client = %client.id(),
        reason = %termination,
        uptime_secs = client.uptime().as_secs(),
        "Client disconnected"
    );
}
