//! Shared fixtures for the Relay benchmarks.

use relay_protocol::{codec, Event};
use std::sync::Arc;
use tenvis_relay_core::{
    ChannelPublisher, ClientId, Hub, HubConfig, Inbox, Item, OverflowPolicy, Stream, StreamSender,
};
use tenvis_relay_transport::memory::{pair, MemoryPeer, Outbound};

/// Name of the stream every fixture publishes on.
pub const BENCH_STREAM: &str = "benchmark";

/// A stream with `subscribers` registered inboxes.
pub async fn stream_with_subscribers(
    subscribers: usize,
    capacity: usize,
) -> (Stream, Vec<Inbox<Item>>) {
    let stream = Stream::new(BENCH_STREAM);
    let mut inboxes = Vec::with_capacity(subscribers);
    for i in 0..subscribers {
        let inbox = Inbox::new(capacity, OverflowPolicy::DropOldest);
        stream
            .subscribe(&ClientId::from(format!("conn-{}", i)), inbox.clone())
            .await
            .expect("fresh stream accepts every subscriber");
        inboxes.push(inbox);
    }
    (stream, inboxes)
}

/// A started hub with `clients` in-memory peers subscribed to [`BENCH_STREAM`].
pub async fn hub_with_peers(clients: usize) -> (Arc<Hub>, StreamSender, Vec<MemoryPeer>) {
    let publisher = ChannelPublisher::new("bench");
    let sender = publisher
        .add_stream(BENCH_STREAM, 1024)
        .expect("valid stream name");

    let config = HubConfig {
        subscriber_buffer: 4096,
        ..Default::default()
    };
    let hub = Arc::new(Hub::new(Arc::new(publisher), config));
    hub.start().expect("hub starts once");

    let request = codec::encode(&Event::subscribe(BENCH_STREAM)).expect("encodable event");
    let mut peers = Vec::with_capacity(clients);
    for _ in 0..clients {
        let (conn, mut peer) = pair();
        hub.connect(Box::new(conn), Default::default())
            .expect("no token required");

        // Greeting, then the subscribe acknowledgement
        next_text(&mut peer).await;
        peer.send_text(request.clone());
        next_text(&mut peer).await;
        peers.push(peer);
    }
    (hub, sender, peers)
}

/// Wait for the next text message, skipping probes.
pub async fn next_text(peer: &mut MemoryPeer) -> Option<String> {
    loop {
        match peer.recv().await? {
            Outbound::Text(text) => return Some(text),
            Outbound::Ping => continue,
            _ => return None,
        }
    }
}
