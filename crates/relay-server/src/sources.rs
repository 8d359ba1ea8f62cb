//! Demo sources.
//!
//! Each configured stream gets a ticker that publishes a sequence-numbered
//! item at a fixed interval, so a fresh server has something to broadcast.

use serde::Serialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tenvis_relay_core::{ChannelPublisher, PublisherError, StreamSender};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::SourceConfig;

/// An item emitted by a demo source.
#[derive(Debug, Clone, Serialize)]
pub struct Tick {
    /// Stream the tick was published on.
    pub stream: String,
    /// Sequence number, starting at 1.
    pub seq: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Register every source with the publisher and start its ticker.
///
/// # Errors
///
/// Fails if a source name is invalid or repeated.
pub fn spawn_sources(
    publisher: &ChannelPublisher,
    sources: &[SourceConfig],
    capacity: usize,
) -> Result<Vec<JoinHandle<()>>, PublisherError> {
    let mut handles = Vec::with_capacity(sources.len());
    for source in sources {
        let sender = publisher.add_stream(source.name.clone(), capacity)?;
        let interval = Duration::from_millis(source.interval_ms.max(1));
        info!(stream = %source.name, interval_ms = source.interval_ms, "Starting demo source");
        handles.push(tokio::spawn(run_ticker(sender, interval)));
    }
    Ok(handles)
}

async fn run_ticker(sender: StreamSender, period: Duration) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut seq = 0;
    loop {
        ticker.tick().await;
        seq += 1;

        let tick = Tick {
            stream: sender.name().to_string(),
            seq,
            timestamp: now_millis(),
        };
        if sender.publish(tick).await.is_err() {
            debug!(stream = %sender.name(), "Demo source stopped");
            break;
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
