//! End-to-end delivery benchmark for Relay.
//!
//! Connects many WebSocket subscribers to a running server and measures how
//! many stream items reach them per second with real network I/O.
//!
//! ```bash
//! e2e_throughput [clients] [stream]
//! ```

use futures_util::{SinkExt, StreamExt};
use relay_protocol::{codec, Event, EventKind};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const SERVER_URL: &str = "ws://127.0.0.1:8080/ws";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let stream = args.get(2).cloned().unwrap_or_else(|| "ticks".to_string());

    println!("Relay end-to-end delivery benchmark");
    println!("  server: {}", SERVER_URL);
    println!("  stream: {}", stream);
    println!();

    run_subscribe_benchmark(num_clients, stream).await;
}

async fn run_subscribe_benchmark(num_clients: usize, stream: String) {
    println!("{} subscribers, warmup {}s, measurement {}s", num_clients, WARMUP_SECS, BENCH_SECS);

    let item_count = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();
    for client in 0..num_clients {
        let count = Arc::clone(&item_count);
        let barrier = Arc::clone(&barrier);
        let stream = stream.clone();

        handles.push(tokio::spawn(async move {
            if let Err(e) = run_client(&stream, count, barrier).await {
                eprintln!("client {} error: {}", client, e);
            }
        }));
    }

    barrier.wait().await;
    println!("all {} clients subscribed", num_clients);

    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    item_count.store(0, Ordering::SeqCst);
    let start = Instant::now();
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total = item_count.load(Ordering::SeqCst);
    let per_sec = total as f64 / elapsed.as_secs_f64();

    println!();
    println!("duration:    {:>10.2}s", elapsed.as_secs_f64());
    println!("items:       {:>10}", total);
    println!("throughput:  {:>10.0} items/s", per_sec);
    println!("per client:  {:>10.0} items/s", per_sec / num_clients as f64);

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    stream: &str,
    item_count: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (ws, _) = connect_async(SERVER_URL).await?;
    let (mut sender, mut receiver) = ws.split();

    // Greeting
    receiver.next().await;

    let request = codec::encode(&Event::subscribe(stream))?;
    sender.send(Message::Text(request)).await?;

    // Acknowledgement, or a refusal we should surface
    if let Some(Ok(Message::Text(reply))) = receiver.next().await {
        let reply = codec::decode(reply.as_bytes())?;
        if reply.event == EventKind::Error {
            return Err(reply.message_or_default().to_string().into());
        }
    }

    barrier.wait().await;

    while let Some(result) = receiver.next().await {
        match result? {
            Message::Text(text) if !is_control(&text) => {
                item_count.fetch_add(1, Ordering::Relaxed);
            }
            Message::Binary(_) => {
                item_count.fetch_add(1, Ordering::Relaxed);
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    Ok(())
}

fn is_control(text: &str) -> bool {
    serde_json::from_str::<Value>(text).is_ok_and(|v| v.get("event").is_some())
}
