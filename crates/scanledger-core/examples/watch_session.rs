#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Example: watch a session of scan diffs and message updates.
//!
//! Feeds synthetic scan blocks through the notification loop, then
//! reconciles a message page, all against the in-memory store.
//!
//! ## Running
//!
//! ```bash
//! RUST_LOG=scanledger_core=debug cargo run --package scanledger-core --example watch_session
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tokio::sync::mpsc;

use scanledger_core::transport::TransportResult;
use scanledger_core::{
    MemoryStore, MessageReconciler, MessageStream, ScanBlock, ScanNotification, ScanReconciler,
    SourceId, Transport, TransportError,
};
use scanledger_patch::diff;

/// Transport that replays a canned session.
struct CannedTransport {
    responses: Mutex<VecDeque<Value>>,
}

impl CannedTransport {
    fn new(responses: Vec<Value>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
        }
    }
}

impl Transport for CannedTransport {
    async fn post(&self, path: &str, _body: &Value) -> TransportResult<Value> {
        println!("-> POST {path}");
        self.responses
            .lock()
            .expect("transport mutex poisoned")
            .pop_front()
            .ok_or_else(|| TransportError::Request("canned session exhausted".to_string()))
    }
}

fn scan(tick: i64) -> Value {
    json!({
        "tick": tick,
        "player_uid": 1,
        "start_time": 1000,
        "stars": {"0": {"name": "Sol", "st": 50 + tick}},
    })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = Arc::new(MemoryStore::new());
    let source = SourceId(42);
    let key = "demo-api-key";

    // Scan side: two notification blocks arrive over the channel.
    let scans = ScanReconciler::new(Arc::clone(&store), source);
    let (tx, rx) = mpsc::channel(8);

    let empty = json!({});
    let mut patches = BTreeMap::new();
    patches.insert(1100, diff(&empty, &scan(1)).unwrap());
    patches.insert(1200, diff(&scan(1), &scan(2)).unwrap());
    tx.send(ScanNotification {
        key: key.to_string(),
        block: ScanBlock {
            patches,
            initial_scan: scan(1),
            last_scan: scan(2),
            initial_timestamp: Some(1100),
            last_timestamp: 1200,
        },
    })
    .await?;

    let mut patches = BTreeMap::new();
    patches.insert(1300, diff(&scan(2), &scan(3)).unwrap());
    tx.send(ScanNotification {
        key: key.to_string(),
        block: ScanBlock {
            patches,
            initial_scan: scan(3),
            last_scan: scan(3),
            initial_timestamp: None,
            last_timestamp: 1300,
        },
    })
    .await?;
    drop(tx);

    scans.run(rx).await;
    println!(
        "cached {} scans for {key}: {:?}",
        scans.scan_count(key).await,
        scans.api_info(key).await,
    );
    println!("scan @1: {}", scans.get_scan(key, 1).await.unwrap());

    // Message side: one page of events with a searchable body.
    let transport = CannedTransport::new(vec![json!({
        "report": {"messages": [
            {"key": "evt-2", "created": "2026-08-06 10:00:00", "body": "Fleet sighted near Sol"},
            {"key": "evt-1", "created": "2026-08-06 09:00:00", "body": "Treaty signed"},
        ]}
    })]);
    let messages = MessageReconciler::new(store, Arc::new(transport), source, "2.1");
    messages.refresh(&MessageStream::Events).await?;

    let cached = messages.cached_messages(&MessageStream::Events).await;
    println!("cached {} events", cached.len());
    for hit in messages.search("sol") {
        println!("token `sol` found in {}:{}", hit.stream, hit.key);
    }
    println!("counters: {:?}", messages.counters().snapshot());
    Ok(())
}
