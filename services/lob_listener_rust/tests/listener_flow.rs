//! Listener supervisor integration tests.
//!
//! Drive a full listener (discovery loop, feed reader, processor, filler)
//! against in-memory venue adapters and sink, covering the market
//! lifecycle, reconnect resubscription and the forward-fill path.

use anyhow::Result;
use async_trait::async_trait;
use lob_listener_rust::listener::{Listener, ListenerStatus};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use ticktape_rust_core::clients::{AuthError, Discovery, Feed, FeedEvent};
use ticktape_rust_core::db::Writer;
use ticktape_rust_core::models::{
    ListenerConfig, ListenerFilters, Market, OrderLevel, OrderbookSnapshot, Platform,
    PolymarketFilters, Trade, TradeSide,
};
use tokio::sync::mpsc;

// ============================================================================
// In-memory adapters
// ============================================================================

#[derive(Default)]
struct MockWriter {
    snapshots: Mutex<Vec<OrderbookSnapshot>>,
    trades: Mutex<Vec<Trade>>,
    markets: Mutex<Vec<Market>>,
    transitions: Mutex<Vec<(String, Option<String>, String)>>,
    flushes: AtomicU64,
}

#[async_trait]
impl Writer for MockWriter {
    async fn write_orderbook(&self, snapshot: OrderbookSnapshot) {
        self.snapshots.lock().unwrap().push(snapshot);
    }
    async fn write_trade(&self, trade: Trade) {
        self.trades.lock().unwrap().push(trade);
    }
    async fn write_market(&self, _listener_id: &str, market: &Market) -> Result<()> {
        self.markets.lock().unwrap().push(market.clone());
        Ok(())
    }
    async fn write_state_transition(
        &self,
        _listener_id: &str,
        condition_id: &str,
        old_state: Option<&str>,
        new_state: &str,
        _metadata: serde_json::Value,
    ) -> Result<()> {
        self.transitions.lock().unwrap().push((
            condition_id.to_string(),
            old_state.map(String::from),
            new_state.to_string(),
        ));
        Ok(())
    }
    async fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }
}

/// Scripted discovery: serves the current round until the test advances
/// it. Keeps round transitions deterministic under the fast paused-time
/// discovery loop.
struct MockDiscovery {
    rounds: Vec<Vec<Market>>,
    index: AtomicUsize,
    auth_fail: bool,
}

impl MockDiscovery {
    fn new(rounds: Vec<Vec<Market>>) -> Self {
        Self {
            rounds,
            index: AtomicUsize::new(0),
            auth_fail: false,
        }
    }

    fn auth_failing() -> Self {
        Self {
            rounds: vec![vec![]],
            index: AtomicUsize::new(0),
            auth_fail: true,
        }
    }

    fn advance(&self) {
        self.index.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Discovery for MockDiscovery {
    async fn discover_markets(&self, _filters: &ListenerFilters) -> Result<Vec<Market>> {
        if self.auth_fail {
            return Err(AuthError("401 unauthorized".to_string()).into());
        }
        let index = self.index.load(Ordering::SeqCst).min(self.rounds.len() - 1);
        Ok(self.rounds[index].clone())
    }

    fn venue_name(&self) -> &'static str {
        "mock"
    }
}

/// Feed double that mirrors the real feeds' contract: `connect` sends one
/// subscribe frame for the already-subscribed set, events arrive through
/// an injected channel.
struct MockFeed {
    events: tokio::sync::Mutex<mpsc::Receiver<FeedEvent>>,
    subscribed: Mutex<HashSet<String>>,
    subscribe_frames: Mutex<Vec<Vec<String>>>,
    unsubscribe_frames: Mutex<Vec<Vec<String>>>,
    connects: AtomicU64,
    failing_connects: AtomicI64,
}

impl MockFeed {
    fn new(events: mpsc::Receiver<FeedEvent>) -> Self {
        Self {
            events: tokio::sync::Mutex::new(events),
            subscribed: Mutex::new(HashSet::new()),
            subscribe_frames: Mutex::new(Vec::new()),
            unsubscribe_frames: Mutex::new(Vec::new()),
            connects: AtomicU64::new(0),
            failing_connects: AtomicI64::new(0),
        }
    }

    fn subscribe_frames(&self) -> Vec<Vec<String>> {
        self.subscribe_frames.lock().unwrap().clone()
    }

    fn unsubscribe_frames(&self) -> Vec<Vec<String>> {
        self.unsubscribe_frames.lock().unwrap().clone()
    }
}

#[async_trait]
impl Feed for MockFeed {
    async fn connect(&self) -> Result<()> {
        if self.failing_connects.fetch_sub(1, Ordering::SeqCst) > 0 {
            anyhow::bail!("connection refused");
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        let resubscribe: Vec<String> = {
            let subscribed = self.subscribed.lock().unwrap();
            let mut tokens: Vec<String> = subscribed.iter().cloned().collect();
            tokens.sort();
            tokens
        };
        if !resubscribe.is_empty() {
            self.subscribe_frames.lock().unwrap().push(resubscribe);
        }
        Ok(())
    }

    async fn disconnect(&self) {}

    async fn subscribe(&self, token_ids: &[String]) -> Result<()> {
        let mut subscribed = self.subscribed.lock().unwrap();
        let new_tokens: Vec<String> = token_ids
            .iter()
            .filter(|t| subscribed.insert((*t).clone()))
            .cloned()
            .collect();
        if !new_tokens.is_empty() {
            self.subscribe_frames.lock().unwrap().push(new_tokens);
        }
        Ok(())
    }

    async fn unsubscribe(&self, token_ids: &[String]) -> Result<()> {
        let mut subscribed = self.subscribed.lock().unwrap();
        let removed: Vec<String> = token_ids
            .iter()
            .filter(|t| subscribed.remove(*t))
            .cloned()
            .collect();
        if !removed.is_empty() {
            self.unsubscribe_frames.lock().unwrap().push(removed);
        }
        Ok(())
    }

    async fn next_event(&self) -> Option<FeedEvent> {
        self.events.lock().await.recv().await
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn listener_config(forward_fill: bool) -> ListenerConfig {
    ListenerConfig {
        id: "lst-1".to_string(),
        name: "nba-test".to_string(),
        platform: Platform::Polymarket,
        description: None,
        filters: ListenerFilters::Polymarket(PolymarketFilters {
            series_ids: vec!["10345".to_string()],
            ..Default::default()
        }),
        discovery_interval_seconds: 1,
        emit_interval_ms: 50,
        enable_forward_fill: forward_fill,
        is_active: true,
        created_at: None,
        updated_at: None,
    }
}

fn market(token: &str, condition: &str) -> Market {
    let mut m = Market::new(
        Platform::Polymarket,
        condition.to_string(),
        token.to_string(),
    );
    m.question = Some(format!("market {}", token));
    m
}

fn book_snapshot(token: &str, timestamp_ms: i64) -> OrderbookSnapshot {
    OrderbookSnapshot::new(
        "lst-1".to_string(),
        Platform::Polymarket,
        token.to_string(),
        "0xabc".to_string(),
        timestamp_ms,
        vec![
            OrderLevel::new(0.52, 10.0),
            OrderLevel::new(0.51, 20.0),
        ],
        vec![OrderLevel::new(0.53, 15.0)],
        Some(json!({"event_type": "book"})),
    )
}

/// Poll until `check` passes or the deadline hits. Auto-advancing paused
/// time makes the sleeps instant.
async fn wait_until<F: Fn() -> bool>(check: F, what: &str) {
    for _ in 0..2_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_market_lifecycle_discovered_then_removed() {
    let writer = Arc::new(MockWriter::default());
    let discovery = Arc::new(MockDiscovery::new(vec![
        vec![market("T1", "0xaaa"), market("T2", "0xbbb")],
        vec![market("T1", "0xaaa")],
    ]));
    let (_events_tx, events_rx) = mpsc::channel(64);
    let feed = Arc::new(MockFeed::new(events_rx));

    let listener = Arc::new(Listener::new(
        listener_config(false),
        discovery.clone(),
        feed.clone(),
        writer.clone(),
    ));
    listener.start().await.unwrap();

    // First cycle: both markets upserted as subscribed, one subscribe
    // frame per token
    wait_until(
        || writer.markets.lock().unwrap().len() >= 2,
        "both markets upserted",
    )
    .await;
    {
        let markets = writer.markets.lock().unwrap();
        let tokens: HashSet<String> = markets.iter().map(|m| m.token_id.clone()).collect();
        assert!(tokens.contains("T1") && tokens.contains("T2"));
        for m in markets.iter() {
            assert_eq!(m.state.as_str(), "subscribed");
            assert_eq!(m.listener_id.as_deref(), Some("lst-1"));
        }
    }
    {
        let transitions = writer.transitions.lock().unwrap();
        assert!(transitions
            .iter()
            .any(|(c, old, new)| c == "0xaaa" && old.as_deref() == Some("discovered") && new == "subscribed"));
        assert!(transitions
            .iter()
            .any(|(c, _, new)| c == "0xbbb" && new == "subscribed"));
    }
    assert_eq!(listener.subscribed_market_count(), 2);
    assert_eq!(listener.status(), ListenerStatus::Running);

    // Second cycle drops T2: unsubscribe frame + removed transition
    discovery.advance();
    wait_until(
        || {
            writer
                .transitions
                .lock()
                .unwrap()
                .iter()
                .any(|(c, _, new)| c == "0xbbb" && new == "removed")
        },
        "T2 removed transition",
    )
    .await;
    wait_until(
        || feed.unsubscribe_frames().iter().any(|f| f.contains(&"T2".to_string())),
        "unsubscribe frame for T2",
    )
    .await;
    wait_until(|| listener.subscribed_market_count() == 1, "registry shrank").await;

    listener.stop().await;
    assert_eq!(listener.status(), ListenerStatus::Stopped);
    assert!(writer.flushes.load(Ordering::Relaxed) >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_book_event_reaches_sink_with_metrics() {
    let writer = Arc::new(MockWriter::default());
    let discovery = Arc::new(MockDiscovery::new(vec![vec![market("T1", "0xaaa")]]));
    let (events_tx, events_rx) = mpsc::channel(64);
    let feed = Arc::new(MockFeed::new(events_rx));

    let listener = Arc::new(Listener::new(
        listener_config(false),
        discovery,
        feed,
        writer.clone(),
    ));
    listener.start().await.unwrap();

    events_tx
        .send(FeedEvent::Book(book_snapshot("T1", 1_700_000_000_000)))
        .await
        .unwrap();

    wait_until(
        || !writer.snapshots.lock().unwrap().is_empty(),
        "snapshot persisted",
    )
    .await;
    let snapshots = writer.snapshots.lock().unwrap();
    let snap = &snapshots[0];
    assert_eq!(snap.best_bid, Some(0.52));
    assert_eq!(snap.best_ask, Some(0.53));
    assert!((snap.spread.unwrap() - 0.01).abs() < 1e-9);
    assert!((snap.mid_price.unwrap() - 0.525).abs() < 1e-9);
    assert_eq!(snap.bid_depth, Some(30.0));
    assert_eq!(snap.ask_depth, Some(15.0));
    assert!(!snap.is_forward_filled);
    assert!(snap.hash.is_some());
    drop(snapshots);

    // Trades take the same data path
    events_tx
        .send(FeedEvent::Trade(Trade {
            listener_id: "lst-1".to_string(),
            platform: Platform::Polymarket,
            asset_id: "T1".to_string(),
            market: "0xabc".to_string(),
            timestamp_ms: 1_700_000_000_500,
            price: 0.52,
            size: 7.0,
            side: TradeSide::Buy,
            fee_rate_bps: None,
            raw_payload: None,
        }))
        .await
        .unwrap();
    wait_until(
        || !writer.trades.lock().unwrap().is_empty(),
        "trade persisted",
    )
    .await;
    assert_eq!(writer.trades.lock().unwrap()[0].size, 7.0);

    listener.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_forward_fill_follows_real_event() {
    let writer = Arc::new(MockWriter::default());
    let discovery = Arc::new(MockDiscovery::new(vec![vec![market("T1", "0xaaa")]]));
    let (events_tx, events_rx) = mpsc::channel(64);
    let feed = Arc::new(MockFeed::new(events_rx));

    let listener = Arc::new(Listener::new(
        listener_config(true),
        discovery,
        feed,
        writer.clone(),
    ));
    listener.start().await.unwrap();

    // The filler only tracks T1 once the discovery control event has been
    // processed; send the real event after that
    wait_until(|| listener.subscribed_market_count() == 1, "T1 tracked").await;

    // Stamp the real event in the past so every tick is a due fill
    let real_ts = ticktape_rust_core::utils::time::now_ms() - 60_000;
    events_tx
        .send(FeedEvent::Book(book_snapshot("T1", real_ts)))
        .await
        .unwrap();

    wait_until(
        || {
            writer
                .snapshots
                .lock()
                .unwrap()
                .iter()
                .filter(|s| s.is_forward_filled)
                .count()
                >= 3
        },
        "forward-filled snapshots",
    )
    .await;

    let snapshots = writer.snapshots.lock().unwrap();
    let filled: Vec<&OrderbookSnapshot> =
        snapshots.iter().filter(|s| s.is_forward_filled).collect();
    for snap in &filled {
        assert_eq!(snap.source_timestamp_ms, Some(real_ts));
        assert!(snap.timestamp_ms >= real_ts);
        assert_eq!(snap.bids.len(), 2);
        assert!(snap.raw_payload.is_none());
    }
    for pair in filled.windows(2) {
        assert!(pair[0].timestamp_ms < pair[1].timestamp_ms);
    }
    drop(snapshots);

    listener.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_resubscribes_token_set_once() {
    let writer = Arc::new(MockWriter::default());
    let discovery = Arc::new(MockDiscovery::new(vec![vec![
        market("T1", "0xaaa"),
        market("T2", "0xbbb"),
    ]]));
    let (events_tx, events_rx) = mpsc::channel(64);
    let feed = Arc::new(MockFeed::new(events_rx));

    let listener = Arc::new(Listener::new(
        listener_config(false),
        discovery,
        feed.clone(),
        writer.clone(),
    ));
    listener.start().await.unwrap();

    wait_until(|| listener.subscribed_market_count() == 2, "both subscribed").await;
    let frames_before = feed.subscribe_frames().len();

    // Two failed reconnect attempts before the third succeeds
    feed.failing_connects.store(2, Ordering::SeqCst);
    events_tx
        .send(FeedEvent::Disconnected {
            reason: "simulated drop".to_string(),
        })
        .await
        .unwrap();

    wait_until(
        || feed.subscribe_frames().len() > frames_before,
        "resubscribe frame after reconnect",
    )
    .await;

    let frames = feed.subscribe_frames();
    let resubscribe = frames.last().unwrap();
    assert_eq!(resubscribe, &vec!["T1".to_string(), "T2".to_string()]);
    // Exactly one frame was added by the reconnect
    assert_eq!(frames.len(), frames_before + 1);

    wait_until(|| listener.status() == ListenerStatus::Running, "running again").await;
    assert!(listener.stats().reconnects.load(Ordering::Relaxed) >= 1);
    // Initial connect plus the one successful reconnect
    assert_eq!(feed.connects.load(Ordering::SeqCst), 2);

    // Filler registry survived the outage
    assert_eq!(listener.subscribed_market_count(), 2);

    listener.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_auth_failure_stops_listener_fatally() {
    let writer = Arc::new(MockWriter::default());
    let discovery = Arc::new(MockDiscovery::auth_failing());
    let (_events_tx, events_rx) = mpsc::channel(8);
    let feed = Arc::new(MockFeed::new(events_rx));

    let listener = Arc::new(Listener::new(
        listener_config(false),
        discovery,
        feed,
        writer.clone(),
    ));
    let result = listener.start().await;
    assert!(result.is_err());
    assert!(listener.is_fatal());
    assert_eq!(listener.status(), ListenerStatus::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_empty_discovery_keeps_listener_running() {
    let writer = Arc::new(MockWriter::default());
    let discovery = Arc::new(MockDiscovery::new(vec![vec![]]));
    let (_events_tx, events_rx) = mpsc::channel(8);
    let feed = Arc::new(MockFeed::new(events_rx));

    let listener = Arc::new(Listener::new(
        listener_config(false),
        discovery,
        feed.clone(),
        writer.clone(),
    ));
    listener.start().await.unwrap();

    assert_eq!(listener.status(), ListenerStatus::Running);
    assert_eq!(listener.subscribed_market_count(), 0);
    assert!(feed.subscribe_frames().is_empty());

    listener.stop().await;
    assert_eq!(listener.status(), ListenerStatus::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_snapshot_dropped_not_fatal() {
    let writer = Arc::new(MockWriter::default());
    let discovery = Arc::new(MockDiscovery::new(vec![vec![market("T1", "0xaaa")]]));
    let (events_tx, events_rx) = mpsc::channel(8);
    let feed = Arc::new(MockFeed::new(events_rx));

    let listener = Arc::new(Listener::new(
        listener_config(false),
        discovery,
        feed,
        writer.clone(),
    ));
    listener.start().await.unwrap();

    // Crossed book: best bid above best ask
    let mut bad = book_snapshot("T1", 1_700_000_000_000);
    bad.bids = vec![OrderLevel::new(0.60, 1.0)];
    bad.asks = vec![OrderLevel::new(0.55, 1.0)];
    events_tx.send(FeedEvent::Book(bad)).await.unwrap();

    // A good event afterwards still flows
    events_tx
        .send(FeedEvent::Book(book_snapshot("T1", 1_700_000_001_000)))
        .await
        .unwrap();

    wait_until(
        || !writer.snapshots.lock().unwrap().is_empty(),
        "good snapshot persisted",
    )
    .await;
    {
        let snapshots = writer.snapshots.lock().unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].timestamp_ms, 1_700_000_001_000);
    }
    assert_eq!(
        listener
            .stats()
            .protocol_violations
            .load(Ordering::Relaxed),
        1
    );
    assert_eq!(listener.status(), ListenerStatus::Running);

    listener.stop().await;
}
