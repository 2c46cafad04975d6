//! Polymarket CLOB market-channel WebSocket feed.
//!
//! The channel is client-initiated: send `{"assets_ids": [...], "type":
//! "market"}` to subscribe, add `"operation": "unsubscribe"` to drop
//! tokens. `book` messages replace the full book for a token;
//! `price_change` messages mutate single levels against our kept state
//! (an absent level is an insert, size 0 removes); `last_trade_price` is
//! a print. A text PING goes out every 5 seconds and a connection silent
//! for 30 seconds is treated as broken.

use crate::clients::{Feed, FeedEvent};
use crate::models::{OrderLevel, OrderbookSnapshot, Platform, Trade, TradeSide};
use crate::utils::time::now_ms;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

const DEFAULT_WS_URL: &str = "wss://ws-subscriptions-clob.polymarket.com/ws/market";
const PING_INTERVAL: Duration = Duration::from_secs(5);
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const EVENT_CHANNEL_CAPACITY: usize = 2048;

/// Price keys are scaled to a tenth of a basis point so levels can live
/// in an ordered map.
const PRICE_SCALE: f64 = 10_000.0;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

fn price_key(price: f64) -> u32 {
    (price * PRICE_SCALE).round() as u32
}

/// Kept book state for one token, mutated by `book` and `price_change`.
#[derive(Debug, Default, Clone)]
struct BookLevels {
    market: String,
    bids: BTreeMap<u32, f64>,
    asks: BTreeMap<u32, f64>,
}

impl BookLevels {
    fn replace(&mut self, market: String, bids: &[(f64, f64)], asks: &[(f64, f64)]) {
        self.market = market;
        self.bids = bids.iter().map(|(p, s)| (price_key(*p), *s)).collect();
        self.asks = asks.iter().map(|(p, s)| (price_key(*p), *s)).collect();
    }

    /// A zero size removes the level, anything else sets it (inserting
    /// when the level was not present).
    fn apply_change(&mut self, side: &str, price: f64, size: f64) {
        let levels = if side.eq_ignore_ascii_case("buy") {
            &mut self.bids
        } else {
            &mut self.asks
        };
        if size <= 0.0 {
            levels.remove(&price_key(price));
        } else {
            levels.insert(price_key(price), size);
        }
    }

    fn to_snapshot(
        &self,
        listener_id: &str,
        asset_id: &str,
        timestamp_ms: i64,
        raw_payload: Option<Value>,
    ) -> OrderbookSnapshot {
        let bids = self
            .bids
            .iter()
            .rev()
            .map(|(k, s)| OrderLevel::new(*k as f64 / PRICE_SCALE, *s))
            .collect();
        let asks = self
            .asks
            .iter()
            .map(|(k, s)| OrderLevel::new(*k as f64 / PRICE_SCALE, *s))
            .collect();
        OrderbookSnapshot::new(
            listener_id.to_string(),
            Platform::Polymarket,
            asset_id.to_string(),
            self.market.clone(),
            timestamp_ms,
            bids,
            asks,
            raw_payload,
        )
    }
}

struct FeedShared {
    listener_id: String,
    url: String,
    writer: tokio::sync::Mutex<Option<WsSink>>,
    events_tx: mpsc::Sender<FeedEvent>,
    subscribed: std::sync::Mutex<HashSet<String>>,
    books: std::sync::Mutex<HashMap<String, BookLevels>>,
    connected: AtomicBool,
}

pub struct PolymarketFeed {
    shared: Arc<FeedShared>,
    events_rx: tokio::sync::Mutex<mpsc::Receiver<FeedEvent>>,
    read_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PolymarketFeed {
    pub fn new(listener_id: String) -> Self {
        Self::with_url(listener_id, DEFAULT_WS_URL.to_string())
    }

    pub fn with_url(listener_id: String, url: String) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(FeedShared {
                listener_id,
                url,
                writer: tokio::sync::Mutex::new(None),
                events_tx,
                subscribed: std::sync::Mutex::new(HashSet::new()),
                books: std::sync::Mutex::new(HashMap::new()),
                connected: AtomicBool::new(false),
            }),
            events_rx: tokio::sync::Mutex::new(events_rx),
            read_task: std::sync::Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn send_subscription(shared: &FeedShared, token_ids: &[String], unsubscribe: bool) -> Result<()> {
        let mut msg = json!({
            "assets_ids": token_ids,
            "type": "market",
        });
        if unsubscribe {
            msg["operation"] = json!("unsubscribe");
        }
        let mut writer = shared.writer.lock().await;
        let sink = writer
            .as_mut()
            .context("polymarket feed is not connected")?;
        sink.send(Message::Text(msg.to_string()))
            .await
            .context("failed to send subscription frame")?;
        Ok(())
    }

    async fn read_loop(shared: Arc<FeedShared>, mut source: WsSource) {
        let mut ping = interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_message = Instant::now();

        let reason = loop {
            tokio::select! {
                msg = source.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            last_message = Instant::now();
                            Self::handle_text(&shared, &text);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            last_message = Instant::now();
                            let mut writer = shared.writer.lock().await;
                            if let Some(sink) = writer.as_mut() {
                                let _ = sink.send(Message::Pong(data)).await;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_message = Instant::now();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let why = frame
                                .map(|f| f.reason.to_string())
                                .unwrap_or_else(|| "server close".to_string());
                            break why;
                        }
                        Some(Ok(_)) => {
                            last_message = Instant::now();
                        }
                        Some(Err(e)) => break format!("receive error: {}", e),
                        None => break "stream ended".to_string(),
                    }
                }
                _ = ping.tick() => {
                    if last_message.elapsed() > IDLE_TIMEOUT {
                        break format!("idle for {}s", last_message.elapsed().as_secs());
                    }
                    let mut writer = shared.writer.lock().await;
                    if let Some(sink) = writer.as_mut() {
                        if let Err(e) = sink.send(Message::Text("PING".to_string())).await {
                            break format!("ping failed: {}", e);
                        }
                    }
                }
            }
        };

        warn!("Polymarket feed disconnected: {}", reason);
        shared.connected.store(false, Ordering::SeqCst);
        *shared.writer.lock().await = None;
        let _ = shared
            .events_tx
            .send(FeedEvent::Disconnected { reason })
            .await;
    }

    fn handle_text(shared: &FeedShared, text: &str) {
        if text.eq_ignore_ascii_case("pong") {
            return;
        }
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                debug!("Non-JSON message from polymarket feed: {}", e);
                return;
            }
        };
        // The market channel batches events into arrays
        match value {
            Value::Array(events) => {
                for event in &events {
                    Self::handle_event(shared, event);
                }
            }
            ref event => Self::handle_event(shared, event),
        }
    }

    fn handle_event(shared: &FeedShared, raw: &Value) {
        let event_type = raw.get("event_type").and_then(|v| v.as_str()).unwrap_or("");
        let result = match event_type {
            "book" => Self::on_book(shared, raw),
            "price_change" => Self::on_price_change(shared, raw),
            "last_trade_price" => Self::on_trade(shared, raw),
            _ => None,
        };
        if let Some(event) = result {
            if shared.events_tx.try_send(event).is_err() {
                warn!("Polymarket feed event channel full, dropping event");
            }
        }
    }

    fn parse_levels(raw: Option<&Value>) -> Vec<(f64, f64)> {
        let mut levels = Vec::new();
        if let Some(Value::Array(arr)) = raw {
            for entry in arr {
                // Levels come as {"price": "0.52", "size": "10"} objects
                // or ["0.52", "10"] pairs
                let (price, size) = match entry {
                    Value::Object(obj) => (
                        obj.get("price").and_then(Self::parse_f64),
                        obj.get("size").and_then(Self::parse_f64),
                    ),
                    Value::Array(pair) => (
                        pair.first().and_then(Self::parse_f64),
                        pair.get(1).and_then(Self::parse_f64),
                    ),
                    _ => (None, None),
                };
                if let (Some(price), Some(size)) = (price, size) {
                    if size > 0.0 {
                        levels.push((price, size));
                    }
                }
            }
        }
        levels
    }

    fn parse_f64(v: &Value) -> Option<f64> {
        match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    fn parse_timestamp_ms(raw: &Value) -> i64 {
        raw.get("timestamp")
            .and_then(Self::parse_f64)
            .map(|t| t as i64)
            .unwrap_or_else(now_ms)
    }

    fn on_book(shared: &FeedShared, raw: &Value) -> Option<FeedEvent> {
        let asset_id = raw.get("asset_id").and_then(|v| v.as_str())?.to_string();
        let market = raw
            .get("market")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let bids = Self::parse_levels(raw.get("bids").or_else(|| raw.get("buys")));
        let asks = Self::parse_levels(raw.get("asks").or_else(|| raw.get("sells")));
        let timestamp_ms = Self::parse_timestamp_ms(raw);

        let mut books = shared.books.lock().unwrap();
        let book = books.entry(asset_id.clone()).or_default();
        book.replace(market, &bids, &asks);
        let snapshot =
            book.to_snapshot(&shared.listener_id, &asset_id, timestamp_ms, Some(raw.clone()));
        Some(FeedEvent::Book(snapshot))
    }

    fn on_price_change(shared: &FeedShared, raw: &Value) -> Option<FeedEvent> {
        let asset_id = raw.get("asset_id").and_then(|v| v.as_str())?.to_string();
        let timestamp_ms = Self::parse_timestamp_ms(raw);

        let mut books = shared.books.lock().unwrap();
        let book = match books.get_mut(&asset_id) {
            Some(b) => b,
            None => {
                // Delta before the initial book; nothing to apply it to
                debug!("price_change for {} before book, dropping", asset_id);
                return None;
            }
        };

        // Either a flat {price, size, side} or a batched {changes: [...]}
        if let Some(Value::Array(changes)) = raw.get("changes") {
            for change in changes {
                let price = change.get("price").and_then(Self::parse_f64);
                let size = change.get("size").and_then(Self::parse_f64);
                let side = change.get("side").and_then(|v| v.as_str());
                if let (Some(price), Some(size), Some(side)) = (price, size, side) {
                    book.apply_change(side, price, size);
                }
            }
        } else {
            let price = raw.get("price").and_then(Self::parse_f64)?;
            let size = raw.get("size").and_then(Self::parse_f64)?;
            let side = raw.get("side").and_then(|v| v.as_str())?;
            book.apply_change(side, price, size);
        }

        let snapshot = book.to_snapshot(&shared.listener_id, &asset_id, timestamp_ms, None);
        Some(FeedEvent::Book(snapshot))
    }

    fn on_trade(shared: &FeedShared, raw: &Value) -> Option<FeedEvent> {
        let asset_id = raw.get("asset_id").and_then(|v| v.as_str())?.to_string();
        let price = raw.get("price").and_then(Self::parse_f64)?;
        let size = raw.get("size").and_then(Self::parse_f64).unwrap_or(0.0);
        let side = match raw.get("side").and_then(|v| v.as_str()) {
            Some(s) if s.eq_ignore_ascii_case("sell") => TradeSide::Sell,
            _ => TradeSide::Buy,
        };
        let trade = Trade {
            listener_id: shared.listener_id.clone(),
            platform: Platform::Polymarket,
            asset_id: asset_id.clone(),
            market: raw
                .get("market")
                .and_then(|v| v.as_str())
                .unwrap_or(&asset_id)
                .to_string(),
            timestamp_ms: Self::parse_timestamp_ms(raw),
            price,
            size,
            side,
            fee_rate_bps: raw
                .get("fee_rate_bps")
                .and_then(Self::parse_f64)
                .map(|f| f as i32),
            raw_payload: Some(raw.clone()),
        };
        Some(FeedEvent::Trade(trade))
    }
}

#[async_trait]
impl Feed for PolymarketFeed {
    async fn connect(&self) -> Result<()> {
        info!("Connecting polymarket feed: {}", self.shared.url);
        let (stream, _response) = connect_async(&self.shared.url)
            .await
            .context("polymarket websocket connect failed")?;
        let (sink, source) = stream.split();
        *self.shared.writer.lock().await = Some(sink);
        self.shared.connected.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        let handle = tokio::spawn(Self::read_loop(shared, source));
        if let Some(old) = self.read_task.lock().unwrap().replace(handle) {
            old.abort();
        }

        // Resubscribe the full token set so a reconnect needs exactly one
        // subscribe frame
        let tokens: Vec<String> = self
            .shared
            .subscribed
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .collect();
        if !tokens.is_empty() {
            info!("Resubscribing {} polymarket tokens", tokens.len());
            Self::send_subscription(&self.shared, &tokens, false).await?;
        }

        info!("Polymarket feed connected");
        Ok(())
    }

    async fn disconnect(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);
        if let Some(handle) = self.read_task.lock().unwrap().take() {
            handle.abort();
        }
        let mut writer = self.shared.writer.lock().await;
        if let Some(mut sink) = writer.take() {
            let _ = sink.close().await;
        }
        info!("Polymarket feed disconnected");
    }

    async fn subscribe(&self, token_ids: &[String]) -> Result<()> {
        let new_tokens: Vec<String> = {
            let mut subscribed = self.shared.subscribed.lock().unwrap();
            token_ids
                .iter()
                .filter(|t| subscribed.insert((*t).clone()))
                .cloned()
                .collect()
        };
        if new_tokens.is_empty() {
            return Ok(());
        }
        Self::send_subscription(&self.shared, &new_tokens, false).await?;
        info!("Polymarket feed subscribed {} tokens", new_tokens.len());
        Ok(())
    }

    async fn unsubscribe(&self, token_ids: &[String]) -> Result<()> {
        let removed: Vec<String> = {
            let mut subscribed = self.shared.subscribed.lock().unwrap();
            token_ids
                .iter()
                .filter(|t| subscribed.remove(*t))
                .cloned()
                .collect()
        };
        if removed.is_empty() {
            return Ok(());
        }
        {
            let mut books = self.shared.books.lock().unwrap();
            for token in &removed {
                books.remove(token);
            }
        }
        Self::send_subscription(&self.shared, &removed, true).await?;
        info!("Polymarket feed unsubscribed {} tokens", removed.len());
        Ok(())
    }

    async fn next_event(&self) -> Option<FeedEvent> {
        self.events_rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shared() -> FeedShared {
        FeedShared {
            listener_id: "l1".to_string(),
            url: DEFAULT_WS_URL.to_string(),
            writer: tokio::sync::Mutex::new(None),
            events_tx: mpsc::channel(16).0,
            subscribed: std::sync::Mutex::new(HashSet::new()),
            books: std::sync::Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
        }
    }

    fn book_event() -> Value {
        json!({
            "event_type": "book",
            "asset_id": "T1",
            "market": "0xabc",
            "bids": [["0.52", "10"], ["0.51", "20"]],
            "asks": [["0.53", "15"]],
            "timestamp": "1700000000000"
        })
    }

    #[test]
    fn test_book_event_decodes_full_snapshot() {
        let shared = shared();
        let event = PolymarketFeed::on_book(&shared, &book_event()).unwrap();
        let snap = match event {
            FeedEvent::Book(s) => s,
            _ => panic!("expected book"),
        };
        assert_eq!(snap.asset_id, "T1");
        assert_eq!(snap.market, "0xabc");
        assert_eq!(snap.timestamp_ms, 1_700_000_000_000);
        assert_eq!(snap.bids.len(), 2);
        assert_eq!(snap.bids[0], OrderLevel::new(0.52, 10.0));
        assert_eq!(snap.bids[1], OrderLevel::new(0.51, 20.0));
        assert_eq!(snap.asks, vec![OrderLevel::new(0.53, 15.0)]);
        assert!(!snap.is_forward_filled);
        assert!(snap.validate().is_ok());
    }

    #[test]
    fn test_price_change_updates_and_inserts_levels() {
        let shared = shared();
        PolymarketFeed::on_book(&shared, &book_event()).unwrap();

        // Update an existing bid level
        let change = json!({
            "event_type": "price_change",
            "asset_id": "T1",
            "price": "0.52",
            "size": "25",
            "side": "BUY",
            "timestamp": "1700000000100"
        });
        let event = PolymarketFeed::on_price_change(&shared, &change).unwrap();
        let snap = match event {
            FeedEvent::Book(s) => s,
            _ => panic!("expected book"),
        };
        assert_eq!(snap.bids[0], OrderLevel::new(0.52, 25.0));

        // A level we have never seen is an insert
        let insert = json!({
            "event_type": "price_change",
            "asset_id": "T1",
            "price": "0.54",
            "size": "5",
            "side": "SELL",
            "timestamp": "1700000000200"
        });
        let event = PolymarketFeed::on_price_change(&shared, &insert).unwrap();
        let snap = match event {
            FeedEvent::Book(s) => s,
            _ => panic!("expected book"),
        };
        assert_eq!(
            snap.asks,
            vec![OrderLevel::new(0.53, 15.0), OrderLevel::new(0.54, 5.0)]
        );
    }

    #[test]
    fn test_price_change_zero_size_removes_level() {
        let shared = shared();
        PolymarketFeed::on_book(&shared, &book_event()).unwrap();
        let remove = json!({
            "event_type": "price_change",
            "asset_id": "T1",
            "price": "0.51",
            "size": "0",
            "side": "BUY",
            "timestamp": "1700000000100"
        });
        let event = PolymarketFeed::on_price_change(&shared, &remove).unwrap();
        let snap = match event {
            FeedEvent::Book(s) => s,
            _ => panic!("expected book"),
        };
        assert_eq!(snap.bids, vec![OrderLevel::new(0.52, 10.0)]);
    }

    #[test]
    fn test_price_change_before_book_is_dropped() {
        let shared = shared();
        let change = json!({
            "event_type": "price_change",
            "asset_id": "UNSEEN",
            "price": "0.5",
            "size": "1",
            "side": "BUY"
        });
        assert!(PolymarketFeed::on_price_change(&shared, &change).is_none());
    }

    #[test]
    fn test_batched_changes_shape() {
        let shared = shared();
        PolymarketFeed::on_book(&shared, &book_event()).unwrap();
        let change = json!({
            "event_type": "price_change",
            "asset_id": "T1",
            "changes": [
                {"price": "0.52", "size": "11", "side": "BUY"},
                {"price": "0.53", "size": "0", "side": "SELL"}
            ],
            "timestamp": "1700000000300"
        });
        let event = PolymarketFeed::on_price_change(&shared, &change).unwrap();
        let snap = match event {
            FeedEvent::Book(s) => s,
            _ => panic!("expected book"),
        };
        assert_eq!(snap.bids[0], OrderLevel::new(0.52, 11.0));
        assert!(snap.asks.is_empty());
    }

    #[test]
    fn test_last_trade_price_decodes_trade() {
        let shared = shared();
        let raw = json!({
            "event_type": "last_trade_price",
            "asset_id": "T1",
            "market": "0xabc",
            "price": "0.52",
            "size": "7",
            "side": "SELL",
            "fee_rate_bps": "20",
            "timestamp": "1700000000400"
        });
        let event = PolymarketFeed::on_trade(&shared, &raw).unwrap();
        let trade = match event {
            FeedEvent::Trade(t) => t,
            _ => panic!("expected trade"),
        };
        assert_eq!(trade.price, 0.52);
        assert_eq!(trade.size, 7.0);
        assert_eq!(trade.side, TradeSide::Sell);
        assert_eq!(trade.fee_rate_bps, Some(20));
        assert_eq!(trade.timestamp_ms, 1_700_000_000_400);
        assert!(trade.validate().is_ok());
    }

    #[test]
    fn test_empty_side_book_still_emits() {
        let shared = shared();
        let raw = json!({
            "event_type": "book",
            "asset_id": "T2",
            "market": "0xdef",
            "bids": [],
            "asks": [["0.9", "3"]],
            "timestamp": "1700000000000"
        });
        let event = PolymarketFeed::on_book(&shared, &raw).unwrap();
        let snap = match event {
            FeedEvent::Book(s) => s,
            _ => panic!("expected book"),
        };
        assert!(snap.bids.is_empty());
        assert_eq!(snap.asks.len(), 1);
        assert!(snap.validate().is_ok());
    }
}
