//! Kalshi WebSocket feed with orderbook reconstruction.
//!
//! Kalshi authenticates the upgrade request itself (the same RSA-PSS
//! headers as REST) and delivers each book as an `orderbook_snapshot`
//! followed by incremental `orderbook_delta` messages, so this client
//! keeps per-ticker Yes/No level maps and emits a full normalized
//! snapshot on every apply. Normalization:
//!
//! - bids = Yes levels, `price = cents / 100`, sorted descending
//! - asks = No levels reflected, `price = (100 - cents) / 100`, sorted
//!   ascending, clamped into [0, 1]
//! - timestamps in seconds are scaled to milliseconds
//! - `taker_side` yes|no maps to trade side buy|sell

use crate::clients::{AuthError, Feed, FeedEvent, KalshiAuthenticator};
use crate::models::{OrderLevel, OrderbookSnapshot, Platform, Trade, TradeSide};
use crate::utils::time::now_ms;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

const DEFAULT_WS_URL: &str = "wss://api.elections.kalshi.com/trade-api/ws/v2";
const WS_SIGNING_PATH: &str = "/trade-api/ws/v2";
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const EVENT_CHANNEL_CAPACITY: usize = 2048;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Orderbook state reconstructed from Kalshi snapshots and deltas.
///
/// Levels are quantity by price in integer cents, per side. Deltas carry
/// a sequence number; anything at or below the last applied sequence is
/// stale and dropped.
#[derive(Debug, Default, Clone)]
pub struct KalshiBookState {
    sequence: u64,
    yes_levels: BTreeMap<u16, i64>,
    no_levels: BTreeMap<u16, i64>,
}

impl KalshiBookState {
    pub fn apply_snapshot(&mut self, yes: &[(u16, i64)], no: &[(u16, i64)], seq: u64) {
        self.sequence = seq;
        self.yes_levels = yes.iter().copied().collect();
        self.no_levels = no.iter().copied().collect();
    }

    /// Returns false when the delta is stale.
    pub fn apply_delta(&mut self, price_cents: u16, delta: i64, side: &str, seq: u64) -> bool {
        if seq <= self.sequence {
            return false;
        }
        self.sequence = seq;
        let levels = if side == "yes" {
            &mut self.yes_levels
        } else {
            &mut self.no_levels
        };
        let quantity = levels.get(&price_cents).copied().unwrap_or(0) + delta;
        if quantity <= 0 {
            levels.remove(&price_cents);
        } else {
            levels.insert(price_cents, quantity);
        }
        true
    }

    /// Reflect Yes/No levels into the normalized bid/ask model.
    pub fn to_snapshot(
        &self,
        listener_id: &str,
        ticker: &str,
        timestamp_ms: i64,
    ) -> OrderbookSnapshot {
        let bids = self
            .yes_levels
            .iter()
            .rev()
            .map(|(cents, qty)| OrderLevel::new(f64::from(*cents) / 100.0, *qty as f64))
            .collect();
        // Descending No cents yields ascending reflected ask prices
        let asks = self
            .no_levels
            .iter()
            .rev()
            .map(|(cents, qty)| {
                let price = (100.0 - f64::from(*cents)) / 100.0;
                OrderLevel::new(price.clamp(0.0, 1.0), *qty as f64)
            })
            .collect();
        OrderbookSnapshot::new(
            listener_id.to_string(),
            Platform::Kalshi,
            ticker.to_string(),
            ticker.to_string(),
            timestamp_ms,
            bids,
            asks,
            None,
        )
    }
}

struct FeedShared {
    listener_id: String,
    url: String,
    auth: Arc<KalshiAuthenticator>,
    writer: tokio::sync::Mutex<Option<WsSink>>,
    events_tx: mpsc::Sender<FeedEvent>,
    subscribed: std::sync::Mutex<HashSet<String>>,
    books: std::sync::Mutex<HashMap<String, KalshiBookState>>,
    connected: AtomicBool,
    msg_id: AtomicU64,
}

pub struct KalshiFeed {
    shared: Arc<FeedShared>,
    events_rx: tokio::sync::Mutex<mpsc::Receiver<FeedEvent>>,
    read_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl KalshiFeed {
    pub fn new(listener_id: String, auth: Arc<KalshiAuthenticator>) -> Self {
        Self::with_url(listener_id, auth, DEFAULT_WS_URL.to_string())
    }

    pub fn with_url(listener_id: String, auth: Arc<KalshiAuthenticator>, url: String) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(FeedShared {
                listener_id,
                url,
                auth,
                writer: tokio::sync::Mutex::new(None),
                events_tx,
                subscribed: std::sync::Mutex::new(HashSet::new()),
                books: std::sync::Mutex::new(HashMap::new()),
                connected: AtomicBool::new(false),
                msg_id: AtomicU64::new(1),
            }),
            events_rx: tokio::sync::Mutex::new(events_rx),
            read_task: std::sync::Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn send_command(shared: &FeedShared, cmd: &str, tickers: &[String]) -> Result<()> {
        let msg = json!({
            "id": shared.msg_id.fetch_add(1, Ordering::SeqCst),
            "cmd": cmd,
            "params": {
                "channels": ["orderbook_delta", "trade"],
                "market_tickers": tickers,
            },
        });
        let mut writer = shared.writer.lock().await;
        let sink = writer.as_mut().context("kalshi feed is not connected")?;
        sink.send(Message::Text(msg.to_string()))
            .await
            .with_context(|| format!("failed to send {} frame", cmd))?;
        Ok(())
    }

    async fn read_loop(shared: Arc<FeedShared>, mut source: WsSource) {
        let mut idle_check = interval(IDLE_CHECK_INTERVAL);
        idle_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
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
                _ = idle_check.tick() => {
                    if last_message.elapsed() > IDLE_TIMEOUT {
                        break format!("idle for {}s", last_message.elapsed().as_secs());
                    }
                }
            }
        };

        warn!("Kalshi feed disconnected: {}", reason);
        shared.connected.store(false, Ordering::SeqCst);
        *shared.writer.lock().await = None;
        let _ = shared
            .events_tx
            .send(FeedEvent::Disconnected { reason })
            .await;
    }

    fn handle_text(shared: &FeedShared, text: &str) {
        let data: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                debug!("Non-JSON message from kalshi feed: {}", e);
                return;
            }
        };

        let event = match data.get("type").and_then(|v| v.as_str()) {
            Some("orderbook_snapshot") => Self::on_snapshot(shared, &data),
            Some("orderbook_delta") => Self::on_delta(shared, &data),
            Some("trade") => Self::on_trade(shared, &data),
            Some("subscribed") => {
                debug!(
                    "Kalshi subscription confirmed: sid={:?}",
                    data.get("sid").and_then(|v| v.as_u64())
                );
                None
            }
            Some("error") => {
                warn!("Kalshi feed error message: {}", data.get("msg").unwrap_or(&Value::Null));
                None
            }
            _ => None,
        };

        if let Some(event) = event {
            if shared.events_tx.try_send(event).is_err() {
                warn!("Kalshi feed event channel full, dropping event");
            }
        }
    }

    fn parse_cent_levels(raw: Option<&Value>) -> Vec<(u16, i64)> {
        let mut levels = Vec::new();
        if let Some(Value::Array(arr)) = raw {
            for pair in arr {
                if let Value::Array(pair) = pair {
                    let price = pair.first().and_then(|v| v.as_u64());
                    let qty = pair.get(1).and_then(|v| v.as_i64());
                    if let (Some(price), Some(qty)) = (price, qty) {
                        levels.push((price as u16, qty));
                    }
                }
            }
        }
        levels
    }

    /// Kalshi stamps messages in epoch seconds.
    fn timestamp_ms(data: &Value) -> i64 {
        let ts = data
            .get("ts")
            .or_else(|| data.get("msg").and_then(|m| m.get("ts")))
            .and_then(|v| v.as_i64());
        match ts {
            Some(seconds) => seconds * 1000,
            None => now_ms(),
        }
    }

    fn on_snapshot(shared: &FeedShared, data: &Value) -> Option<FeedEvent> {
        let msg = data.get("msg")?;
        let ticker = msg.get("market_ticker").and_then(|v| v.as_str())?.to_string();
        let seq = data.get("seq").and_then(|v| v.as_u64()).unwrap_or(0);
        let yes = Self::parse_cent_levels(msg.get("yes"));
        let no = Self::parse_cent_levels(msg.get("no"));

        let mut books = shared.books.lock().unwrap();
        let state = books.entry(ticker.clone()).or_default();
        state.apply_snapshot(&yes, &no, seq);
        let snapshot = state.to_snapshot(&shared.listener_id, &ticker, Self::timestamp_ms(data));
        debug!(
            "Kalshi snapshot for {}: {} yes / {} no levels",
            ticker,
            yes.len(),
            no.len()
        );
        Some(FeedEvent::Book(snapshot))
    }

    fn on_delta(shared: &FeedShared, data: &Value) -> Option<FeedEvent> {
        let msg = data.get("msg")?;
        let ticker = msg.get("market_ticker").and_then(|v| v.as_str())?.to_string();
        let seq = data.get("seq").and_then(|v| v.as_u64()).unwrap_or(0);
        let price = msg.get("price").and_then(|v| v.as_u64()).unwrap_or(0) as u16;
        let delta = msg.get("delta").and_then(|v| v.as_i64()).unwrap_or(0);
        let side = msg.get("side").and_then(|v| v.as_str()).unwrap_or("yes");

        let mut books = shared.books.lock().unwrap();
        let state = match books.get_mut(&ticker) {
            Some(s) => s,
            None => {
                warn!("Kalshi delta for {} before snapshot, dropping", ticker);
                return None;
            }
        };
        if !state.apply_delta(price, delta, side, seq) {
            return None; // Stale update
        }
        let snapshot = state.to_snapshot(&shared.listener_id, &ticker, Self::timestamp_ms(data));
        Some(FeedEvent::Book(snapshot))
    }

    fn on_trade(shared: &FeedShared, data: &Value) -> Option<FeedEvent> {
        let msg = data.get("msg")?;
        let ticker = msg.get("market_ticker").and_then(|v| v.as_str())?.to_string();
        let yes_price_cents = msg.get("yes_price").and_then(|v| v.as_u64()).unwrap_or(0);
        let count = msg.get("count").and_then(|v| v.as_i64()).unwrap_or(0);
        let side = match msg.get("taker_side").and_then(|v| v.as_str()) {
            Some("no") => TradeSide::Sell,
            _ => TradeSide::Buy,
        };
        let trade = Trade {
            listener_id: shared.listener_id.clone(),
            platform: Platform::Kalshi,
            asset_id: ticker.clone(),
            market: ticker,
            timestamp_ms: Self::timestamp_ms(data),
            price: yes_price_cents as f64 / 100.0,
            size: count as f64,
            side,
            fee_rate_bps: None,
            raw_payload: Some(data.clone()),
        };
        Some(FeedEvent::Trade(trade))
    }
}

#[async_trait]
impl Feed for KalshiFeed {
    async fn connect(&self) -> Result<()> {
        info!("Connecting kalshi feed: {}", self.shared.url);
        let mut request = self
            .shared
            .url
            .as_str()
            .into_client_request()
            .context("invalid kalshi websocket url")?;
        for (name, value) in self.shared.auth.ws_headers(WS_SIGNING_PATH) {
            request.headers_mut().insert(
                name,
                HeaderValue::from_str(&value).context("invalid auth header value")?,
            );
        }

        let (stream, _response) = match connect_async(request).await {
            Ok(ok) => ok,
            Err(tokio_tungstenite::tungstenite::Error::Http(response))
                if response.status().as_u16() == 401 || response.status().as_u16() == 403 =>
            {
                return Err(AuthError(format!(
                    "kalshi websocket upgrade rejected: {}",
                    response.status()
                ))
                .into());
            }
            Err(e) => return Err(e).context("kalshi websocket connect failed"),
        };

        let (sink, source) = stream.split();
        *self.shared.writer.lock().await = Some(sink);
        self.shared.connected.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        let handle = tokio::spawn(Self::read_loop(shared, source));
        if let Some(old) = self.read_task.lock().unwrap().replace(handle) {
            old.abort();
        }

        let tickers: Vec<String> = self
            .shared
            .subscribed
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .collect();
        if !tickers.is_empty() {
            info!("Resubscribing {} kalshi tickers", tickers.len());
            Self::send_command(&self.shared, "subscribe", &tickers).await?;
        }

        info!("Kalshi feed connected");
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
        info!("Kalshi feed disconnected");
    }

    async fn subscribe(&self, token_ids: &[String]) -> Result<()> {
        let new_tickers: Vec<String> = {
            let mut subscribed = self.shared.subscribed.lock().unwrap();
            token_ids
                .iter()
                .filter(|t| subscribed.insert((*t).clone()))
                .cloned()
                .collect()
        };
        if new_tickers.is_empty() {
            return Ok(());
        }
        {
            let mut books = self.shared.books.lock().unwrap();
            for ticker in &new_tickers {
                books.entry(ticker.clone()).or_default();
            }
        }
        Self::send_command(&self.shared, "subscribe", &new_tickers).await?;
        info!("Kalshi feed subscribed {} tickers", new_tickers.len());
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
            for ticker in &removed {
                books.remove(ticker);
            }
        }
        Self::send_command(&self.shared, "unsubscribe", &removed).await?;
        info!("Kalshi feed unsubscribed {} tickers", removed.len());
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
        let key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let pem = rsa::pkcs8::EncodePrivateKey::to_pkcs8_pem(&key, rsa::pkcs8::LineEnding::LF)
            .unwrap();
        let auth = KalshiAuthenticator::new("test".to_string(), &pem).unwrap();
        FeedShared {
            listener_id: "l1".to_string(),
            url: DEFAULT_WS_URL.to_string(),
            auth: Arc::new(auth),
            writer: tokio::sync::Mutex::new(None),
            events_tx: mpsc::channel(16).0,
            subscribed: std::sync::Mutex::new(HashSet::new()),
            books: std::sync::Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            msg_id: AtomicU64::new(1),
        }
    }

    #[test]
    fn test_snapshot_normalization() {
        let shared = shared();
        let data = json!({
            "type": "orderbook_snapshot",
            "seq": 1,
            "msg": {
                "market_ticker": "KXTEST-26",
                "yes": [[50, 100]],
                "no": [[40, 150]],
                "ts": 1_700_000_000
            }
        });
        let event = KalshiFeed::on_snapshot(&shared, &data).unwrap();
        let snap = match event {
            FeedEvent::Book(s) => s,
            _ => panic!("expected book"),
        };
        assert_eq!(snap.platform, Platform::Kalshi);
        assert_eq!(snap.timestamp_ms, 1_700_000_000_000);
        assert_eq!(snap.bids, vec![OrderLevel::new(0.50, 100.0)]);
        assert_eq!(snap.asks, vec![OrderLevel::new(0.60, 150.0)]);
        assert!(snap.validate().is_ok());
    }

    #[test]
    fn test_normalization_sort_orders() {
        let mut state = KalshiBookState::default();
        state.apply_snapshot(&[(48, 10), (52, 5), (50, 7)], &[(40, 3), (45, 9)], 1);
        let snap = state.to_snapshot("l1", "T", 0);

        // Yes levels descending by price
        let bid_prices: Vec<f64> = snap.bids.iter().map(|l| l.price).collect();
        assert_eq!(bid_prices, vec![0.52, 0.50, 0.48]);

        // Reflected No levels ascending by price: 45c -> 0.55, 40c -> 0.60
        let ask_prices: Vec<f64> = snap.asks.iter().map(|l| l.price).collect();
        assert_eq!(ask_prices, vec![0.55, 0.60]);
        assert!(snap.validate().is_ok());
    }

    #[test]
    fn test_reflection_clamps_extreme_cents() {
        let mut state = KalshiBookState::default();
        state.apply_snapshot(&[], &[(0, 1), (100, 2)], 1);
        let snap = state.to_snapshot("l1", "T", 0);
        for level in &snap.asks {
            assert!((0.0..=1.0).contains(&level.price));
        }
    }

    #[test]
    fn test_delta_application_and_staleness() {
        let mut state = KalshiBookState::default();
        state.apply_snapshot(&[(50, 100)], &[(40, 150)], 5);

        // Stale sequence is refused
        assert!(!state.apply_delta(50, 10, "yes", 5));
        assert!(!state.apply_delta(50, 10, "yes", 3));

        // Additive delta
        assert!(state.apply_delta(50, 25, "yes", 6));
        let snap = state.to_snapshot("l1", "T", 0);
        assert_eq!(snap.bids, vec![OrderLevel::new(0.50, 125.0)]);

        // Depletion removes the level
        assert!(state.apply_delta(40, -150, "no", 7));
        let snap = state.to_snapshot("l1", "T", 0);
        assert!(snap.asks.is_empty());
    }

    #[test]
    fn test_delta_inserts_new_level() {
        let mut state = KalshiBookState::default();
        state.apply_snapshot(&[(50, 100)], &[], 1);
        assert!(state.apply_delta(55, 40, "no", 2));
        let snap = state.to_snapshot("l1", "T", 0);
        assert_eq!(snap.asks, vec![OrderLevel::new(0.45, 40.0)]);
    }

    #[test]
    fn test_delta_before_snapshot_dropped() {
        let shared = shared();
        let data = json!({
            "type": "orderbook_delta",
            "seq": 2,
            "msg": {"market_ticker": "UNSEEN", "price": 50, "delta": 10, "side": "yes"}
        });
        assert!(KalshiFeed::on_delta(&shared, &data).is_none());
    }

    #[test]
    fn test_trade_side_mapping() {
        let shared = shared();
        let data = json!({
            "type": "trade",
            "msg": {
                "market_ticker": "KXTEST-26",
                "yes_price": 55,
                "count": 10,
                "taker_side": "yes",
                "ts": 1_700_000_000
            }
        });
        let event = KalshiFeed::on_trade(&shared, &data).unwrap();
        let trade = match event {
            FeedEvent::Trade(t) => t,
            _ => panic!("expected trade"),
        };
        assert_eq!(trade.price, 0.55);
        assert_eq!(trade.size, 10.0);
        assert_eq!(trade.side, TradeSide::Buy);
        assert_eq!(trade.timestamp_ms, 1_700_000_000_000);

        let data = json!({
            "type": "trade",
            "msg": {"market_ticker": "KXTEST-26", "yes_price": 55, "count": 10, "taker_side": "no"}
        });
        let event = KalshiFeed::on_trade(&shared, &data).unwrap();
        match event {
            FeedEvent::Trade(t) => assert_eq!(t.side, TradeSide::Sell),
            _ => panic!("expected trade"),
        }
    }
}
