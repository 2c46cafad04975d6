// Shared models for ticktape services
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============================================================================
// Platform & Market lifecycle
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Polymarket,
    Kalshi,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Polymarket => "polymarket",
            Platform::Kalshi => "kalshi",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "polymarket" => Some(Platform::Polymarket),
            "kalshi" => Some(Platform::Kalshi),
            _ => None,
        }
    }
}

/// Lifecycle of a tracked market, persisted to the state history table on
/// every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketState {
    Discovered,
    Subscribed,
    Active,
    Closed,
    Removed,
}

impl MarketState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketState::Discovered => "discovered",
            MarketState::Subscribed => "subscribed",
            MarketState::Active => "active",
            MarketState::Closed => "closed",
            MarketState::Removed => "removed",
        }
    }
}

// ============================================================================
// Market
// ============================================================================

/// One tradeable outcome token. Identity is (listener_id, token_id); a
/// Polymarket condition with N outcomes yields N Market rows sharing
/// condition_id, while Kalshi has one row per ticker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub listener_id: Option<String>,
    pub platform: Platform,
    pub condition_id: String,
    pub token_id: String,
    pub market_slug: Option<String>,
    pub event_slug: Option<String>,
    pub question: Option<String>,
    pub outcome: Option<String>,
    pub outcome_index: Option<i32>,
    pub event_id: Option<String>,
    pub event_title: Option<String>,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub series_id: Option<String>,
    pub tags: Option<serde_json::Value>,
    pub description: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub volume: Option<f64>,
    pub liquidity: Option<f64>,
    pub is_active: bool,
    pub is_closed: bool,
    pub state: MarketState,
}

impl Market {
    pub fn new(platform: Platform, condition_id: String, token_id: String) -> Self {
        Self {
            listener_id: None,
            platform,
            condition_id,
            token_id,
            market_slug: None,
            event_slug: None,
            question: None,
            outcome: None,
            outcome_index: None,
            event_id: None,
            event_title: None,
            category: None,
            subcategory: None,
            series_id: None,
            tags: None,
            description: None,
            start_time: None,
            end_time: None,
            volume: None,
            liquidity: None,
            is_active: true,
            is_closed: false,
            state: MarketState::Discovered,
        }
    }
}

// ============================================================================
// Orderbook snapshot
// ============================================================================

/// A single price level. Prices are venue-normalized decimals in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderLevel {
    pub price: f64,
    pub size: f64,
}

impl OrderLevel {
    pub fn new(price: f64, size: f64) -> Self {
        Self { price, size }
    }
}

/// Normalized full-depth orderbook state for one token at one instant.
///
/// Invariants (checked by `validate`): bids sorted price-descending, asks
/// price-ascending, sizes positive, prices within [0, 1]. Derived fields
/// are filled by `compute_metrics`; `hash` is a content digest over the
/// two sides used for emission dedup and audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderbookSnapshot {
    pub listener_id: String,
    pub platform: Platform,
    pub asset_id: String,
    pub market: String,
    pub timestamp_ms: i64,
    pub bids: Vec<OrderLevel>,
    pub asks: Vec<OrderLevel>,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub spread: Option<f64>,
    pub mid_price: Option<f64>,
    pub bid_depth: Option<f64>,
    pub ask_depth: Option<f64>,
    pub hash: Option<String>,
    pub raw_payload: Option<serde_json::Value>,
    pub is_forward_filled: bool,
    pub source_timestamp_ms: Option<i64>,
}

impl OrderbookSnapshot {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        listener_id: String,
        platform: Platform,
        asset_id: String,
        market: String,
        timestamp_ms: i64,
        bids: Vec<OrderLevel>,
        asks: Vec<OrderLevel>,
        raw_payload: Option<serde_json::Value>,
    ) -> Self {
        Self {
            listener_id,
            platform,
            asset_id,
            market,
            timestamp_ms,
            bids,
            asks,
            best_bid: None,
            best_ask: None,
            spread: None,
            mid_price: None,
            bid_depth: None,
            ask_depth: None,
            hash: None,
            raw_payload,
            is_forward_filled: false,
            source_timestamp_ms: None,
        }
    }

    /// Check the sort and range invariants on both sides.
    pub fn validate(&self) -> Result<()> {
        Self::validate_side(&self.bids, true)?;
        Self::validate_side(&self.asks, false)?;
        if let (Some(bb), Some(ba)) = (self.bids.first(), self.asks.first()) {
            if bb.price > ba.price {
                bail!(
                    "invalid snapshot for {}: crossed book (best_bid {} > best_ask {})",
                    self.asset_id,
                    bb.price,
                    ba.price
                );
            }
        }
        Ok(())
    }

    fn validate_side(levels: &[OrderLevel], descending: bool) -> Result<()> {
        let side = if descending { "bids" } else { "asks" };
        for level in levels {
            if !(0.0..=1.0).contains(&level.price) {
                bail!("invalid snapshot: {} price {} outside [0, 1]", side, level.price);
            }
            if level.size <= 0.0 {
                bail!("invalid snapshot: {} size {} not positive", side, level.size);
            }
        }
        for pair in levels.windows(2) {
            let ordered = if descending {
                pair[0].price > pair[1].price
            } else {
                pair[0].price < pair[1].price
            };
            if !ordered {
                bail!(
                    "invalid snapshot: {} not strictly {} at price {}",
                    side,
                    if descending { "descending" } else { "ascending" },
                    pair[1].price
                );
            }
        }
        Ok(())
    }

    /// Fill best bid/ask, spread, mid price and per-side depth from the
    /// (already sorted) levels. Empty sides leave their fields as None.
    pub fn compute_metrics(&mut self) {
        self.best_bid = self.bids.first().map(|l| l.price);
        self.best_ask = self.asks.first().map(|l| l.price);
        self.bid_depth = if self.bids.is_empty() {
            None
        } else {
            Some(self.bids.iter().map(|l| l.size).sum())
        };
        self.ask_depth = if self.asks.is_empty() {
            None
        } else {
            Some(self.asks.iter().map(|l| l.size).sum())
        };
        if let (Some(bb), Some(ba)) = (self.best_bid, self.best_ask) {
            self.spread = Some(ba - bb);
            self.mid_price = Some((bb + ba) / 2.0);
        } else {
            self.spread = None;
            self.mid_price = None;
        }
    }

    /// Stable content digest over (bids, asks): SHA-256 of the canonical
    /// level serialization, truncated to 16 hex chars.
    pub fn content_hash(&self) -> String {
        let mut canonical = String::new();
        for level in &self.bids {
            canonical.push_str(&format!("{:.6}x{:.6},", level.price, level.size));
        }
        canonical.push('|');
        for level in &self.asks {
            canonical.push_str(&format!("{:.6}x{:.6},", level.price, level.size));
        }
        let digest = Sha256::digest(canonical.as_bytes());
        hex::encode(digest)[..16].to_string()
    }

    /// Clone of this snapshot re-stamped at `timestamp_ms` and marked as a
    /// synthetic forward-fill. The raw payload is not carried over.
    pub fn forward_filled_copy(&self, timestamp_ms: i64) -> Self {
        let mut copy = self.clone();
        copy.timestamp_ms = timestamp_ms;
        copy.is_forward_filled = true;
        copy.source_timestamp_ms = Some(self.timestamp_ms);
        copy.raw_payload = None;
        copy
    }
}

// ============================================================================
// Trade
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub listener_id: String,
    pub platform: Platform,
    pub asset_id: String,
    pub market: String,
    pub timestamp_ms: i64,
    pub price: f64,
    pub size: f64,
    pub side: TradeSide,
    pub fee_rate_bps: Option<i32>,
    pub raw_payload: Option<serde_json::Value>,
}

impl Trade {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.price) {
            bail!("invalid trade for {}: price {} outside [0, 1]", self.asset_id, self.price);
        }
        if self.size <= 0.0 {
            bail!("invalid trade for {}: size {} not positive", self.asset_id, self.size);
        }
        Ok(())
    }
}

// ============================================================================
// Listener configuration & filters
// ============================================================================

/// Per-platform discovery filters. Stored as a JSON column on the
/// listeners table; the variant is selected by the row's platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ListenerFilters {
    Polymarket(PolymarketFilters),
    Kalshi(KalshiFilters),
}

impl ListenerFilters {
    pub fn parse(platform: Platform, value: &serde_json::Value) -> Result<Self> {
        match platform {
            Platform::Polymarket => Ok(ListenerFilters::Polymarket(serde_json::from_value(
                value.clone(),
            )?)),
            Platform::Kalshi => Ok(ListenerFilters::Kalshi(serde_json::from_value(
                value.clone(),
            )?)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolymarketFilters {
    #[serde(default)]
    pub series_ids: Vec<String>,
    #[serde(default)]
    pub tag_ids: Vec<i64>,
    #[serde(default)]
    pub slug_patterns: Vec<String>,
    #[serde(default)]
    pub condition_ids: Vec<String>,
    #[serde(default)]
    pub min_liquidity: Option<f64>,
    #[serde(default)]
    pub min_volume: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KalshiFilters {
    #[serde(default)]
    pub series_tickers: Vec<String>,
    #[serde(default)]
    pub event_tickers: Vec<String>,
    #[serde(default)]
    pub market_tickers: Vec<String>,
    #[serde(default = "KalshiFilters::default_status")]
    pub status: Option<String>,
    #[serde(default)]
    pub min_volume: Option<f64>,
    #[serde(default)]
    pub min_open_interest: Option<f64>,
    #[serde(default)]
    pub title_contains: Option<String>,
}

impl KalshiFilters {
    fn default_status() -> Option<String> {
        Some("open".to_string())
    }
}

impl Default for KalshiFilters {
    fn default() -> Self {
        Self {
            series_tickers: Vec::new(),
            event_tickers: Vec::new(),
            market_tickers: Vec::new(),
            status: Self::default_status(),
            min_volume: None,
            min_open_interest: None,
            title_contains: None,
        }
    }
}

/// One listener row. Loaded from the sink-backed store; never written by
/// the recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub id: String,
    pub name: String,
    pub platform: Platform,
    pub description: Option<String>,
    pub filters: ListenerFilters,
    pub discovery_interval_seconds: u64,
    pub emit_interval_ms: u64,
    pub enable_forward_fill: bool,
    pub is_active: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ListenerConfig {
    /// Functional comparison for reload: row timestamps do not count as a
    /// config change.
    pub fn differs_from(&self, other: &ListenerConfig) -> bool {
        self.name != other.name
            || self.platform != other.platform
            || self.description != other.description
            || self.filters != other.filters
            || self.discovery_interval_seconds != other.discovery_interval_seconds
            || self.emit_interval_ms != other.emit_interval_ms
            || self.enable_forward_fill != other.enable_forward_fill
            || self.is_active != other.is_active
    }
}
