//! Kalshi market discovery over the authenticated REST API.
//!
//! Kalshi organizes markets as Series -> Events -> Markets and paginates
//! with an opaque `cursor`. Unlike Polymarket there is no per-outcome
//! token fan-out: one ticker is one market, with Yes/No as sides. The
//! ticker doubles as condition_id and token_id.

use crate::clients::{AuthError, Discovery, KalshiAuthenticator};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use reqwest::Client;
use serde_json::Value;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use crate::models::{KalshiFilters, ListenerFilters, Market, Platform};

const KALSHI_API_PROD: &str = "https://api.elections.kalshi.com/trade-api/v2";
const SIGNING_PATH_PREFIX: &str = "/trade-api/v2";
const PAGE_SIZE: u32 = 200;
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

#[derive(Clone)]
pub struct KalshiDiscovery {
    client: Client,
    base_url: String,
    auth: Arc<KalshiAuthenticator>,
}

impl std::fmt::Debug for KalshiDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KalshiDiscovery")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl KalshiDiscovery {
    pub fn new(auth: Arc<KalshiAuthenticator>) -> Result<Self> {
        let base_url = env::var("KALSHI_BASE_URL").unwrap_or_else(|_| KALSHI_API_PROD.to_string());
        Self::with_base_url(auth, base_url)
    }

    pub fn with_base_url(auth: Arc<KalshiAuthenticator>, base_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client for Kalshi")?;
        Ok(Self {
            client,
            base_url,
            auth,
        })
    }

    /// Authenticated GET. The signature covers the canonical API path
    /// without the query string.
    async fn get(&self, endpoint: &str, params: &[(&str, String)]) -> Result<Value> {
        let url = format!("{}{}", self.base_url, endpoint);
        let signing_path = format!("{}{}", SIGNING_PATH_PREFIX, endpoint);
        let mut attempt = 0;

        loop {
            let mut request = self.client.get(&url).query(params);
            for (name, value) in self.auth.headers("GET", &signing_path) {
                request = request.header(name, value);
            }

            let resp = request
                .send()
                .await
                .with_context(|| format!("Kalshi request failed: {}", url))?;
            let status = resp.status();

            if status.as_u16() == 401 || status.as_u16() == 403 {
                let text = resp.text().await.unwrap_or_default();
                return Err(AuthError(format!("Kalshi {}: {}", status, text)).into());
            }

            if status.as_u16() == 429 && attempt < MAX_RATE_LIMIT_RETRIES {
                let delay = resp
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(1);
                warn!("Kalshi rate limited, retrying in {}s", delay);
                tokio::time::sleep(Duration::from_secs(delay)).await;
                attempt += 1;
                continue;
            }

            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                bail!("Kalshi API error ({}): {}", status, text);
            }

            return resp.json().await.context("Kalshi response was not JSON");
        }
    }

    /// Generic paginated market fetch (cursor-based).
    async fn fetch_markets(
        &self,
        series_ticker: Option<&str>,
        event_ticker: Option<&str>,
        status: Option<&str>,
    ) -> Result<Vec<Market>> {
        let mut markets = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut params: Vec<(&str, String)> = vec![("limit", PAGE_SIZE.to_string())];
            if let Some(s) = status {
                params.push(("status", s.to_string()));
            }
            if let Some(s) = series_ticker {
                params.push(("series_ticker", s.to_string()));
            }
            if let Some(e) = event_ticker {
                params.push(("event_ticker", e.to_string()));
            }
            if let Some(c) = &cursor {
                params.push(("cursor", c.clone()));
            }

            let data = self.get("/markets", &params).await?;
            for market_data in data
                .get("markets")
                .and_then(|m| m.as_array())
                .unwrap_or(&vec![])
            {
                markets.push(Self::parse_market(market_data));
            }

            cursor = data
                .get("cursor")
                .and_then(|c| c.as_str())
                .filter(|c| !c.is_empty())
                .map(String::from);
            if cursor.is_none() {
                break;
            }
        }

        Ok(markets)
    }

    async fn get_market(&self, ticker: &str) -> Result<Option<Market>> {
        let endpoint = format!("/markets/{}", ticker);
        let data = self.get(&endpoint, &[]).await?;
        Ok(data.get("market").map(Self::parse_market))
    }

    fn parse_market(data: &Value) -> Market {
        let ticker = data
            .get("ticker")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let status = data.get("status").and_then(|v| v.as_str()).unwrap_or("");

        let mut market = Market::new(Platform::Kalshi, ticker.clone(), ticker.clone());
        market.market_slug = Some(ticker);
        market.event_slug = data
            .get("event_ticker")
            .and_then(|v| v.as_str())
            .map(String::from);
        market.question = data.get("title").and_then(|v| v.as_str()).map(String::from);
        market.event_id = data
            .get("event_ticker")
            .and_then(|v| v.as_str())
            .map(String::from);
        market.event_title = data
            .get("subtitle")
            .and_then(|v| v.as_str())
            .map(String::from);
        market.category = data
            .get("category")
            .and_then(|v| v.as_str())
            .map(String::from);
        market.subcategory = data
            .get("sub_title")
            .and_then(|v| v.as_str())
            .map(String::from);
        market.series_id = data
            .get("series_ticker")
            .and_then(|v| v.as_str())
            .map(String::from);
        market.description = data
            .get("rules_primary")
            .and_then(|v| v.as_str())
            .map(String::from);
        market.start_time = Self::parse_time(data.get("open_time"));
        market.end_time = Self::parse_time(data.get("close_time"));
        market.volume = data.get("volume").and_then(|v| v.as_f64());
        // Open interest stands in for liquidity: contracts outstanding
        market.liquidity = data.get("open_interest").and_then(|v| v.as_f64());
        market.is_active = status == "open";
        market.is_closed = status == "closed" || status == "settled";
        market
    }

    fn parse_time(v: Option<&Value>) -> Option<DateTime<Utc>> {
        v.and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn apply_filters(markets: Vec<Market>, filters: &KalshiFilters) -> Vec<Market> {
        let title_needle = filters.title_contains.as_ref().map(|t| t.to_lowercase());
        markets
            .into_iter()
            .filter(|m| {
                if let Some(min) = filters.min_volume {
                    if m.volume.unwrap_or(0.0) < min {
                        return false;
                    }
                }
                if let Some(min) = filters.min_open_interest {
                    if m.liquidity.unwrap_or(0.0) < min {
                        return false;
                    }
                }
                if let Some(needle) = &title_needle {
                    let title = m.question.as_deref().unwrap_or("").to_lowercase();
                    if !title.contains(needle.as_str()) {
                        return false;
                    }
                }
                true
            })
            .collect()
    }

    fn dedup_by_ticker(markets: Vec<Market>) -> Vec<Market> {
        let mut seen = std::collections::HashSet::new();
        markets
            .into_iter()
            .filter(|m| seen.insert(m.token_id.clone()))
            .collect()
    }
}

#[async_trait]
impl Discovery for KalshiDiscovery {
    async fn discover_markets(&self, filters: &ListenerFilters) -> Result<Vec<Market>> {
        let filters = match filters {
            ListenerFilters::Kalshi(f) => f,
            ListenerFilters::Polymarket(_) => {
                bail!("polymarket filters passed to kalshi discovery")
            }
        };
        let status = filters.status.as_deref();

        let mut markets: Vec<Market> = Vec::new();

        for series in &filters.series_tickers {
            match self.fetch_markets(Some(series), None, status).await {
                Ok(found) => markets.extend(found),
                Err(e) if crate::clients::is_auth_error(&e) => return Err(e),
                Err(e) => error!("Kalshi series {} fetch failed: {:#}", series, e),
            }
        }

        for event in &filters.event_tickers {
            match self.fetch_markets(None, Some(event), status).await {
                Ok(found) => markets.extend(found),
                Err(e) if crate::clients::is_auth_error(&e) => return Err(e),
                Err(e) => error!("Kalshi event {} fetch failed: {:#}", event, e),
            }
        }

        for ticker in &filters.market_tickers {
            match self.get_market(ticker).await {
                Ok(Some(market)) => markets.push(market),
                Ok(None) => warn!("Kalshi market {} not found", ticker),
                Err(e) if crate::clients::is_auth_error(&e) => return Err(e),
                Err(e) => error!("Kalshi market {} fetch failed: {:#}", ticker, e),
            }
        }

        // No ticker filters at all: fall back to a full status-scoped scan
        if filters.series_tickers.is_empty()
            && filters.event_tickers.is_empty()
            && filters.market_tickers.is_empty()
        {
            markets.extend(self.fetch_markets(None, None, status).await?);
        }

        let filtered = Self::apply_filters(markets, filters);
        let unique = Self::dedup_by_ticker(filtered);

        info!("Kalshi discovery found {} markets", unique.len());
        Ok(unique)
    }

    fn venue_name(&self) -> &'static str {
        "kalshi"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_market() -> Value {
        json!({
            "ticker": "KXNBA-26JAN15-LAL",
            "event_ticker": "KXNBA-26JAN15",
            "series_ticker": "KXNBA",
            "title": "Will the Lakers win on Jan 15?",
            "subtitle": "Lakers vs. Celtics",
            "category": "Sports",
            "status": "open",
            "volume": 15000.0,
            "open_interest": 3200.0,
            "open_time": "2026-01-15T00:00:00Z",
            "close_time": "2026-01-16T04:00:00Z",
            "rules_primary": "Resolves YES if the Lakers win."
        })
    }

    #[test]
    fn test_parse_market_ticker_is_both_ids() {
        let market = KalshiDiscovery::parse_market(&sample_market());
        assert_eq!(market.condition_id, "KXNBA-26JAN15-LAL");
        assert_eq!(market.token_id, "KXNBA-26JAN15-LAL");
        assert_eq!(market.platform, Platform::Kalshi);
        assert_eq!(market.series_id.as_deref(), Some("KXNBA"));
        assert_eq!(market.event_id.as_deref(), Some("KXNBA-26JAN15"));
        assert_eq!(market.volume, Some(15000.0));
        assert_eq!(market.liquidity, Some(3200.0));
        assert!(market.is_active);
        assert!(!market.is_closed);
        assert!(market.start_time.is_some());
        assert!(market.end_time.is_some());
    }

    #[test]
    fn test_parse_market_settled_status() {
        let mut data = sample_market();
        data["status"] = json!("settled");
        let market = KalshiDiscovery::parse_market(&data);
        assert!(!market.is_active);
        assert!(market.is_closed);
    }

    #[test]
    fn test_apply_filters_thresholds_and_title() {
        let markets = vec![KalshiDiscovery::parse_market(&sample_market())];

        let filters = KalshiFilters {
            min_volume: Some(20000.0),
            ..Default::default()
        };
        assert!(KalshiDiscovery::apply_filters(markets.clone(), &filters).is_empty());

        let filters = KalshiFilters {
            min_open_interest: Some(1000.0),
            title_contains: Some("LAKERS".to_string()),
            ..Default::default()
        };
        assert_eq!(KalshiDiscovery::apply_filters(markets, &filters).len(), 1);
    }
}
