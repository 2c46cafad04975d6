//! Polymarket market discovery against the Gamma REST API.
//!
//! Series and tag filters are resolved through `/events` (markets come
//! embedded in their event, which carries the series/tag metadata);
//! explicit condition ids go through `/markets`. A condition with N
//! outcome tokens fans out into N Market rows sharing the condition_id.

use crate::clients::Discovery;
use crate::models::{ListenerFilters, Market, Platform, PolymarketFilters};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

const GAMMA_BASE_URL: &str = "https://gamma-api.polymarket.com";
const PAGE_SIZE: usize = 100;
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct PolymarketDiscovery {
    client: Client,
    base_url: String,
}

impl PolymarketDiscovery {
    pub fn new() -> Result<Self> {
        Self::with_base_url(GAMMA_BASE_URL.to_string())
    }

    pub fn with_base_url(base_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client for Polymarket")?;
        Ok(Self { client, base_url })
    }

    /// Gamma serializes some array fields either as JSON arrays or as
    /// JSON-encoded strings depending on the endpoint.
    pub fn parse_json_string_or_array(v: &Value) -> Vec<String> {
        match v {
            Value::Array(arr) => arr
                .iter()
                .map(|item| item.as_str().unwrap_or_default().to_string())
                .collect(),
            Value::String(s) => {
                let parsed: Value = serde_json::from_str(s).unwrap_or(Value::Null);
                if let Value::Array(arr) = parsed {
                    arr.iter()
                        .map(|item| item.as_str().unwrap_or_default().to_string())
                        .collect()
                } else {
                    vec![]
                }
            }
            _ => vec![],
        }
    }

    /// Numeric fields arrive as numbers or numeric strings.
    fn value_f64(v: Option<&Value>) -> Option<f64> {
        match v {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }

    fn value_datetime(v: Option<&Value>) -> Option<DateTime<Utc>> {
        v.and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    async fn get_with_rate_limit(&self, url: &str, params: &[(&str, String)]) -> Result<Value> {
        let mut attempt = 0;
        loop {
            let resp = self
                .client
                .get(url)
                .query(params)
                .send()
                .await
                .with_context(|| format!("Gamma request failed: {}", url))?;

            if resp.status().as_u16() == 429 && attempt < MAX_RATE_LIMIT_RETRIES {
                let delay = resp
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(1);
                warn!("Gamma rate limited, retrying in {}s", delay);
                tokio::time::sleep(Duration::from_secs(delay)).await;
                attempt += 1;
                continue;
            }

            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                bail!("Gamma API error ({}): {}", status, text);
            }

            return resp.json().await.context("Gamma response was not JSON");
        }
    }

    /// Paginated fetch of active events matching the given query params.
    async fn fetch_events(&self, extra: &[(&str, String)]) -> Result<Vec<Value>> {
        let url = format!("{}/events", self.base_url);
        let mut events = Vec::new();
        let mut offset = 0usize;

        loop {
            let mut params: Vec<(&str, String)> = vec![
                ("limit", PAGE_SIZE.to_string()),
                ("offset", offset.to_string()),
                ("active", "true".to_string()),
                ("closed", "false".to_string()),
            ];
            params.extend(extra.iter().cloned());

            let page = self.get_with_rate_limit(&url, &params).await?;
            let batch = match page {
                Value::Array(arr) => arr,
                _ => bail!("Gamma /events returned a non-array payload"),
            };
            let count = batch.len();
            events.extend(batch);
            if count < PAGE_SIZE {
                break;
            }
            offset += count;
        }

        Ok(events)
    }

    async fn fetch_by_condition(&self, condition_id: &str) -> Result<Vec<Market>> {
        let url = format!("{}/markets", self.base_url);
        let params = vec![("condition_id", condition_id.to_string())];
        let data = self.get_with_rate_limit(&url, &params).await?;
        let mut markets = Vec::new();
        if let Value::Array(arr) = data {
            for market_data in &arr {
                markets.extend(Self::parse_market(market_data, None));
            }
        }
        Ok(markets)
    }

    fn parse_events(events: &[Value]) -> Vec<Market> {
        let mut markets = Vec::new();
        for event in events {
            let embedded = event
                .get("markets")
                .and_then(|m| m.as_array())
                .cloned()
                .unwrap_or_default();
            for market_data in &embedded {
                markets.extend(Self::parse_market(market_data, Some(event)));
            }
        }
        markets
    }

    /// One Market per outcome token. Markets with no CLOB token ids carry
    /// nothing subscribable and are skipped.
    fn parse_market(data: &Value, event: Option<&Value>) -> Vec<Market> {
        let condition_id = data
            .get("conditionId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let clob_ids = data
            .get("clobTokenIds")
            .map(Self::parse_json_string_or_array)
            .unwrap_or_default();
        if clob_ids.is_empty() {
            debug!("Skipping market without token ids: {}", condition_id);
            return vec![];
        }

        let outcomes = data
            .get("outcomes")
            .map(Self::parse_json_string_or_array)
            .unwrap_or_default();

        let tags = event.and_then(|e| e.get("tags")).filter(|t| t.is_array());
        let (category, subcategory) = match tags.and_then(|t| t.as_array()) {
            Some(list) => {
                let label = |i: usize| {
                    list.get(i)
                        .and_then(|t| t.get("label"))
                        .and_then(|l| l.as_str())
                        .map(|s| s.to_string())
                };
                (label(0), label(1))
            }
            None => (None, None),
        };

        let series_id = event
            .and_then(|e| e.get("series"))
            .and_then(|s| s.as_array())
            .and_then(|s| s.first())
            .and_then(|s| s.get("id"))
            .map(|id| match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });

        let mut out = Vec::with_capacity(clob_ids.len());
        for (i, token_id) in clob_ids.into_iter().enumerate() {
            if token_id.is_empty() {
                continue;
            }
            let mut market = Market::new(Platform::Polymarket, condition_id.clone(), token_id);
            market.market_slug = data.get("slug").and_then(|v| v.as_str()).map(String::from);
            market.event_slug = event
                .and_then(|e| e.get("slug"))
                .and_then(|v| v.as_str())
                .map(String::from);
            market.question = data
                .get("question")
                .and_then(|v| v.as_str())
                .map(String::from);
            market.outcome = outcomes.get(i).cloned();
            market.outcome_index = Some(i as i32);
            market.event_id = event.and_then(|e| e.get("id")).map(|id| match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
            market.event_title = event
                .and_then(|e| e.get("title"))
                .and_then(|v| v.as_str())
                .map(String::from);
            market.category = category.clone();
            market.subcategory = subcategory.clone();
            market.series_id = series_id.clone();
            market.tags = tags.cloned();
            market.description = data
                .get("description")
                .and_then(|v| v.as_str())
                .map(String::from);
            market.start_time = Self::value_datetime(data.get("startDate"));
            market.end_time = Self::value_datetime(data.get("endDate"));
            market.volume = Self::value_f64(data.get("volume"));
            market.liquidity = Self::value_f64(data.get("liquidity"));
            market.is_active = data.get("active").and_then(|v| v.as_bool()).unwrap_or(true);
            market.is_closed = data.get("closed").and_then(|v| v.as_bool()).unwrap_or(false);
            out.push(market);
        }
        out
    }

    fn filter_by_slug(markets: Vec<Market>, patterns: &[String]) -> Vec<Market> {
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_lowercase()).collect();
        markets
            .into_iter()
            .filter(|m| {
                let slug = m
                    .market_slug
                    .as_deref()
                    .or(m.event_slug.as_deref())
                    .unwrap_or("")
                    .to_lowercase();
                patterns.iter().any(|p| slug.contains(p.as_str()))
            })
            .collect()
    }

    fn apply_thresholds(markets: Vec<Market>, filters: &PolymarketFilters) -> Vec<Market> {
        markets
            .into_iter()
            .filter(|m| {
                if let Some(min) = filters.min_liquidity {
                    if m.liquidity.unwrap_or(0.0) < min {
                        return false;
                    }
                }
                if let Some(min) = filters.min_volume {
                    if m.volume.unwrap_or(0.0) < min {
                        return false;
                    }
                }
                true
            })
            .collect()
    }

    fn dedup_by_token(markets: Vec<Market>) -> Vec<Market> {
        let mut seen = std::collections::HashSet::new();
        markets
            .into_iter()
            .filter(|m| seen.insert(m.token_id.clone()))
            .collect()
    }
}

#[async_trait]
impl Discovery for PolymarketDiscovery {
    async fn discover_markets(&self, filters: &ListenerFilters) -> Result<Vec<Market>> {
        let filters = match filters {
            ListenerFilters::Polymarket(f) => f,
            ListenerFilters::Kalshi(_) => bail!("kalshi filters passed to polymarket discovery"),
        };

        let mut markets: Vec<Market> = Vec::new();

        for series_id in &filters.series_ids {
            match self.fetch_events(&[("series_id", series_id.clone())]).await {
                Ok(events) => markets.extend(Self::parse_events(&events)),
                Err(e) => error!("Polymarket series {} fetch failed: {:#}", series_id, e),
            }
        }

        for tag_id in &filters.tag_ids {
            match self.fetch_events(&[("tag_id", tag_id.to_string())]).await {
                Ok(events) => markets.extend(Self::parse_events(&events)),
                Err(e) => error!("Polymarket tag {} fetch failed: {:#}", tag_id, e),
            }
        }

        for condition_id in &filters.condition_ids {
            match self.fetch_by_condition(condition_id).await {
                Ok(found) => markets.extend(found),
                Err(e) => error!("Polymarket condition {} fetch failed: {:#}", condition_id, e),
            }
        }

        if !filters.slug_patterns.is_empty() {
            markets = Self::filter_by_slug(markets, &filters.slug_patterns);
        }
        markets = Self::apply_thresholds(markets, filters);
        let unique = Self::dedup_by_token(markets);

        info!("Polymarket discovery found {} markets", unique.len());
        Ok(unique)
    }

    fn venue_name(&self) -> &'static str {
        "polymarket"
    }
}
