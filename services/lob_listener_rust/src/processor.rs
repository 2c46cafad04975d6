//! Per-listener event processor.
//!
//! Drains the data and control queues with strict priority: book and
//! trade events are never head-of-line-blocked behind a discovery burst.
//! Orderbook events are validated, enriched with derived metrics and a
//! content hash, persisted, and only then applied to the forward filler
//! so the next tick observes them. Control events drive the market
//! lifecycle (upsert, state history, subscribe/unsubscribe).

use crate::events::{BoundedQueue, ControlEvent, DataEvent};
use crate::filler::ForwardFiller;
use crate::listener::ListenerStats;
use anyhow::Result;
use log::{error, info, warn};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use ticktape_rust_core::clients::Feed;
use ticktape_rust_core::db::Writer;
use ticktape_rust_core::models::{Market, MarketState};
use tokio_util::sync::CancellationToken;

pub struct EventProcessor {
    listener_id: String,
    data_queue: Arc<BoundedQueue<DataEvent>>,
    control_queue: Arc<BoundedQueue<ControlEvent>>,
    writer: Arc<dyn Writer>,
    filler: Arc<ForwardFiller>,
    feed: Arc<dyn Feed>,
    known_markets: Arc<Mutex<HashMap<String, Market>>>,
    stats: Arc<ListenerStats>,
}

impl EventProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        listener_id: String,
        data_queue: Arc<BoundedQueue<DataEvent>>,
        control_queue: Arc<BoundedQueue<ControlEvent>>,
        writer: Arc<dyn Writer>,
        filler: Arc<ForwardFiller>,
        feed: Arc<dyn Feed>,
        known_markets: Arc<Mutex<HashMap<String, Market>>>,
        stats: Arc<ListenerStats>,
    ) -> Self {
        Self {
            listener_id,
            data_queue,
            control_queue,
            writer,
            filler,
            feed,
            known_markets,
            stats,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!("Event processor started for listener {}", self.listener_id);
        loop {
            if cancel.is_cancelled() {
                break;
            }
            // Strict priority: drain data before touching control
            if let Some(event) = self.data_queue.try_pop() {
                self.handle_data(event).await;
                continue;
            }
            if let Some(event) = self.control_queue.try_pop() {
                self.handle_control(event).await;
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.data_queue.wait_items() => {}
                _ = self.control_queue.wait_items() => {}
            }
        }
        info!("Event processor stopped for listener {}", self.listener_id);
    }

    async fn handle_data(&self, event: DataEvent) {
        match event {
            DataEvent::Orderbook(mut snapshot) => {
                if let Err(e) = snapshot.validate() {
                    warn!("Dropping malformed snapshot: {:#}", e);
                    self.stats.protocol_violations.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                snapshot.compute_metrics();
                snapshot.hash = Some(snapshot.content_hash());
                self.writer.write_orderbook(snapshot.clone()).await;
                self.filler.update_state(&snapshot);
                self.stats.events_processed.fetch_add(1, Ordering::Relaxed);
            }
            DataEvent::Trade(trade) => {
                if let Err(e) = trade.validate() {
                    warn!("Dropping malformed trade: {:#}", e);
                    self.stats.protocol_violations.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                self.writer.write_trade(trade).await;
                self.stats.events_processed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn handle_control(&self, event: ControlEvent) {
        let result = match event {
            ControlEvent::MarketDiscovered(market) => self.on_market_discovered(market).await,
            ControlEvent::MarketRemoved(market) => self.on_market_removed(market).await,
            ControlEvent::MarketStateChanged { market, old_state } => {
                self.on_market_state_changed(market, old_state).await
            }
        };
        if let Err(e) = result {
            error!("Control event failed: {:#}", e);
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn on_market_discovered(&self, mut market: Market) -> Result<()> {
        info!(
            "Market discovered: {} ({})",
            market.token_id,
            market.question.as_deref().unwrap_or("?")
        );
        market.listener_id = Some(self.listener_id.clone());
        let old_state = market.state;
        market.state = MarketState::Subscribed;

        self.writer.write_market(&self.listener_id, &market).await?;
        self.writer
            .write_state_transition(
                &self.listener_id,
                &market.condition_id,
                Some(old_state.as_str()),
                market.state.as_str(),
                json!({"question": market.question, "token_id": market.token_id}),
            )
            .await?;

        self.filler.add_token(&market.token_id, &market.condition_id);
        self.feed.subscribe(&[market.token_id.clone()]).await?;
        self.known_markets
            .lock()
            .unwrap()
            .insert(market.token_id.clone(), market);
        Ok(())
    }

    /// Lifecycle change without a subscription change: the market stays
    /// on the feed (removal is a separate event) but its persisted state
    /// moves on.
    async fn on_market_state_changed(
        &self,
        market: Market,
        old_state: MarketState,
    ) -> Result<()> {
        info!(
            "Market {} state {} -> {}",
            market.token_id,
            old_state.as_str(),
            market.state.as_str()
        );
        self.writer.write_market(&self.listener_id, &market).await?;
        self.writer
            .write_state_transition(
                &self.listener_id,
                &market.condition_id,
                Some(old_state.as_str()),
                market.state.as_str(),
                json!({"token_id": market.token_id}),
            )
            .await?;
        self.known_markets
            .lock()
            .unwrap()
            .insert(market.token_id.clone(), market);
        Ok(())
    }

    async fn on_market_removed(&self, market: Market) -> Result<()> {
        info!(
            "Market removed: {} ({})",
            market.token_id,
            market.question.as_deref().unwrap_or("?")
        );
        self.feed.unsubscribe(&[market.token_id.clone()]).await?;
        self.filler.remove_token(&market.token_id);

        let mut removed = market.clone();
        let old_state = removed.state;
        removed.state = MarketState::Removed;
        self.writer.write_market(&self.listener_id, &removed).await?;
        self.writer
            .write_state_transition(
                &self.listener_id,
                &removed.condition_id,
                Some(old_state.as_str()),
                removed.state.as_str(),
                json!({"token_id": removed.token_id}),
            )
            .await?;

        self.known_markets.lock().unwrap().remove(&removed.token_id);
        Ok(())
    }
}
