//! State forward-filler: turns the sparse event stream into a
//! regularly-sampled one.
//!
//! Real events update per-token state immediately (through the event
//! processor); between events the tick loop emits a clone of the last
//! known snapshot every `emit_interval_ms`, stamped with the current
//! time and marked `is_forward_filled`. Emitted timestamps are strictly
//! monotonic per token. State lives only in memory and is rebuilt from
//! the feed after a restart.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use ticktape_rust_core::db::Writer;
use ticktape_rust_core::models::OrderbookSnapshot;
use ticktape_rust_core::utils::time::now_ms;
use tokio_util::sync::CancellationToken;

/// Last known orderbook state for one tracked token.
#[derive(Debug, Clone)]
struct TokenState {
    market_id: String,
    last_snapshot: Option<OrderbookSnapshot>,
    last_real_event_ms: Option<i64>,
    last_emit_ms: Option<i64>,
    last_emit_hash: Option<String>,
    tracking_since_ms: i64,
}

pub struct ForwardFiller {
    listener_id: String,
    emit_interval: Duration,
    enabled: bool,
    writer: Arc<dyn Writer>,
    tokens: Mutex<HashMap<String, TokenState>>,
}

impl ForwardFiller {
    pub fn new(
        listener_id: String,
        emit_interval_ms: u64,
        enabled: bool,
        writer: Arc<dyn Writer>,
    ) -> Self {
        Self {
            listener_id,
            emit_interval: Duration::from_millis(emit_interval_ms.max(1)),
            enabled,
            writer,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Start tracking a token. Idempotent.
    pub fn add_token(&self, token_id: &str, market_id: &str) {
        let mut tokens = self.tokens.lock().unwrap();
        if !tokens.contains_key(token_id) {
            tokens.insert(
                token_id.to_string(),
                TokenState {
                    market_id: market_id.to_string(),
                    last_snapshot: None,
                    last_real_event_ms: None,
                    last_emit_ms: None,
                    last_emit_hash: None,
                    tracking_since_ms: now_ms(),
                },
            );
            debug!("Forward filler tracking token {}", token_id);
        }
    }

    /// Stop tracking a token. Idempotent.
    pub fn remove_token(&self, token_id: &str) {
        if let Some(state) = self.tokens.lock().unwrap().remove(token_id) {
            debug!(
                "Forward filler dropped token {} (market {}, tracked {}ms)",
                token_id,
                state.market_id,
                now_ms().saturating_sub(state.tracking_since_ms)
            );
        }
    }

    /// Record a real event. O(1); called by the processor for every
    /// orderbook event, before any later tick can observe it.
    pub fn update_state(&self, snapshot: &OrderbookSnapshot) {
        let mut tokens = self.tokens.lock().unwrap();
        if let Some(state) = tokens.get_mut(&snapshot.asset_id) {
            state.last_real_event_ms = Some(snapshot.timestamp_ms);
            state.last_snapshot = Some(snapshot.clone());
        }
    }

    pub fn tracked_token_count(&self) -> usize {
        self.tokens.lock().unwrap().len()
    }

    pub fn tokens_with_state(&self) -> usize {
        self.tokens
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.last_snapshot.is_some())
            .count()
    }

    /// One emission pass at `now`. Returns the snapshots to route to the
    /// sink; separated from the loop so the cadence logic is testable.
    fn tick(&self, now: i64) -> Vec<OrderbookSnapshot> {
        let interval_ms = self.emit_interval.as_millis() as i64;
        let mut emissions = Vec::new();
        let mut tokens = self.tokens.lock().unwrap();

        for (token_id, state) in tokens.iter_mut() {
            let snapshot = match &state.last_snapshot {
                Some(s) => s,
                None => continue, // No state yet for this token
            };

            let hash = snapshot
                .hash
                .clone()
                .unwrap_or_else(|| snapshot.content_hash());

            // Suppress the duplicate right at the cadence boundary: the
            // book has not changed and the real event is fresher than one
            // interval
            if let (Some(last_hash), Some(last_real)) =
                (&state.last_emit_hash, state.last_real_event_ms)
            {
                if *last_hash == hash && now.saturating_sub(last_real) < interval_ms {
                    continue;
                }
            }

            // Strictly monotonic per token even under clock jitter
            let mut stamp = now;
            if let Some(last_emit) = state.last_emit_ms {
                if stamp <= last_emit {
                    stamp = last_emit + 1;
                }
            }

            let mut filled = snapshot.forward_filled_copy(stamp);
            filled.source_timestamp_ms = state.last_real_event_ms;
            state.last_emit_ms = Some(stamp);
            state.last_emit_hash = Some(hash);
            debug!("Forward fill for {} at {}", token_id, stamp);
            emissions.push(filled);
        }

        emissions
    }

    /// Periodic emission loop. A no-op task when forward fill is disabled
    /// for the listener (real events still flow through the processor).
    pub async fn run(&self, cancel: CancellationToken) {
        if !self.enabled {
            info!(
                "Forward fill disabled for listener {}, ticker idle",
                self.listener_id
            );
            cancel.cancelled().await;
            return;
        }

        info!(
            "Forward filler started for listener {} (interval {:?})",
            self.listener_id, self.emit_interval
        );
        let mut ticker = tokio::time::interval(self.emit_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let emissions = self.tick(now_ms());
                    if emissions.len() > 500 {
                        warn!(
                            "Forward filler emitting {} snapshots in one tick for listener {}",
                            emissions.len(),
                            self.listener_id
                        );
                    }
                    for snapshot in emissions {
                        self.writer.write_orderbook(snapshot).await;
                    }
                }
            }
        }
        info!("Forward filler stopped for listener {}", self.listener_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use ticktape_rust_core::models::{Market, OrderLevel, Platform, Trade};

    /// Sink stub: collects snapshots in memory.
    #[derive(Default)]
    struct MockWriter {
        snapshots: Mutex<Vec<OrderbookSnapshot>>,
    }

    #[async_trait::async_trait]
    impl Writer for MockWriter {
        async fn write_orderbook(&self, snapshot: OrderbookSnapshot) {
            self.snapshots.lock().unwrap().push(snapshot);
        }
        async fn write_trade(&self, _trade: Trade) {}
        async fn write_market(&self, _listener_id: &str, _market: &Market) -> Result<()> {
            Ok(())
        }
        async fn write_state_transition(
            &self,
            _listener_id: &str,
            _condition_id: &str,
            _old_state: Option<&str>,
            _new_state: &str,
            _metadata: serde_json::Value,
        ) -> Result<()> {
            Ok(())
        }
        async fn flush(&self) {}
    }

    fn filler(interval_ms: u64) -> ForwardFiller {
        ForwardFiller::new(
            "l1".to_string(),
            interval_ms,
            true,
            Arc::new(MockWriter::default()),
        )
    }

    fn real_snapshot(token: &str, timestamp_ms: i64, bid: f64) -> OrderbookSnapshot {
        let mut snap = OrderbookSnapshot::new(
            "l1".to_string(),
            Platform::Polymarket,
            token.to_string(),
            "0xabc".to_string(),
            timestamp_ms,
            vec![OrderLevel::new(bid, 10.0)],
            vec![OrderLevel::new(bid + 0.01, 15.0)],
            None,
        );
        snap.compute_metrics();
        snap.hash = Some(snap.content_hash());
        snap
    }

    #[test]
    fn test_add_remove_idempotent() {
        let filler = filler(100);
        filler.add_token("T1", "0xabc");
        filler.add_token("T1", "0xabc");
        assert_eq!(filler.tracked_token_count(), 1);
        filler.remove_token("T1");
        filler.remove_token("T1");
        assert_eq!(filler.tracked_token_count(), 0);
    }

    #[test]
    fn test_no_emission_without_state() {
        let filler = filler(100);
        filler.add_token("T1", "0xabc");
        assert!(filler.tick(1_000).is_empty());
        assert_eq!(filler.tokens_with_state(), 0);
    }

    #[test]
    fn test_update_ignored_for_untracked_token() {
        let filler = filler(100);
        filler.update_state(&real_snapshot("GHOST", 0, 0.5));
        assert_eq!(filler.tracked_token_count(), 0);
    }

    #[test]
    fn test_forward_fill_cadence() {
        // Scenario: one real event at t=0, 100 ms interval, silence for 1 s
        let filler = filler(100);
        filler.add_token("T1", "0xabc");
        filler.update_state(&real_snapshot("T1", 0, 0.52));

        let mut emitted = Vec::new();
        let mut t = 100;
        while t <= 1_000 {
            emitted.extend(filler.tick(t));
            t += 100;
        }

        assert!(emitted.len() >= 9 && emitted.len() <= 11, "{}", emitted.len());
        for snap in &emitted {
            assert!(snap.is_forward_filled);
            assert_eq!(snap.source_timestamp_ms, Some(0));
            assert!(snap.raw_payload.is_none());
        }
        // Strictly monotonic timestamps
        for pair in emitted.windows(2) {
            assert!(pair[0].timestamp_ms < pair[1].timestamp_ms);
        }
    }

    #[test]
    fn test_monotonic_bump_on_clock_stall() {
        let filler = filler(100);
        filler.add_token("T1", "0xabc");
        filler.update_state(&real_snapshot("T1", 0, 0.52));

        let first = filler.tick(200);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].timestamp_ms, 200);

        // Clock did not advance; the stamp must still move forward
        let second = filler.tick(200);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].timestamp_ms, 201);
    }

    #[test]
    fn test_boundary_duplicate_suppressed() {
        let filler = filler(100);
        filler.add_token("T1", "0xabc");

        filler.update_state(&real_snapshot("T1", 0, 0.52));
        let first = filler.tick(100);
        assert_eq!(first.len(), 1);

        // A fresher real event with the same book content lands, then a
        // tick fires less than one interval later: suppressed
        filler.update_state(&real_snapshot("T1", 150, 0.52));
        assert!(filler.tick(180).is_empty());

        // Once a full interval has passed since the real event, fills resume
        let resumed = filler.tick(260);
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0].source_timestamp_ms, Some(150));
    }

    #[test]
    fn test_changed_book_not_suppressed() {
        let filler = filler(100);
        filler.add_token("T1", "0xabc");
        filler.update_state(&real_snapshot("T1", 0, 0.52));
        filler.tick(100);

        // Book content changed; even a fresh real event does not suppress
        filler.update_state(&real_snapshot("T1", 150, 0.55));
        let emitted = filler.tick(180);
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].best_bid, Some(0.55));
    }

    #[test]
    fn test_empty_book_forward_fills() {
        let filler = filler(100);
        filler.add_token("T1", "0xabc");
        let mut snap = OrderbookSnapshot::new(
            "l1".to_string(),
            Platform::Polymarket,
            "T1".to_string(),
            "0xabc".to_string(),
            0,
            vec![],
            vec![],
            None,
        );
        snap.compute_metrics();
        snap.hash = Some(snap.content_hash());
        filler.update_state(&snap);

        let emitted = filler.tick(100);
        assert_eq!(emitted.len(), 1);
        assert!(emitted[0].bids.is_empty());
        assert!(emitted[0].best_bid.is_none());
        assert!(emitted[0].is_forward_filled);
    }

    #[test]
    fn test_removed_token_stops_emitting() {
        let filler = filler(100);
        filler.add_token("T1", "0xabc");
        filler.update_state(&real_snapshot("T1", 0, 0.52));
        assert_eq!(filler.tick(100).len(), 1);

        filler.remove_token("T1");
        assert!(filler.tick(200).is_empty());
    }

    #[test]
    fn test_two_tokens_independent() {
        let filler = filler(100);
        filler.add_token("T1", "0xabc");
        filler.add_token("T2", "0xdef");
        filler.update_state(&real_snapshot("T1", 0, 0.52));

        let emitted = filler.tick(200);
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].asset_id, "T1");

        filler.update_state(&real_snapshot("T2", 210, 0.40));
        let emitted = filler.tick(400);
        assert_eq!(emitted.len(), 2);
    }
}
