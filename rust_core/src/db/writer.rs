//! Buffered, batched Postgres sink.
//!
//! `write_orderbook` / `write_trade` only append to an in-memory buffer;
//! a background task per table flushes every second, and a buffer
//! reaching 100 records flushes inline. Inserts are idempotent
//! (`ON CONFLICT DO NOTHING` / market upsert), so delivery is
//! at-least-once. A batch still failing after five retries is dropped
//! with an error log rather than stalling the pipeline, and
//! schemas missing the optional `platform` / `is_forward_filled` /
//! `source_timestamp` columns cause the writer to downgrade and strip
//! those fields.

use crate::models::{Market, OrderbookSnapshot, Trade};
use crate::utils::backoff::Backoff;
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const BATCH_SIZE: usize = 100;
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const MAX_FLUSH_ATTEMPTS: u32 = 5;

#[derive(Clone)]
pub struct PostgresWriter {
    inner: Arc<WriterInner>,
}

struct WriterInner {
    pool: PgPool,
    orderbooks: Mutex<Vec<OrderbookSnapshot>>,
    trades: Mutex<Vec<Trade>>,
    schema_has_platform: AtomicBool,
    schema_has_fill_columns: AtomicBool,
    running: AtomicBool,
    rows_written: AtomicU64,
    batches_dropped: AtomicU64,
}

impl PostgresWriter {
    pub fn new(pool: PgPool) -> Self {
        Self {
            inner: Arc::new(WriterInner {
                pool,
                orderbooks: Mutex::new(Vec::new()),
                trades: Mutex::new(Vec::new()),
                schema_has_platform: AtomicBool::new(true),
                schema_has_fill_columns: AtomicBool::new(true),
                running: AtomicBool::new(false),
                rows_written: AtomicU64::new(0),
                batches_dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Spawn the periodic flush tasks (one per buffered table).
    pub fn start(&self) {
        self.inner.running.store(true, Ordering::SeqCst);

        let writer = self.clone();
        tokio::spawn(async move {
            while writer.inner.running.load(Ordering::SeqCst) {
                tokio::time::sleep(FLUSH_INTERVAL).await;
                writer.flush_orderbooks().await;
            }
        });

        let writer = self.clone();
        tokio::spawn(async move {
            while writer.inner.running.load(Ordering::SeqCst) {
                tokio::time::sleep(FLUSH_INTERVAL).await;
                writer.flush_trades().await;
            }
        });

        info!("Postgres writer started");
    }

    /// Stop the flush tasks and drain what is buffered.
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.flush().await;
        info!(
            "Postgres writer stopped ({} rows written, {} batches dropped)",
            self.inner.rows_written.load(Ordering::Relaxed),
            self.inner.batches_dropped.load(Ordering::Relaxed)
        );
    }

    pub fn rows_written(&self) -> u64 {
        self.inner.rows_written.load(Ordering::Relaxed)
    }

    pub fn batches_dropped(&self) -> u64 {
        self.inner.batches_dropped.load(Ordering::Relaxed)
    }

    pub async fn write_orderbook(&self, snapshot: OrderbookSnapshot) {
        let should_flush = {
            let mut buffer = self.inner.orderbooks.lock().await;
            buffer.push(snapshot);
            buffer.len() >= BATCH_SIZE
        };
        if should_flush {
            self.flush_orderbooks().await;
        }
    }

    pub async fn write_trade(&self, trade: Trade) {
        let should_flush = {
            let mut buffer = self.inner.trades.lock().await;
            buffer.push(trade);
            buffer.len() >= BATCH_SIZE
        };
        if should_flush {
            self.flush_trades().await;
        }
    }

    /// Blocking flush of both buffers.
    pub async fn flush(&self) {
        self.flush_orderbooks().await;
        self.flush_trades().await;
    }

    async fn flush_orderbooks(&self) {
        let batch: Vec<OrderbookSnapshot> = {
            let mut buffer = self.inner.orderbooks.lock().await;
            if buffer.is_empty() {
                return;
            }
            std::mem::take(&mut *buffer)
        };

        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(10));
        let mut attempts = 0;
        loop {
            match self.insert_orderbooks(&batch).await {
                Ok(()) => {
                    self.inner
                        .rows_written
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    debug!("Flushed {} orderbook snapshots", batch.len());
                    return;
                }
                Err(e) => {
                    let text = format!("{:#}", e).to_lowercase();
                    if self.downgrade_schema(&text) {
                        continue; // Retry immediately without the missing columns
                    }
                    if is_fk_violation(&text) {
                        // Snapshots for markets we never managed to upsert
                        // will never succeed
                        warn!("Dropping {} snapshots on FK violation", batch.len());
                        self.inner.batches_dropped.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    attempts += 1;
                    if attempts >= MAX_FLUSH_ATTEMPTS {
                        error!(
                            "Dropping {} snapshots after {} failed flushes: {:#}",
                            batch.len(),
                            attempts,
                            e
                        );
                        self.inner.batches_dropped.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    let delay = backoff.next_delay();
                    warn!(
                        "Orderbook flush failed (attempt {}/{}), retrying in {:?}: {:#}",
                        attempts, MAX_FLUSH_ATTEMPTS, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn flush_trades(&self) {
        let batch: Vec<Trade> = {
            let mut buffer = self.inner.trades.lock().await;
            if buffer.is_empty() {
                return;
            }
            std::mem::take(&mut *buffer)
        };

        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(10));
        let mut attempts = 0;
        loop {
            match self.insert_trades(&batch).await {
                Ok(()) => {
                    self.inner
                        .rows_written
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    debug!("Flushed {} trades", batch.len());
                    return;
                }
                Err(e) => {
                    let text = format!("{:#}", e).to_lowercase();
                    if self.downgrade_schema(&text) {
                        continue;
                    }
                    if is_fk_violation(&text) {
                        warn!("Dropping {} trades on FK violation", batch.len());
                        self.inner.batches_dropped.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    attempts += 1;
                    if attempts >= MAX_FLUSH_ATTEMPTS {
                        error!(
                            "Dropping {} trades after {} failed flushes: {:#}",
                            batch.len(),
                            attempts,
                            e
                        );
                        self.inner.batches_dropped.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    let delay = backoff.next_delay();
                    warn!(
                        "Trade flush failed (attempt {}/{}), retrying in {:?}: {:#}",
                        attempts, MAX_FLUSH_ATTEMPTS, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Flip schema capability flags when the error names a known optional
    /// column. Returns true when a downgrade happened (caller should
    /// retry immediately).
    fn downgrade_schema(&self, error_text: &str) -> bool {
        if self.inner.schema_has_fill_columns.load(Ordering::SeqCst)
            && (is_missing_column(error_text, "is_forward_filled")
                || is_missing_column(error_text, "source_timestamp"))
        {
            warn!("Schema lacks forward-fill columns, stripping them from writes");
            self.inner
                .schema_has_fill_columns
                .store(false, Ordering::SeqCst);
            return true;
        }
        if self.inner.schema_has_platform.load(Ordering::SeqCst)
            && is_missing_column(error_text, "platform")
        {
            warn!("Schema lacks platform column, stripping it from writes");
            self.inner.schema_has_platform.store(false, Ordering::SeqCst);
            return true;
        }
        false
    }

    async fn insert_orderbooks(&self, batch: &[OrderbookSnapshot]) -> Result<()> {
        let has_platform = self.inner.schema_has_platform.load(Ordering::SeqCst);
        let has_fill = self.inner.schema_has_fill_columns.load(Ordering::SeqCst);
        let sql = snapshot_insert_sql(has_platform, has_fill);

        let mut tx = self.inner.pool.begin().await.context("begin failed")?;
        for snapshot in batch {
            let bids = serde_json::to_value(&snapshot.bids).unwrap_or_default();
            let asks = serde_json::to_value(&snapshot.asks).unwrap_or_default();
            let mut query = sqlx::query(&sql)
                .bind(&snapshot.listener_id)
                .bind(&snapshot.asset_id)
                .bind(&snapshot.market)
                .bind(snapshot.timestamp_ms)
                .bind(bids)
                .bind(asks)
                .bind(snapshot.best_bid)
                .bind(snapshot.best_ask)
                .bind(snapshot.spread)
                .bind(snapshot.mid_price)
                .bind(snapshot.bid_depth)
                .bind(snapshot.ask_depth)
                .bind(&snapshot.hash)
                .bind(&snapshot.raw_payload);
            if has_fill {
                query = query
                    .bind(snapshot.is_forward_filled)
                    .bind(snapshot.source_timestamp_ms);
            }
            if has_platform {
                query = query.bind(snapshot.platform.as_str());
            }
            query.execute(&mut *tx).await.context("snapshot insert failed")?;
        }
        tx.commit().await.context("commit failed")?;
        Ok(())
    }

    async fn insert_trades(&self, batch: &[Trade]) -> Result<()> {
        let has_platform = self.inner.schema_has_platform.load(Ordering::SeqCst);
        let sql = trade_insert_sql(has_platform);

        let mut tx = self.inner.pool.begin().await.context("begin failed")?;
        for trade in batch {
            let mut query = sqlx::query(&sql)
                .bind(&trade.listener_id)
                .bind(&trade.asset_id)
                .bind(&trade.market)
                .bind(trade.timestamp_ms)
                .bind(trade.price)
                .bind(trade.size)
                .bind(trade.side.as_str())
                .bind(trade.fee_rate_bps)
                .bind(&trade.raw_payload);
            if has_platform {
                query = query.bind(trade.platform.as_str());
            }
            query.execute(&mut *tx).await.context("trade insert failed")?;
        }
        tx.commit().await.context("commit failed")?;
        Ok(())
    }

    /// Upsert one market row on (listener_id, token_id).
    pub async fn write_market(&self, listener_id: &str, market: &Market) -> Result<()> {
        let has_platform = self.inner.schema_has_platform.load(Ordering::SeqCst);
        match self.insert_market(listener_id, market, has_platform).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let text = format!("{:#}", e).to_lowercase();
                if self.downgrade_schema(&text) {
                    self.insert_market(listener_id, market, false).await
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn insert_market(
        &self,
        listener_id: &str,
        market: &Market,
        has_platform: bool,
    ) -> Result<()> {
        let sql = market_upsert_sql(has_platform);
        let mut query = sqlx::query(&sql)
            .bind(listener_id)
            .bind(&market.condition_id)
            .bind(&market.token_id)
            .bind(&market.market_slug)
            .bind(&market.event_slug)
            .bind(&market.question)
            .bind(&market.outcome)
            .bind(market.outcome_index)
            .bind(&market.event_id)
            .bind(&market.event_title)
            .bind(&market.category)
            .bind(&market.subcategory)
            .bind(&market.series_id)
            .bind(&market.tags)
            .bind(&market.description)
            .bind(market.start_time)
            .bind(market.end_time)
            .bind(market.volume)
            .bind(market.liquidity)
            .bind(market.is_active)
            .bind(market.is_closed)
            .bind(market.state.as_str());
        if has_platform {
            query = query.bind(market.platform.as_str());
        }
        query
            .execute(&self.inner.pool)
            .await
            .context("market upsert failed")?;
        Ok(())
    }

    /// Append one row to the market state history table.
    pub async fn write_state_transition(
        &self,
        listener_id: &str,
        condition_id: &str,
        old_state: Option<&str>,
        new_state: &str,
        metadata: serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO market_state_history (listener_id, condition_id, previous_state, new_state, metadata)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(listener_id)
        .bind(condition_id)
        .bind(old_state)
        .bind(new_state)
        .bind(metadata)
        .execute(&self.inner.pool)
        .await
        .context("state transition insert failed")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl crate::db::Writer for PostgresWriter {
    async fn write_orderbook(&self, snapshot: OrderbookSnapshot) {
        PostgresWriter::write_orderbook(self, snapshot).await
    }

    async fn write_trade(&self, trade: Trade) {
        PostgresWriter::write_trade(self, trade).await
    }

    async fn write_market(&self, listener_id: &str, market: &Market) -> Result<()> {
        PostgresWriter::write_market(self, listener_id, market).await
    }

    async fn write_state_transition(
        &self,
        listener_id: &str,
        condition_id: &str,
        old_state: Option<&str>,
        new_state: &str,
        metadata: serde_json::Value,
    ) -> Result<()> {
        PostgresWriter::write_state_transition(
            self,
            listener_id,
            condition_id,
            old_state,
            new_state,
            metadata,
        )
        .await
    }

    async fn flush(&self) {
        PostgresWriter::flush(self).await
    }
}

fn is_fk_violation(error_text: &str) -> bool {
    error_text.contains("foreign key constraint")
}

fn is_missing_column(error_text: &str, column: &str) -> bool {
    error_text.contains("column") && error_text.contains(column)
}

fn snapshot_insert_sql(has_platform: bool, has_fill: bool) -> String {
    let mut columns = vec![
        "listener_id",
        "asset_id",
        "market",
        "timestamp",
        "bids",
        "asks",
        "best_bid",
        "best_ask",
        "spread",
        "mid_price",
        "bid_depth",
        "ask_depth",
        "hash",
        "raw_payload",
    ];
    if has_fill {
        columns.push("is_forward_filled");
        columns.push("source_timestamp");
    }
    if has_platform {
        columns.push("platform");
    }
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${}", i)).collect();
    format!(
        "INSERT INTO orderbook_snapshots ({}) VALUES ({}) ON CONFLICT DO NOTHING",
        columns.join(", "),
        placeholders.join(", ")
    )
}

fn trade_insert_sql(has_platform: bool) -> String {
    let mut columns = vec![
        "listener_id",
        "asset_id",
        "market",
        "timestamp",
        "price",
        "size",
        "side",
        "fee_rate_bps",
        "raw_payload",
    ];
    if has_platform {
        columns.push("platform");
    }
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${}", i)).collect();
    format!(
        "INSERT INTO trades ({}) VALUES ({}) ON CONFLICT DO NOTHING",
        columns.join(", "),
        placeholders.join(", ")
    )
}

fn market_upsert_sql(has_platform: bool) -> String {
    let mut columns = vec![
        "listener_id",
        "condition_id",
        "token_id",
        "market_slug",
        "event_slug",
        "question",
        "outcome",
        "outcome_index",
        "event_id",
        "event_title",
        "category",
        "subcategory",
        "series_id",
        "tags",
        "description",
        "start_time",
        "end_time",
        "volume",
        "liquidity",
        "is_active",
        "is_closed",
        "state",
    ];
    if has_platform {
        columns.push("platform");
    }
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${}", i)).collect();
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| **c != "listener_id" && **c != "token_id")
        .map(|c| format!("{} = EXCLUDED.{}", c, c))
        .collect();
    format!(
        "INSERT INTO markets ({}) VALUES ({}) ON CONFLICT (listener_id, token_id) DO UPDATE SET {}, updated_at = NOW()",
        columns.join(", "),
        placeholders.join(", "),
        updates.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_sql_column_variants() {
        let full = snapshot_insert_sql(true, true);
        assert!(full.contains("is_forward_filled"));
        assert!(full.contains("source_timestamp"));
        assert!(full.contains("platform"));
        assert!(full.contains("$17"));
        assert!(full.contains("ON CONFLICT DO NOTHING"));

        let legacy = snapshot_insert_sql(false, false);
        assert!(!legacy.contains("is_forward_filled"));
        assert!(!legacy.contains("platform"));
        assert!(legacy.contains("$14"));
        assert!(!legacy.contains("$15"));
    }

    #[test]
    fn test_trade_sql_column_variants() {
        let full = trade_insert_sql(true);
        assert!(full.contains("platform"));
        assert!(full.contains("$10"));

        let legacy = trade_insert_sql(false);
        assert!(!legacy.contains("platform"));
        assert!(legacy.contains("$9"));
        assert!(!legacy.contains("$10"));
    }

    #[test]
    fn test_market_upsert_shape() {
        let sql = market_upsert_sql(true);
        assert!(sql.contains("ON CONFLICT (listener_id, token_id) DO UPDATE"));
        assert!(sql.contains("state = EXCLUDED.state"));
        assert!(sql.contains("platform = EXCLUDED.platform"));
        assert!(!sql.contains("listener_id = EXCLUDED.listener_id"));
        assert!(sql.contains("updated_at = NOW()"));
    }

    #[test]
    fn test_error_classifiers() {
        assert!(is_fk_violation(
            "insert or update on table violates foreign key constraint"
        ));
        assert!(!is_fk_violation("connection refused"));

        assert!(is_missing_column(
            "error: column \"platform\" of relation \"trades\" does not exist",
            "platform"
        ));
        assert!(!is_missing_column("platform mismatch in payload", "platform"));
    }
}
