pub mod pool;
pub mod writer;

pub use pool::{create_pool, DbPoolConfig};
pub use writer::PostgresWriter;

use crate::models::{Market, OrderbookSnapshot, Trade};
use anyhow::Result;
use async_trait::async_trait;

/// Narrow sink contract the pipeline writes through. `write_orderbook`
/// and `write_trade` only buffer (non-blocking apart from a short lock);
/// `flush` blocks until buffered rows are pushed out.
#[async_trait]
pub trait Writer: Send + Sync {
    async fn write_orderbook(&self, snapshot: OrderbookSnapshot);
    async fn write_trade(&self, trade: Trade);
    async fn write_market(&self, listener_id: &str, market: &Market) -> Result<()>;
    async fn write_state_transition(
        &self,
        listener_id: &str,
        condition_id: &str,
        old_state: Option<&str>,
        new_state: &str,
        metadata: serde_json::Value,
    ) -> Result<()>;
    async fn flush(&self);
}
