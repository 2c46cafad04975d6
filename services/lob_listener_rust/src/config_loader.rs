//! Listener configuration loading from the sink-backed store.
//!
//! The recorder only reads the `listeners` table; rows are owned by
//! whoever seeds them. A row with unparseable filters is skipped with an
//! error log so one bad config cannot take down its peers.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{error, info};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use ticktape_rust_core::models::{ListenerConfig, ListenerFilters, Platform};

pub struct PostgresConfigLoader {
    pool: PgPool,
}

impl PostgresConfigLoader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn load_active_configs(&self) -> Result<Vec<ListenerConfig>> {
        let rows = sqlx::query(
            r#"
            SELECT id::text AS id,
                   name,
                   platform,
                   description,
                   filters,
                   COALESCE(discovery_interval_seconds, 60)::bigint AS discovery_interval_seconds,
                   COALESCE(emit_interval_ms, 100)::bigint AS emit_interval_ms,
                   COALESCE(enable_forward_fill, FALSE) AS enable_forward_fill,
                   is_active,
                   created_at,
                   updated_at
            FROM listeners
            WHERE is_active = TRUE
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to load listener configs")?;

        let mut configs = Vec::with_capacity(rows.len());
        for row in &rows {
            match Self::parse_row(row) {
                Ok(config) => configs.push(config),
                Err(e) => {
                    let id: String = row.try_get("id").unwrap_or_default();
                    error!("Skipping corrupt listener config {}: {:#}", id, e);
                }
            }
        }
        info!("Loaded {} active listener configs", configs.len());
        Ok(configs)
    }

    fn parse_row(row: &PgRow) -> Result<ListenerConfig> {
        let platform_str: String = row.try_get("platform").context("platform column")?;
        let filters_value: serde_json::Value = row.try_get("filters").context("filters column")?;
        config_from_parts(
            row.try_get("id").context("id column")?,
            row.try_get("name").context("name column")?,
            &platform_str,
            row.try_get("description").context("description column")?,
            &filters_value,
            row.try_get::<i64, _>("discovery_interval_seconds")
                .context("discovery_interval_seconds column")?,
            row.try_get::<i64, _>("emit_interval_ms")
                .context("emit_interval_ms column")?,
            row.try_get("enable_forward_fill")
                .context("enable_forward_fill column")?,
            row.try_get("is_active").context("is_active column")?,
            row.try_get::<Option<DateTime<Utc>>, _>("created_at")
                .unwrap_or(None),
            row.try_get::<Option<DateTime<Utc>>, _>("updated_at")
                .unwrap_or(None),
        )
    }
}

/// Row-independent assembly so parsing is testable without a database.
#[allow(clippy::too_many_arguments)]
pub fn config_from_parts(
    id: String,
    name: String,
    platform: &str,
    description: Option<String>,
    filters: &serde_json::Value,
    discovery_interval_seconds: i64,
    emit_interval_ms: i64,
    enable_forward_fill: bool,
    is_active: bool,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
) -> Result<ListenerConfig> {
    let platform = Platform::parse(platform)
        .with_context(|| format!("unknown platform '{}'", platform))?;
    let filters = ListenerFilters::parse(platform, filters)
        .with_context(|| format!("invalid filters for platform {}", platform.as_str()))?;
    Ok(ListenerConfig {
        id,
        name,
        platform,
        description,
        filters,
        discovery_interval_seconds: discovery_interval_seconds.max(1) as u64,
        emit_interval_ms: emit_interval_ms.max(1) as u64,
        enable_forward_fill,
        is_active,
        created_at,
        updated_at,
    })
}
