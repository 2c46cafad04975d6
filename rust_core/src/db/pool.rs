//! Database connection pool construction.
//!
//! The recorder keeps a deliberately small pool: all snapshot and trade
//! writes are batched through the sink, so a handful of connections
//! covers every listener.

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::env;
use std::time::Duration;

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Pool sizing and timeout settings, overridable via `DB_*` env vars.
#[derive(Debug, Clone)]
pub struct DbPoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for DbPoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

impl DbPoolConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_connections: env_u64("DB_MAX_CONNECTIONS", defaults.max_connections as u64) as u32,
            min_connections: env_u64("DB_MIN_CONNECTIONS", defaults.min_connections as u64) as u32,
            acquire_timeout: Duration::from_secs(env_u64(
                "DB_ACQUIRE_TIMEOUT_SECS",
                defaults.acquire_timeout.as_secs(),
            )),
            idle_timeout: Duration::from_secs(env_u64(
                "DB_IDLE_TIMEOUT_SECS",
                defaults.idle_timeout.as_secs(),
            )),
            max_lifetime: Duration::from_secs(env_u64(
                "DB_MAX_LIFETIME_SECS",
                defaults.max_lifetime.as_secs(),
            )),
        }
    }
}

pub async fn create_pool(database_url: &str, config: &DbPoolConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .max_lifetime(config.max_lifetime)
        .connect(database_url)
        .await
        .context("Failed to create database connection pool")?;

    tracing::info!(
        "Database pool created: max={}, min={}, acquire_timeout={}s",
        config.max_connections,
        config.min_connections,
        config.acquire_timeout.as_secs()
    );

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DbPoolConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 2);
        assert_eq!(config.acquire_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_env_fallback() {
        assert_eq!(env_u64("DB_POOL_TEST_UNSET_VAR", 42), 42);
    }

    #[test]
    fn test_from_env_is_consistent() {
        let config = DbPoolConfig::from_env();
        assert!(config.min_connections <= config.max_connections);
    }
}
