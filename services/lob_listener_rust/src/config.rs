//! Service configuration from environment variables.

use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

/// Default interval between config reloads
pub const DEFAULT_RELOAD_INTERVAL_SECS: u64 = 60;

/// Default bound on graceful shutdown before remaining tasks are abandoned
pub const DEFAULT_SHUTDOWN_DEADLINE_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub database_url: String,
    pub reload_interval: Duration,
    pub shutdown_deadline: Duration,
}

impl ServiceConfig {
    /// Load configuration from environment variables. A missing
    /// DATABASE_URL is an unrecoverable bootstrap failure.
    pub fn from_env() -> Result<Self> {
        let database_url =
            env::var("DATABASE_URL").context("DATABASE_URL environment variable must be set")?;

        let reload_interval = Duration::from_secs(
            env::var("CONFIG_RELOAD_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_RELOAD_INTERVAL_SECS),
        );

        let shutdown_deadline = Duration::from_secs(
            env::var("SHUTDOWN_DEADLINE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_SHUTDOWN_DEADLINE_SECS),
        );

        Ok(Self {
            database_url,
            reload_interval,
            shutdown_deadline,
        })
    }
}
