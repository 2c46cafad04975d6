//! Listener manager: spawns one supervisor per active config and keeps
//! the running set in sync with the store.
//!
//! On every reload interval the active configs are diffed against the
//! running listeners by id: new configs spawn, missing or deactivated
//! ones stop, changed ones stop and respawn (no hot-apply). A listener
//! that died on an auth failure stays down until its config changes.

use crate::config_loader::PostgresConfigLoader;
use crate::factory::build_adapters;
use crate::listener::{Listener, ListenerStatus};
use anyhow::Result;
use log::{error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use ticktape_rust_core::clients::KalshiAuthenticator;
use ticktape_rust_core::db::{PostgresWriter, Writer};
use ticktape_rust_core::models::ListenerConfig;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub struct ListenerManager {
    writer: PostgresWriter,
    config_loader: PostgresConfigLoader,
    kalshi_auth: Option<Arc<KalshiAuthenticator>>,
    reload_interval: Duration,
    listeners: tokio::sync::Mutex<HashMap<String, Arc<Listener>>>,
}

impl ListenerManager {
    pub fn new(
        writer: PostgresWriter,
        config_loader: PostgresConfigLoader,
        kalshi_auth: Option<Arc<KalshiAuthenticator>>,
        reload_interval: Duration,
    ) -> Self {
        Self {
            writer,
            config_loader,
            kalshi_auth,
            reload_interval,
            listeners: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn start(&self) -> Result<()> {
        info!("Listener manager starting");
        let configs = self.config_loader.load_active_configs().await?;
        let mut listeners = self.listeners.lock().await;
        for config in configs {
            if let Some(listener) = self.spawn_listener(&config).await {
                listeners.insert(config.id.clone(), listener);
            }
        }
        info!("Listener manager started with {} listeners", listeners.len());
        Ok(())
    }

    async fn spawn_listener(&self, config: &ListenerConfig) -> Option<Arc<Listener>> {
        let (discovery, feed) = match build_adapters(config, self.kalshi_auth.as_ref()) {
            Ok(adapters) => adapters,
            Err(e) => {
                error!("Cannot build adapters for listener {}: {:#}", config.name, e);
                return None;
            }
        };
        let writer: Arc<dyn Writer> = Arc::new(self.writer.clone());
        let listener = Arc::new(Listener::new(config.clone(), discovery, feed, writer));
        match listener.start().await {
            Ok(()) => {
                info!("Listener {} spawned", config.name);
                Some(listener)
            }
            Err(e) => {
                error!("Listener {} failed to start: {:#}", config.name, e);
                // Keep fatally-failed listeners in the map so they are not
                // respawned every reload (credential flood prevention)
                if listener.is_fatal() {
                    Some(listener)
                } else {
                    None
                }
            }
        }
    }

    /// Periodic reload + health log until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.reload_interval) => {
                    if let Err(e) = self.reload().await {
                        error!("Listener reload failed: {:#}", e);
                    }
                    self.log_health().await;
                }
            }
        }
    }

    pub async fn reload(&self) -> Result<()> {
        let configs = self.config_loader.load_active_configs().await?;
        let config_by_id: HashMap<String, ListenerConfig> =
            configs.into_iter().map(|c| (c.id.clone(), c)).collect();

        let mut listeners = self.listeners.lock().await;

        // Stop listeners whose config is gone or deactivated
        let gone: Vec<String> = listeners
            .keys()
            .filter(|id| !config_by_id.contains_key(*id))
            .cloned()
            .collect();
        for id in gone {
            if let Some(listener) = listeners.remove(&id) {
                info!("Listener {} removed from config, stopping", listener.name());
                listener.stop().await;
            }
        }

        for (id, config) in &config_by_id {
            match listeners.get(id) {
                Some(existing) if !existing.config().differs_from(config) => {
                    // Unchanged; a fatally-stopped listener stays down
                }
                Some(existing) => {
                    info!("Listener {} config changed, respawning", existing.name());
                    existing.stop().await;
                    listeners.remove(id);
                    if let Some(listener) = self.spawn_listener(config).await {
                        listeners.insert(id.clone(), listener);
                    }
                }
                None => {
                    info!("New listener config {}, spawning", config.name);
                    if let Some(listener) = self.spawn_listener(config).await {
                        listeners.insert(id.clone(), listener);
                    }
                }
            }
        }

        Ok(())
    }

    async fn log_health(&self) {
        let listeners = self.listeners.lock().await;
        for listener in listeners.values() {
            let stats = listener.stats();
            let dropped = listener.data_events_dropped();
            info!(
                "Listener {}: status={:?} markets={} events={} errors={} drops={} reconnects={}",
                listener.name(),
                listener.status(),
                listener.subscribed_market_count(),
                stats
                    .events_processed
                    .load(std::sync::atomic::Ordering::Relaxed),
                stats.errors.load(std::sync::atomic::Ordering::Relaxed),
                dropped,
                stats.reconnects.load(std::sync::atomic::Ordering::Relaxed),
            );
            if dropped > 0 && listener.status() == ListenerStatus::Running {
                warn!(
                    "Listener {} has shed {} data events under backpressure",
                    listener.name(),
                    dropped
                );
            }
        }
    }

    /// Stop all listeners in parallel, bounded by `deadline`, then flush
    /// the shared writer.
    pub async fn shutdown(&self, deadline: Duration) {
        info!("Listener manager stopping");
        let listeners: Vec<Arc<Listener>> = {
            let mut map = self.listeners.lock().await;
            map.drain().map(|(_, l)| l).collect()
        };

        let mut stops = JoinSet::new();
        for listener in listeners {
            stops.spawn(async move { listener.stop().await });
        }

        let drained = tokio::time::timeout(deadline, async {
            while stops.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Shutdown deadline hit, abandoning remaining listener tasks");
            stops.abort_all();
        }

        self.writer.flush().await;
        info!("Listener manager stopped");
    }

    pub async fn listener_count(&self) -> usize {
        self.listeners.lock().await.len()
    }
}
