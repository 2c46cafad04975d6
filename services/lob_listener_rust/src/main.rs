use anyhow::Result;
use dotenv::dotenv;
use log::{error, info};
use lob_listener_rust::config::ServiceConfig;
use lob_listener_rust::config_loader::PostgresConfigLoader;
use lob_listener_rust::manager::ListenerManager;
use std::sync::Arc;
use ticktape_rust_core::clients::KalshiAuthenticator;
use ticktape_rust_core::db::{create_pool, DbPoolConfig, PostgresWriter};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    env_logger::init();

    info!("Starting LOB Listener Rust Service...");

    let config = ServiceConfig::from_env()?;
    let pool = create_pool(&config.database_url, &DbPoolConfig::from_env()).await?;

    let writer = PostgresWriter::new(pool.clone());
    writer.start();

    let kalshi_auth = KalshiAuthenticator::from_env()?.map(Arc::new);
    let config_loader = PostgresConfigLoader::new(pool);

    let manager = Arc::new(ListenerManager::new(
        writer.clone(),
        config_loader,
        kalshi_auth,
        config.reload_interval,
    ));
    manager.start().await?;

    let cancel = CancellationToken::new();
    let reload_manager = manager.clone();
    let reload_cancel = cancel.clone();
    let reload_task = tokio::spawn(async move {
        reload_manager.run(reload_cancel).await;
    });

    wait_for_shutdown_signal().await;
    info!("Shutdown signal received");

    cancel.cancel();
    let _ = reload_task.await;
    manager.shutdown(config.shutdown_deadline).await;
    writer.stop().await;

    info!("Recorder stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("Cannot install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
