//! Venue adapter construction.
//!
//! Selects the discovery and feed implementations for a listener config
//! by platform. Kalshi listeners require credentials; a config for a
//! platform we cannot serve is a spawn-time error the manager logs and
//! skips.

use anyhow::{bail, Result};
use std::sync::Arc;
use ticktape_rust_core::clients::{
    Discovery, Feed, KalshiAuthenticator, KalshiDiscovery, KalshiFeed, PolymarketDiscovery,
    PolymarketFeed,
};
use ticktape_rust_core::models::{ListenerConfig, Platform};

pub fn build_adapters(
    config: &ListenerConfig,
    kalshi_auth: Option<&Arc<KalshiAuthenticator>>,
) -> Result<(Arc<dyn Discovery>, Arc<dyn Feed>)> {
    match config.platform {
        Platform::Polymarket => {
            let discovery: Arc<dyn Discovery> = Arc::new(PolymarketDiscovery::new()?);
            let feed: Arc<dyn Feed> = Arc::new(PolymarketFeed::new(config.id.clone()));
            Ok((discovery, feed))
        }
        Platform::Kalshi => {
            let auth = match kalshi_auth {
                Some(auth) => auth.clone(),
                None => bail!(
                    "listener {} targets kalshi but no credentials are configured",
                    config.name
                ),
            };
            let discovery: Arc<dyn Discovery> = Arc::new(KalshiDiscovery::new(auth.clone())?);
            let feed: Arc<dyn Feed> = Arc::new(KalshiFeed::new(config.id.clone(), auth));
            Ok((discovery, feed))
        }
    }
}
