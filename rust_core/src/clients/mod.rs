pub mod kalshi;
pub mod kalshi_auth;
pub mod kalshi_ws;
pub mod polymarket;
pub mod polymarket_ws;

// Re-export commonly used types
pub use kalshi::KalshiDiscovery;
pub use kalshi_auth::KalshiAuthenticator;
pub use kalshi_ws::KalshiFeed;
pub use polymarket::PolymarketDiscovery;
pub use polymarket_ws::PolymarketFeed;

use crate::models::{ListenerFilters, Market, OrderbookSnapshot, Trade};
use anyhow::Result;
use async_trait::async_trait;

/// A normalized event read off a venue feed.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// Full reconstructed book state for one token.
    Book(OrderbookSnapshot),
    /// A print on the tape.
    Trade(Trade),
    /// The underlying connection died; the supervisor owns reconnection.
    Disconnected { reason: String },
}

/// REST-side venue capability: find the markets a listener should track.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn discover_markets(&self, filters: &ListenerFilters) -> Result<Vec<Market>>;

    /// Venue name for logging and debugging
    fn venue_name(&self) -> &'static str;
}

/// Streaming-side venue capability. Implementations keep their own
/// receive loop and hand back normalized events through `next_event`;
/// subscribe/unsubscribe are safe to call concurrently with reads.
#[async_trait]
pub trait Feed: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self);
    async fn subscribe(&self, token_ids: &[String]) -> Result<()>;
    async fn unsubscribe(&self, token_ids: &[String]) -> Result<()>;

    /// Next normalized event, or None once the feed is shut down for good.
    async fn next_event(&self) -> Option<FeedEvent>;
}

/// Marker error for venue authentication failures (401/403). These are
/// fatal for the affected listener: the supervisor stops and the manager
/// must not auto-restart it.
#[derive(Debug)]
pub struct AuthError(pub String);

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "authentication failed: {}", self.0)
    }
}

impl std::error::Error for AuthError {}

/// True when the error chain bottoms out in an authentication failure.
pub fn is_auth_error(err: &anyhow::Error) -> bool {
    err.chain().any(|c| c.downcast_ref::<AuthError>().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_error_detected_through_context() {
        let err = anyhow::Error::new(AuthError("401 unauthorized".to_string()))
            .context("kalshi discovery failed");
        assert!(is_auth_error(&err));

        let plain = anyhow::anyhow!("connection refused");
        assert!(!is_auth_error(&plain));
    }
}
