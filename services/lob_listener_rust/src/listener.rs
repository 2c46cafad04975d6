//! Per-configuration listener supervisor.
//!
//! Owns one venue adapter pair plus the forward filler and event
//! processor for a single listener config, and runs four cooperating
//! tasks: discovery poller, feed reader, event processor and the filler
//! ticker. All tasks observe one cancellation token. A lost feed puts
//! the supervisor in Degraded while the reconnect loop runs; discovery
//! and the filler keep going on last-known state throughout.

use crate::events::{
    BoundedQueue, ControlEvent, DataEvent, CONTROL_QUEUE_CAPACITY, DATA_QUEUE_CAPACITY,
};
use crate::filler::ForwardFiller;
use crate::processor::EventProcessor;
use anyhow::Result;
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use ticktape_rust_core::clients::{is_auth_error, Discovery, Feed, FeedEvent};
use ticktape_rust_core::db::Writer;
use ticktape_rust_core::models::{ListenerConfig, Market, MarketState};
use ticktape_rust_core::utils::backoff::Backoff;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerStatus {
    Idle,
    Starting,
    Running,
    Degraded,
    Stopping,
    Stopped,
}

/// Counters surfaced in the manager's periodic health log.
#[derive(Debug, Default)]
pub struct ListenerStats {
    pub events_processed: AtomicU64,
    pub errors: AtomicU64,
    pub protocol_violations: AtomicU64,
    pub reconnects: AtomicU64,
    pub discovery_cycles: AtomicU64,
}

pub struct Listener {
    config: ListenerConfig,
    discovery: Arc<dyn Discovery>,
    feed: Arc<dyn Feed>,
    writer: Arc<dyn Writer>,
    filler: Arc<ForwardFiller>,
    data_queue: Arc<BoundedQueue<DataEvent>>,
    control_queue: Arc<BoundedQueue<ControlEvent>>,
    known_markets: Arc<Mutex<HashMap<String, Market>>>,
    stats: Arc<ListenerStats>,
    status: watch::Sender<ListenerStatus>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    fatal: AtomicBool,
}

impl Listener {
    pub fn new(
        config: ListenerConfig,
        discovery: Arc<dyn Discovery>,
        feed: Arc<dyn Feed>,
        writer: Arc<dyn Writer>,
    ) -> Self {
        let filler = Arc::new(ForwardFiller::new(
            config.id.clone(),
            config.emit_interval_ms,
            config.enable_forward_fill,
            writer.clone(),
        ));
        Self {
            config,
            discovery,
            feed,
            writer,
            filler,
            data_queue: Arc::new(BoundedQueue::new(DATA_QUEUE_CAPACITY)),
            control_queue: Arc::new(BoundedQueue::new(CONTROL_QUEUE_CAPACITY)),
            known_markets: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(ListenerStats::default()),
            status: watch::channel(ListenerStatus::Idle).0,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            fatal: AtomicBool::new(false),
        }
    }

    pub fn listener_id(&self) -> &str {
        &self.config.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    pub fn status(&self) -> ListenerStatus {
        *self.status.borrow()
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    pub fn data_events_dropped(&self) -> u64 {
        self.data_queue.dropped()
    }

    pub fn subscribed_market_count(&self) -> usize {
        self.known_markets.lock().unwrap().len()
    }

    /// Auth failures stop the listener for good; the manager must not
    /// respawn it.
    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    fn set_status(&self, status: ListenerStatus) {
        // Stopping/Stopped are terminal for this run; tasks racing a
        // shutdown must not flip the listener back to Running
        let current = *self.status.borrow();
        if matches!(current, ListenerStatus::Stopping | ListenerStatus::Stopped)
            && !matches!(status, ListenerStatus::Stopped)
        {
            return;
        }
        self.status.send_replace(status);
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!("Listener {} starting", self.config.name);
        self.set_status(ListenerStatus::Starting);

        let mut connected = true;
        match self.feed.connect().await {
            Ok(()) => {}
            Err(e) if is_auth_error(&e) => {
                error!("Listener {} auth failure on connect: {:#}", self.config.name, e);
                self.fatal_stop();
                return Err(e);
            }
            Err(e) => {
                warn!(
                    "Listener {} initial connect failed, will reconnect: {:#}",
                    self.config.name, e
                );
                connected = false;
            }
        }

        let processor = EventProcessor::new(
            self.config.id.clone(),
            self.data_queue.clone(),
            self.control_queue.clone(),
            self.writer.clone(),
            self.filler.clone(),
            self.feed.clone(),
            self.known_markets.clone(),
            self.stats.clone(),
        );

        // Processor, feed reader and ticker come up first so the initial
        // discovery cycle cannot stall on a full control queue
        let cancel = self.cancel.clone();
        self.spawn_task(tokio::spawn(async move {
            processor.run(cancel).await;
        }));

        let listener = self.clone();
        let cancel = self.cancel.clone();
        self.spawn_task(tokio::spawn(async move {
            listener.feed_loop(cancel, connected).await;
        }));

        let filler = self.filler.clone();
        let cancel = self.cancel.clone();
        self.spawn_task(tokio::spawn(async move {
            filler.run(cancel).await;
        }));

        // One discovery cycle while still Starting so the first
        // subscriptions go out immediately
        self.discover_and_sync().await;
        if self.is_fatal() {
            return Err(anyhow::anyhow!("listener stopped during initial discovery"));
        }

        let listener = self.clone();
        let cancel = self.cancel.clone();
        self.spawn_task(tokio::spawn(async move {
            listener.discovery_loop(cancel).await;
        }));

        self.set_status(if connected {
            ListenerStatus::Running
        } else {
            ListenerStatus::Degraded
        });
        info!("Listener {} started", self.config.name);
        Ok(())
    }

    pub async fn stop(&self) {
        if self.status() == ListenerStatus::Stopped {
            return;
        }
        info!("Listener {} stopping", self.config.name);
        self.set_status(ListenerStatus::Stopping);
        self.cancel.cancel();

        let tokens: Vec<String> = self.known_markets.lock().unwrap().keys().cloned().collect();
        if !tokens.is_empty() {
            if let Err(e) = self.feed.unsubscribe(&tokens).await {
                debug!("Unsubscribe during stop failed: {:#}", e);
            }
        }
        self.feed.disconnect().await;

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for mut handle in handles {
            if tokio::time::timeout(TASK_JOIN_TIMEOUT, &mut handle).await.is_err() {
                warn!("Listener {} task did not stop in time, aborting", self.config.name);
                handle.abort();
            }
        }

        self.writer.flush().await;
        self.set_status(ListenerStatus::Stopped);
        info!("Listener {} stopped", self.config.name);
    }

    fn spawn_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().unwrap().push(handle);
    }

    fn fatal_stop(&self) {
        self.fatal.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        self.status.send_replace(ListenerStatus::Stopped);
    }

    async fn discovery_loop(self: Arc<Self>, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.config.discovery_interval_seconds.max(1));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    self.discover_and_sync().await;
                    if self.is_fatal() {
                        break;
                    }
                }
            }
        }
        debug!("Discovery loop exited for listener {}", self.config.name);
    }

    async fn discover_and_sync(&self) {
        let discovered = match self.discovery.discover_markets(&self.config.filters).await {
            Ok(markets) => markets,
            Err(e) if is_auth_error(&e) => {
                error!(
                    "Listener {} discovery auth failure: {:#}",
                    self.config.name, e
                );
                self.fatal_stop();
                return;
            }
            Err(e) => {
                error!("Listener {} discovery failed: {:#}", self.config.name, e);
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        self.stats.discovery_cycles.fetch_add(1, Ordering::Relaxed);

        let deltas = {
            let known = self.known_markets.lock().unwrap();
            compute_market_deltas(&known, discovered)
        };
        debug!(
            "Listener {} discovery: {} new, {} removed, {} state changes",
            self.config.name,
            deltas.new_markets.len(),
            deltas.removed_markets.len(),
            deltas.state_changes.len()
        );

        for mut market in deltas.new_markets {
            market.listener_id = Some(self.config.id.clone());
            self.control_queue
                .push_wait(ControlEvent::MarketDiscovered(market))
                .await;
        }
        for market in deltas.removed_markets {
            self.control_queue
                .push_wait(ControlEvent::MarketRemoved(market))
                .await;
        }
        for (market, old_state) in deltas.state_changes {
            self.control_queue
                .push_wait(ControlEvent::MarketStateChanged { market, old_state })
                .await;
        }
    }

    async fn feed_loop(self: Arc<Self>, cancel: CancellationToken, initially_connected: bool) {
        let mut backoff = Backoff::reconnect();

        if !initially_connected && !self.reconnect_with_backoff(&cancel, &mut backoff).await {
            return;
        }
        self.set_status(ListenerStatus::Running);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.feed.next_event() => match event {
                    Some(FeedEvent::Book(snapshot)) => {
                        self.data_queue.push_drop_oldest(DataEvent::Orderbook(snapshot));
                    }
                    Some(FeedEvent::Trade(trade)) => {
                        self.data_queue.push_drop_oldest(DataEvent::Trade(trade));
                    }
                    Some(FeedEvent::Disconnected { reason }) => {
                        warn!("Listener {} feed lost: {}", self.config.name, reason);
                        self.set_status(ListenerStatus::Degraded);
                        self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                        if !self.reconnect_with_backoff(&cancel, &mut backoff).await {
                            return;
                        }
                        self.set_status(ListenerStatus::Running);
                    }
                    None => break,
                }
            }
        }
        debug!("Feed loop exited for listener {}", self.config.name);
    }

    /// Reconnect until success. Returns false when cancelled or fatally
    /// stopped. The feed resubscribes its own token set on connect, so a
    /// successful reconnect needs no extra subscribe calls here.
    async fn reconnect_with_backoff(
        &self,
        cancel: &CancellationToken,
        backoff: &mut Backoff,
    ) -> bool {
        loop {
            let delay = backoff.next_delay();
            info!(
                "Listener {} reconnecting feed in {:.1}s",
                self.config.name,
                delay.as_secs_f64()
            );
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
            match self.feed.connect().await {
                Ok(()) => {
                    backoff.reset();
                    info!("Listener {} feed reconnected", self.config.name);
                    return true;
                }
                Err(e) if is_auth_error(&e) => {
                    error!(
                        "Listener {} auth failure on reconnect: {:#}",
                        self.config.name, e
                    );
                    self.fatal_stop();
                    return false;
                }
                Err(e) => {
                    warn!("Listener {} reconnect failed: {:#}", self.config.name, e);
                }
            }
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct MarketDeltas {
    pub new_markets: Vec<Market>,
    pub removed_markets: Vec<Market>,
    /// (market with its new state, previous state)
    pub state_changes: Vec<(Market, MarketState)>,
}

/// Diff one discovery result against the known set: markets whose token
/// we have never seen are new; known tokens absent from the result are
/// gone; still-present markets whose open/closed flag flipped become
/// state changes.
pub(crate) fn compute_market_deltas(
    known: &HashMap<String, Market>,
    discovered: Vec<Market>,
) -> MarketDeltas {
    let discovered_tokens: HashSet<String> =
        discovered.iter().map(|m| m.token_id.clone()).collect();

    let mut deltas = MarketDeltas::default();

    for market in discovered {
        match known.get(&market.token_id) {
            None => deltas.new_markets.push(market),
            Some(existing) => {
                if market.is_closed && existing.state != MarketState::Closed {
                    let mut closed = market;
                    closed.listener_id = existing.listener_id.clone();
                    closed.state = MarketState::Closed;
                    deltas.state_changes.push((closed, existing.state));
                } else if !market.is_closed && existing.state == MarketState::Closed {
                    let mut reopened = market;
                    reopened.listener_id = existing.listener_id.clone();
                    reopened.state = MarketState::Active;
                    deltas.state_changes.push((reopened, existing.state));
                }
            }
        }
    }

    deltas.removed_markets = known
        .values()
        .filter(|m| !discovered_tokens.contains(&m.token_id))
        .cloned()
        .collect();

    deltas
}
