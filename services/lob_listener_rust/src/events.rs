//! Internal listener events and the bounded queues between tasks.
//!
//! Two queues per listener with different overflow policies: the data
//! queue sheds the oldest event when full (fresh book state beats stale)
//! while the control queue blocks its producer (discovery is rare and
//! losing it is worse than briefly pausing it).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use ticktape_rust_core::models::{Market, MarketState, OrderbookSnapshot, Trade};
use tokio::sync::Notify;

pub const DATA_QUEUE_CAPACITY: usize = 10_000;
pub const CONTROL_QUEUE_CAPACITY: usize = 1_000;

#[derive(Debug, Clone)]
pub enum DataEvent {
    Orderbook(OrderbookSnapshot),
    Trade(Trade),
}

#[derive(Debug, Clone)]
pub enum ControlEvent {
    MarketDiscovered(Market),
    MarketRemoved(Market),
    /// A still-tracked market changed lifecycle state (e.g. venue closed
    /// it but discovery still returns it). `market.state` carries the new
    /// state.
    MarketStateChanged {
        market: Market,
        old_state: MarketState,
    },
}

/// Bounded MPSC queue with selectable overflow behavior per call site.
pub struct BoundedQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
    items: Notify,
    space: Notify,
    dropped: AtomicU64,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            items: Notify::new(),
            space: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue, evicting the oldest element when full. Never blocks.
    pub fn push_drop_oldest(&self, item: T) {
        {
            let mut queue = self.inner.lock().unwrap();
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(item);
        }
        self.items.notify_one();
    }

    /// Enqueue, waiting for space when full.
    pub async fn push_wait(&self, item: T) {
        let mut item = Some(item);
        loop {
            {
                let mut queue = self.inner.lock().unwrap();
                if queue.len() < self.capacity {
                    queue.push_back(item.take().unwrap());
                }
            }
            if item.is_none() {
                self.items.notify_one();
                return;
            }
            // Full; wait for a pop to free a slot and re-check
            self.space.notified().await;
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        let popped = self.inner.lock().unwrap().pop_front();
        if popped.is_some() {
            self.space.notify_one();
        }
        popped
    }

    /// Resolves after the next push. Combined with `try_pop` this gives a
    /// race-free wait: a push between the failed pop and this call leaves
    /// a stored permit.
    pub async fn wait_items(&self) {
        self.items.notified().await;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fifo_order() {
        let queue = BoundedQueue::new(4);
        queue.push_drop_oldest(1);
        queue.push_drop_oldest(2);
        queue.push_drop_oldest(3);
        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), Some(3));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let queue = BoundedQueue::new(10_000);
        for i in 0..20_000 {
            queue.push_drop_oldest(i);
        }
        assert_eq!(queue.len(), 10_000);
        assert_eq!(queue.dropped(), 10_000);
        // Oldest half is gone; the survivors start at 10_000
        assert_eq!(queue.try_pop(), Some(10_000));
    }

    #[tokio::test]
    async fn test_push_wait_blocks_until_pop() {
        let queue = Arc::new(BoundedQueue::new(1));
        queue.push_wait(1).await;

        let q = queue.clone();
        let producer = tokio::spawn(async move {
            q.push_wait(2).await;
        });

        // Producer should be parked on the full queue
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!producer.is_finished());
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.try_pop(), Some(1));
        producer.await.unwrap();
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.dropped(), 0);
    }

    #[tokio::test]
    async fn test_wait_items_sees_push_before_wait() {
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(4));
        // Push first: the permit must be stored for a later waiter
        queue.push_drop_oldest(7);
        tokio::time::timeout(std::time::Duration::from_millis(100), queue.wait_items())
            .await
            .expect("wait_items should resolve from the stored permit");
    }
}
