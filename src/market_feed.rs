//! Market price feed collaborator.
//!
//! The round engine only needs a pull (`latest_price`) and a push
//! (`subscribe`) interface; shaped after the teacher's
//! `scrapers::binance_price_feed::BinancePriceFeed` (`subscribe()` returning
//! a broadcast receiver, a `disabled()`-style fallback constructor).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PriceEvent {
    Tick { price: f64, timestamp_ms: i64 },
    Critical,
}

#[async_trait]
pub trait MarketFeed: Send + Sync {
    fn latest_price(&self) -> Option<f64>;
    fn subscribe(&self) -> broadcast::Receiver<PriceEvent>;
}

/// Deterministic in-process feed: advances price via `push_tick`, used by the
/// default binary in the absence of a real external feed and by tests that
/// need reproducible hit/miss outcomes.
pub struct DeterministicFeed {
    bits: AtomicU64,
    tx: broadcast::Sender<PriceEvent>,
}

impl DeterministicFeed {
    pub fn new(initial_price: f64) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(1024);
        Arc::new(DeterministicFeed {
            bits: AtomicU64::new(initial_price.to_bits()),
            tx,
        })
    }

    pub fn push_tick(&self, price: f64, timestamp_ms: i64) {
        self.bits.store(price.to_bits(), Ordering::SeqCst);
        let _ = self.tx.send(PriceEvent::Tick { price, timestamp_ms });
    }

    pub fn push_critical(&self) {
        let _ = self.tx.send(PriceEvent::Critical);
    }
}

#[async_trait]
impl MarketFeed for DeterministicFeed {
    fn latest_price(&self) -> Option<f64> {
        Some(f64::from_bits(self.bits.load(Ordering::SeqCst)))
    }

    fn subscribe(&self) -> broadcast::Receiver<PriceEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_pushed_ticks() {
        let feed = DeterministicFeed::new(100.0);
        let mut rx = feed.subscribe();
        feed.push_tick(105.0, 1000);
        assert_eq!(feed.latest_price(), Some(105.0));
        match rx.recv().await.unwrap() {
            PriceEvent::Tick { price, .. } => assert_eq!(price, 105.0),
            _ => panic!("expected tick"),
        }
    }
}
