use std::time::Duration;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use log::{debug, info};

use crate::config::{DEFAULT_BASE_PRICE, DEFAULT_PRICE_SPREAD, DEFAULT_TICK_INTERVAL_MS};

// Every producer hands events over one at a time; the receiver must keep up.
pub const PRODUCER_CHANNEL_SIZE: usize = 1;

/// One price observation from one named source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceEvent {
    pub provider_name: String,
    pub current_price: f64,
    pub timestamp: DateTime<Utc>,
}

impl PriceEvent {
    pub fn new(provider_name: impl Into<String>, current_price: f64) -> Self {
        let provider_name = provider_name.into();
        debug_assert!(!provider_name.is_empty(), "price event needs a provider name");
        Self {
            provider_name,
            current_price,
            timestamp: Utc::now(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A source of price events.
///
/// `produce` starts a fresh, independent sequence on every call. The returned
/// receiver is the only handle to that sequence; dropping it ends the
/// background task that feeds it.
pub trait DataProducer: Send + Sync {
    fn name(&self) -> &str;

    fn produce(&self) -> mpsc::Receiver<PriceEvent>;
}

/// Synthetic feed emitting `base_price + uniform[0, 1) * spread` every
/// `interval`.
#[derive(Debug, Clone)]
pub struct Provider {
    name: String,
    interval: Duration,
    base_price: f64,
    spread: f64,
}

impl Provider {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        debug_assert!(!name.is_empty(), "provider name must not be empty");
        Self {
            name,
            interval: Duration::from_millis(DEFAULT_TICK_INTERVAL_MS),
            base_price: DEFAULT_BASE_PRICE,
            spread: DEFAULT_PRICE_SPREAD,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_price_range(mut self, base_price: f64, spread: f64) -> Self {
        self.base_price = base_price;
        self.spread = spread;
        self
    }

    fn next_price(&self) -> f64 {
        let mut rng = rand::thread_rng();
        self.base_price + rng.gen::<f64>() * self.spread
    }
}

impl DataProducer for Provider {
    fn name(&self) -> &str {
        &self.name
    }

    fn produce(&self) -> mpsc::Receiver<PriceEvent> {
        let (tx, rx) = mpsc::channel(PRODUCER_CHANNEL_SIZE);
        let provider = self.clone();

        tokio::spawn(async move {
            info!("Starting provider: {} (every {:?})", provider.name, provider.interval);

            loop {
                tokio::time::sleep(provider.interval).await;

                let event = PriceEvent::new(provider.name.clone(), provider.next_price());
                if tx.send(event).await.is_err() {
                    debug!("Consumer for provider {} went away, stopping", provider.name);
                    break;
                }
            }
        });

        rx
    }
}
