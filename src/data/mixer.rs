use tokio::sync::mpsc;
use log::{debug, info};

use crate::data::producer::{DataProducer, PriceEvent};

// No buffering between producers and the hub: a stalled consumer stalls
// every forwarding task and, through them, every producer.
pub const MIXER_CHANNEL_SIZE: usize = 1;

/// Fans in every producer's sequence into a single receiver.
///
/// One forwarding task is spawned per producer. Events keep their
/// per-producer order; events from different producers interleave in
/// arrival order.
pub fn mix(producers: &[Box<dyn DataProducer>]) -> mpsc::Receiver<PriceEvent> {
    let (tx, rx) = mpsc::channel(MIXER_CHANNEL_SIZE);

    for producer in producers {
        let name = producer.name().to_string();
        let mut stream = producer.produce();
        let tx = tx.clone();

        tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                if tx.send(event).await.is_err() {
                    debug!("Merged stream closed, stopping forwarder for {}", name);
                    return;
                }
            }
            debug!("Producer {} finished", name);
        });
    }

    info!("Mixing {} producers into one stream", producers.len());
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    /// Emits a fixed list of prices as fast as the consumer allows, then ends.
    struct FixedProducer {
        name: String,
        prices: Vec<f64>,
        sent: Arc<AtomicUsize>,
    }

    impl FixedProducer {
        fn boxed(name: &str, prices: Vec<f64>) -> Box<dyn DataProducer> {
            Box::new(Self {
                name: name.to_string(),
                prices,
                sent: Arc::new(AtomicUsize::new(0)),
            })
        }
    }

    impl DataProducer for FixedProducer {
        fn name(&self) -> &str {
            &self.name
        }

        fn produce(&self) -> mpsc::Receiver<PriceEvent> {
            let (tx, rx) = mpsc::channel(1);
            let name = self.name.clone();
            let prices = self.prices.clone();
            let sent = self.sent.clone();

            tokio::spawn(async move {
                for price in prices {
                    if tx.send(PriceEvent::new(name.clone(), price)).await.is_err() {
                        return;
                    }
                    sent.fetch_add(1, Ordering::SeqCst);
                }
            });

            rx
        }
    }

    async fn drain(mut rx: mpsc::Receiver<PriceEvent>) -> Vec<PriceEvent> {
        let mut events = Vec::new();
        while let Some(event) = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("mixer stalled")
        {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_one_event_per_producer() {
        let producers = vec![
            FixedProducer::boxed("A", vec![1.0]),
            FixedProducer::boxed("B", vec![2.0]),
            FixedProducer::boxed("C", vec![3.0]),
        ];

        let events = drain(mix(&producers)).await;

        assert_eq!(events.len(), 3);
        let mut names: Vec<_> = events.iter().map(|e| e.provider_name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_every_event_forwarded_once_in_producer_order() {
        let per_producer: u32 = 50;
        let producers: Vec<_> = ["A", "B", "C", "D"]
            .iter()
            .map(|name| FixedProducer::boxed(name, (0..per_producer).map(f64::from).collect()))
            .collect();

        let events = drain(mix(&producers)).await;
        assert_eq!(events.len(), 4 * per_producer as usize);

        let mut by_source: HashMap<String, Vec<f64>> = HashMap::new();
        for event in events {
            by_source.entry(event.provider_name).or_default().push(event.current_price);
        }

        let expected: Vec<f64> = (0..per_producer).map(f64::from).collect();
        for name in ["A", "B", "C", "D"] {
            assert_eq!(by_source[name], expected, "order broken for {}", name);
        }
    }

    #[tokio::test]
    async fn test_undrained_stream_stalls_producers() {
        let sent = Arc::new(AtomicUsize::new(0));
        let producer: Box<dyn DataProducer> = Box::new(FixedProducer {
            name: "A".to_string(),
            prices: vec![1.0; 100],
            sent: sent.clone(),
        });
        let producers = vec![producer];

        let rx = mix(&producers);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // One event in the mixer channel, one held by the forwarder, one in
        // the producer channel.
        assert!(sent.load(Ordering::SeqCst) <= 3);
        drop(rx);
    }

    #[tokio::test]
    async fn test_no_producers_closes_immediately() {
        let producers: Vec<Box<dyn DataProducer>> = Vec::new();
        let events = drain(mix(&producers)).await;
        assert!(events.is_empty());
    }
}
