//! Broadcast hub.
//!
//! The [`Hub`] task owns the set of subscriber lanes. Everything else talks to
//! it through a cloneable [`HubHandle`], so the lane map is only ever read or
//! mutated from inside the hub's own loop.
//!
//! Delivery is best effort. Each published event is offered to every lane
//! with `try_send`; a lane that is full (or whose receiver is gone) simply
//! misses that event. The hub never waits on a subscriber.

use std::collections::HashMap;
use serde::Serialize;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;
use log::{debug, info, trace, warn};

use crate::config::{CONTROL_CHANNEL_SIZE, PUBLISH_CHANNEL_SIZE};
use crate::data::PriceEvent;

pub type LaneId = Uuid;

/// Sending half of a subscriber lane. Moved into the hub on subscribe; the
/// hub is its only owner from then on, and dropping it closes the lane.
#[derive(Debug)]
pub struct Lane {
    id: LaneId,
    tx: mpsc::Sender<PriceEvent>,
}

/// Receiving half of a subscriber lane, held by the connection endpoint.
#[derive(Debug)]
pub struct LaneReceiver {
    id: LaneId,
    rx: mpsc::Receiver<PriceEvent>,
}

impl Lane {
    /// Creates a lane buffering up to `capacity` events (at least one).
    pub fn new(capacity: usize) -> (Lane, LaneReceiver) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Lane { id, tx }, LaneReceiver { id, rx })
    }

    pub fn id(&self) -> LaneId {
        self.id
    }
}

impl LaneReceiver {
    pub fn id(&self) -> LaneId {
        self.id
    }

    /// Waits for the next event. `None` once the hub has closed the lane and
    /// every buffered event has been read.
    pub async fn recv(&mut self) -> Option<PriceEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<PriceEvent, TryRecvError> {
        self.rx.try_recv()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub subscribers: usize,
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    pub control_capacity: usize,
    pub publish_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            control_capacity: CONTROL_CHANNEL_SIZE,
            publish_capacity: PUBLISH_CHANNEL_SIZE,
        }
    }
}

enum HubQuery {
    Stats(oneshot::Sender<HubStats>),
    Subscribers(oneshot::Sender<Vec<LaneId>>),
}

pub struct Hub {
    lanes: HashMap<LaneId, Lane>,
    stats: HubStats,
    register_rx: mpsc::Receiver<Lane>,
    unregister_rx: mpsc::Receiver<LaneId>,
    query_rx: mpsc::Receiver<HubQuery>,
    broadcast_rx: mpsc::Receiver<PriceEvent>,
}

#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<Lane>,
    unregister_tx: mpsc::Sender<LaneId>,
    query_tx: mpsc::Sender<HubQuery>,
    broadcast_tx: mpsc::Sender<PriceEvent>,
}

impl Hub {
    pub fn new(config: HubConfig) -> (Hub, HubHandle) {
        let control = config.control_capacity.max(1);
        let (register_tx, register_rx) = mpsc::channel(control);
        let (unregister_tx, unregister_rx) = mpsc::channel(control);
        let (query_tx, query_rx) = mpsc::channel(control);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.publish_capacity.max(1));

        let hub = Hub {
            lanes: HashMap::new(),
            stats: HubStats::default(),
            register_rx,
            unregister_rx,
            query_rx,
            broadcast_rx,
        };

        let handle = HubHandle {
            register_tx,
            unregister_tx,
            query_tx,
            broadcast_tx,
        };

        (hub, handle)
    }

    /// Runs the coordination loop until every [`HubHandle`] is dropped.
    ///
    /// Membership changes are polled before publishes, so a subscribe or
    /// unsubscribe that was queued ahead of a publish is applied first.
    pub async fn run(mut self) {
        info!("Hub running");

        loop {
            tokio::select! {
                biased;

                Some(lane) = self.register_rx.recv() => self.register(lane),
                Some(id) = self.unregister_rx.recv() => self.unregister(id),
                Some(query) = self.query_rx.recv() => self.answer(query),
                Some(event) = self.broadcast_rx.recv() => self.broadcast(event),
                else => break,
            }
        }

        info!(
            "Hub stopped - published: {}, delivered: {}, dropped: {}, closing {} lanes",
            self.stats.published, self.stats.delivered, self.stats.dropped, self.lanes.len()
        );
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    fn register(&mut self, lane: Lane) {
        let id = lane.id;
        if self.lanes.insert(id, lane).is_some() {
            // Ids are v4 UUIDs; on a collision the newer lane wins.
            warn!("Lane {} subscribed twice, previous lane closed", id);
        }
        debug!("Lane {} subscribed ({} active)", id, self.lanes.len());
    }

    fn unregister(&mut self, id: LaneId) {
        if self.lanes.remove(&id).is_some() {
            debug!("Lane {} unsubscribed ({} active)", id, self.lanes.len());
        }
    }

    fn answer(&self, query: HubQuery) {
        // A requester that gave up waiting is not an error.
        match query {
            HubQuery::Stats(reply) => {
                let _ = reply.send(HubStats {
                    subscribers: self.lanes.len(),
                    ..self.stats
                });
            }
            HubQuery::Subscribers(reply) => {
                let _ = reply.send(self.lanes.keys().copied().collect());
            }
        }
    }

    fn broadcast(&mut self, event: PriceEvent) {
        self.stats.published += 1;

        for lane in self.lanes.values() {
            match lane.tx.try_send(event.clone()) {
                Ok(()) => self.stats.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.stats.dropped += 1;
                    trace!("Lane {} full, dropped {} event", lane.id, event.provider_name);
                }
                Err(TrySendError::Closed(_)) => {
                    self.stats.dropped += 1;
                    trace!("Lane {} receiver gone, dropped {} event", lane.id, event.provider_name);
                }
            }
        }
    }
}

impl HubHandle {
    pub async fn subscribe(&self, lane: Lane) {
        let id = lane.id;
        if self.register_tx.send(lane).await.is_err() {
            warn!("Hub is not running, lane {} was not subscribed", id);
        }
    }

    /// Removes and closes the lane. Unknown ids are ignored.
    pub async fn unsubscribe(&self, id: LaneId) {
        if self.unregister_tx.send(id).await.is_err() {
            debug!("Hub is not running, nothing to unsubscribe for lane {}", id);
        }
    }

    pub async fn publish(&self, event: PriceEvent) {
        if self.broadcast_tx.send(event).await.is_err() {
            warn!("Hub is not running, event dropped");
        }
    }

    /// The hub's inbound publish channel, for feeding it directly.
    pub fn publisher(&self) -> mpsc::Sender<PriceEvent> {
        self.broadcast_tx.clone()
    }

    /// Forwards a merged stream into the hub until the stream ends or the
    /// hub stops.
    pub fn attach(&self, mut stream: mpsc::Receiver<PriceEvent>) -> JoinHandle<()> {
        let publisher = self.publisher();

        tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                if publisher.send(event).await.is_err() {
                    warn!("Hub stopped, detaching merged stream");
                    return;
                }
            }
            info!("Merged stream ended");
        })
    }

    pub async fn stats(&self) -> Option<HubStats> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.query_tx.send(HubQuery::Stats(reply_tx)).await.ok()?;
        reply_rx.await.ok()
    }

    pub async fn subscribers(&self) -> Option<Vec<LaneId>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.query_tx.send(HubQuery::Subscribers(reply_tx)).await.ok()?;
        reply_rx.await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn start() -> HubHandle {
        let (hub, handle) = Hub::new(HubConfig::default());
        hub.spawn();
        handle
    }

    async fn next(lane: &mut LaneReceiver) -> PriceEvent {
        timeout(WAIT, lane.recv())
            .await
            .expect("timed out waiting for event")
            .expect("lane closed")
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber_once() {
        let hub = start();
        let (lane1, mut rx1) = Lane::new(8);
        let (lane2, mut rx2) = Lane::new(8);
        hub.subscribe(lane1).await;
        hub.subscribe(lane2).await;

        let event = PriceEvent::new("Bitcoin", 101.5);
        hub.publish(event.clone()).await;

        assert_eq!(next(&mut rx1).await, event);
        assert_eq!(next(&mut rx2).await, event);

        // Stats are answered after the publish above has been handled.
        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.delivered, 2);
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stalled_lane_does_not_block_others() {
        let hub = start();
        let (stalled, mut stalled_rx) = Lane::new(0);
        let (reader, mut reader_rx) = Lane::new(16);
        hub.subscribe(stalled).await;
        hub.subscribe(reader).await;

        timeout(WAIT, async {
            for i in 0..5u32 {
                hub.publish(PriceEvent::new("Bitcoin", 100.0 + f64::from(i))).await;
            }
        })
        .await
        .expect("publish blocked");

        for i in 0..5u32 {
            assert_eq!(next(&mut reader_rx).await.current_price, 100.0 + f64::from(i));
        }

        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.published, 5);
        assert_eq!(stats.delivered, 6);
        assert_eq!(stats.dropped, 4);

        let mut stalled_count = 0;
        while stalled_rx.try_recv().is_ok() {
            stalled_count += 1;
        }
        assert!(stalled_count <= 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_twice_is_noop() {
        let hub = start();
        let (lane, _rx) = Lane::new(1);
        let id = lane.id();
        hub.subscribe(lane).await;

        hub.unsubscribe(id).await;
        hub.unsubscribe(id).await;

        assert_eq!(hub.subscribers().await.unwrap(), Vec::<LaneId>::new());
    }

    #[tokio::test]
    async fn test_membership_tracks_subscribe_and_unsubscribe() {
        let hub = start();
        let mut ids = Vec::new();
        let mut receivers = Vec::new();
        for _ in 0..4 {
            let (lane, rx) = Lane::new(1);
            ids.push(lane.id());
            receivers.push(rx);
            hub.subscribe(lane).await;
        }

        hub.unsubscribe(ids[1]).await;
        hub.unsubscribe(ids[3]).await;
        hub.unsubscribe(Uuid::new_v4()).await;

        let active: HashSet<_> = hub.subscribers().await.unwrap().into_iter().collect();
        let expected: HashSet<_> = [ids[0], ids[2]].into_iter().collect();
        assert_eq!(active, expected);
        assert_eq!(hub.stats().await.unwrap().subscribers, 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_lane() {
        let hub = start();
        let (lane, mut rx) = Lane::new(4);
        let id = lane.id();
        hub.subscribe(lane).await;

        hub.publish(PriceEvent::new("Ethereum", 2000.0)).await;
        assert_eq!(next(&mut rx).await.provider_name, "Ethereum");

        hub.unsubscribe(id).await;
        hub.publish(PriceEvent::new("Ethereum", 2001.0)).await;

        let closed = timeout(WAIT, rx.recv()).await.expect("lane was not closed");
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn test_dropped_receiver_counts_as_drop() {
        let hub = start();
        let (lane, rx) = Lane::new(4);
        hub.subscribe(lane).await;
        drop(rx);

        hub.publish(PriceEvent::new("Binance", 300.0)).await;
        hub.publish(PriceEvent::new("Binance", 301.0)).await;
        let stats = timeout(WAIT, async {
            loop {
                let stats = hub.stats().await.unwrap();
                if stats.published == 2 {
                    return stats;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(stats.dropped, 2);
        // Still a member until explicitly unsubscribed.
        assert_eq!(stats.subscribers, 1);
    }

    #[tokio::test]
    async fn test_hub_stops_when_handles_dropped() {
        let (hub, handle) = Hub::new(HubConfig::default());
        let task = hub.spawn();
        let (lane, mut rx) = Lane::new(1);
        handle.subscribe(lane).await;

        drop(handle);
        timeout(WAIT, task).await.unwrap().unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_attach_forwards_stream() {
        let hub = start();
        let (lane, mut rx) = Lane::new(8);
        hub.subscribe(lane).await;

        let (tx, stream) = mpsc::channel(1);
        let feed = hub.attach(stream);
        tx.send(PriceEvent::new("A", 1.0)).await.unwrap();
        tx.send(PriceEvent::new("A", 2.0)).await.unwrap();
        drop(tx);

        assert_eq!(next(&mut rx).await.current_price, 1.0);
        assert_eq!(next(&mut rx).await.current_price, 2.0);
        timeout(WAIT, feed).await.unwrap().unwrap();
    }
}
