//! Change feed for incidents, hotspots, and alerts.
//!
//! Publishing never blocks. Each subscriber gets its own bounded buffer;
//! a subscriber that falls behind loses the oldest events and is told how
//! many it missed on its next receive.

use crime_watch_hotspot_models::HotspotEvent;
use tokio::sync::broadcast;

/// Fan-out channel of [`HotspotEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<HotspotEvent>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Registers a new subscriber that receives every event published from
    /// now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<HotspotEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publishes an event to every current subscriber.
    pub fn publish(&self, event: HotspotEvent) {
        if self.tx.send(event).is_err() {
            log::trace!("No subscribers for hotspot event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deferred(id: &str) -> HotspotEvent {
        HotspotEvent::IncidentDeferred {
            incident_id: id.to_string(),
            reason: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn every_subscriber_gets_every_event() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(deferred("x"));

        assert_eq!(a.recv().await.unwrap(), deferred("x"));
        assert_eq!(b.recv().await.unwrap(), deferred("x"));
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_fine() {
        let bus = EventBus::new(8);
        bus.publish(deferred("ignored"));
        let mut late = bus.subscribe();
        bus.publish(deferred("seen"));
        assert_eq!(late.recv().await.unwrap(), deferred("seen"));
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..5 {
            bus.publish(deferred(&i.to_string()));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        assert_eq!(rx.recv().await.unwrap(), deferred("3"));
    }
}
