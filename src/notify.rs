use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{Event, LotId};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for committed events, one channel per lot. Dashboards and
/// other embedding collaborators subscribe here instead of polling.
pub struct NotifyHub {
    channels: DashMap<LotId, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications for a lot. Creates the channel if needed.
    pub fn subscribe(&self, lot_id: LotId) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(lot_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, lot_id: LotId, event: &Event) {
        if let Some(sender) = self.channels.get(&lot_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Remove a channel (when the lot is deleted).
    pub fn remove(&self, lot_id: &LotId) {
        self.channels.remove(lot_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let lot_id = LotId(3);
        let mut rx = hub.subscribe(lot_id);

        let event = Event::LotDeleted { id: lot_id };
        hub.send(lot_id, &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        // No subscriber — should not panic
        hub.send(LotId(9), &Event::LotDeleted { id: LotId(9) });
    }

    #[tokio::test]
    async fn channels_are_per_lot() {
        let hub = NotifyHub::new();
        let mut rx_a = hub.subscribe(LotId(1));
        let _rx_b = hub.subscribe(LotId(2));

        hub.send(LotId(2), &Event::LotDeleted { id: LotId(2) });
        assert!(rx_a.try_recv().is_err());
    }
}
