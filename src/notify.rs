use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{SlotKey, SlotKind};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for cache-invalidation keys (`domain/entityId`), one
/// channel per domain.
pub struct NotifyHub {
    channels: DashMap<SlotKind, broadcast::Sender<String>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to invalidations of a domain. Creates the channel if needed.
    pub fn subscribe(&self, kind: SlotKind) -> broadcast::Receiver<String> {
        let sender = self
            .channels
            .entry(kind)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send the invalidation key of `key`. No-op if nobody is listening.
    pub fn send(&self, key: &SlotKey) {
        if let Some(sender) = self.channels.get(&key.kind) {
            let _ = sender.send(key.cache_key());
        }
    }

    pub fn remove(&self, kind: SlotKind) {
        self.channels.remove(&kind);
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Entity;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe(SlotKind::Operation);

        hub.send(&SlotKey::new(Entity::Machine(3), SlotKind::Operation));
        // Other domains do not reach this channel.
        hub.send(&SlotKey::new(Entity::Machine(3), SlotKind::Shift));

        assert_eq!(rx.recv().await.unwrap(), "operation/machine-3");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        // No subscriber: must not panic
        hub.send(&SlotKey::new(Entity::Global, SlotKind::Day));
        hub.remove(SlotKind::Day);
    }
}
