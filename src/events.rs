use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub so UI/CRUD collaborators can watch mutations as they land.
/// Channels are keyed by entity id: cell id for cell and assignment events,
/// occupant id for occupant events.
pub struct EventBus {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to events for one entity. Creates the channel if needed.
    pub fn subscribe(&self, key: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(key)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish an event. No-op if nobody is listening.
    pub fn send(&self, key: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&key) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop a channel, e.g. when the entity is deleted.
    pub fn remove(&self, key: &Ulid) {
        self.channels.remove(key);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_sees_event() {
        let bus = EventBus::new();
        let cell_id = Ulid::new();
        let mut rx = bus.subscribe(cell_id);

        let event = Event::CellCreated {
            id: cell_id,
            floor: 2,
            capacity: 3,
        };
        bus.send(cell_id, &event);
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn send_without_subscriber_is_noop() {
        let bus = EventBus::new();
        // Must not panic or block.
        bus.send(Ulid::new(), &Event::CellDeleted { id: Ulid::new() });
    }
}
