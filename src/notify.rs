use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for per-time-slot change feeds (bookings, status changes,
/// voids). Observers use it to refresh occupancy views.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
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

    /// Subscribe to a time slot's events. Creates the channel if needed.
    pub fn subscribe(&self, time_slot_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(time_slot_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, time_slot_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&time_slot_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop a slot's channel once the slot is purged. Subscribers see the
    /// stream close.
    pub fn remove(&self, time_slot_id: &Ulid) {
        self.channels.remove(time_slot_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AppointmentStatus;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let slot = Ulid::new();
        let mut rx = hub.subscribe(slot);

        let event = Event::AppointmentStatusChanged {
            id: Ulid::new(),
            time_slot_id: slot,
            status: AppointmentStatus::Waiting,
            at: 1_000,
        };
        hub.send(slot, &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn other_slots_not_delivered() {
        let hub = NotifyHub::new();
        let watched = Ulid::new();
        let other = Ulid::new();
        let mut rx = hub.subscribe(watched);
        hub.send(other, &Event::TimeSlotUnvoided { id: other });
        assert!(matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let slot = Ulid::new();
        // No subscriber, no panic
        hub.send(slot, &Event::TimeSlotUnvoided { id: slot });
    }

    #[tokio::test]
    async fn remove_closes_stream() {
        let hub = NotifyHub::new();
        let slot = Ulid::new();
        let mut rx = hub.subscribe(slot);
        hub.remove(&slot);
        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Closed)));
    }
}
