//! In-process event bus.
//!
//! Mutators publish while still holding the stack lock, so per-stack event
//! order matches mutation order. Publishing never blocks; the consumer side
//! (the hook dispatcher loop) journals and fans out.

use tokio::sync::mpsc;
use tracing::{trace, warn};

use super::event::Event;

/// Receiving half, consumed by the dispatcher loop.
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Sending half, cloned into every component that emits events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventBus {
    /// Creates a bus and the receiver for its events.
    pub fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventBus { tx }, rx)
    }

    /// Publishes one event. A closed bus drops the event with a warning.
    pub fn publish(&self, event: Event) {
        let kind = event.kind();
        let stack = event.stack.clone();
        match self.tx.send(event) {
            Ok(()) => trace!(stack = %stack, event = %kind, "event published"),
            Err(_) => warn!(stack = %stack, event = %kind, "event bus closed, dropping event"),
        }
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = Event>) {
        for event in events {
            self.publish(event);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPayload;
    use crate::test_utils::at;
    use crate::types::StackId;

    fn lock_event(stack: &str, locked: bool) -> Event {
        Event::new(
            StackId::from(stack),
            EventPayload::Lock { locked, lock: None },
            at(0),
        )
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let (bus, mut rx) = EventBus::channel();
        bus.publish_all([lock_event("a", true), lock_event("a", false)]);

        assert_eq!(rx.recv().await, Some(lock_event("a", true)));
        assert_eq!(rx.recv().await, Some(lock_event("a", false)));
    }

    #[tokio::test]
    async fn publishing_to_closed_bus_does_not_panic() {
        let (bus, rx) = EventBus::channel();
        drop(rx);
        assert!(bus.is_closed());
        bus.publish(lock_event("a", true));
    }
}
