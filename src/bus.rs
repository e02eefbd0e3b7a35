//! In-process message bus.
//!
//! Decouples the input drivers from the session engine and the DNS driver.
//! Subscribers register a channel; `publish` fans each event out to every
//! subscriber in registration order, so all subscribers observe the same
//! event order. Publishing never blocks (channels are unbounded) and may be
//! done from inside a handler; nested publishes are simply queued behind
//! the event being handled.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;

/// Everything that crosses between drivers and the session engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Kick the session.
    Start,
    /// Reactor tick pulse.
    Heartbeat,
    /// Final teardown.
    Shutdown,
    SessionCreated {
        session_id: u16,
    },
    SessionClosed {
        session_id: u16,
        reason: String,
    },
    /// An input driver wants the session closed (local EOF, child exit).
    CloseSession {
        session_id: u16,
    },
    /// Input driver -> session engine.
    DataOut {
        session_id: u16,
        data: Bytes,
    },
    /// Session engine -> input driver.
    DataIn {
        session_id: u16,
        data: Bytes,
    },
    ConfigString {
        key: String,
        value: String,
    },
    ConfigInt {
        key: String,
        value: u32,
    },
}

/// Cheaply clonable handle to the shared subscriber list.
#[derive(Clone, Default)]
pub struct Bus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<Event>>>>,
}

impl Bus {
    pub fn new() -> Self {
        Bus::default()
    }

    /// Register a new subscriber. Events published after this call are
    /// delivered to the returned receiver in publish order.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("bus subscriber list poisoned")
            .push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber; dead ones are pruned.
    pub fn publish(&self, event: Event) {
        let mut subscribers = self
            .subscribers
            .lock()
            .expect("bus subscriber list poisoned");
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_all_subscribers_observe_same_order() {
        let bus = Bus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(Event::Start);
        bus.publish(Event::Heartbeat);
        bus.publish(Event::Shutdown);

        for rx in [&mut a, &mut b] {
            assert_eq!(rx.recv().await, Some(Event::Start));
            assert_eq!(rx.recv().await, Some(Event::Heartbeat));
            assert_eq!(rx.recv().await, Some(Event::Shutdown));
        }
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let bus = Bus::new();
        let rx = bus.subscribe();
        drop(rx);

        let mut alive = bus.subscribe();
        bus.publish(Event::Start);
        assert_eq!(alive.recv().await, Some(Event::Start));
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_events() {
        let bus = Bus::new();
        bus.publish(Event::Start);

        let mut rx = bus.subscribe();
        bus.publish(Event::Heartbeat);
        assert_eq!(rx.recv().await, Some(Event::Heartbeat));
    }
}
