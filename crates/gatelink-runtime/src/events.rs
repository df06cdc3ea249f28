//! Gateway event fan-out.
//!
//! Inbound event frames are published to subscribers by name. A subscriber
//! holds a channel receiver plus an id it can use to unsubscribe; the bus
//! also drops entries whose receiver has gone away, so leaked subscriptions
//! cannot pile up.

use serde_json::Value;
use tokio::sync::mpsc;

// ----------------------------------------------------------------------------
// Event Types
// ----------------------------------------------------------------------------

/// One named event from the gateway, payload passed through untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayEvent {
    pub name: String,
    pub payload: Option<Value>,
}

/// Identifies one subscription for explicit removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

// ----------------------------------------------------------------------------
// Event Bus
// ----------------------------------------------------------------------------

struct Entry {
    id: SubscriptionId,
    /// `None` subscribes to every event
    name: Option<String>,
    tx: mpsc::UnboundedSender<GatewayEvent>,
}

/// Name-keyed dispatch table, owned by the engine task.
#[derive(Default)]
pub struct EventBus {
    next_id: u64,
    entries: Vec<Entry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for one event name, or all events when `name`
    /// is `None`.
    pub fn subscribe(
        &mut self,
        name: Option<String>,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<GatewayEvent>) {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.entries.push(Entry { id, name, tx });
        (id, rx)
    }

    /// Remove a subscription. Unknown ids are a no-op, so double
    /// unsubscribes are harmless.
    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        self.entries.retain(|entry| entry.id != id);
    }

    /// Deliver an event to every matching live subscriber.
    pub fn publish(&mut self, event: &GatewayEvent) {
        self.entries.retain(|entry| {
            let matches = match &entry.name {
                Some(name) => *name == event.name,
                None => true,
            };
            if !matches {
                return true;
            }
            // A failed send means the receiver was dropped; forget it.
            entry.tx.send(event.clone()).is_ok()
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.entries.len()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
