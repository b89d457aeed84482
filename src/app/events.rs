//! Flow lifecycle events for observers

use tokio::sync::broadcast;

use crate::flow::FlowId;
use crate::proxy::ConnectionId;

/// Events published by `FlowMaster`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowEvent {
    /// Client admitted
    ClientConnected(ConnectionId),

    /// Client gone
    ClientDisconnected(ConnectionId),

    /// New flow recorded
    FlowAdded(FlowId),

    /// Flow received a response, an error or an edit
    FlowUpdated(FlowId),

    /// Flow paused and waiting for a decision
    FlowIntercepted(FlowId),

    /// Flow removed from state
    FlowRemoved(FlowId),

    /// View filter replaced or state cleared
    ViewChanged,
}

/// Broadcasts flow events to any number of subscribers
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FlowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is fine.
    pub fn emit(&self, event: FlowEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("No event subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
