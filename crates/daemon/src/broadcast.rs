use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::controller::DaemonEvent;
use crate::state::DaemonState;

/// Notification delivered to external listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Broadcast {
    StateChanged { state: DaemonState },
    Event(DaemonEvent),
}

pub trait BroadcastSink: Send + Sync {
    fn state_changed(&self, state: DaemonState);

    fn forward_event(&self, event: DaemonEvent);
}

/// Fan-out over a `tokio::sync::broadcast` channel.
///
/// Sending never blocks; with no subscribers the notification is dropped.
#[derive(Debug, Clone)]
pub struct ChannelBroadcaster {
    tx: broadcast::Sender<Broadcast>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Broadcast> {
        self.tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn send(&self, message: Broadcast) {
        if self.tx.send(message).is_err() {
            debug!("No broadcast listeners");
        }
    }
}

impl BroadcastSink for ChannelBroadcaster {
    fn state_changed(&self, state: DaemonState) {
        self.send(Broadcast::StateChanged { state });
    }

    fn forward_event(&self, event: DaemonEvent) {
        self.send(Broadcast::Event(event));
    }
}
