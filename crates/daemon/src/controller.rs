use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::state::DaemonState;

/// A peer currently known to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub endpoint: String,
    pub kind: String,
}

impl Node {
    pub fn new(endpoint: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            kind: kind.into(),
        }
    }
}

/// Generic daemon notification forwarded verbatim to broadcast listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonEvent {
    pub action: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl DaemonEvent {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Receives asynchronous notifications from a [`DaemonController`].
///
/// Implementations may be called from any thread, including the dispatcher
/// thread while it is inside a controller call, so they must never block on
/// the dispatcher.
pub trait DaemonHandler: Send + Sync {
    fn on_state_changed(&self, state: DaemonState);

    fn on_neighborhood_changed(&self);

    fn on_event(&self, event: DaemonEvent);
}

/// Owner of the daemon process and its lifecycle state.
///
/// Queries are called concurrently from remote callers while the dispatcher
/// thread runs lifecycle commands, so implementations must be safe for
/// concurrent reads during writes.
pub trait DaemonController: Send + Sync {
    fn get_state(&self) -> DaemonState;

    fn get_neighbors(&self) -> Result<Vec<Node>>;

    fn get_version(&self) -> Result<Vec<String>>;

    fn clear_storage(&self) -> Result<()>;

    fn start(&self) -> Result<()>;

    fn stop(&self) -> Result<()>;

    fn restart(&self, level: i32) -> Result<()>;

    /// Prepare the controller and register the handler for state, neighbor
    /// and event notifications.
    fn initialize(&self, handler: Arc<dyn DaemonHandler>) -> Result<()>;

    /// Release every resource; no notification may be delivered afterwards.
    fn destroy(&self);
}
