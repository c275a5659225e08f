use anyhow::Result;
use std::sync::Arc;

use crate::controller::{DaemonController, Node};
use crate::registry::{SessionHandle, SessionRegistry};
use crate::state::DaemonState;

/// Read-only surface handed to external callers.
///
/// Every call runs on the caller's context; nothing here goes through the
/// command queue.
#[derive(Clone)]
pub struct ControlService {
    controller: Arc<dyn DaemonController>,
    registry: Arc<SessionRegistry>,
}

impl ControlService {
    pub fn new(controller: Arc<dyn DaemonController>, registry: Arc<SessionRegistry>) -> Self {
        Self {
            controller,
            registry,
        }
    }

    pub fn get_state(&self) -> DaemonState {
        self.controller.get_state()
    }

    pub fn is_running(&self) -> bool {
        self.get_state() == DaemonState::Online
    }

    pub fn get_neighbors(&self) -> Result<Vec<Node>> {
        self.controller.get_neighbors()
    }

    pub fn clear_storage(&self) -> Result<()> {
        self.controller.clear_storage()
    }

    /// The remote handle of `caller_id`'s session, if it is registered.
    pub fn get_session(&self, caller_id: &str) -> Option<SessionHandle> {
        self.registry
            .lookup(caller_id)
            .map(|session| Arc::clone(&session.handle))
    }

    pub fn get_version(&self) -> Result<Vec<String>> {
        self.controller.get_version()
    }
}
