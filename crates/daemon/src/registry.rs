use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::error::ControlError;
use crate::store::RegistrationStore;

/// What a client asks to receive when it registers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub endpoint: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

/// The remote-callable handle handed out to a registered client.
pub trait RemoteSession: Send + Sync {
    fn handle_id(&self) -> &str;

    /// Tear the handle down. Called once when its session is replaced,
    /// unregistered or destroyed.
    fn release(&self) -> Result<()>;
}

pub type SessionHandle = Arc<dyn RemoteSession>;

/// Builds remote handles for new sessions.
pub trait SessionBinder: Send + Sync {
    fn bind(&self, caller_id: &str, registration: &Registration) -> Result<SessionHandle>;
}

pub struct ClientSession {
    pub caller_id: String,
    pub registration: Registration,
    pub handle: SessionHandle,
    pub created_at: DateTime<Utc>,
}

/// Directory of live sessions keyed by caller id.
///
/// Mutations only ever come from the dispatcher thread; lookups come from
/// anywhere and take the read lock.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<ClientSession>>>,
    binder: Arc<dyn SessionBinder>,
    store: Arc<dyn RegistrationStore>,
}

impl SessionRegistry {
    pub fn new(binder: Arc<dyn SessionBinder>, store: Arc<dyn RegistrationStore>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            binder,
            store,
        }
    }

    /// Register `caller_id`, replacing (and releasing) any previous session.
    pub fn register(
        &self,
        caller_id: &str,
        registration: Registration,
    ) -> std::result::Result<(), ControlError> {
        self.insert(caller_id, registration.clone())?;

        if let Err(e) = self.store.save(caller_id, &registration) {
            warn!("Failed to persist registration for {}: {}", caller_id, e);
        }
        info!("Registered session for {} ({})", caller_id, registration.endpoint);
        Ok(())
    }

    /// Remove the session for `caller_id`. Unknown callers are not an error.
    pub fn unregister(&self, caller_id: &str) {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(caller_id);

        match removed {
            Some(session) => {
                release_session(&session);
                if let Err(e) = self.store.remove(caller_id) {
                    warn!("Failed to remove persisted registration for {}: {}", caller_id, e);
                }
                info!("Unregistered session for {}", caller_id);
            }
            None => debug!("Unregister for unknown caller {}, nothing to do", caller_id),
        }
    }

    pub fn lookup(&self, caller_id: &str) -> Option<Arc<ClientSession>> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(caller_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn caller_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Re-create every persisted session. Returns how many were restored.
    pub fn restore_all(&self) -> usize {
        let persisted = match self.store.load_persisted_registrations() {
            Ok(persisted) => persisted,
            Err(e) => {
                warn!("Failed to load persisted registrations: {}", e);
                return 0;
            }
        };

        let mut restored = 0;
        for record in persisted {
            match self.insert(&record.caller_id, record.registration) {
                Ok(()) => restored += 1,
                Err(e) => warn!("Skipping registration restore for {}: {}", record.caller_id, e),
            }
        }

        info!("Restored {} session(s)", restored);
        restored
    }

    /// Release every session handle and empty the registry. Persisted
    /// registrations are kept so they restore on the next start.
    pub fn destroy_all(&self) {
        let drained: Vec<Arc<ClientSession>> = self
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, session)| session)
            .collect();

        let count = drained.len();
        for session in drained {
            release_session(&session);
        }
        info!("Destroyed {} session(s)", count);
    }

    fn insert(
        &self,
        caller_id: &str,
        registration: Registration,
    ) -> std::result::Result<(), ControlError> {
        let handle = self
            .binder
            .bind(caller_id, &registration)
            .map_err(|error| ControlError::SessionBind {
                caller_id: caller_id.to_string(),
                error,
            })?;

        let session = Arc::new(ClientSession {
            caller_id: caller_id.to_string(),
            registration,
            handle,
            created_at: Utc::now(),
        });

        let previous = self
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(caller_id.to_string(), session);

        if let Some(previous) = previous {
            debug!("Replacing existing session for {}", caller_id);
            release_session(&previous);
        }
        Ok(())
    }
}

fn release_session(session: &ClientSession) {
    if let Err(e) = session.handle.release() {
        warn!(
            "Failed to release session handle {} for {}: {}",
            session.handle.handle_id(),
            session.caller_id,
            e
        );
    }
}
