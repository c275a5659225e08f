use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::controller::DaemonController;
use crate::state::DaemonState;

/// Text published on entering ONLINE, before the first real refresh completes.
pub const PLACEHOLDER_TEXT: &str = "pending";

/// Persistent indicator of the daemon's state shown to the end user.
pub trait StatusSurface: Send + Sync {
    fn show(&self, icon: &str, text: &str) -> Result<()>;

    fn hide(&self) -> Result<()>;
}

/// Map a daemon state (and, when ONLINE, the neighbor count) to status text.
///
/// Returns `None` for UNKNOWN, which has no text of its own.
pub fn status_text(state: DaemonState, neighbor_count: usize) -> Option<String> {
    match state {
        DaemonState::Pending => Some("pending ...".to_string()),
        DaemonState::Error => Some("error".to_string()),
        DaemonState::Offline => Some("offline".to_string()),
        DaemonState::Suspended => Some("suspended".to_string()),
        DaemonState::Online => Some(match neighbor_count {
            0 => "no neighbors".to_string(),
            n => format!("{} neighbors", n),
        }),
        DaemonState::Unknown => None,
    }
}

/// Derives status text from the controller and pushes it to the surface
/// while the surface is visible.
///
/// Visibility is written only by the lifecycle reactions; refreshes run on the
/// dispatcher thread and just read it.
pub struct StatusPresenter {
    controller: Arc<dyn DaemonController>,
    surface: Arc<dyn StatusSurface>,
    icon: String,
    visible: AtomicBool,
}

impl StatusPresenter {
    pub fn new(
        controller: Arc<dyn DaemonController>,
        surface: Arc<dyn StatusSurface>,
        icon: impl Into<String>,
    ) -> Self {
        Self {
            controller,
            surface,
            icon: icon.into(),
            visible: AtomicBool::new(false),
        }
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }

    pub fn icon(&self) -> &str {
        &self.icon
    }

    /// Mark the surface visible and publish the placeholder text.
    pub fn show_placeholder(&self) {
        self.visible.store(true, Ordering::SeqCst);
        if let Err(e) = self.surface.show(&self.icon, PLACEHOLDER_TEXT) {
            warn!("Failed to show status surface: {}", e);
        }
    }

    /// Mark the surface invisible and take it down.
    pub fn hide(&self) {
        self.visible.store(false, Ordering::SeqCst);
        if let Err(e) = self.surface.hide() {
            warn!("Failed to hide status surface: {}", e);
        }
    }

    /// Recompute the status text and push it if the surface is visible.
    ///
    /// Returns the text that was computed, whether or not it was published.
    pub fn refresh(&self) -> Option<String> {
        let state = self.controller.get_state();

        let neighbor_count = if state == DaemonState::Online {
            match self.controller.get_neighbors() {
                Ok(neighbors) => neighbors.len(),
                Err(e) => {
                    warn!("Failed to query neighbors for status refresh: {}", e);
                    return None;
                }
            }
        } else {
            0
        };

        let text = status_text(state, neighbor_count);

        if !self.is_visible() {
            debug!("Status surface hidden, discarding status text {:?}", text);
            return text;
        }

        let shown = text.as_deref().unwrap_or("");
        if let Err(e) = self.surface.show(&self.icon, shown) {
            warn!("Failed to update status surface: {}", e);
        }
        text
    }
}
