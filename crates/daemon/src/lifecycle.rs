use std::sync::Arc;
use tracing::{debug, info};

use crate::broadcast::BroadcastSink;
use crate::controller::{DaemonEvent, DaemonHandler};
use crate::dispatcher::{Action, CommandSender, StartId};
use crate::presenter::StatusPresenter;
use crate::state::DaemonState;

/// The process hosting the control plane.
///
/// `terminate` and `release` must only signal; tearing the control plane down
/// synchronously from inside them would run on the dispatcher thread.
pub trait ProcessHost: Send + Sync {
    /// Keep the process alive under resource pressure while the daemon runs.
    fn enter_privileged_mode(&self);

    fn exit_privileged_mode(&self);

    /// Begin shutting the hosting process down.
    fn terminate(&self);

    /// The control plane is idle and offline after the command started with
    /// `start_id`; the host may stop if nothing newer is outstanding.
    fn release(&self, start_id: Option<StartId>);
}

/// Read-only "should the daemon auto-start" preference.
pub trait AutoStartPreference: Send + Sync {
    fn auto_start(&self) -> bool;
}

/// Fixed preference value.
#[derive(Debug, Clone, Copy)]
pub struct StaticPreference(pub bool);

impl AutoStartPreference for StaticPreference {
    fn auto_start(&self) -> bool {
        self.0
    }
}

/// Reacts to controller notifications.
pub struct LifecycleHandler {
    presenter: Arc<StatusPresenter>,
    host: Arc<dyn ProcessHost>,
    preference: Arc<dyn AutoStartPreference>,
    broadcaster: Arc<dyn BroadcastSink>,
    commands: CommandSender,
}

impl LifecycleHandler {
    pub fn new(
        presenter: Arc<StatusPresenter>,
        host: Arc<dyn ProcessHost>,
        preference: Arc<dyn AutoStartPreference>,
        broadcaster: Arc<dyn BroadcastSink>,
        commands: CommandSender,
    ) -> Self {
        Self {
            presenter,
            host,
            preference,
            broadcaster,
            commands,
        }
    }

    fn request_refresh(&self) {
        if let Err(e) = self.commands.submit(Action::UpdateStatus, None) {
            debug!("Status refresh not queued: {}", e);
        }
    }
}

impl DaemonHandler for LifecycleHandler {
    fn on_state_changed(&self, state: DaemonState) {
        info!("Daemon state changed to {}", state);

        // The placeholder must be up before a queued refresh can count neighbors.
        match state {
            DaemonState::Online => {
                self.presenter.show_placeholder();
                self.host.enter_privileged_mode();
            }
            DaemonState::Offline => {
                if self.preference.auto_start() {
                    debug!("Daemon offline but auto-start is enabled, staying resident");
                } else {
                    self.presenter.hide();
                    self.host.exit_privileged_mode();
                    self.host.terminate();
                }
            }
            DaemonState::Pending
            | DaemonState::Suspended
            | DaemonState::Error
            | DaemonState::Unknown => {}
        }

        self.request_refresh();
        self.broadcaster.state_changed(state);
    }

    fn on_neighborhood_changed(&self) {
        self.request_refresh();
    }

    fn on_event(&self, event: DaemonEvent) {
        self.broadcaster.forward_event(event);
    }
}
