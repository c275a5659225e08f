use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info};

use crate::controller::DaemonController;
use crate::dispatcher::{Action, Command, CommandHandler, StartLedger};
use crate::lifecycle::ProcessHost;
use crate::presenter::StatusPresenter;
use crate::registry::SessionRegistry;
use crate::state::DaemonState;

/// Runs queued commands against the controller and the session registry.
pub struct ControlExecutor {
    controller: Arc<dyn DaemonController>,
    registry: Arc<SessionRegistry>,
    presenter: Arc<StatusPresenter>,
    host: Arc<dyn ProcessHost>,
    starts: Arc<StartLedger>,
}

impl ControlExecutor {
    pub fn new(
        controller: Arc<dyn DaemonController>,
        registry: Arc<SessionRegistry>,
        presenter: Arc<StatusPresenter>,
        host: Arc<dyn ProcessHost>,
        starts: Arc<StartLedger>,
    ) -> Self {
        Self {
            controller,
            registry,
            presenter,
            host,
            starts,
        }
    }
}

impl CommandHandler for ControlExecutor {
    fn execute(&self, command: &Command) -> Result<()> {
        match &command.action {
            Action::Startup => {
                if self.controller.get_state() == DaemonState::Online {
                    debug!("Daemon already online, ignoring startup");
                    return Ok(());
                }
                info!("Starting daemon");
                self.controller.start()?;
            }
            Action::Shutdown => {
                info!("Stopping daemon");
                self.controller.stop()?;
            }
            Action::Restart { level } => {
                info!("Restarting daemon into run level {}", level);
                self.controller.restart(*level)?;
            }
            Action::UpdateStatus => {
                self.presenter.refresh();
            }
            Action::Register {
                registration,
                reply_target,
            } => {
                self.registry
                    .register(reply_target.caller_id(), registration.clone())?;
            }
            Action::Unregister { reply_target } => {
                self.registry.unregister(reply_target.caller_id());
            }
        }
        Ok(())
    }

    fn finish(&self, command: &Command) {
        if let Some(start_id) = command.start_id {
            self.starts.finish(start_id);
        }

        // A newer external command still queued keeps the host alive.
        if self.controller.get_state() == DaemonState::Offline && self.starts.is_idle() {
            debug!(
                "Daemon offline after command #{}, releasing host (start id {:?})",
                command.seq, command.start_id
            );
            self.host.release(command.start_id);
        }
    }
}
