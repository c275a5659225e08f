use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::broadcast::BroadcastSink;
use crate::controller::DaemonController;
use crate::dispatcher::{Action, CommandDispatcher, CommandSender, StartId, StartLedger};
use crate::error::Result;
use crate::executor::ControlExecutor;
use crate::lifecycle::{AutoStartPreference, LifecycleHandler, ProcessHost};
use crate::presenter::{StatusPresenter, StatusSurface};
use crate::registry::{SessionBinder, SessionRegistry};
use crate::service::ControlService;
use crate::store::RegistrationStore;

/// External collaborators the control plane is wired to.
pub struct Collaborators {
    pub controller: Arc<dyn DaemonController>,
    pub surface: Arc<dyn StatusSurface>,
    pub host: Arc<dyn ProcessHost>,
    pub preference: Arc<dyn AutoStartPreference>,
    pub broadcaster: Arc<dyn BroadcastSink>,
    pub binder: Arc<dyn SessionBinder>,
    pub store: Arc<dyn RegistrationStore>,
}

/// The command dispatcher, session registry and status presenter bound to one
/// daemon controller.
pub struct ControlPlane {
    controller: Arc<dyn DaemonController>,
    registry: Arc<SessionRegistry>,
    presenter: Arc<StatusPresenter>,
    dispatcher: CommandDispatcher,
    starts: Arc<StartLedger>,
    start_lock: Mutex<()>,
    destroyed: AtomicBool,
}

impl ControlPlane {
    /// Spawn the dispatcher, initialize the controller, restore sessions and
    /// queue a startup when auto-start is enabled.
    pub fn initialize(parts: Collaborators, status_icon: &str) -> Result<Self> {
        let Collaborators {
            controller,
            surface,
            host,
            preference,
            broadcaster,
            binder,
            store,
        } = parts;

        let presenter = Arc::new(StatusPresenter::new(
            Arc::clone(&controller),
            surface,
            status_icon,
        ));
        let registry = Arc::new(SessionRegistry::new(binder, store));
        let starts = Arc::new(StartLedger::new());

        let executor = Arc::new(ControlExecutor::new(
            Arc::clone(&controller),
            Arc::clone(&registry),
            Arc::clone(&presenter),
            Arc::clone(&host),
            Arc::clone(&starts),
        ));
        let dispatcher = CommandDispatcher::spawn(executor)?;

        let handler = Arc::new(LifecycleHandler::new(
            Arc::clone(&presenter),
            host,
            Arc::clone(&preference),
            broadcaster,
            dispatcher.sender(),
        ));
        // Only a missing dispatcher is fatal; commands still run and fail on their own.
        if let Err(e) = controller.initialize(handler) {
            warn!("Daemon controller failed to initialize: {:#}", e);
        }

        registry.restore_all();

        let plane = Self {
            controller,
            registry,
            presenter,
            dispatcher,
            starts,
            start_lock: Mutex::new(()),
            destroyed: AtomicBool::new(false),
        };

        if preference.auto_start() {
            info!("Auto-start enabled, queueing daemon startup");
            plane.start_command(Some(Action::Startup))?;
        }

        info!("Control plane initialized");
        Ok(plane)
    }

    /// Queue an externally requested command under a fresh start id. A missing
    /// action means the host restarted us without one, which is a startup.
    pub fn start_command(&self, action: Option<Action>) -> Result<StartId> {
        let action = action.unwrap_or_else(|| {
            debug!("No action given, defaulting to startup");
            Action::Startup
        });
        // Ids must reach the queue in the order they were issued.
        let _guard = self.start_lock.lock().unwrap_or_else(|e| e.into_inner());
        let start_id = self.starts.issue();
        if let Err(e) = self.dispatcher.submit(action, Some(start_id)) {
            // Never executes, so it must not hold the host alive.
            self.starts.finish(start_id);
            return Err(e);
        }
        Ok(start_id)
    }

    /// The most recently issued start id, if any.
    pub fn last_start_id(&self) -> Option<StartId> {
        self.starts.last_issued()
    }

    pub fn sender(&self) -> CommandSender {
        self.dispatcher.sender()
    }

    pub fn service(&self) -> ControlService {
        ControlService::new(Arc::clone(&self.controller), Arc::clone(&self.registry))
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn presenter(&self) -> &Arc<StatusPresenter> {
        &self.presenter
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Stop the dispatcher, then tear down sessions, then the controller.
    /// Later calls do nothing.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Destroying control plane");
        self.dispatcher.shutdown();
        self.registry.destroy_all();
        self.controller.destroy();
        self.presenter.hide();
        info!("Control plane destroyed");
    }
}
