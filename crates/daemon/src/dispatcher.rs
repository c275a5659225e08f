use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::error::{ControlError, Result};
use crate::registry::Registration;

/// Opaque id the hosting process uses to acknowledge a command.
pub type StartId = u64;

/// Issues start ids and tracks which have finished executing.
#[derive(Debug)]
pub struct StartLedger {
    next: AtomicU64,
    finished: AtomicU64,
}

impl StartLedger {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            finished: AtomicU64::new(0),
        }
    }

    pub fn issue(&self) -> StartId {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    pub fn last_issued(&self) -> Option<StartId> {
        match self.next.load(Ordering::SeqCst) {
            1 => None,
            next => Some(next - 1),
        }
    }

    pub fn finish(&self, start_id: StartId) {
        self.finished.fetch_max(start_id, Ordering::SeqCst);
    }

    /// True when every issued start id has finished.
    pub fn is_idle(&self) -> bool {
        self.last_issued()
            .map_or(true, |last| self.finished.load(Ordering::SeqCst) >= last)
    }
}

impl Default for StartLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a client wants replies delivered. The caller's identity is the
/// principal owning the target, never anything in the request payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyTarget {
    pub package: String,
}

impl ReplyTarget {
    pub fn new(package: impl Into<String>) -> Self {
        Self {
            package: package.into(),
        }
    }

    pub fn caller_id(&self) -> &str {
        &self.package
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Startup,
    Shutdown,
    Restart {
        #[serde(default)]
        level: i32,
    },
    UpdateStatus,
    Register {
        registration: Registration,
        reply_target: ReplyTarget,
    },
    Unregister {
        reply_target: ReplyTarget,
    },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Startup => "startup",
            Action::Shutdown => "shutdown",
            Action::Restart { .. } => "restart",
            Action::UpdateStatus => "update_status",
            Action::Register { .. } => "register",
            Action::Unregister { .. } => "unregister",
        }
    }
}

/// A queued command. Immutable once submitted and executed exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub seq: u64,
    pub start_id: Option<StartId>,
    pub action: Action,
}

/// Executes commands on the dispatcher thread.
pub trait CommandHandler: Send + Sync {
    fn execute(&self, command: &Command) -> anyhow::Result<()>;

    /// Runs after every command, whether or not `execute` succeeded.
    fn finish(&self, _command: &Command) {}
}

struct Shared {
    tx: Mutex<Option<UnboundedSender<Command>>>,
    next_seq: AtomicU64,
    closing: AtomicBool,
}

/// Cloneable, non-blocking producer side of the dispatcher queue.
#[derive(Clone)]
pub struct CommandSender {
    shared: Arc<Shared>,
}

impl CommandSender {
    /// Append a command to the queue and return its arrival sequence.
    pub fn submit(&self, action: Action, start_id: Option<StartId>) -> Result<u64> {
        let guard = self.shared.tx.lock().unwrap_or_else(|e| e.into_inner());
        let tx = guard.as_ref().ok_or(ControlError::DispatcherClosed)?;

        // Sequence is taken under the lock so it matches queue order.
        let seq = self.shared.next_seq.fetch_add(1, Ordering::SeqCst);
        let name = action.name();
        tx.send(Command {
            seq,
            start_id,
            action,
        })
        .map_err(|_| ControlError::DispatcherClosed)?;

        debug!("Queued command #{} ({})", seq, name);
        Ok(seq)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closing.load(Ordering::SeqCst)
    }
}

/// Single-consumer command queue drained by one dedicated thread.
pub struct CommandDispatcher {
    sender: CommandSender,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl CommandDispatcher {
    pub fn spawn(handler: Arc<dyn CommandHandler>) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            tx: Mutex::new(Some(tx)),
            next_seq: AtomicU64::new(0),
            closing: AtomicBool::new(false),
        });

        let loop_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("dtn-control-dispatch".to_string())
            .spawn(move || run_dispatch_loop(rx, handler, loop_shared))
            .map_err(ControlError::DispatcherSpawn)?;
        let worker_id = worker.thread().id();

        Ok(Self {
            sender: CommandSender { shared },
            worker: Mutex::new(Some(worker)),
            worker_id,
        })
    }

    pub fn sender(&self) -> CommandSender {
        self.sender.clone()
    }

    pub fn submit(&self, action: Action, start_id: Option<StartId>) -> Result<u64> {
        self.sender.submit(action, start_id)
    }

    /// Stop accepting commands, discard whatever is still queued and wait for
    /// the command in flight to finish.
    pub fn shutdown(&self) {
        let shared = &self.sender.shared;
        shared.closing.store(true, Ordering::SeqCst);
        drop(shared.tx.lock().unwrap_or_else(|e| e.into_inner()).take());

        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            if thread::current().id() == self.worker_id {
                warn!("Dispatcher shutdown requested from its own thread, not joining");
                return;
            }
            if worker.join().is_err() {
                error!("Dispatcher thread panicked");
            }
            info!("Command dispatcher stopped");
        }
    }
}

impl Drop for CommandDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_dispatch_loop(
    mut rx: UnboundedReceiver<Command>,
    handler: Arc<dyn CommandHandler>,
    shared: Arc<Shared>,
) {
    debug!("Command dispatcher started");
    let mut discarded = 0usize;

    while let Some(command) = rx.blocking_recv() {
        if shared.closing.load(Ordering::SeqCst) {
            discarded += 1;
            continue;
        }
        run_command(handler.as_ref(), &command);
    }

    if discarded > 0 {
        info!("Discarded {} pending command(s) at shutdown", discarded);
    }
}

fn run_command(handler: &dyn CommandHandler, command: &Command) {
    debug!(
        "Executing command #{} ({}, start id {:?})",
        command.seq,
        command.action.name(),
        command.start_id
    );

    match panic::catch_unwind(AssertUnwindSafe(|| handler.execute(command))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(
            "Command #{} ({}) failed: {:#}",
            command.seq,
            command.action.name(),
            e
        ),
        Err(_) => error!(
            "Command #{} ({}) panicked",
            command.seq,
            command.action.name()
        ),
    }

    if panic::catch_unwind(AssertUnwindSafe(|| handler.finish(command))).is_err() {
        error!("Epilogue for command #{} panicked", command.seq);
    }
}
