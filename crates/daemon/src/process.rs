use anyhow::{anyhow, Context, Result};
use regex::Regex;
use std::fs;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::config::ControlConfig;
use crate::controller::{DaemonController, DaemonEvent, DaemonHandler, Node};
use crate::state::{DaemonState, StateMachine};

/// Environment variable carrying the requested run level to the daemon.
pub const RUNLEVEL_ENV: &str = "DTN_RUNLEVEL";

#[derive(Debug, Clone)]
pub struct ProcessSettings {
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub storage_dir: PathBuf,
    pub stop_timeout: Duration,
}

impl From<&ControlConfig> for ProcessSettings {
    fn from(config: &ControlConfig) -> Self {
        Self {
            binary: config.daemon_binary.clone(),
            args: config.daemon_args.clone(),
            storage_dir: config.storage_dir.clone(),
            stop_timeout: Duration::from_secs(config.stop_timeout_secs),
        }
    }
}

/// One `key=value` line from the daemon's stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonRecord {
    State(DaemonState),
    NeighborUp(String),
    NeighborDown(String),
    Event(DaemonEvent),
}

/// Parse a stdout line. Lines without `=` are plain log output.
pub fn parse_record(line: &str) -> Option<DaemonRecord> {
    let (key, value) = line.trim().split_once('=')?;
    let key = key.trim();
    let value = value.trim();
    if key.is_empty() {
        return None;
    }

    let record = match key {
        "state" => DaemonRecord::State(match value {
            "online" => DaemonState::Online,
            "suspended" => DaemonState::Suspended,
            "offline" => DaemonState::Offline,
            "error" => DaemonState::Error,
            _ => return None,
        }),
        "neighbor+" if !value.is_empty() => DaemonRecord::NeighborUp(value.to_string()),
        "neighbor-" if !value.is_empty() => DaemonRecord::NeighborDown(value.to_string()),
        _ => DaemonRecord::Event(DaemonEvent::new(key).with_attribute("value", value)),
    };
    Some(record)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopMode {
    Shutdown,
    Restart,
}

struct RunningDaemon {
    stop_tx: Option<oneshot::Sender<StopMode>>,
    monitor: JoinHandle<()>,
}

/// Supervises an external daemon executable.
pub struct ProcessController {
    settings: ProcessSettings,
    runtime: Handle,
    machine: Arc<StateMachine>,
    neighbors: Arc<RwLock<Vec<Node>>>,
    running: Mutex<Option<RunningDaemon>>,
}

impl ProcessController {
    pub fn new(settings: ProcessSettings, runtime: Handle) -> Self {
        Self {
            settings,
            runtime,
            machine: Arc::new(StateMachine::new()),
            neighbors: Arc::new(RwLock::new(Vec::new())),
            running: Mutex::new(None),
        }
    }

    fn launch(&self, level: i32) -> Result<()> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(daemon) = running.as_ref() {
            if !daemon.monitor.is_finished() {
                anyhow::bail!("daemon is already running");
            }
        }

        apply_transition(&self.machine, DaemonState::Pending);

        let _guard = self.runtime.enter();
        let mut cmd = tokio::process::Command::new(&self.settings.binary);
        cmd.args(&self.settings.args)
            .env(RUNLEVEL_ENV, level.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                apply_transition(&self.machine, DaemonState::Error);
                return Err(anyhow!(
                    "Failed to spawn {}: {}",
                    self.settings.binary.display(),
                    e
                ));
            }
        };

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Failed to capture daemon stdout"))?;

        info!(
            "Spawned {} (pid {:?}, run level {})",
            self.settings.binary.display(),
            child.id(),
            level
        );

        let (stop_tx, stop_rx) = oneshot::channel();
        let monitor = self.runtime.spawn(supervise(
            child,
            stdout,
            stop_rx,
            Arc::clone(&self.machine),
            Arc::clone(&self.neighbors),
        ));

        *running = Some(RunningDaemon {
            stop_tx: Some(stop_tx),
            monitor,
        });
        Ok(())
    }

    fn signal_stop(&self, mode: StopMode) -> bool {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        match running.as_mut() {
            Some(daemon) if !daemon.monitor.is_finished() => {
                if let Some(tx) = daemon.stop_tx.take() {
                    let _ = tx.send(mode);
                }
                true
            }
            _ => false,
        }
    }

    /// Wait for the supervisor to see the process exit.
    fn wait_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let finished = self
                .running
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .as_ref()
                .map_or(true, |daemon| daemon.monitor.is_finished());
            if finished {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(25));
        }
    }
}

impl DaemonController for ProcessController {
    fn get_state(&self) -> DaemonState {
        self.machine.current()
    }

    fn get_neighbors(&self) -> Result<Vec<Node>> {
        Ok(self
            .neighbors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    fn get_version(&self) -> Result<Vec<String>> {
        let output = std::process::Command::new(&self.settings.binary)
            .arg("--version")
            .output()
            .with_context(|| {
                format!(
                    "Failed to execute {} --version",
                    self.settings.binary.display()
                )
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let first_line = stdout.lines().next().unwrap_or("").trim().to_string();

        let re = Regex::new(r"(\d+)\.(\d+)(?:\.(\d+))?").context("Invalid version pattern")?;
        let version = re
            .find(&first_line)
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| anyhow!("Failed to parse daemon version from: {}", first_line))?;

        Ok(vec![version, first_line])
    }

    fn clear_storage(&self) -> Result<()> {
        let dir = &self.settings.storage_dir;
        if !dir.exists() {
            return Ok(());
        }

        let mut failures = 0usize;
        for entry in WalkDir::new(dir).min_depth(1).contents_first(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Failed to walk storage: {}", e);
                    failures += 1;
                    continue;
                }
            };
            let removed = if entry.file_type().is_dir() {
                fs::remove_dir(entry.path())
            } else {
                fs::remove_file(entry.path())
            };
            if let Err(e) = removed {
                warn!("Failed to remove {:?}: {}", entry.path(), e);
                failures += 1;
            }
        }

        if failures > 0 {
            anyhow::bail!("{} storage entries could not be removed", failures);
        }
        info!("Cleared daemon storage at {}", dir.display());
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.launch(0)
    }

    fn stop(&self) -> Result<()> {
        if !self.signal_stop(StopMode::Shutdown) {
            debug!("Stop requested but no daemon process is running");
        }
        Ok(())
    }

    fn restart(&self, level: i32) -> Result<()> {
        if self.signal_stop(StopMode::Restart) && !self.wait_stopped(self.settings.stop_timeout) {
            anyhow::bail!(
                "daemon did not stop within {} seconds",
                self.settings.stop_timeout.as_secs()
            );
        }
        self.launch(level)
    }

    fn initialize(&self, handler: Arc<dyn DaemonHandler>) -> Result<()> {
        fs::create_dir_all(&self.settings.storage_dir).with_context(|| {
            format!(
                "Failed to create storage dir {}",
                self.settings.storage_dir.display()
            )
        })?;
        self.machine.set_handler(handler);
        Ok(())
    }

    fn destroy(&self) {
        self.machine.clear_handler();

        if self.signal_stop(StopMode::Shutdown) && !self.wait_stopped(self.settings.stop_timeout) {
            warn!("Daemon did not exit in time, aborting supervisor");
        }
        if let Some(daemon) = self.running.lock().unwrap_or_else(|e| e.into_inner()).take() {
            // Dropping the child inside the aborted task kills the process.
            daemon.monitor.abort();
        }
    }
}

async fn supervise(
    mut child: Child,
    stdout: ChildStdout,
    mut stop_rx: oneshot::Receiver<StopMode>,
    machine: Arc<StateMachine>,
    neighbors: Arc<RwLock<Vec<Node>>>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut stdout_open = true;
    let mut stop_mode: Option<StopMode> = None;

    let status = loop {
        tokio::select! {
            line = lines.next_line(), if stdout_open => match line {
                Ok(Some(line)) => handle_line(&line, &machine, &neighbors),
                Ok(None) => stdout_open = false,
                Err(e) => {
                    warn!("Failed to read daemon output: {}", e);
                    stdout_open = false;
                }
            },
            mode = &mut stop_rx, if stop_mode.is_none() => {
                stop_mode = Some(mode.unwrap_or(StopMode::Shutdown));
                if let Err(e) = child.start_kill() {
                    warn!("Failed to signal daemon: {}", e);
                }
            },
            status = child.wait() => break status,
        }
    };

    let had_neighbors = {
        let mut guard = neighbors.write().unwrap_or_else(|e| e.into_inner());
        let had = !guard.is_empty();
        guard.clear();
        had
    };
    if had_neighbors {
        if let Some(handler) = machine.handler() {
            handler.on_neighborhood_changed();
        }
    }

    let clean = matches!(&status, Ok(s) if s.success());
    match (stop_mode, &status) {
        (Some(StopMode::Restart), _) => {
            debug!("Daemon exited for restart");
        }
        (Some(StopMode::Shutdown), _) => {
            info!("Daemon stopped");
            apply_transition(&machine, DaemonState::Offline);
        }
        (None, _) if clean => {
            info!("Daemon exited");
            apply_transition(&machine, DaemonState::Offline);
        }
        (None, Ok(s)) => {
            error!("Daemon exited unexpectedly with {}", s);
            apply_transition(&machine, DaemonState::Error);
        }
        (None, Err(e)) => {
            error!("Failed to wait for daemon: {}", e);
            apply_transition(&machine, DaemonState::Error);
        }
    }
}

fn handle_line(line: &str, machine: &StateMachine, neighbors: &RwLock<Vec<Node>>) {
    let Some(record) = parse_record(line) else {
        debug!("daemon: {}", line);
        return;
    };

    match record {
        DaemonRecord::State(state) => apply_transition(machine, state),
        DaemonRecord::NeighborUp(endpoint) => {
            let added = {
                let mut guard = neighbors.write().unwrap_or_else(|e| e.into_inner());
                if guard.iter().any(|n| n.endpoint == endpoint) {
                    false
                } else {
                    guard.push(Node::new(endpoint, "discovered"));
                    true
                }
            };
            if added {
                notify_neighborhood(machine);
            }
        }
        DaemonRecord::NeighborDown(endpoint) => {
            let removed = {
                let mut guard = neighbors.write().unwrap_or_else(|e| e.into_inner());
                let before = guard.len();
                guard.retain(|n| n.endpoint != endpoint);
                guard.len() != before
            };
            if removed {
                notify_neighborhood(machine);
            }
        }
        DaemonRecord::Event(event) => {
            if let Some(handler) = machine.handler() {
                handler.on_event(event);
            }
        }
    }
}

fn notify_neighborhood(machine: &StateMachine) {
    if let Some(handler) = machine.handler() {
        handler.on_neighborhood_changed();
    }
}

/// Apply a transition, falling back to OFFLINE when ERROR is not reachable
/// from the current state.
fn apply_transition(machine: &StateMachine, next: DaemonState) {
    let next = if next == DaemonState::Error && !machine.current().can_transition_to(next) {
        DaemonState::Offline
    } else {
        next
    };
    if let Err(e) = machine.transition(next) {
        debug!("{}", e);
    }
}
