use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatcher::StartId;
use crate::lifecycle::{AutoStartPreference, ProcessHost};
use crate::presenter::StatusSurface;
use crate::registry::{Registration, RemoteSession, SessionBinder, SessionHandle};

/// Publishes status as `icon<TAB>text` in a file that status bars can watch.
/// Without a file it only logs.
#[derive(Debug, Clone)]
pub struct FileStatusSurface {
    path: Option<PathBuf>,
}

impl FileStatusSurface {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

impl StatusSurface for FileStatusSurface {
    fn show(&self, icon: &str, text: &str) -> Result<()> {
        info!("Status: {}", text);

        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let temp = path.with_extension("tmp");
        let mut file = fs::File::create(&temp)
            .with_context(|| format!("Failed to create {}", temp.display()))?;
        writeln!(file, "{}\t{}", icon, text)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp, path)
            .with_context(|| format!("Failed to publish status to {}", path.display()))?;
        Ok(())
    }

    fn hide(&self) -> Result<()> {
        debug!("Status surface hidden");

        let Some(path) = &self.path else {
            return Ok(());
        };
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }
}

/// Host signals for a standalone process: stop requests are published on a
/// watch channel the binary's main task waits on.
#[derive(Debug)]
pub struct SignalHost {
    privileged: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl SignalHost {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            privileged: AtomicBool::new(false),
            stop_tx,
        }
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged.load(Ordering::SeqCst)
    }

    pub fn stop_requested(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&self) {
        let mut rx = self.stop_tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

impl Default for SignalHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessHost for SignalHost {
    fn enter_privileged_mode(&self) {
        if !self.privileged.swap(true, Ordering::SeqCst) {
            info!("Entering always-running mode");
        }
    }

    fn exit_privileged_mode(&self) {
        if self.privileged.swap(false, Ordering::SeqCst) {
            info!("Leaving always-running mode");
        }
    }

    fn terminate(&self) {
        info!("Daemon switched off, stopping control plane");
        self.stop_tx.send_replace(true);
    }

    fn release(&self, start_id: Option<StartId>) {
        info!("Idle and offline after start id {:?}, stopping control plane", start_id);
        self.stop_tx.send_replace(true);
    }
}

#[derive(Debug, Deserialize)]
struct PreferenceFile {
    enabled: Option<bool>,
}

/// Reads `enabled = <bool>` from a TOML file on every check, so the switch
/// can be flipped while we run.
#[derive(Debug, Clone)]
pub struct FilePreference {
    path: Option<PathBuf>,
    fallback: bool,
}

impl FilePreference {
    pub fn new(path: Option<PathBuf>, fallback: bool) -> Self {
        Self { path, fallback }
    }

    fn read(&self) -> Result<Option<bool>> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read preference file {}", path.display()))?;
        let parsed: PreferenceFile = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse preference file {}", path.display()))?;
        Ok(parsed.enabled)
    }
}

impl AutoStartPreference for FilePreference {
    fn auto_start(&self) -> bool {
        match self.read() {
            Ok(Some(enabled)) => enabled,
            Ok(None) => self.fallback,
            Err(e) => {
                warn!("{:#}, using auto_start = {}", e, self.fallback);
                self.fallback
            }
        }
    }
}

/// In-process session handle.
#[derive(Debug)]
pub struct LocalSession {
    handle_id: String,
    caller_id: String,
    endpoint: String,
    created_at: DateTime<Utc>,
    released: AtomicBool,
}

impl LocalSession {
    pub fn caller_id(&self) -> &str {
        &self.caller_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl RemoteSession for LocalSession {
    fn handle_id(&self) -> &str {
        &self.handle_id
    }

    fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            anyhow::bail!("session handle {} already released", self.handle_id);
        }
        debug!("Released session handle {} for {}", self.handle_id, self.caller_id);
        Ok(())
    }
}

/// Issues [`LocalSession`] handles with random ids.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalSessionBinder;

impl SessionBinder for LocalSessionBinder {
    fn bind(&self, caller_id: &str, registration: &Registration) -> Result<SessionHandle> {
        if registration.endpoint.trim().is_empty() {
            anyhow::bail!("registration for {} has an empty endpoint", caller_id);
        }
        Ok(std::sync::Arc::new(LocalSession {
            handle_id: Uuid::new_v4().to_string(),
            caller_id: caller_id.to_string(),
            endpoint: registration.endpoint.clone(),
            created_at: Utc::now(),
            released: AtomicBool::new(false),
        }))
    }
}
