use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::registry::Registration;

/// A registration as it was last saved for a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRegistration {
    pub caller_id: String,
    pub registration: Registration,
    pub saved_at: DateTime<Utc>,
}

/// Where registrations survive control-plane restarts.
pub trait RegistrationStore: Send + Sync {
    fn load_persisted_registrations(&self) -> Result<Vec<PersistedRegistration>>;

    fn save(&self, caller_id: &str, registration: &Registration) -> Result<()>;

    fn remove(&self, caller_id: &str) -> Result<()>;
}

/// One pretty-printed JSON file per caller in a state directory.
#[derive(Debug, Clone)]
pub struct JsonRegistrationStore {
    dir: PathBuf,
}

impl JsonRegistrationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, caller_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(caller_id)))
    }
}

/// Hex keeps the mapping from caller id to file name one-to-one and confined
/// to the state directory, whatever characters the id contains.
fn file_stem(caller_id: &str) -> String {
    format!("caller-{}", hex::encode(caller_id.as_bytes()))
}

impl RegistrationStore for JsonRegistrationStore {
    fn load_persisted_registrations(&self) -> Result<Vec<PersistedRegistration>> {
        if !self.dir.exists() {
            return Ok(vec![]);
        }

        let mut registrations = Vec::new();

        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read registration dir {}", self.dir.display()))?
        {
            let path = entry?.path();

            if !path.is_file() || path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }

            match fs::read_to_string(&path) {
                Ok(contents) => match serde_json::from_str::<PersistedRegistration>(&contents) {
                    Ok(registration) => registrations.push(registration),
                    Err(e) => {
                        warn!("Failed to parse registration file {:?}: {}", path, e);
                    }
                },
                Err(e) => {
                    warn!("Failed to read registration file {:?}: {}", path, e);
                }
            }
        }

        registrations.sort_by(|a, b| a.caller_id.cmp(&b.caller_id));
        Ok(registrations)
    }

    fn save(&self, caller_id: &str, registration: &Registration) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create registration dir {}", self.dir.display()))?;

        let record = PersistedRegistration {
            caller_id: caller_id.to_string(),
            registration: registration.clone(),
            saved_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&record)?;

        let target = self.file_for(caller_id);
        let temp = target.with_extension("json.tmp");

        let mut file = fs::File::create(&temp)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp, &target)?;
        Ok(())
    }

    fn remove(&self, caller_id: &str) -> Result<()> {
        let target = self.file_for(caller_id);
        match fs::remove_file(&target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", target.display())),
        }
    }
}
