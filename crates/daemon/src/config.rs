use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub socket_path: PathBuf,
    pub registration_dir: PathBuf,
    pub status_file: Option<PathBuf>,
    pub status_icon: String,
    pub auto_start: bool,
    pub preference_file: Option<PathBuf>,
    pub broadcast_capacity: usize,
    pub daemon_binary: PathBuf,
    pub daemon_args: Vec<String>,
    pub storage_dir: PathBuf,
    pub stop_timeout_secs: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/dtn/control.sock"),
            registration_dir: PathBuf::from("/var/lib/dtn/registrations"),
            status_file: None,
            status_icon: "dtn-notification".to_string(),
            auto_start: false,
            preference_file: None,
            broadcast_capacity: 64,
            daemon_binary: PathBuf::from("dtnd"),
            daemon_args: vec![],
            storage_dir: PathBuf::from("/var/lib/dtn/storage"),
            stop_timeout_secs: 10,
        }
    }
}

pub fn load_config(path: Option<&std::path::Path>) -> Result<ControlConfig> {
    let config = if let Some(config_path) = path {
        if config_path.exists() {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;

            toml::from_str::<ControlConfig>(&contents)
                .map_err(|e| anyhow::anyhow!("Failed to parse TOML config: {}", e))?
        } else {
            #[cfg(not(test))]
            tracing::warn!("Config file not found at {:?}, using defaults", config_path);
            ControlConfig::default()
        }
    } else {
        #[cfg(not(test))]
        tracing::info!("No config path provided, using defaults");
        ControlConfig::default()
    };

    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &ControlConfig) -> Result<()> {
    if config.broadcast_capacity == 0 {
        anyhow::bail!("broadcast_capacity must be at least 1");
    }

    if config.stop_timeout_secs == 0 {
        anyhow::bail!("stop_timeout_secs must be at least 1");
    }

    if config.status_icon.trim().is_empty() {
        anyhow::bail!("status_icon cannot be empty");
    }

    if config.daemon_binary.as_os_str().is_empty() {
        anyhow::bail!("daemon_binary cannot be empty");
    }

    Ok(())
}
