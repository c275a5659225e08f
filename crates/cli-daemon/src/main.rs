use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dtn_control::config::load_config;
use dtn_control::host::{FilePreference, FileStatusSurface, LocalSessionBinder, SignalHost};
use dtn_control::ipc::{self, IpcContext};
use dtn_control::process::{ProcessController, ProcessSettings};
use dtn_control::store::JsonRegistrationStore;
use dtn_control::{ChannelBroadcaster, Collaborators, ControlPlane};

#[derive(Parser, Debug)]
#[command(name = "dtn-controld")]
#[command(about = "DTN daemon control plane", long_about = None)]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the control socket path
    #[arg(short, long, value_name = "PATH")]
    socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_level(true)
        .init();

    info!("DTN control plane v{}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();

    let mut config = match load_config(args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }

    info!("Daemon binary: {:?}", config.daemon_binary);
    info!("Registration directory: {:?}", config.registration_dir);
    info!("Auto-start: {}", config.auto_start);

    let controller = Arc::new(ProcessController::new(
        ProcessSettings::from(&config),
        tokio::runtime::Handle::current(),
    ));
    let host = Arc::new(SignalHost::new());
    let broadcaster = ChannelBroadcaster::new(config.broadcast_capacity);

    let parts = Collaborators {
        controller,
        surface: Arc::new(FileStatusSurface::new(config.status_file.clone())),
        host: host.clone(),
        preference: Arc::new(FilePreference::new(
            config.preference_file.clone(),
            config.auto_start,
        )),
        broadcaster: Arc::new(broadcaster.clone()),
        binder: Arc::new(LocalSessionBinder),
        store: Arc::new(JsonRegistrationStore::new(config.registration_dir.clone())),
    };

    // Auto-start may wait on the daemon process, keep it off the reactor.
    let icon = config.status_icon.clone();
    let plane = tokio::task::spawn_blocking(move || ControlPlane::initialize(parts, &icon))
        .await
        .context("Control plane initialization task failed")??;
    let plane = Arc::new(plane);

    let listener = ipc::bind(&config.socket_path).await?;
    let ctx = Arc::new(IpcContext::new(Arc::clone(&plane), broadcaster));
    let server = tokio::spawn(ipc::serve(listener, ctx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
        _ = host.stopped() => info!("Stop requested by control plane"),
    }

    server.abort();

    let teardown = {
        let plane = Arc::clone(&plane);
        tokio::task::spawn_blocking(move || plane.destroy())
    };
    if tokio::time::timeout(Duration::from_secs(config.stop_timeout_secs * 2), teardown)
        .await
        .is_err()
    {
        error!("Control plane teardown timed out");
    }

    let _ = std::fs::remove_file(&config.socket_path);
    info!("Exited");
    Ok(())
}
