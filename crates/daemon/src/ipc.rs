//! Unix socket transport: newline-delimited JSON requests and responses.
//!
//! Mutating methods are queued on the dispatcher and answered with their
//! start id; queries go straight to the [`ControlService`]. A caller is the
//! peer's uid as reported by the kernel, never anything in the request.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

use crate::broadcast::{Broadcast, ChannelBroadcaster};
use crate::control::ControlPlane;
use crate::controller::Node;
use crate::dispatcher::{Action, ReplyTarget, StartId};
use crate::registry::Registration;
use crate::service::ControlService;
use crate::state::DaemonState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: Method,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Startup,
    Shutdown,
    Restart {
        #[serde(default)]
        level: i32,
    },
    UpdateStatus,
    Register {
        registration: Registration,
    },
    Unregister,
    GetState,
    IsRunning,
    GetNeighbors,
    ClearStorage,
    GetSession,
    GetVersion,
    Subscribe,
}

impl Method {
    /// The queued action for mutating methods, addressed to `peer`; queries
    /// come back unchanged.
    fn into_action(self, peer: &Peer) -> std::result::Result<Action, Method> {
        match self {
            Method::Startup => Ok(Action::Startup),
            Method::Shutdown => Ok(Action::Shutdown),
            Method::Restart { level } => Ok(Action::Restart { level }),
            Method::UpdateStatus => Ok(Action::UpdateStatus),
            Method::Register { registration } => Ok(Action::Register {
                registration,
                reply_target: peer.reply_target(),
            }),
            Method::Unregister => Ok(Action::Unregister {
                reply_target: peer.reply_target(),
            }),
            query => Err(query),
        }
    }
}

/// The principal on the other end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    uid: u32,
}

impl Peer {
    pub fn new(uid: u32) -> Self {
        Self { uid }
    }

    /// Read the connecting process's credentials from the socket.
    pub fn from_stream(stream: &UnixStream) -> Result<Self> {
        let cred = stream
            .peer_cred()
            .context("Failed to read peer credentials")?;
        debug!("Connection from uid {} (pid {:?})", cred.uid(), cred.pid());
        Ok(Self::new(cred.uid()))
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn caller_id(&self) -> String {
        format!("uid-{}", self.uid)
    }

    fn reply_target(&self) -> ReplyTarget {
        ReplyTarget::new(self.caller_id())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseData {
    Queued { start_id: StartId },
    State { state: DaemonState },
    Running { running: bool },
    Neighbors { neighbors: Vec<Node> },
    Session { handle_id: Option<String> },
    Version { version: Vec<String> },
    Subscribed,
    Ok,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub result: std::result::Result<ResponseData, String>,
}

/// Everything a connection needs.
pub struct IpcContext {
    plane: Arc<ControlPlane>,
    service: ControlService,
    broadcaster: ChannelBroadcaster,
}

impl IpcContext {
    pub fn new(plane: Arc<ControlPlane>, broadcaster: ChannelBroadcaster) -> Self {
        let service = plane.service();
        Self {
            plane,
            service,
            broadcaster,
        }
    }
}

/// Bind the control socket, replacing a stale one.
pub async fn bind(socket_path: &Path) -> Result<UnixListener> {
    if let Some(dir) = socket_path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .context("Failed to create socket directory")?;
    }

    let _ = tokio::fs::remove_file(socket_path).await;

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("Failed to bind Unix socket {}", socket_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o660))?;
    }

    info!("Control socket listening on {}", socket_path.display());
    Ok(listener)
}

/// Accept connections until the task is dropped.
pub async fn serve(listener: UnixListener, ctx: Arc<IpcContext>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx).await {
                        error!("Connection handler error: {:#}", e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, ctx: Arc<IpcContext>) -> Result<()> {
    let peer = Peer::from_stream(&stream)?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader
            .read_line(&mut line)
            .await
            .context("Failed to read from socket")?;

        if bytes_read == 0 {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                warn!("Invalid request JSON: {}", e);
                continue;
            }
        };

        // Attach before acknowledging so nothing sent after the ack is missed.
        let subscription =
            (request.method == Method::Subscribe).then(|| ctx.broadcaster.subscribe());
        let response = handle_request(request, &peer, &ctx).await;
        write_json(&mut writer, &response).await?;

        if let Some(rx) = subscription {
            debug!("Listener subscribed ({} total)", ctx.broadcaster.listener_count());
            return stream_broadcasts(&mut writer, rx).await;
        }
    }

    Ok(())
}

/// Answer one request on behalf of `peer`.
pub async fn handle_request(request: Request, peer: &Peer, ctx: &IpcContext) -> Response {
    let id = request.id;

    let result = match request.method.into_action(peer) {
        Ok(action) => ctx
            .plane
            .start_command(Some(action))
            .map(|start_id| ResponseData::Queued { start_id })
            .map_err(|e| e.to_string()),
        Err(Method::Subscribe) => Ok(ResponseData::Subscribed),
        Err(query) => {
            let service = ctx.service.clone();
            let caller_id = peer.caller_id();
            match tokio::task::spawn_blocking(move || answer_query(&service, &caller_id, query))
                .await
            {
                Ok(result) => result.map_err(|e| format!("{:#}", e)),
                Err(e) => Err(format!("query task failed: {}", e)),
            }
        }
    };

    Response { id, result }
}

fn answer_query(service: &ControlService, caller_id: &str, query: Method) -> Result<ResponseData> {
    let data = match query {
        Method::GetState => ResponseData::State {
            state: service.get_state(),
        },
        Method::IsRunning => ResponseData::Running {
            running: service.is_running(),
        },
        Method::GetNeighbors => ResponseData::Neighbors {
            neighbors: service.get_neighbors()?,
        },
        Method::ClearStorage => {
            service.clear_storage()?;
            ResponseData::Ok
        }
        Method::GetSession => ResponseData::Session {
            handle_id: service
                .get_session(caller_id)
                .map(|handle| handle.handle_id().to_string()),
        },
        Method::GetVersion => ResponseData::Version {
            version: service.get_version()?,
        },
        other => anyhow::bail!("{:?} is not a query", other),
    };
    Ok(data)
}

async fn stream_broadcasts(
    writer: &mut OwnedWriteHalf,
    mut rx: broadcast::Receiver<Broadcast>,
) -> Result<()> {
    loop {
        match rx.recv().await {
            Ok(message) => {
                if let Err(e) = write_json(writer, &message).await {
                    debug!("Listener went away: {:#}", e);
                    return Ok(());
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("Listener lagged, skipped {} broadcast(s)", skipped);
            }
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}

async fn write_json<T: Serialize>(writer: &mut OwnedWriteHalf, value: &T) -> Result<()> {
    let json = serde_json::to_string(value)? + "\n";
    writer
        .write_all(json.as_bytes())
        .await
        .context("Failed to write to socket")?;
    Ok(())
}

/// Parse one broadcast line as written to subscribers.
pub fn parse_broadcast(line: &str) -> Result<Broadcast> {
    serde_json::from_str(line.trim()).context("Invalid broadcast line")
}
