// Control plane for a delay-tolerant networking daemon

pub mod broadcast;
pub mod config;
pub mod control;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod host;
pub mod ipc;
pub mod lifecycle;
pub mod presenter;
pub mod process;
pub mod registry;
pub mod service;
pub mod state;
pub mod store;

// Re-export commonly used types
pub use broadcast::{Broadcast, BroadcastSink, ChannelBroadcaster};
pub use config::ControlConfig;
pub use control::{Collaborators, ControlPlane};
pub use controller::{DaemonController, DaemonEvent, DaemonHandler, Node};
pub use dispatcher::{Action, CommandDispatcher, CommandSender, ReplyTarget, StartId};
pub use error::ControlError;
pub use registry::{Registration, SessionRegistry};
pub use service::ControlService;
pub use state::{DaemonState, StateMachine};
