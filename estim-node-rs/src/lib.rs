//! Estim Node Library
//!
//! Hosts one estimation session on a WebSocket listener, with file and
//! command backed collaborators.

pub mod config;
pub mod integrations;
pub mod server;

pub use config::{AdvisorConfig, NodeConfig, NotificationConfig};
pub use integrations::{
    collaborators, CommandEstimator, HookNotifier, JsonFileResultsSink, JsonFileTaskSource,
};
pub use server::{Server, ServerError};
