//! Estim Core Library
//!
//! Coordinator for live consensus-estimation sessions: a leader walks a task
//! list, participants vote blind, votes are revealed together with their
//! statistics, and finalized tasks are then claimed and assigned.

pub mod types;
pub mod error;
pub mod settings;
pub mod protocol;
pub mod registry;
pub mod voting;
pub mod distribution;
pub mod collaborators;
pub mod session;
pub mod coordinator;

pub use types::*;
pub use error::{ConfigError, RejectedReason, SessionError, SessionResult};
pub use settings::Settings;
pub use protocol::{ClientMessage, EndReason, Phase, ServerMessage, SessionSummary};
pub use registry::ConnectionRegistry;
pub use voting::{PointsChoice, Reveal, Statistics, VotingRound};
pub use distribution::{Decision, DistributionRound};
pub use collaborators::{
    AdvisoryEstimator, CollaboratorError, Estimate, LifecycleEvent, Notifier, ResultsSink,
    SessionResults, StaticTaskSource, TaskSource,
};
pub use coordinator::{Collaborators, Coordinator, CoordinatorClosed, CoordinatorHandle, Event};
