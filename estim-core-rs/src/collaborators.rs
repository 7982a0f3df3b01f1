//! External collaborators
//!
//! Narrow interfaces to the world outside the session. Implementations get
//! plain data only and never a handle back into session state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::EndReason;
use crate::types::{TaskKey, TaskSpec};

/// Failure reported by a collaborator; logged, never fatal to a session
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("{0}")]
    Failed(String),

    #[error("timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// An advisory estimate for one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub value: f64,
    #[serde(default)]
    pub rationale: String,
}

/// Final results handed to a results sink after the session ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResults {
    pub session_id: Uuid,
    pub points: BTreeMap<TaskKey, f64>,
    pub assignees: BTreeMap<TaskKey, String>,
}

/// Lifecycle facts for notifiers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    #[serde(rename_all = "camelCase")]
    Started {
        session_id: Uuid,
        task_count: usize,
        participant_count: usize,
    },
    #[serde(rename_all = "camelCase")]
    Distributed {
        session_id: Uuid,
        assigned: usize,
        skipped: usize,
    },
    #[serde(rename_all = "camelCase")]
    Ended {
        session_id: Uuid,
        reason: EndReason,
        finalized: usize,
        total_points: f64,
    },
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Started { .. } => "started",
            LifecycleEvent::Distributed { .. } => "distributed",
            LifecycleEvent::Ended { .. } => "ended",
        }
    }
}

/// Supplies the ordered task list before the session starts
#[async_trait]
pub trait TaskSource: Send + Sync {
    async fn load(&self) -> Result<Vec<TaskSpec>, CollaboratorError>;
}

/// Produces an advisory vote for a task
#[async_trait]
pub trait AdvisoryEstimator: Send + Sync {
    /// Display name of the advisory voter
    fn name(&self) -> &str {
        "advisor"
    }

    async fn estimate(&self, task: &TaskSpec) -> Result<Estimate, CollaboratorError>;
}

/// Receives final points and assignments
#[async_trait]
pub trait ResultsSink: Send + Sync {
    async fn publish(&self, results: &SessionResults) -> Result<(), CollaboratorError>;
}

/// Receives lifecycle events
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &LifecycleEvent) -> Result<(), CollaboratorError>;
}

/// Fixed task list
#[derive(Debug, Clone, Default)]
pub struct StaticTaskSource {
    tasks: Vec<TaskSpec>,
}

impl StaticTaskSource {
    pub fn new(tasks: Vec<TaskSpec>) -> Self {
        Self { tasks }
    }
}

#[async_trait]
impl TaskSource for StaticTaskSource {
    async fn load(&self) -> Result<Vec<TaskSpec>, CollaboratorError> {
        Ok(self.tasks.clone())
    }
}
