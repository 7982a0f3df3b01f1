//! Core types for estimation sessions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Stable identifier of a participant within one session
pub type ParticipantId = u32;

/// Identifier of one transport connection
pub type ConnectionId = u64;

/// Key of a work item (e.g. `PROJ-42`)
pub type TaskKey = String;

/// Role a participant plays in the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Leader,
    Voter,
    AdvisoryVoter,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Leader => write!(f, "leader"),
            Role::Voter => write!(f, "voter"),
            Role::AdvisoryVoter => write!(f, "advisory_voter"),
        }
    }
}

/// Whether a participant currently has a live transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// A member of the session
#[derive(Debug, Clone)]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    pub role: Role,
    pub connection: ConnectionState,
}

impl Participant {
    pub fn new(id: ParticipantId, name: impl Into<String>, role: Role) -> Self {
        Self {
            id,
            name: name.into(),
            role,
            connection: ConnectionState::Connected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }

    /// True if a reveal should wait for this participant's vote
    pub fn expects_vote(&self) -> bool {
        match self.role {
            Role::Voter => self.is_connected(),
            Role::AdvisoryVoter => true,
            Role::Leader => false,
        }
    }
}

/// One estimate. Numbers come from the configured scale; `"?"` on the wire
/// is the uncertain sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "VoteRepr", into = "VoteRepr")]
pub enum Vote {
    Points(f64),
    Uncertain,
}

/// Wire marker for an uncertain vote
pub const UNCERTAIN_MARKER: &str = "?";

impl Vote {
    /// Numeric value, `None` for uncertain votes
    pub fn points(&self) -> Option<f64> {
        match self {
            Vote::Points(p) => Some(*p),
            Vote::Uncertain => None,
        }
    }
}

impl std::fmt::Display for Vote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Vote::Points(p) => write!(f, "{}", p),
            Vote::Uncertain => write!(f, "{}", UNCERTAIN_MARKER),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum VoteRepr {
    Points(f64),
    Marker(String),
}

impl TryFrom<VoteRepr> for Vote {
    type Error = String;

    fn try_from(repr: VoteRepr) -> Result<Self, Self::Error> {
        match repr {
            VoteRepr::Points(p) => Ok(Vote::Points(p)),
            VoteRepr::Marker(m) if m == UNCERTAIN_MARKER => Ok(Vote::Uncertain),
            VoteRepr::Marker(m) => Err(format!("unrecognized vote marker {:?}", m)),
        }
    }
}

impl From<Vote> for VoteRepr {
    fn from(vote: Vote) -> Self {
        match vote {
            Vote::Points(p) => VoteRepr::Points(p),
            Vote::Uncertain => VoteRepr::Marker(UNCERTAIN_MARKER.to_string()),
        }
    }
}

/// Lifecycle of a task inside the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Voting,
    Revealed,
    Finalized,
}

/// Task as supplied by a task source, before the session starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub key: TaskKey,
    pub summary: String,
    #[serde(default)]
    pub description: String,
}

impl TaskSpec {
    pub fn new(key: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            summary: summary.into(),
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// How an assignment was settled by the leader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentState {
    /// Leader confirmed one of the claimants
    Confirmed,
    /// Leader assigned someone directly
    Reassigned,
    /// Leader left the task unassigned
    Skipped,
}

/// Final assignment of a task after distribution
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub assignee: Option<ParticipantId>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub state: AssignmentState,
}

/// A work item walked during the session
#[derive(Debug, Clone)]
pub struct Task {
    pub key: TaskKey,
    pub summary: String,
    pub description: String,
    pub status: TaskStatus,
    /// Votes of the latest revealed round; cleared when a round starts
    pub votes: BTreeMap<ParticipantId, Vote>,
    pub points: Option<f64>,
    pub assignment: Option<Assignment>,
}

impl Task {
    pub fn from_spec(spec: TaskSpec) -> Self {
        Self {
            key: spec.key,
            summary: spec.summary,
            description: spec.description,
            status: TaskStatus::Pending,
            votes: BTreeMap::new(),
            points: None,
            assignment: None,
        }
    }

    pub fn spec(&self) -> TaskSpec {
        TaskSpec {
            key: self.key.clone(),
            summary: self.summary.clone(),
            description: self.description.clone(),
        }
    }
}

/// A participant's bid to take an offered task
#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    pub task_key: TaskKey,
    pub claimant: ParticipantId,
    /// Stamped by the connection task when the frame arrived
    pub received_at: DateTime<Utc>,
    /// Queue order, only consulted when timestamps are equal
    pub seq: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vote_wire_format() {
        let points: Vote = serde_json::from_str("5").unwrap();
        assert_eq!(points, Vote::Points(5.0));

        let half: Vote = serde_json::from_str("0.5").unwrap();
        assert_eq!(half.points(), Some(0.5));

        let uncertain: Vote = serde_json::from_str("\"?\"").unwrap();
        assert_eq!(uncertain, Vote::Uncertain);
        assert_eq!(serde_json::to_string(&uncertain).unwrap(), "\"?\"");

        assert!(serde_json::from_str::<Vote>("\"coffee\"").is_err());
    }

    #[test]
    fn test_expects_vote() {
        let mut voter = Participant::new(1, "ana", Role::Voter);
        assert!(voter.expects_vote());
        voter.connection = ConnectionState::Disconnected;
        assert!(!voter.expects_vote());

        let leader = Participant::new(2, "lead", Role::Leader);
        assert!(!leader.expects_vote());

        let mut advisor = Participant::new(3, "advisor", Role::AdvisoryVoter);
        advisor.connection = ConnectionState::Disconnected;
        assert!(advisor.expects_vote());
    }

    #[test]
    fn test_task_spec_defaults_description() {
        let spec: TaskSpec = serde_json::from_str(r#"{"key":"A-1","summary":"Login"}"#).unwrap();
        assert_eq!(spec.description, "");
        let task = Task::from_spec(spec);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.points.is_none());
    }
}
