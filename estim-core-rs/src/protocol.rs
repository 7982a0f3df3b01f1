//! Wire protocol
//!
//! Every frame is a JSON object `{"type": ..., "payload": {...}}`. Message
//! types are snake_case, payload fields camelCase. Messages without a
//! payload may omit the `payload` key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::settings::Settings;
use crate::types::{ParticipantId, Role, TaskKey, TaskStatus, Vote};
use crate::voting::PointsChoice;

/// Leader's ruling as sent on the wire; participants are named
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DecisionRequest {
    Confirm { claimant: String },
    Reassign { assignee: String },
    Skip,
}

/// Frames sent by clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        name: String,
    },
    #[serde(rename_all = "camelCase")]
    Vote {
        task_key: TaskKey,
        value: Vote,
    },
    #[serde(rename_all = "camelCase")]
    ClaimTask {
        task_key: TaskKey,
    },
    #[serde(rename_all = "camelCase")]
    StartVoting {
        task_key: TaskKey,
    },
    Reveal,
    Revote,
    #[serde(rename_all = "camelCase")]
    SetPoints {
        task_key: TaskKey,
        points: PointsChoice,
    },
    UpdateSettings {
        settings: Settings,
    },
    StartDistribution,
    #[serde(rename_all = "camelCase")]
    OfferTask {
        task_key: TaskKey,
    },
    #[serde(rename_all = "camelCase")]
    LeaderDecision {
        task_key: TaskKey,
        decision: DecisionRequest,
    },
    EndSession,
}

impl ClientMessage {
    /// Parse one text frame
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// True for actions only the leader may take
    pub fn requires_leader(&self) -> bool {
        match self {
            ClientMessage::Join { .. }
            | ClientMessage::Vote { .. }
            | ClientMessage::ClaimTask { .. } => false,
            ClientMessage::StartVoting { .. }
            | ClientMessage::Reveal
            | ClientMessage::Revote
            | ClientMessage::SetPoints { .. }
            | ClientMessage::UpdateSettings { .. }
            | ClientMessage::StartDistribution
            | ClientMessage::OfferTask { .. }
            | ClientMessage::LeaderDecision { .. }
            | ClientMessage::EndSession => true,
        }
    }

    /// Wire name, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "join",
            ClientMessage::Vote { .. } => "vote",
            ClientMessage::ClaimTask { .. } => "claim_task",
            ClientMessage::StartVoting { .. } => "start_voting",
            ClientMessage::Reveal => "reveal",
            ClientMessage::Revote => "revote",
            ClientMessage::SetPoints { .. } => "set_points",
            ClientMessage::UpdateSettings { .. } => "update_settings",
            ClientMessage::StartDistribution => "start_distribution",
            ClientMessage::OfferTask { .. } => "offer_task",
            ClientMessage::LeaderDecision { .. } => "leader_decision",
            ClientMessage::EndSession => "end_session",
        }
    }
}

/// Session phase as seen by clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Forming,
    Voting,
    Revealed,
    Distributing,
    Ended,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Leader sent `end_session`
    LeaderEnded,
    /// Leader stayed disconnected past the grace window
    LeaderLost,
    /// Host process is shutting down
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantView {
    pub id: ParticipantId,
    pub name: String,
    pub role: Role,
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub key: TaskKey,
    pub summary: String,
    pub description: String,
    pub status: TaskStatus,
    pub points: Option<f64>,
    pub assignee: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteView {
    pub participant_id: ParticipantId,
    pub name: String,
    pub value: Vote,
    /// Produced by the advisory estimator
    pub advisory: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

/// Payload of `voting_revealed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevealView {
    pub task_key: TaskKey,
    pub per_participant_votes: Vec<VoteView>,
    pub average: Option<f64>,
    pub median: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub divergence: f64,
    pub discussion_flag: bool,
    pub partial: bool,
    pub suggested_points: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferView {
    pub task_key: TaskKey,
    pub summary: String,
    pub points: Option<f64>,
    pub claimants: Vec<String>,
    pub window_closed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateView {
    pub participant_id: ParticipantId,
    pub name: String,
    pub claimed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentView {
    pub task_key: TaskKey,
    pub assignee_name: String,
}

/// Authoritative state replayed to a (re)joining connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotView {
    pub phase: Phase,
    pub tasks: Vec<TaskView>,
    pub current_task: Option<TaskKey>,
    pub votes_in: usize,
    pub votes_expected: usize,
    /// The receiving participant's own vote in the open round
    pub your_vote: Option<Vote>,
    pub last_reveal: Option<RevealView>,
    pub open_offers: Vec<OfferView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub task_count: usize,
    pub finalized_count: usize,
    pub total_points: f64,
    pub assigned_count: usize,
    pub skipped_count: usize,
}

/// Payload of `session_ended`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub tasks: Vec<TaskView>,
    pub totals: Totals,
    pub participants: Vec<String>,
    pub duration_secs: i64,
    pub reason: EndReason,
}

/// Frames sent by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Welcome {
        session_id: Uuid,
        participant_id: ParticipantId,
        leader_name: String,
        participants: Vec<ParticipantView>,
        settings: Settings,
    },
    SessionSnapshot(SnapshotView),
    #[serde(rename_all = "camelCase")]
    ParticipantsUpdate {
        participants: Vec<ParticipantView>,
        connected_voters: usize,
        ready_to_start: bool,
    },
    SettingsUpdated {
        settings: Settings,
    },
    #[serde(rename_all = "camelCase")]
    VotingStarted {
        task_key: TaskKey,
        summary: String,
        description: String,
        epoch: u64,
    },
    #[serde(rename_all = "camelCase")]
    VoteCountUpdate {
        votes_in: usize,
        votes_expected: usize,
    },
    VotingRevealed(RevealView),
    #[serde(rename_all = "camelCase")]
    TaskFinalized {
        task_key: TaskKey,
        points: f64,
        next_task_key: Option<TaskKey>,
    },
    DistributionStarted {
        tasks: Vec<TaskView>,
    },
    #[serde(rename_all = "camelCase")]
    TaskOffer {
        task_key: TaskKey,
        summary: String,
        points: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    TaskClaimed {
        task_key: TaskKey,
        claimant_name: String,
    },
    #[serde(rename_all = "camelCase")]
    ClaimCandidates {
        task_key: TaskKey,
        claimants: Vec<CandidateView>,
        default_candidate: Option<String>,
        window_closed: bool,
    },
    #[serde(rename_all = "camelCase")]
    TaskAssigned {
        task_key: TaskKey,
        assignee_name: String,
    },
    #[serde(rename_all = "camelCase")]
    TaskSkipped {
        task_key: TaskKey,
    },
    #[serde(rename_all = "camelCase")]
    DistributionComplete {
        assignments: Vec<AssignmentView>,
        skipped: Vec<TaskKey>,
        assigned_count: usize,
        skipped_count: usize,
    },
    SessionEnded {
        summary: SessionSummary,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Serialize to a JSON text frame
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_client_frames() {
        let msg = ClientMessage::from_json(r#"{"type":"join","payload":{"name":"ana"}}"#).unwrap();
        assert_eq!(msg, ClientMessage::Join { name: "ana".into() });

        let msg = ClientMessage::from_json(
            r#"{"type":"vote","payload":{"taskKey":"A-1","value":"?"}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Vote {
                task_key: "A-1".into(),
                value: Vote::Uncertain
            }
        );

        let msg = ClientMessage::from_json(r#"{"type":"reveal"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Reveal);
        assert!(msg.requires_leader());

        let msg = ClientMessage::from_json(
            r#"{"type":"set_points","payload":{"taskKey":"A-1","points":"average"}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::SetPoints {
                task_key: "A-1".into(),
                points: PointsChoice::Average
            }
        );

        let msg = ClientMessage::from_json(
            r#"{"type":"leader_decision","payload":{"taskKey":"A-1","decision":{"action":"reassign","assignee":"bo"}}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::LeaderDecision {
                task_key: "A-1".into(),
                decision: DecisionRequest::Reassign {
                    assignee: "bo".into()
                }
            }
        );
    }

    #[test]
    fn test_rejects_unknown_and_malformed() {
        assert!(ClientMessage::from_json(r#"{"type":"dance"}"#).is_err());
        assert!(ClientMessage::from_json(r#"{"type":"vote","payload":{"taskKey":"A-1"}}"#).is_err());
        assert!(ClientMessage::from_json("not json").is_err());
    }

    #[test]
    fn test_server_frame_shape() {
        let msg = ServerMessage::VoteCountUpdate {
            votes_in: 2,
            votes_expected: 3,
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "vote_count_update", "payload": {"votesIn": 2, "votesExpected": 3}})
        );

        let msg = ServerMessage::TaskClaimed {
            task_key: "A-1".into(),
            claimant_name: "ana".into(),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["payload"]["claimantName"], "ana");
    }
}
