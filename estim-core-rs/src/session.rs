//! Owned state of one estimation session
//!
//! The session holds the participant roster (id → participant, no back
//! pointers) and the task list. Only the coordinator mutates it.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

use crate::error::ConfigError;
use crate::protocol::{ParticipantView, Phase, TaskView};
use crate::settings::Settings;
use crate::types::{
    ConnectionState, Participant, ParticipantId, Role, Task, TaskSpec, TaskStatus,
};

#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub leader_name: String,
    pub leader: Option<ParticipantId>,
    pub tasks: Vec<Task>,
    pub settings: Settings,
    pub phase: Phase,
    /// Task under vote, or next pending task while forming
    pub current: Option<usize>,
    pub participants: BTreeMap<ParticipantId, Participant>,
    pub started_at: DateTime<Utc>,
    /// Set when the first round starts
    pub settings_locked: bool,
    /// Increments on every round start; guards vote timers and advisory replies
    pub epoch: u64,
    /// Increments on every leader (dis)connect; guards the grace timer
    pub leader_grace_epoch: u64,
}

impl Session {
    pub fn new(
        leader_name: impl Into<String>,
        tasks: Vec<TaskSpec>,
        settings: Settings,
    ) -> Result<Self, ConfigError> {
        let leader_name = leader_name.into().trim().to_string();
        if leader_name.is_empty() {
            return Err(ConfigError::Invalid("leader name must not be empty".into()));
        }
        settings.validate()?;
        if tasks.is_empty() {
            return Err(ConfigError::Invalid("task list is empty".into()));
        }
        let mut seen = HashSet::new();
        for task in &tasks {
            if !seen.insert(task.key.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate task key {}",
                    task.key
                )));
            }
        }

        Ok(Self {
            id: Uuid::new_v4(),
            leader_name,
            leader: None,
            tasks: tasks.into_iter().map(Task::from_spec).collect(),
            settings,
            phase: Phase::Forming,
            current: Some(0),
            participants: BTreeMap::new(),
            started_at: Utc::now(),
            settings_locked: false,
            epoch: 0,
            leader_grace_epoch: 0,
        })
    }

    pub fn task_index(&self, key: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.key == key)
    }

    pub fn task(&self, key: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.key == key)
    }

    pub fn task_mut(&mut self, key: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.key == key)
    }

    pub fn current_task(&self) -> Option<&Task> {
        self.current.and_then(|i| self.tasks.get(i))
    }

    /// Next pending task after `index`, wrapping around
    pub fn next_pending_after(&self, index: usize) -> Option<usize> {
        let n = self.tasks.len();
        (1..=n)
            .map(|offset| (index + offset) % n)
            .find(|i| self.tasks[*i].status == TaskStatus::Pending)
    }

    pub fn all_finalized(&self) -> bool {
        self.tasks.iter().all(|t| t.status == TaskStatus::Finalized)
    }

    pub fn next_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    pub fn is_leader(&self, participant: ParticipantId) -> bool {
        self.leader == Some(participant)
    }

    pub fn leader_connected(&self) -> bool {
        self.leader
            .and_then(|id| self.participants.get(&id))
            .map(Participant::is_connected)
            .unwrap_or(false)
    }

    pub fn role_for(&self, name: &str) -> Role {
        if name.trim() == self.leader_name {
            Role::Leader
        } else {
            Role::Voter
        }
    }

    pub fn add_participant(&mut self, participant: Participant) {
        if participant.role == Role::Leader {
            self.leader = Some(participant.id);
        }
        self.participants.insert(participant.id, participant);
    }

    pub fn set_connection(&mut self, participant: ParticipantId, state: ConnectionState) {
        if let Some(p) = self.participants.get_mut(&participant) {
            p.connection = state;
        }
    }

    pub fn name_of(&self, participant: ParticipantId) -> String {
        self.participants
            .get(&participant)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| format!("#{}", participant))
    }

    pub fn role_of(&self, participant: ParticipantId) -> Option<Role> {
        self.participants.get(&participant).map(|p| p.role)
    }

    /// Connected human voters, the quantity gated by `min_participants`
    pub fn connected_voters(&self) -> usize {
        self.participants
            .values()
            .filter(|p| p.role == Role::Voter && p.is_connected())
            .count()
    }

    pub fn ready_to_start(&self) -> bool {
        self.connected_voters() >= self.settings.min_participants
    }

    pub fn participant_views(&self) -> Vec<ParticipantView> {
        self.participants
            .values()
            .map(|p| ParticipantView {
                id: p.id,
                name: p.name.clone(),
                role: p.role,
                connected: p.is_connected(),
            })
            .collect()
    }

    pub fn task_views(&self) -> Vec<TaskView> {
        self.tasks
            .iter()
            .map(|t| TaskView {
                key: t.key.clone(),
                summary: t.summary.clone(),
                description: t.description.clone(),
                status: t.status,
                points: t.points,
                assignee: t
                    .assignment
                    .as_ref()
                    .and_then(|a| a.assignee)
                    .map(|id| self.name_of(id)),
            })
            .collect()
    }
}
