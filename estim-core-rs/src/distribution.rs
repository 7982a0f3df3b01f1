//! Distribution engine: claim/assign round after voting
//!
//! The leader offers finalized tasks one by one (several may be open at
//! once). Participants claim offered tasks; the earliest claim by server
//! receive time is the default candidate but every claimant stays visible to
//! the leader, whose decision settles the task.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

use crate::error::{SessionError, SessionResult};
use crate::types::{Assignment, AssignmentState, Claim, ParticipantId, TaskKey};

/// Leader's ruling on an offered task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Accept one of the claimants
    Confirm(ParticipantId),
    /// Assign someone regardless of claims
    Reassign(ParticipantId),
    /// Leave the task unassigned
    Skip,
}

/// A task currently open for claims
#[derive(Debug, Clone)]
pub struct Offer {
    pub task_key: TaskKey,
    /// Guards the claim-window timer
    pub epoch: u64,
    pub claims: Vec<Claim>,
    pub window_elapsed: bool,
}

impl Offer {
    /// Claims ordered by receive time, queue order breaking ties
    pub fn candidates(&self) -> Vec<&Claim> {
        let mut claims: Vec<&Claim> = self.claims.iter().collect();
        claims.sort_by(|a, b| a.received_at.cmp(&b.received_at).then(a.seq.cmp(&b.seq)));
        claims
    }

    /// Earliest claim, proposed to the leader
    pub fn default_candidate(&self) -> Option<&Claim> {
        self.candidates().into_iter().next()
    }
}

/// Counts and lists produced when every task is settled
#[derive(Debug, Clone, PartialEq)]
pub struct DistributionSummary {
    pub assigned: Vec<(TaskKey, ParticipantId)>,
    pub skipped: Vec<TaskKey>,
}

/// State of the claim/assign round
#[derive(Debug, Clone)]
pub struct DistributionRound {
    order: Vec<TaskKey>,
    offers: BTreeMap<TaskKey, Offer>,
    decided: HashMap<TaskKey, Assignment>,
    next_seq: u64,
    next_epoch: u64,
}

impl DistributionRound {
    /// Start distributing `tasks`, in session order
    pub fn new(tasks: Vec<TaskKey>) -> Self {
        Self {
            order: tasks,
            offers: BTreeMap::new(),
            decided: HashMap::new(),
            next_seq: 0,
            next_epoch: 0,
        }
    }

    pub fn tasks(&self) -> &[TaskKey] {
        &self.order
    }

    fn ensure_undecided(&self, task_key: &str) -> SessionResult<()> {
        if !self.order.iter().any(|k| k == task_key) {
            return Err(SessionError::validation(format!(
                "{} is not being distributed",
                task_key
            )));
        }
        if self.decided.contains_key(task_key) {
            return Err(SessionError::state(format!("{} is already settled", task_key)));
        }
        Ok(())
    }

    /// Open `task_key` for claims, returning the epoch guarding its window
    pub fn offer(&mut self, task_key: &str) -> SessionResult<u64> {
        self.ensure_undecided(task_key)?;
        if self.offers.contains_key(task_key) {
            return Err(SessionError::state(format!("{} is already offered", task_key)));
        }

        self.next_epoch += 1;
        let epoch = self.next_epoch;
        self.offers.insert(
            task_key.to_string(),
            Offer {
                task_key: task_key.to_string(),
                epoch,
                claims: Vec::new(),
                window_elapsed: false,
            },
        );
        info!("Distribution: offered {} (epoch {})", task_key, epoch);
        Ok(epoch)
    }

    /// Record a claim. Returns false if the participant had already claimed.
    pub fn claim(
        &mut self,
        claimant: ParticipantId,
        task_key: &str,
        received_at: DateTime<Utc>,
    ) -> SessionResult<bool> {
        self.ensure_undecided(task_key)?;
        let offer = self
            .offers
            .get_mut(task_key)
            .ok_or_else(|| SessionError::state(format!("{} is not open for claims", task_key)))?;
        if offer.window_elapsed {
            return Err(SessionError::state(format!(
                "claim window for {} has closed",
                task_key
            )));
        }
        if offer.claims.iter().any(|c| c.claimant == claimant) {
            debug!("Distribution: duplicate claim on {} by {}", task_key, claimant);
            return Ok(false);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        offer.claims.push(Claim {
            task_key: task_key.to_string(),
            claimant,
            received_at,
            seq,
        });
        debug!("Distribution: {} claimed {} at {}", claimant, task_key, received_at);
        Ok(true)
    }

    pub fn offer_for(&self, task_key: &str) -> Option<&Offer> {
        self.offers.get(task_key)
    }

    pub fn open_offers(&self) -> impl Iterator<Item = &Offer> {
        self.offers.values()
    }

    /// Close the claim window if `epoch` still matches the offer
    pub fn close_window(&mut self, task_key: &str, epoch: u64) -> bool {
        match self.offers.get_mut(task_key) {
            Some(offer) if offer.epoch == epoch && !offer.window_elapsed => {
                offer.window_elapsed = true;
                info!(
                    "Distribution: claim window for {} closed with {} claims",
                    task_key,
                    offer.claims.len()
                );
                true
            }
            _ => false,
        }
    }

    /// Settle a task
    pub fn decide(&mut self, task_key: &str, decision: Decision) -> SessionResult<Assignment> {
        self.ensure_undecided(task_key)?;
        let offer = self.offers.get(task_key);

        let assignment = match decision {
            Decision::Confirm(claimant) => {
                let offer = offer.ok_or_else(|| {
                    SessionError::state(format!("{} was never offered", task_key))
                })?;
                if offer.claims.is_empty() {
                    return Err(SessionError::state(format!(
                        "{} has no claims; reassign or skip it",
                        task_key
                    )));
                }
                let claim = offer
                    .claims
                    .iter()
                    .find(|c| c.claimant == claimant)
                    .ok_or_else(|| {
                        SessionError::validation(format!(
                            "participant {} did not claim {}",
                            claimant, task_key
                        ))
                    })?;
                Assignment {
                    assignee: Some(claimant),
                    claimed_at: Some(claim.received_at),
                    state: AssignmentState::Confirmed,
                }
            }
            Decision::Reassign(assignee) => Assignment {
                assignee: Some(assignee),
                claimed_at: offer
                    .and_then(|o| o.claims.iter().find(|c| c.claimant == assignee))
                    .map(|c| c.received_at),
                state: AssignmentState::Reassigned,
            },
            Decision::Skip => Assignment {
                assignee: None,
                claimed_at: None,
                state: AssignmentState::Skipped,
            },
        };

        self.offers.remove(task_key);
        self.decided.insert(task_key.to_string(), assignment.clone());
        info!("Distribution: {} settled as {:?}", task_key, assignment.state);
        Ok(assignment)
    }

    pub fn is_complete(&self) -> bool {
        self.order.iter().all(|k| self.decided.contains_key(k))
    }

    /// Assigned and skipped tasks, in session order
    pub fn summary(&self) -> DistributionSummary {
        let mut assigned = Vec::new();
        let mut skipped = Vec::new();
        for key in &self.order {
            match self.decided.get(key).and_then(|a| a.assignee) {
                Some(assignee) => assigned.push((key.clone(), assignee)),
                None if self.decided.contains_key(key) => skipped.push(key.clone()),
                None => {}
            }
        }
        DistributionSummary { assigned, skipped }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn round() -> DistributionRound {
        DistributionRound::new(vec!["A-1".into(), "A-2".into()])
    }

    #[test]
    fn test_earliest_claim_is_default_candidate() {
        let mut dist = round();
        dist.offer("A-1").unwrap();

        let t1 = Utc::now();
        let t2 = t1 + Duration::milliseconds(40);
        // B's frame is processed first but arrived later
        dist.claim(2, "A-1", t2).unwrap();
        dist.claim(1, "A-1", t1).unwrap();

        let offer = dist.offer_for("A-1").unwrap();
        assert_eq!(offer.default_candidate().unwrap().claimant, 1);
        assert_eq!(offer.candidates().len(), 2);

        let assignment = dist.decide("A-1", Decision::Reassign(2)).unwrap();
        assert_eq!(assignment.assignee, Some(2));
        assert_eq!(assignment.state, AssignmentState::Reassigned);
        assert_eq!(assignment.claimed_at, Some(t2));
    }

    #[test]
    fn test_equal_timestamps_fall_back_to_queue_order() {
        let mut dist = round();
        dist.offer("A-1").unwrap();
        let t = Utc::now();
        dist.claim(5, "A-1", t).unwrap();
        dist.claim(3, "A-1", t).unwrap();
        assert_eq!(
            dist.offer_for("A-1").unwrap().default_candidate().unwrap().claimant,
            5
        );
    }

    #[test]
    fn test_duplicate_claim_keeps_first() {
        let mut dist = round();
        dist.offer("A-1").unwrap();
        let t = Utc::now();
        assert!(dist.claim(1, "A-1", t).unwrap());
        assert!(!dist.claim(1, "A-1", t + Duration::seconds(1)).unwrap());
        let offer = dist.offer_for("A-1").unwrap();
        assert_eq!(offer.claims.len(), 1);
        assert_eq!(offer.claims[0].received_at, t);
    }

    #[test]
    fn test_claim_requires_open_offer() {
        let mut dist = round();
        assert_eq!(dist.claim(1, "A-1", Utc::now()).unwrap_err().code(), "STATE_ERROR");
        assert_eq!(dist.claim(1, "Z-9", Utc::now()).unwrap_err().code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_zero_claims_allow_only_reassign_or_skip() {
        let mut dist = round();
        let epoch = dist.offer("A-1").unwrap();
        assert!(dist.close_window("A-1", epoch));

        let err = dist.decide("A-1", Decision::Confirm(1)).unwrap_err();
        assert_eq!(err.code(), "STATE_ERROR");
        assert!(dist.claim(1, "A-1", Utc::now()).is_err());

        let assignment = dist.decide("A-1", Decision::Skip).unwrap();
        assert_eq!(assignment.assignee, None);
        assert_eq!(assignment.state, AssignmentState::Skipped);
    }

    #[test]
    fn test_stale_window_epoch_is_ignored() {
        let mut dist = round();
        let epoch = dist.offer("A-1").unwrap();
        assert!(!dist.close_window("A-1", epoch + 1));
        assert!(!dist.close_window("A-2", epoch));
        assert!(!dist.offer_for("A-1").unwrap().window_elapsed);
    }

    #[test]
    fn test_confirm_requires_claimant() {
        let mut dist = round();
        dist.offer("A-1").unwrap();
        dist.claim(1, "A-1", Utc::now()).unwrap();
        assert_eq!(
            dist.decide("A-1", Decision::Confirm(9)).unwrap_err().code(),
            "VALIDATION_ERROR"
        );
        let assignment = dist.decide("A-1", Decision::Confirm(1)).unwrap();
        assert_eq!(assignment.state, AssignmentState::Confirmed);
        assert!(dist.offer_for("A-1").is_none());
        assert!(dist.offer("A-1").is_err());
    }

    #[test]
    fn test_summary_after_all_settled() {
        let mut dist = round();
        dist.offer("A-1").unwrap();
        dist.claim(4, "A-1", Utc::now()).unwrap();
        dist.decide("A-1", Decision::Confirm(4)).unwrap();
        assert!(!dist.is_complete());

        dist.decide("A-2", Decision::Skip).unwrap();
        assert!(dist.is_complete());

        let summary = dist.summary();
        assert_eq!(summary.assigned, vec![("A-1".to_string(), 4)]);
        assert_eq!(summary.skipped, vec!["A-2".to_string()]);
    }
}
