//! Voting engine: one estimation round on one task
//!
//! A round collects at most one live vote per participant. Resubmitting
//! before reveal overwrites the earlier vote. Reveal closes the round and
//! computes statistics over numeric votes only; uncertain votes are kept for
//! display but excluded from arithmetic.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::error::{SessionError, SessionResult};
use crate::settings::Settings;
use crate::types::{ParticipantId, TaskKey, Vote};

/// Summary of the numeric votes of a round
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    /// Mean, rounded to two decimals
    pub average: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    /// `max - min`
    pub divergence: f64,
}

impl Statistics {
    /// Compute statistics, `None` when there are no values
    pub fn compute(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let n = sorted.len();
        let median = if n % 2 == 0 {
            (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
        } else {
            sorted[n / 2]
        };
        let min = sorted[0];
        let max = sorted[n - 1];
        let mean = sorted.iter().sum::<f64>() / n as f64;

        Some(Self {
            average: round2(mean),
            median,
            min,
            max,
            divergence: max - min,
        })
    }

    /// True if the spread warrants a discussion
    pub fn needs_discussion(&self, threshold: f64) -> bool {
        self.divergence >= threshold
    }
}

/// Round to two decimal places
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Leader's choice of final points for a revealed task
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PointsRepr", into = "PointsRepr")]
pub enum PointsChoice {
    Median,
    Average,
    Custom(f64),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum PointsRepr {
    Custom(f64),
    Named(String),
}

impl TryFrom<PointsRepr> for PointsChoice {
    type Error = String;

    fn try_from(repr: PointsRepr) -> Result<Self, Self::Error> {
        match repr {
            PointsRepr::Custom(p) => Ok(PointsChoice::Custom(p)),
            PointsRepr::Named(name) => match name.as_str() {
                "median" => Ok(PointsChoice::Median),
                "average" => Ok(PointsChoice::Average),
                other => Err(format!("unknown points choice {:?}", other)),
            },
        }
    }
}

impl From<PointsChoice> for PointsRepr {
    fn from(choice: PointsChoice) -> Self {
        match choice {
            PointsChoice::Median => PointsRepr::Named("median".into()),
            PointsChoice::Average => PointsRepr::Named("average".into()),
            PointsChoice::Custom(p) => PointsRepr::Custom(p),
        }
    }
}

/// Outcome of revealing a round
#[derive(Debug, Clone, PartialEq)]
pub struct Reveal {
    pub task_key: TaskKey,
    pub epoch: u64,
    pub votes: BTreeMap<ParticipantId, Vote>,
    pub statistics: Option<Statistics>,
    pub discussion: bool,
    /// Revealed by timeout before every expected vote arrived
    pub partial: bool,
}

impl Reveal {
    /// Default suggestion offered to the leader
    pub fn suggested_points(&self) -> Option<f64> {
        self.statistics.map(|s| s.median)
    }

    /// Resolve the leader's choice into final points
    pub fn resolve(&self, choice: PointsChoice) -> SessionResult<f64> {
        match choice {
            PointsChoice::Median => self
                .statistics
                .map(|s| s.median)
                .ok_or_else(|| SessionError::validation("no numeric votes to take a median of")),
            PointsChoice::Average => self
                .statistics
                .map(|s| s.average)
                .ok_or_else(|| SessionError::validation("no numeric votes to average")),
            PointsChoice::Custom(points) if points.is_finite() && points >= 0.0 => Ok(points),
            PointsChoice::Custom(points) => Err(SessionError::validation(format!(
                "points must be finite and non-negative, got {}",
                points
            ))),
        }
    }
}

/// Open or closed estimation round for one task
#[derive(Debug, Clone)]
pub struct VotingRound {
    task_key: TaskKey,
    epoch: u64,
    votes: BTreeMap<ParticipantId, Vote>,
    /// Participants not waited for this round (e.g. a failed advisor)
    excused: BTreeSet<ParticipantId>,
    open: bool,
}

impl VotingRound {
    pub fn new(task_key: impl Into<TaskKey>, epoch: u64) -> Self {
        Self {
            task_key: task_key.into(),
            epoch,
            votes: BTreeMap::new(),
            excused: BTreeSet::new(),
            open: true,
        }
    }

    pub fn task_key(&self) -> &str {
        &self.task_key
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Store or overwrite a vote, returning the number of votes collected
    pub fn submit_vote(
        &mut self,
        settings: &Settings,
        participant: ParticipantId,
        vote: Vote,
    ) -> SessionResult<usize> {
        if !self.open {
            return Err(SessionError::state(format!(
                "voting on {} is closed",
                self.task_key
            )));
        }

        match vote {
            Vote::Points(p) if !settings.in_scale(p) => {
                return Err(SessionError::validation(format!(
                    "{} is not on the scale {:?}",
                    p, settings.scale
                )));
            }
            Vote::Uncertain if !settings.allow_uncertain => {
                return Err(SessionError::validation(
                    "uncertain votes are disabled for this session",
                ));
            }
            _ => {}
        }

        let previous = self.votes.insert(participant, vote);
        debug!(
            "Voting: {} voted on {} (overwrote: {})",
            participant,
            self.task_key,
            previous.is_some()
        );
        Ok(self.votes.len())
    }

    pub fn votes_in(&self) -> usize {
        self.votes.len()
    }

    pub fn vote_of(&self, participant: ParticipantId) -> Option<Vote> {
        self.votes.get(&participant).copied()
    }

    pub fn has_voted(&self, participant: ParticipantId) -> bool {
        self.votes.contains_key(&participant)
    }

    /// Stop waiting for `participant` this round
    pub fn excuse(&mut self, participant: ParticipantId) {
        self.excused.insert(participant);
    }

    pub fn is_excused(&self, participant: ParticipantId) -> bool {
        self.excused.contains(&participant)
    }

    /// Close the round and compute its statistics
    pub fn reveal(&mut self, settings: &Settings, partial: bool) -> SessionResult<Reveal> {
        if !self.open {
            return Err(SessionError::state(format!(
                "{} has already been revealed",
                self.task_key
            )));
        }
        self.open = false;

        let numeric: Vec<f64> = self.votes.values().filter_map(Vote::points).collect();
        let statistics = Statistics::compute(&numeric);
        let discussion = statistics
            .map(|s| s.needs_discussion(settings.divergence_threshold))
            .unwrap_or(false);

        Ok(Reveal {
            task_key: self.task_key.clone(),
            epoch: self.epoch,
            votes: self.votes.clone(),
            statistics,
            discussion,
            partial,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings::default().with_divergence_threshold(8.0)
    }

    fn reveal_of(votes: &[f64]) -> Reveal {
        let settings = settings();
        let mut round = VotingRound::new("T-1", 1);
        for (i, v) in votes.iter().enumerate() {
            round.submit_vote(&settings, i as ParticipantId, Vote::Points(*v)).unwrap();
        }
        round.reveal(&settings, false).unwrap()
    }

    #[test]
    fn test_low_divergence_no_flag() {
        let reveal = reveal_of(&[5.0, 8.0, 5.0]);
        let stats = reveal.statistics.unwrap();
        assert_eq!(stats.divergence, 3.0);
        assert!(!reveal.discussion);
    }

    #[test]
    fn test_high_divergence_flags_discussion() {
        let reveal = reveal_of(&[2.0, 13.0, 5.0]);
        let stats = reveal.statistics.unwrap();
        assert_eq!(stats.divergence, 11.0);
        assert_eq!(stats.min, 2.0);
        assert_eq!(stats.max, 13.0);
        assert!(reveal.discussion);
    }

    #[test]
    fn test_flag_at_exact_threshold() {
        let reveal = reveal_of(&[5.0, 13.0]);
        assert_eq!(reveal.statistics.unwrap().divergence, 8.0);
        assert!(reveal.discussion);
    }

    #[test]
    fn test_even_count_median_and_average() {
        let stats = Statistics::compute(&[5.0, 8.0, 5.0, 5.0]).unwrap();
        assert_eq!(stats.median, 5.0);
        assert_eq!(stats.average, 5.75);

        let stats = Statistics::compute(&[3.0, 8.0]).unwrap();
        assert_eq!(stats.median, 5.5);
    }

    #[test]
    fn test_average_rounded_to_two_decimals() {
        let stats = Statistics::compute(&[1.0, 2.0, 2.0]).unwrap();
        assert_eq!(stats.average, 1.67);
    }

    #[test]
    fn test_last_vote_wins() {
        let settings = settings();
        let mut round = VotingRound::new("T-1", 1);
        assert_eq!(round.submit_vote(&settings, 7, Vote::Points(3.0)).unwrap(), 1);
        assert_eq!(round.submit_vote(&settings, 7, Vote::Points(13.0)).unwrap(), 1);
        assert_eq!(round.vote_of(7), Some(Vote::Points(13.0)));

        let reveal = round.reveal(&settings, false).unwrap();
        assert_eq!(reveal.statistics.unwrap().median, 13.0);
    }

    #[test]
    fn test_uncertain_votes_excluded_from_arithmetic() {
        let settings = settings();
        let mut round = VotingRound::new("T-1", 1);
        round.submit_vote(&settings, 1, Vote::Points(3.0)).unwrap();
        round.submit_vote(&settings, 2, Vote::Uncertain).unwrap();
        round.submit_vote(&settings, 3, Vote::Points(5.0)).unwrap();

        let reveal = round.reveal(&settings, false).unwrap();
        assert_eq!(reveal.votes.len(), 3);
        let stats = reveal.statistics.unwrap();
        assert_eq!(stats.average, 4.0);
        assert_eq!(stats.divergence, 2.0);
    }

    #[test]
    fn test_only_uncertain_votes_have_no_statistics() {
        let settings = settings();
        let mut round = VotingRound::new("T-1", 1);
        round.submit_vote(&settings, 1, Vote::Uncertain).unwrap();

        let reveal = round.reveal(&settings, false).unwrap();
        assert!(reveal.statistics.is_none());
        assert!(!reveal.discussion);
        assert!(reveal.resolve(PointsChoice::Median).is_err());
        assert_eq!(reveal.resolve(PointsChoice::Custom(3.0)).unwrap(), 3.0);
    }

    #[test]
    fn test_rejects_off_scale_and_disabled_uncertain() {
        let settings = settings().without_uncertain();
        let mut round = VotingRound::new("T-1", 1);

        let err = round.submit_vote(&settings, 1, Vote::Points(4.0)).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let err = round.submit_vote(&settings, 1, Vote::Uncertain).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(round.votes_in(), 0);
    }

    #[test]
    fn test_closed_round_rejects_votes() {
        let settings = settings();
        let mut round = VotingRound::new("T-1", 1);
        round.reveal(&settings, false).unwrap();

        let err = round.submit_vote(&settings, 1, Vote::Points(3.0)).unwrap_err();
        assert_eq!(err.code(), "STATE_ERROR");
        assert!(round.reveal(&settings, false).is_err());
    }

    #[test]
    fn test_points_choice_resolution() {
        let reveal = reveal_of(&[1.0, 2.0, 2.0]);
        assert_eq!(reveal.suggested_points(), Some(2.0));
        assert_eq!(reveal.resolve(PointsChoice::Median).unwrap(), 2.0);
        assert_eq!(reveal.resolve(PointsChoice::Average).unwrap(), 1.67);
        assert!(reveal.resolve(PointsChoice::Custom(-1.0)).is_err());
    }

    #[test]
    fn test_points_choice_wire_format() {
        let median: PointsChoice = serde_json::from_str("\"median\"").unwrap();
        assert_eq!(median, PointsChoice::Median);
        let custom: PointsChoice = serde_json::from_str("8").unwrap();
        assert_eq!(custom, PointsChoice::Custom(8.0));
        assert!(serde_json::from_str::<PointsChoice>("\"mode\"").is_err());
    }
}
