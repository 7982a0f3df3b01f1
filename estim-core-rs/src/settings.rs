//! Session settings
//!
//! Settings may be changed by the leader while the session is still forming.
//! They are locked the first time a round starts.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;

/// Default estimation scale (Fibonacci-like)
pub const DEFAULT_SCALE: [f64; 7] = [1.0, 2.0, 3.0, 5.0, 8.0, 13.0, 21.0];

/// Tunables of one estimation session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Connected voters required before a round may start
    pub min_participants: usize,

    /// Seconds before an open round is force-revealed (0 = unlimited)
    pub vote_timeout_secs: u64,

    /// Allowed numeric votes, ascending
    pub scale: Vec<f64>,

    /// Whether the uncertain sentinel is accepted
    pub allow_uncertain: bool,

    /// Spread between highest and lowest vote that flags a discussion
    pub divergence_threshold: f64,

    /// How long a disconnected leader may stay away before the session ends
    pub leader_grace_secs: u64,

    /// Seconds an offered task stays open for claims (0 = until decided)
    pub claim_window_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            min_participants: 2,
            vote_timeout_secs: 0,
            scale: DEFAULT_SCALE.to_vec(),
            allow_uncertain: true,
            divergence_threshold: 8.0,
            leader_grace_secs: 60,
            claim_window_secs: 0,
        }
    }
}

impl Settings {
    /// Check internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_participants == 0 {
            return Err(ConfigError::Invalid(
                "minParticipants must be at least 1".into(),
            ));
        }
        if self.scale.is_empty() {
            return Err(ConfigError::Invalid("scale must not be empty".into()));
        }
        if self.scale.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(ConfigError::Invalid(
                "scale values must be finite and non-negative".into(),
            ));
        }
        if self.scale.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ConfigError::Invalid(
                "scale must be strictly ascending".into(),
            ));
        }
        if !self.divergence_threshold.is_finite() || self.divergence_threshold < 0.0 {
            return Err(ConfigError::Invalid(
                "divergenceThreshold must be finite and non-negative".into(),
            ));
        }
        Ok(())
    }

    /// True if `value` is one of the scale entries
    pub fn in_scale(&self, value: f64) -> bool {
        self.scale.iter().any(|s| (s - value).abs() < f64::EPSILON)
    }

    pub fn vote_timeout(&self) -> Option<Duration> {
        (self.vote_timeout_secs > 0).then(|| Duration::from_secs(self.vote_timeout_secs))
    }

    pub fn claim_window(&self) -> Option<Duration> {
        (self.claim_window_secs > 0).then(|| Duration::from_secs(self.claim_window_secs))
    }

    pub fn leader_grace(&self) -> Duration {
        Duration::from_secs(self.leader_grace_secs)
    }

    /// Set minimum connected voters
    pub fn with_min_participants(mut self, count: usize) -> Self {
        self.min_participants = count;
        self
    }

    /// Set vote timeout in seconds
    pub fn with_vote_timeout(mut self, secs: u64) -> Self {
        self.vote_timeout_secs = secs;
        self
    }

    /// Replace the estimation scale
    pub fn with_scale(mut self, scale: impl Into<Vec<f64>>) -> Self {
        self.scale = scale.into();
        self
    }

    /// Reject the uncertain sentinel
    pub fn without_uncertain(mut self) -> Self {
        self.allow_uncertain = false;
        self
    }

    pub fn with_divergence_threshold(mut self, threshold: f64) -> Self {
        self.divergence_threshold = threshold;
        self
    }

    pub fn with_leader_grace(mut self, secs: u64) -> Self {
        self.leader_grace_secs = secs;
        self
    }

    pub fn with_claim_window(mut self, secs: u64) -> Self {
        self.claim_window_secs = secs;
        self
    }
}
