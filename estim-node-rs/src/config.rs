//! Configuration for the estimation node
//!
//! Loaded from an optional JSON file; CLI flags override individual fields.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use estim_core::{ConfigError, LifecycleEvent, Settings};

/// Default WebSocket port
pub const DEFAULT_PORT: u16 = 9870;

/// Lifecycle event names a notifier may subscribe to
pub const EVENT_NAMES: [&str; 3] = ["started", "distributed", "ended"];

/// Complete node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeConfig {
    /// Address the WebSocket listener binds to
    pub listen: SocketAddr,

    /// Display name that receives the leader role
    pub leader: String,

    /// JSON file holding the ordered task list
    pub tasks_path: Option<PathBuf>,

    /// Session settings
    pub settings: Settings,

    /// JSON file the final points and assignees are written to
    pub results_path: Option<PathBuf>,

    /// External advisory estimator
    pub advisor: Option<AdvisorConfig>,

    /// Lifecycle notifications
    pub notifications: NotificationConfig,
}

/// Advisory estimator run as a shell command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdvisorConfig {
    /// Display name of the advisory voter
    pub name: String,

    /// Shell command; receives the task JSON on stdin, prints an estimate
    pub command: String,

    /// Seconds before the command is abandoned
    pub timeout_secs: u64,
}

/// Lifecycle notification settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationConfig {
    pub enabled: bool,

    /// Events to report; empty means all
    pub events: Vec<String>,

    /// Shell command run once per reported event
    pub hook_command: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            leader: String::new(),
            tasks_path: None,
            settings: Settings::default(),
            results_path: None,
            advisor: None,
            notifications: NotificationConfig::default(),
        }
    }
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            name: "advisor".to_string(),
            command: String::new(),
            timeout_secs: 30,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            events: Vec::new(),
            hook_command: None,
        }
    }
}

impl AdvisorConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl NotificationConfig {
    /// True if `event` should be reported
    pub fn wants(&self, event: &LifecycleEvent) -> bool {
        self.enabled && (self.events.is_empty() || self.events.iter().any(|e| e == event.name()))
    }
}

impl NodeConfig {
    /// Create config with the leader's display name
    pub fn new(leader: impl Into<String>) -> Self {
        Self {
            leader: leader.into(),
            ..Default::default()
        }
    }

    /// Read and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.leader.trim().is_empty() {
            return Err(ConfigError::Invalid("leader name must not be empty".into()));
        }
        self.settings.validate()?;

        if let Some(advisor) = &self.advisor {
            if advisor.name.trim().is_empty() || advisor.command.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "advisor needs both a name and a command".into(),
                ));
            }
            if advisor.name.trim() == self.leader.trim() {
                return Err(ConfigError::Invalid(
                    "advisor cannot use the leader's name".into(),
                ));
            }
            if advisor.timeout_secs == 0 {
                return Err(ConfigError::Invalid("advisor timeoutSecs must be positive".into()));
            }
        }

        if let Some(unknown) = self
            .notifications
            .events
            .iter()
            .find(|e| !EVENT_NAMES.contains(&e.as_str()))
        {
            return Err(ConfigError::Invalid(format!(
                "unknown notification event {:?}",
                unknown
            )));
        }
        Ok(())
    }

    /// Set the listen address
    pub fn with_listen(mut self, listen: SocketAddr) -> Self {
        self.listen = listen;
        self
    }

    /// Set the task list file
    pub fn with_tasks_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.tasks_path = Some(path.into());
        self
    }

    /// Set the session settings
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the results file
    pub fn with_results_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.results_path = Some(path.into());
        self
    }

    /// Enable the command-based advisory estimator
    pub fn with_advisor(mut self, advisor: AdvisorConfig) -> Self {
        self.advisor = Some(advisor);
        self
    }

    /// Run `command` on every reported lifecycle event
    pub fn with_hook(mut self, command: impl Into<String>) -> Self {
        self.notifications.hook_command = Some(command.into());
        self
    }

    /// Disable lifecycle notifications
    pub fn without_notifications(mut self) -> Self {
        self.notifications.enabled = false;
        self
    }
}
