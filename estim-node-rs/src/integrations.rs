//! File and command backed collaborators
//!
//! These are the node's only links to the outside world: a task list file,
//! a results file, an estimator command and a notification hook.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use estim_core::{
    AdvisoryEstimator, CollaboratorError, Collaborators, Estimate, LifecycleEvent, Notifier,
    ResultsSink, SessionResults, TaskSource, TaskSpec,
};

use crate::config::{AdvisorConfig, NodeConfig, NotificationConfig};

/// Task list stored as a JSON array of `{key, summary, description}`
#[derive(Debug, Clone)]
pub struct JsonFileTaskSource {
    path: PathBuf,
}

impl JsonFileTaskSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TaskSource for JsonFileTaskSource {
    async fn load(&self) -> Result<Vec<TaskSpec>, CollaboratorError> {
        let text = tokio::fs::read_to_string(&self.path).await?;
        let tasks: Vec<TaskSpec> = serde_json::from_str(&text)?;
        info!("Loaded {} tasks from {}", tasks.len(), self.path.display());
        Ok(tasks)
    }
}

/// Writes final results as pretty JSON
#[derive(Debug, Clone)]
pub struct JsonFileResultsSink {
    path: PathBuf,
}

impl JsonFileResultsSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ResultsSink for JsonFileResultsSink {
    async fn publish(&self, results: &SessionResults) -> Result<(), CollaboratorError> {
        let json = serde_json::to_vec_pretty(results)?;
        tokio::fs::write(&self.path, json).await?;
        info!("Results written to {}", self.path.display());
        Ok(())
    }
}

/// Runs a shell command per task: task JSON on stdin, `{value, rationale}` on stdout
#[derive(Debug, Clone)]
pub struct CommandEstimator {
    name: String,
    command: String,
    timeout: Duration,
}

impl CommandEstimator {
    pub fn new(name: impl Into<String>, command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            timeout,
        }
    }

    pub fn from_config(config: &AdvisorConfig) -> Self {
        Self::new(&config.name, &config.command, config.timeout())
    }

    async fn run(&self, input: Vec<u8>) -> Result<Vec<u8>, CollaboratorError> {
        let mut child = Command::new("sh")
            .args(["-c", &self.command])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            // A command may exit without reading its input
            if let Err(e) = stdin.write_all(&input).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e.into());
                }
            }
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(CollaboratorError::Failed(format!(
                "estimator exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl AdvisoryEstimator for CommandEstimator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn estimate(&self, task: &TaskSpec) -> Result<Estimate, CollaboratorError> {
        let input = serde_json::to_vec(task)?;
        debug!("Asking estimator about {}", task.key);
        let stdout = tokio::time::timeout(self.timeout, self.run(input))
            .await
            .map_err(|_| CollaboratorError::Timeout)??;
        let estimate: Estimate = serde_json::from_slice(&stdout)?;
        Ok(estimate)
    }
}

/// Logs lifecycle events and optionally runs a hook command for each
#[derive(Debug, Clone)]
pub struct HookNotifier {
    config: NotificationConfig,
}

impl HookNotifier {
    pub fn new(config: NotificationConfig) -> Self {
        Self { config }
    }

    /// Run `hook` with the event JSON on stdin and in `ESTIM_EVENT_JSON`
    async fn run_hook(&self, hook: &str, event: &LifecycleEvent) -> Result<(), CollaboratorError> {
        let json = serde_json::to_string(event)?;
        let mut child = Command::new("sh")
            .args(["-c", hook])
            .env("ESTIM_EVENT", event.name())
            .env("ESTIM_EVENT_JSON", &json)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(json.as_bytes()).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e.into());
                }
            }
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(CollaboratorError::Failed(format!(
                "hook exited with {}",
                output.status
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for HookNotifier {
    async fn notify(&self, event: &LifecycleEvent) -> Result<(), CollaboratorError> {
        if !self.config.wants(event) {
            debug!("Notification {} filtered", event.name());
            return Ok(());
        }
        info!("Session {}", event.name());

        match &self.config.hook_command {
            Some(hook) => self.run_hook(hook, event).await.map_err(|e| {
                warn!("Hook {:?} failed: {}", hook, e);
                e
            }),
            None => Ok(()),
        }
    }
}

/// Wire the configured collaborators
pub fn collaborators(config: &NodeConfig) -> Collaborators {
    let mut collaborators = Collaborators::default();
    if let Some(path) = &config.results_path {
        collaborators = collaborators.with_results(Arc::new(JsonFileResultsSink::new(path)));
    }
    if let Some(advisor) = &config.advisor {
        collaborators =
            collaborators.with_estimator(Arc::new(CommandEstimator::from_config(advisor)));
    }
    if config.notifications.enabled {
        collaborators = collaborators
            .with_notifier(Arc::new(HookNotifier::new(config.notifications.clone())));
    }
    collaborators
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_task_source_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(
            &path,
            r#"[{"key": "A-1", "summary": "Login"}, {"key": "A-2", "summary": "Reset", "description": "via email"}]"#,
        )
        .unwrap();

        let tasks = JsonFileTaskSource::new(&path).load().await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].description, "via email");

        let missing = JsonFileTaskSource::new(dir.path().join("nope.json")).load().await;
        assert!(matches!(missing, Err(CollaboratorError::Io(_))));
    }

    #[tokio::test]
    async fn test_results_sink_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        let results = SessionResults {
            session_id: Uuid::nil(),
            points: BTreeMap::from([("A-1".to_string(), 5.0)]),
            assignees: BTreeMap::from([("A-1".to_string(), "ana".to_string())]),
        };

        JsonFileResultsSink::new(&path).publish(&results).await.unwrap();
        let written: SessionResults =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, results);
    }

    #[tokio::test]
    async fn test_command_estimator() {
        let estimator = CommandEstimator::new(
            "oracle",
            r#"cat > /dev/null; echo '{"value": 8, "rationale": "two services"}'"#,
            Duration::from_secs(10),
        );
        let estimate = estimator.estimate(&TaskSpec::new("A-1", "Login")).await.unwrap();
        assert_eq!(estimate.value, 8.0);
        assert_eq!(estimate.rationale, "two services");
        assert_eq!(estimator.name(), "oracle");

        let failing = CommandEstimator::new("oracle", "exit 3", Duration::from_secs(10));
        assert!(matches!(
            failing.estimate(&TaskSpec::new("A-1", "Login")).await,
            Err(CollaboratorError::Failed(_))
        ));

        let garbage = CommandEstimator::new("oracle", "echo nope", Duration::from_secs(10));
        assert!(matches!(
            garbage.estimate(&TaskSpec::new("A-1", "Login")).await,
            Err(CollaboratorError::Json(_))
        ));
    }

    #[tokio::test]
    async fn test_command_estimator_timeout() {
        let slow = CommandEstimator::new("oracle", "sleep 5", Duration::from_millis(100));
        assert!(matches!(
            slow.estimate(&TaskSpec::new("A-1", "Login")).await,
            Err(CollaboratorError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_hook_receives_event() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("event.txt");
        let notifier = HookNotifier::new(NotificationConfig {
            enabled: true,
            events: vec!["ended".into()],
            hook_command: Some(format!("printf %s \"$ESTIM_EVENT\" > {}", out.display())),
        });

        let started = LifecycleEvent::Started {
            session_id: Uuid::nil(),
            task_count: 1,
            participant_count: 2,
        };
        notifier.notify(&started).await.unwrap();
        assert!(!out.exists());

        let ended = LifecycleEvent::Ended {
            session_id: Uuid::nil(),
            reason: estim_core::EndReason::LeaderEnded,
            finalized: 1,
            total_points: 5.0,
        };
        notifier.notify(&ended).await.unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "ended");
    }

    #[tokio::test]
    async fn test_hook_reads_event_json_on_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("event.json");
        let notifier = HookNotifier::new(NotificationConfig {
            hook_command: Some(format!("cat > {}", out.display())),
            ..Default::default()
        });

        let started = LifecycleEvent::Started {
            session_id: Uuid::nil(),
            task_count: 3,
            participant_count: 2,
        };
        notifier.notify(&started).await.unwrap();

        let written: LifecycleEvent =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(written, started);
    }

    #[test]
    fn test_collaborators_follow_config() {
        let config = NodeConfig::new("lead").without_notifications();
        let wired = collaborators(&config);
        assert!(wired.results.is_none() && wired.estimator.is_none() && wired.notifier.is_none());

        let config = NodeConfig::new("lead")
            .with_results_path("/tmp/results.json")
            .with_advisor(AdvisorConfig::new("oracle", "estimate.sh"));
        let wired = collaborators(&config);
        assert!(wired.results.is_some());
        assert_eq!(wired.estimator.unwrap().name(), "oracle");
        assert!(wired.notifier.is_some());
    }
}
