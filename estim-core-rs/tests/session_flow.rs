//! End-to-end session flows through the running coordinator
//!
//! Time is paused so vote timeouts and the leader grace window elapse
//! instantly once every task is idle.

use async_trait::async_trait;
use estim_core::collaborators::{
    AdvisoryEstimator, CollaboratorError, Estimate, LifecycleEvent, Notifier, ResultsSink,
    SessionResults,
};
use estim_core::coordinator::{Collaborators, Coordinator, CoordinatorHandle};
use estim_core::protocol::{ClientMessage, DecisionRequest, EndReason, ServerMessage};
use estim_core::settings::Settings;
use estim_core::types::{ConnectionId, TaskSpec, Vote};
use estim_core::voting::PointsChoice;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

struct Peer {
    connection: ConnectionId,
    rx: UnboundedReceiver<ServerMessage>,
}

impl Peer {
    async fn join(handle: &CoordinatorHandle, name: &str) -> Self {
        let (connection, rx) = handle.open_connection().await.unwrap();
        handle
            .submit(connection, ClientMessage::Join { name: name.into() })
            .await
            .unwrap();
        Self { connection, rx }
    }

    /// Wait for the first frame matching `pick`, skipping others
    async fn expect<T>(&mut self, pick: impl Fn(&ServerMessage) -> Option<T>) -> T {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(600), self.rx.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("connection closed");
            if let Some(found) = pick(&msg) {
                return found;
            }
        }
    }
}

fn tasks() -> Vec<TaskSpec> {
    vec![
        TaskSpec::new("A-1", "Login form"),
        TaskSpec::new("A-2", "Password reset").with_description("Email link flow"),
        TaskSpec::new("A-3", "Audit log"),
    ]
}

fn spawn(
    settings: Settings,
    collaborators: Collaborators,
) -> (CoordinatorHandle, JoinHandle<estim_core::protocol::SessionSummary>) {
    let (coordinator, handle) = Coordinator::new("lead", settings, tasks(), collaborators).unwrap();
    (handle, tokio::spawn(coordinator.run()))
}

async fn vote(handle: &CoordinatorHandle, peer: &Peer, task: &str, value: f64) {
    handle
        .submit(
            peer.connection,
            ClientMessage::Vote {
                task_key: task.into(),
                value: Vote::Points(value),
            },
        )
        .await
        .unwrap();
}

async fn leader_says(handle: &CoordinatorHandle, leader: &Peer, message: ClientMessage) {
    handle.submit(leader.connection, message).await.unwrap();
}

#[derive(Default)]
struct Recorder {
    results: Mutex<Vec<SessionResults>>,
    events: Mutex<Vec<LifecycleEvent>>,
}

#[async_trait]
impl ResultsSink for Recorder {
    async fn publish(&self, results: &SessionResults) -> Result<(), CollaboratorError> {
        self.results.lock().push(results.clone());
        Ok(())
    }
}

#[async_trait]
impl Notifier for Recorder {
    async fn notify(&self, event: &LifecycleEvent) -> Result<(), CollaboratorError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_estimate_distribute_and_end() {
    let recorder = Arc::new(Recorder::default());
    let collaborators = Collaborators::default()
        .with_results(recorder.clone())
        .with_notifier(recorder.clone());
    let (handle, session) = spawn(Settings::default(), collaborators);

    let mut leader = Peer::join(&handle, "lead").await;
    let mut ana = Peer::join(&handle, "ana").await;
    let mut bo = Peer::join(&handle, "bo").await;

    let leader_id = leader
        .expect(|m| match m {
            ServerMessage::Welcome { participant_id, .. } => Some(*participant_id),
            _ => None,
        })
        .await;
    let ready = leader
        .expect(|m| match m {
            ServerMessage::ParticipantsUpdate {
                connected_voters: 2,
                ready_to_start,
                ..
            } => Some(*ready_to_start),
            _ => None,
        })
        .await;
    assert!(ready);

    for (task, a, b, expect_avg) in [("A-1", 5.0, 8.0, 6.5), ("A-2", 3.0, 3.0, 3.0), ("A-3", 2.0, 13.0, 7.5)] {
        leader_says(&handle, &leader, ClientMessage::StartVoting { task_key: task.into() }).await;
        let started = ana
            .expect(|m| match m {
                ServerMessage::VotingStarted { task_key, .. } => Some(task_key.clone()),
                _ => None,
            })
            .await;
        assert_eq!(started, task);

        vote(&handle, &ana, task, a).await;
        vote(&handle, &bo, task, b).await;

        let reveal = leader
            .expect(|m| match m {
                ServerMessage::VotingRevealed(view) => Some(view.clone()),
                _ => None,
            })
            .await;
        assert_eq!(reveal.task_key, task);
        assert_eq!(reveal.average, Some(expect_avg));
        assert_eq!(reveal.discussion_flag, task == "A-3");
        assert!(!reveal.partial);
        assert!(reveal.per_participant_votes.iter().all(|v| v.participant_id != leader_id));

        leader_says(
            &handle,
            &leader,
            ClientMessage::SetPoints {
                task_key: task.into(),
                points: PointsChoice::Average,
            },
        )
        .await;
        let points = bo
            .expect(|m| match m {
                ServerMessage::TaskFinalized { points, .. } => Some(*points),
                _ => None,
            })
            .await;
        assert_eq!(points, expect_avg);
    }

    leader_says(&handle, &leader, ClientMessage::StartDistribution).await;
    for task in ["A-1", "A-2", "A-3"] {
        leader_says(&handle, &leader, ClientMessage::OfferTask { task_key: task.into() }).await;
    }
    handle
        .submit(ana.connection, ClientMessage::ClaimTask { task_key: "A-1".into() })
        .await
        .unwrap();
    let default_candidate = leader
        .expect(|m| match m {
            ServerMessage::ClaimCandidates {
                default_candidate, ..
            } => default_candidate.clone(),
            _ => None,
        })
        .await;
    assert_eq!(default_candidate, "ana");

    leader_says(
        &handle,
        &leader,
        ClientMessage::LeaderDecision {
            task_key: "A-1".into(),
            decision: DecisionRequest::Confirm { claimant: "ana".into() },
        },
    )
    .await;
    leader_says(
        &handle,
        &leader,
        ClientMessage::LeaderDecision {
            task_key: "A-2".into(),
            decision: DecisionRequest::Reassign { assignee: "bo".into() },
        },
    )
    .await;
    leader_says(
        &handle,
        &leader,
        ClientMessage::LeaderDecision {
            task_key: "A-3".into(),
            decision: DecisionRequest::Skip,
        },
    )
    .await;

    let (assigned, skipped) = ana
        .expect(|m| match m {
            ServerMessage::DistributionComplete {
                assigned_count,
                skipped_count,
                ..
            } => Some((*assigned_count, *skipped_count)),
            _ => None,
        })
        .await;
    assert_eq!((assigned, skipped), (2, 1));

    leader_says(&handle, &leader, ClientMessage::EndSession).await;
    let summary = session.await.unwrap();
    assert_eq!(summary.reason, EndReason::LeaderEnded);
    assert_eq!(summary.totals.finalized_count, 3);
    assert_eq!(summary.totals.total_points, 6.5 + 3.0 + 7.5);
    assert_eq!(summary.totals.assigned_count, 2);
    assert_eq!(summary.totals.skipped_count, 1);

    let results = recorder.results.lock().clone();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].points.get("A-2"), Some(&3.0));
    assert_eq!(results[0].assignees.get("A-1").map(String::as_str), Some("ana"));
    assert_eq!(results[0].assignees.get("A-2").map(String::as_str), Some("bo"));
    assert!(!results[0].assignees.contains_key("A-3"));

    let mut names: Vec<&str> = recorder.events.lock().iter().map(|e| e.name()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["distributed", "ended", "started"]);

    // Everyone hears the end, then the transport is dropped
    bo.expect(|m| match m {
        ServerMessage::SessionEnded { .. } => Some(()),
        _ => None,
    })
    .await;
    assert!(handle.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_vote_timeout_reveals_partial_round() {
    let settings = Settings::default().with_min_participants(3).with_vote_timeout(30);
    let (handle, _session) = spawn(settings, Collaborators::default());

    let mut leader = Peer::join(&handle, "lead").await;
    let ana = Peer::join(&handle, "ana").await;
    let bo = Peer::join(&handle, "bo").await;
    let _cy = Peer::join(&handle, "cy").await;

    leader_says(&handle, &leader, ClientMessage::StartVoting { task_key: "A-1".into() }).await;
    vote(&handle, &ana, "A-1", 5.0).await;
    vote(&handle, &bo, "A-1", 8.0).await;

    let reveal = leader
        .expect(|m| match m {
            ServerMessage::VotingRevealed(view) => Some(view.clone()),
            _ => None,
        })
        .await;
    assert!(reveal.partial);
    assert_eq!(reveal.per_participant_votes.len(), 2);
    assert_eq!(reveal.median, Some(6.5));
    assert_eq!(reveal.suggested_points, Some(6.5));
}

#[tokio::test(start_paused = true)]
async fn test_leader_lost_ends_session() {
    let settings = Settings::default().with_leader_grace(45);
    let (handle, session) = spawn(settings, Collaborators::default());

    let leader = Peer::join(&handle, "lead").await;
    let mut ana = Peer::join(&handle, "ana").await;
    handle.close_connection(leader.connection).await.unwrap();

    let reason = ana
        .expect(|m| match m {
            ServerMessage::SessionEnded { summary } => Some(summary.reason),
            _ => None,
        })
        .await;
    assert_eq!(reason, EndReason::LeaderLost);
    assert_eq!(session.await.unwrap().reason, EndReason::LeaderLost);
}

#[tokio::test(start_paused = true)]
async fn test_leader_reconnect_within_grace_keeps_session() {
    let settings = Settings::default().with_leader_grace(45);
    let (handle, session) = spawn(settings, Collaborators::default());

    let leader = Peer::join(&handle, "lead").await;
    let _ana = Peer::join(&handle, "ana").await;
    handle.close_connection(leader.connection).await.unwrap();
    tokio::time::sleep(Duration::from_secs(20)).await;

    let mut back = Peer::join(&handle, "lead").await;
    let snapshot = back
        .expect(|m| match m {
            ServerMessage::SessionSnapshot(snapshot) => Some(snapshot.clone()),
            _ => None,
        })
        .await;
    assert_eq!(snapshot.current_task.as_deref(), Some("A-1"));

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(!session.is_finished());

    handle.shutdown().await.unwrap();
    assert_eq!(session.await.unwrap().reason, EndReason::Shutdown);
}

struct SlowEstimator;

#[async_trait]
impl AdvisoryEstimator for SlowEstimator {
    fn name(&self) -> &str {
        "oracle"
    }

    async fn estimate(&self, task: &TaskSpec) -> Result<Estimate, CollaboratorError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        if task.key == "A-2" {
            return Err(CollaboratorError::Failed("model unavailable".into()));
        }
        Ok(Estimate {
            value: 13.0,
            rationale: "large schema change".into(),
        })
    }
}

#[tokio::test(start_paused = true)]
async fn test_advisory_voter_joins_each_round() {
    let collaborators = Collaborators::default().with_estimator(Arc::new(SlowEstimator));
    let (handle, _session) = spawn(Settings::default(), collaborators);

    let mut leader = Peer::join(&handle, "lead").await;
    let ana = Peer::join(&handle, "ana").await;
    let bo = Peer::join(&handle, "bo").await;

    leader_says(&handle, &leader, ClientMessage::StartVoting { task_key: "A-1".into() }).await;
    vote(&handle, &ana, "A-1", 3.0).await;
    vote(&handle, &bo, "A-1", 3.0).await;

    let reveal = leader
        .expect(|m| match m {
            ServerMessage::VotingRevealed(view) => Some(view.clone()),
            _ => None,
        })
        .await;
    let advisory = reveal
        .per_participant_votes
        .iter()
        .find(|v| v.advisory)
        .expect("advisory vote");
    assert_eq!(advisory.name, "oracle");
    assert_eq!(advisory.value, Vote::Points(13.0));
    assert!(reveal.discussion_flag);

    leader_says(
        &handle,
        &leader,
        ClientMessage::SetPoints {
            task_key: "A-1".into(),
            points: PointsChoice::Median,
        },
    )
    .await;
    leader_says(&handle, &leader, ClientMessage::StartVoting { task_key: "A-2".into() }).await;
    vote(&handle, &ana, "A-2", 5.0).await;
    vote(&handle, &bo, "A-2", 5.0).await;

    let reveal = leader
        .expect(|m| match m {
            ServerMessage::VotingRevealed(view) if view.task_key == "A-2" => Some(view.clone()),
            _ => None,
        })
        .await;
    assert_eq!(reveal.per_participant_votes.len(), 2);
    assert!(reveal.per_participant_votes.iter().all(|v| !v.advisory));
}

/// Takes its time over `started`, answers everything else at once
#[derive(Default)]
struct SlowStart {
    seen: Mutex<Vec<&'static str>>,
}

#[async_trait]
impl Notifier for SlowStart {
    async fn notify(&self, event: &LifecycleEvent) -> Result<(), CollaboratorError> {
        if matches!(event, LifecycleEvent::Started { .. }) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        self.seen.lock().push(event.name());
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_pending_notifications_delivered_before_run_returns() {
    let notifier = Arc::new(SlowStart::default());
    let (handle, session) = spawn(
        Settings::default(),
        Collaborators::default().with_notifier(notifier.clone()),
    );

    let leader = Peer::join(&handle, "lead").await;
    let mut ana = Peer::join(&handle, "ana").await;
    let _bo = Peer::join(&handle, "bo").await;

    leader_says(&handle, &leader, ClientMessage::StartVoting { task_key: "A-1".into() }).await;
    ana.expect(|m| matches!(m, ServerMessage::VotingStarted { .. }).then_some(()))
        .await;
    leader_says(&handle, &leader, ClientMessage::EndSession).await;

    let summary = session.await.unwrap();
    assert_eq!(summary.reason, EndReason::LeaderEnded);
    assert_eq!(*notifier.seen.lock(), vec!["started", "ended"]);
}
