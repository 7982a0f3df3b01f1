//! Session coordinator
//!
//! The single authority over a session. Connection tasks, timers and
//! collaborator replies all feed one bounded event queue; the coordinator
//! drains it one event at a time, so every state transition is atomic with
//! respect to every other. Handlers never block: collaborator calls and
//! timers run as spawned tasks and report back through the same queue.
//!
//! Timers and advisory replies carry the epoch they were started under and
//! are ignored once that epoch is stale.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::collaborators::{
    AdvisoryEstimator, CollaboratorError, Estimate, LifecycleEvent, Notifier, ResultsSink,
    SessionResults, TaskSource,
};
use crate::distribution::{Decision, DistributionRound};
use crate::error::{ConfigError, SessionError, SessionResult};
use crate::protocol::{
    AssignmentView, CandidateView, ClientMessage, DecisionRequest, EndReason, OfferView, Phase,
    RevealView, ServerMessage, SessionSummary, SnapshotView, Totals, VoteView,
};
use crate::registry::{ConnectionRegistry, ConnectivityChange, Outbound};
use crate::session::Session;
use crate::settings::Settings;
use crate::types::{
    AssignmentState, ConnectionId, ConnectionState, Participant, ParticipantId, Role, TaskKey,
    TaskSpec, TaskStatus, Vote,
};
use crate::voting::{PointsChoice, Reveal, VotingRound};

/// Capacity of the coordinator's inbound queue
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Deferred wake-ups scheduled by the coordinator itself
#[derive(Debug, Clone, PartialEq)]
pub enum TimerEvent {
    VoteTimeout { epoch: u64 },
    ClaimWindow { task_key: TaskKey, epoch: u64 },
    LeaderGrace { epoch: u64 },
}

/// Everything the coordinator reacts to
#[derive(Debug)]
pub enum Event {
    /// A transport connected; it has not joined yet
    Opened {
        connection: ConnectionId,
        outbound: Outbound,
    },
    /// A well-formed client frame, stamped on arrival
    Inbound {
        connection: ConnectionId,
        message: ClientMessage,
        received_at: DateTime<Utc>,
    },
    /// A frame that failed to parse
    Malformed {
        connection: ConnectionId,
        reason: String,
    },
    Closed {
        connection: ConnectionId,
    },
    Timer(TimerEvent),
    /// Reply from the advisory estimator
    Advisory {
        epoch: u64,
        task_key: TaskKey,
        result: Result<Estimate, CollaboratorError>,
    },
    Shutdown,
}

/// Whether the event loop should keep going
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Optional collaborators wired into a session
#[derive(Clone, Default)]
pub struct Collaborators {
    pub estimator: Option<Arc<dyn AdvisoryEstimator>>,
    pub results: Option<Arc<dyn ResultsSink>>,
    pub notifier: Option<Arc<dyn Notifier>>,
}

impl Collaborators {
    pub fn with_estimator(mut self, estimator: Arc<dyn AdvisoryEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub fn with_results(mut self, results: Arc<dyn ResultsSink>) -> Self {
        self.results = Some(results);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }
}

/// The coordinator has stopped and no longer accepts events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("session coordinator has stopped")]
pub struct CoordinatorClosed;

/// Cloneable entry point used by connection tasks
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Event>,
    next_connection: Arc<AtomicU64>,
}

impl CoordinatorHandle {
    /// Announce a new transport. Returns its id and the receiver its writer drains.
    pub async fn open_connection(
        &self,
    ) -> Result<(ConnectionId, mpsc::UnboundedReceiver<ServerMessage>), CoordinatorClosed> {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let (outbound, rx) = mpsc::unbounded_channel();
        self.send(Event::Opened {
            connection,
            outbound,
        })
        .await?;
        Ok((connection, rx))
    }

    pub async fn submit(
        &self,
        connection: ConnectionId,
        message: ClientMessage,
    ) -> Result<(), CoordinatorClosed> {
        self.send(Event::Inbound {
            connection,
            message,
            received_at: Utc::now(),
        })
        .await
    }

    /// Parse and forward a raw text frame
    pub async fn submit_text(
        &self,
        connection: ConnectionId,
        text: &str,
    ) -> Result<(), CoordinatorClosed> {
        let received_at = Utc::now();
        let event = match ClientMessage::from_json(text) {
            Ok(message) => Event::Inbound {
                connection,
                message,
                received_at,
            },
            Err(e) => Event::Malformed {
                connection,
                reason: e.to_string(),
            },
        };
        self.send(event).await
    }

    /// Report a frame the transport could not decode
    pub async fn submit_malformed(
        &self,
        connection: ConnectionId,
        reason: impl Into<String>,
    ) -> Result<(), CoordinatorClosed> {
        self.send(Event::Malformed {
            connection,
            reason: reason.into(),
        })
        .await
    }

    pub async fn close_connection(&self, connection: ConnectionId) -> Result<(), CoordinatorClosed> {
        self.send(Event::Closed { connection }).await
    }

    pub async fn shutdown(&self) -> Result<(), CoordinatorClosed> {
        self.send(Event::Shutdown).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the coordinator has stopped
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    async fn send(&self, event: Event) -> Result<(), CoordinatorClosed> {
        self.tx.send(event).await.map_err(|_| CoordinatorClosed)
    }
}

/// Session actor
pub struct Coordinator {
    session: Session,
    registry: ConnectionRegistry,
    round: Option<VotingRound>,
    last_reveal: Option<Reveal>,
    /// Rationale attached to the advisory vote of the open round
    advisory_note: Option<String>,
    distribution: Option<DistributionRound>,
    advisor: Option<ParticipantId>,
    collaborators: Collaborators,
    /// Lifecycle notifications still in flight
    notifications: JoinSet<()>,
    /// Weak so that pending timers do not keep the queue alive
    scheduler: mpsc::WeakSender<Event>,
    events: mpsc::Receiver<Event>,
    ended: Option<SessionSummary>,
}

impl Coordinator {
    /// Build a session and the handle that feeds it
    pub fn new(
        leader_name: &str,
        settings: Settings,
        tasks: Vec<TaskSpec>,
        collaborators: Collaborators,
    ) -> Result<(Self, CoordinatorHandle), ConfigError> {
        let mut session = Session::new(leader_name, tasks, settings)?;
        let mut registry = ConnectionRegistry::new();

        let advisor = match &collaborators.estimator {
            Some(estimator) => {
                let name = estimator.name().trim().to_string();
                if name == session.leader_name {
                    return Err(ConfigError::Invalid(format!(
                        "advisory voter cannot share the leader's name {}",
                        name
                    )));
                }
                let id = registry
                    .reserve(&name)
                    .map_err(|e| ConfigError::Invalid(format!("advisory voter {:?}: {}", name, e)))?;
                session.add_participant(Participant::new(id, name, Role::AdvisoryVoter));
                Some(id)
            }
            None => None,
        };

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let coordinator = Self {
            session,
            registry,
            round: None,
            last_reveal: None,
            advisory_note: None,
            distribution: None,
            advisor,
            collaborators,
            notifications: JoinSet::new(),
            scheduler: tx.downgrade(),
            events: rx,
            ended: None,
        };
        let handle = CoordinatorHandle {
            tx,
            next_connection: Arc::new(AtomicU64::new(1)),
        };
        Ok((coordinator, handle))
    }

    /// Load the task list from `source`, then build the session
    pub async fn from_source(
        leader_name: &str,
        settings: Settings,
        source: &dyn TaskSource,
        collaborators: Collaborators,
    ) -> Result<(Self, CoordinatorHandle), ConfigError> {
        let tasks = source.load().await?;
        info!("Coordinator: loaded {} tasks", tasks.len());
        Self::new(leader_name, settings, tasks, collaborators)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn phase(&self) -> Phase {
        self.session.phase
    }

    pub fn last_reveal(&self) -> Option<&Reveal> {
        self.last_reveal.as_ref()
    }

    pub fn distribution(&self) -> Option<&DistributionRound> {
        self.distribution.as_ref()
    }

    /// Drain events until the session ends or every handle is dropped
    pub async fn run(mut self) -> SessionSummary {
        info!(
            "Coordinator: session {} led by {} with {} tasks",
            self.session.id,
            self.session.leader_name,
            self.session.tasks.len()
        );
        while let Some(event) = self.events.recv().await {
            if self.handle_event(event) == Flow::Stop {
                break;
            }
        }
        if self.ended.is_none() {
            self.end(EndReason::Shutdown);
        }
        self.finish().await
    }

    /// Hand results to the sink and announce the end; consumes the session
    pub async fn finish(mut self) -> SessionSummary {
        if self.ended.is_none() {
            self.end(EndReason::Shutdown);
        }
        let results = self.results();
        let summary = match self.ended.take() {
            Some(summary) => summary,
            None => self.summary(EndReason::Shutdown),
        };

        while self.notifications.join_next().await.is_some() {}

        if let Some(sink) = &self.collaborators.results {
            match sink.publish(&results).await {
                Ok(()) => info!("Coordinator: published results for {} tasks", results.points.len()),
                Err(e) => warn!("Coordinator: results sink failed: {}", e),
            }
        }
        if let Some(notifier) = &self.collaborators.notifier {
            let event = LifecycleEvent::Ended {
                session_id: summary.session_id,
                reason: summary.reason,
                finalized: summary.totals.finalized_count,
                total_points: summary.totals.total_points,
            };
            if let Err(e) = notifier.notify(&event).await {
                warn!("Coordinator: notifier failed on {}: {}", event.name(), e);
            }
        }
        summary
    }

    /// Apply one event
    pub fn handle_event(&mut self, event: Event) -> Flow {
        match event {
            Event::Opened {
                connection,
                outbound,
            } => self.registry.open(connection, outbound),
            Event::Inbound {
                connection,
                message,
                received_at,
            } => {
                debug!("Coordinator: {} from connection {}", message.kind(), connection);
                if let Err(err) = self.on_inbound(connection, message, received_at) {
                    self.reject(connection, err);
                }
            }
            Event::Malformed { connection, reason } => {
                self.reject(connection, SessionError::Protocol(reason));
            }
            Event::Closed { connection } => self.on_closed(connection),
            Event::Timer(timer) => self.on_timer(timer),
            Event::Advisory {
                epoch,
                task_key,
                result,
            } => self.on_advisory(epoch, &task_key, result),
            Event::Shutdown => self.end(EndReason::Shutdown),
        }

        if self.session.phase == Phase::Ended {
            Flow::Stop
        } else {
            Flow::Continue
        }
    }

    fn reject(&self, connection: ConnectionId, err: SessionError) {
        warn!("Coordinator: rejected frame from connection {}: {}", connection, err);
        self.registry
            .send_to_connection(connection, ServerMessage::error(err.code(), err.to_string()));
    }

    fn on_inbound(
        &mut self,
        connection: ConnectionId,
        message: ClientMessage,
        received_at: DateTime<Utc>,
    ) -> SessionResult<()> {
        if let ClientMessage::Join { name } = &message {
            self.on_join(connection, name);
            return Ok(());
        }

        let participant = self
            .registry
            .participant_of(connection)
            .ok_or_else(|| SessionError::Protocol("join before sending other messages".into()))?;
        if message.requires_leader() && !self.session.is_leader(participant) {
            return Err(SessionError::Authorization(format!(
                "only the leader may {}",
                message.kind()
            )));
        }

        match message {
            ClientMessage::Join { .. } => Ok(()),
            ClientMessage::Vote { task_key, value } => self.on_vote(participant, &task_key, value),
            ClientMessage::ClaimTask { task_key } => {
                self.on_claim(participant, &task_key, received_at)
            }
            ClientMessage::StartVoting { task_key } => self.on_start_voting(&task_key),
            ClientMessage::Reveal => self.on_reveal(),
            ClientMessage::Revote => self.on_revote(),
            ClientMessage::SetPoints { task_key, points } => self.on_set_points(&task_key, points),
            ClientMessage::UpdateSettings { settings } => self.on_update_settings(settings),
            ClientMessage::StartDistribution => self.on_start_distribution(),
            ClientMessage::OfferTask { task_key } => self.on_offer(&task_key),
            ClientMessage::LeaderDecision { task_key, decision } => {
                self.on_decision(&task_key, decision)
            }
            ClientMessage::EndSession => {
                self.end(EndReason::LeaderEnded);
                Ok(())
            }
        }
    }

    // Membership

    fn on_join(&mut self, connection: ConnectionId, name: &str) {
        let ended = self.session.phase == Phase::Ended;
        let registration = match self.registry.register(connection, name, ended) {
            Ok(registration) => registration,
            Err(reason) => {
                warn!("Coordinator: join as {:?} rejected: {}", name, reason);
                self.registry
                    .send_to_connection(connection, ServerMessage::error(reason.code(), reason.to_string()));
                return;
            }
        };

        let participant = registration.participant;
        if registration.change == ConnectivityChange::Joined {
            let role = self.session.role_for(name);
            self.session
                .add_participant(Participant::new(participant, name.trim(), role));
            info!("Coordinator: {} joined as {}", name.trim(), role);
        } else {
            self.session
                .set_connection(participant, ConnectionState::Connected);
            if self.session.is_leader(participant) {
                self.session.leader_grace_epoch += 1;
                info!("Coordinator: leader {} is back", name.trim());
            } else {
                info!("Coordinator: {} reconnected", name.trim());
            }
        }

        self.registry.send(participant, self.welcome(participant));
        self.registry
            .send(participant, ServerMessage::SessionSnapshot(self.snapshot(participant)));
        self.broadcast_participants();
        if self.voting_open() {
            self.broadcast_vote_count();
        }
    }

    fn on_closed(&mut self, connection: ConnectionId) {
        let Some(registration) = self.registry.deregister(connection) else {
            debug!("Coordinator: connection {} closed before joining", connection);
            return;
        };
        let participant = registration.participant;
        self.session
            .set_connection(participant, ConnectionState::Disconnected);

        if self.session.is_leader(participant) {
            self.session.leader_grace_epoch += 1;
            let epoch = self.session.leader_grace_epoch;
            let grace = self.session.settings.leader_grace();
            warn!(
                "Coordinator: leader disconnected; session ends in {:?} unless they return",
                grace
            );
            self.schedule(grace, TimerEvent::LeaderGrace { epoch });
        }

        self.broadcast_participants();
        if self.voting_open() {
            self.broadcast_vote_count();
            self.reveal_if_complete();
        }
    }

    // Voting

    fn voting_open(&self) -> bool {
        self.session.phase == Phase::Voting
            && self.round.as_ref().map(VotingRound::is_open).unwrap_or(false)
    }

    fn on_start_voting(&mut self, task_key: &str) -> SessionResult<()> {
        if self.session.phase != Phase::Forming {
            return Err(SessionError::state(format!(
                "cannot start voting while {:?}",
                self.session.phase
            )));
        }
        let index = self
            .session
            .task_index(task_key)
            .ok_or_else(|| SessionError::validation(format!("unknown task {}", task_key)))?;
        if self.session.tasks[index].status != TaskStatus::Pending {
            return Err(SessionError::state(format!("{} is already finalized", task_key)));
        }
        let connected = self.session.connected_voters();
        let required = self.session.settings.min_participants;
        if connected < required {
            return Err(SessionError::Capacity {
                connected,
                required,
            });
        }

        let first_round = !self.session.settings_locked;
        self.session.settings_locked = true;
        self.session.current = Some(index);
        self.open_round(index);

        if first_round {
            self.notify(LifecycleEvent::Started {
                session_id: self.session.id,
                task_count: self.session.tasks.len(),
                participant_count: self.session.participants.len(),
            });
        }
        Ok(())
    }

    fn open_round(&mut self, index: usize) {
        let epoch = self.session.next_epoch();
        let task = &mut self.session.tasks[index];
        task.status = TaskStatus::Voting;
        task.votes.clear();
        let spec = task.spec();

        self.session.phase = Phase::Voting;
        self.round = Some(VotingRound::new(spec.key.clone(), epoch));
        self.last_reveal = None;
        self.advisory_note = None;
        info!("Coordinator: voting on {} (epoch {})", spec.key, epoch);

        self.registry.broadcast(
            &ServerMessage::VotingStarted {
                task_key: spec.key.clone(),
                summary: spec.summary.clone(),
                description: spec.description.clone(),
                epoch,
            },
            &[],
        );
        self.broadcast_vote_count();

        if let Some(timeout) = self.session.settings.vote_timeout() {
            self.schedule(timeout, TimerEvent::VoteTimeout { epoch });
        }
        self.request_advisory(epoch, spec);
    }

    fn request_advisory(&self, epoch: u64, task: TaskSpec) {
        let Some(estimator) = self.collaborators.estimator.clone() else {
            return;
        };
        let scheduler = self.scheduler.clone();
        tokio::spawn(async move {
            let result = estimator.estimate(&task).await;
            if let Some(tx) = scheduler.upgrade() {
                let _ = tx
                    .send(Event::Advisory {
                        epoch,
                        task_key: task.key,
                        result,
                    })
                    .await;
            }
        });
    }

    fn on_advisory(
        &mut self,
        epoch: u64,
        task_key: &str,
        result: Result<Estimate, CollaboratorError>,
    ) {
        let Some(advisor) = self.advisor else {
            return;
        };
        let Some(round) = self
            .round
            .as_mut()
            .filter(|r| r.is_open() && r.epoch() == epoch)
        else {
            debug!("Coordinator: stale advisory estimate for {} (epoch {})", task_key, epoch);
            return;
        };

        match result {
            Ok(estimate) => {
                match round.submit_vote(&self.session.settings, advisor, Vote::Points(estimate.value)) {
                    Ok(_) => {
                        info!("Coordinator: advisory estimate {} for {}", estimate.value, task_key);
                        self.advisory_note =
                            Some(estimate.rationale).filter(|r| !r.trim().is_empty());
                    }
                    Err(err) => {
                        warn!("Coordinator: advisory estimate for {} dropped: {}", task_key, err);
                        round.excuse(advisor);
                    }
                }
            }
            Err(err) => {
                warn!("Coordinator: advisory estimator failed on {}: {}", task_key, err);
                round.excuse(advisor);
            }
        }

        self.broadcast_vote_count();
        self.reveal_if_complete();
    }

    fn on_vote(&mut self, participant: ParticipantId, task_key: &str, value: Vote) -> SessionResult<()> {
        if !self.voting_open() {
            return Err(SessionError::state("no round is open"));
        }
        if self.session.is_leader(participant) {
            return Err(SessionError::state("the leader does not vote"));
        }
        let round = self
            .round
            .as_mut()
            .ok_or_else(|| SessionError::state("no round is open"))?;
        if round.task_key() != task_key {
            return Err(SessionError::state(format!("{} is not under vote", task_key)));
        }
        round.submit_vote(&self.session.settings, participant, value)?;

        self.broadcast_vote_count();
        self.reveal_if_complete();
        Ok(())
    }

    fn votes_in(&self) -> usize {
        self.round.as_ref().map(VotingRound::votes_in).unwrap_or(0)
    }

    /// Voters still awaited plus those who already voted
    fn votes_expected(&self) -> usize {
        let Some(round) = self.round.as_ref() else {
            return 0;
        };
        self.session
            .participants
            .values()
            .filter(|p| round.has_voted(p.id) || (p.expects_vote() && !round.is_excused(p.id)))
            .count()
    }

    fn broadcast_vote_count(&self) {
        self.registry.broadcast(
            &ServerMessage::VoteCountUpdate {
                votes_in: self.votes_in(),
                votes_expected: self.votes_expected(),
            },
            &[],
        );
    }

    /// Reveal once every awaited voter has voted
    fn reveal_if_complete(&mut self) {
        if !self.voting_open() {
            return;
        }
        let Some(round) = self.round.as_ref() else {
            return;
        };
        let mut awaited = self
            .session
            .participants
            .values()
            .filter(|p| p.expects_vote() && !round.is_excused(p.id))
            .peekable();
        if awaited.peek().is_none() {
            return;
        }
        if awaited.all(|p| round.has_voted(p.id)) {
            if let Err(err) = self.reveal(false) {
                warn!("Coordinator: automatic reveal failed: {}", err);
            }
        }
    }

    fn reveal(&mut self, partial: bool) -> SessionResult<()> {
        let round = self
            .round
            .as_mut()
            .ok_or_else(|| SessionError::state("no round is open"))?;
        let reveal = round.reveal(&self.session.settings, partial)?;

        if let Some(task) = self.session.task_mut(&reveal.task_key) {
            task.status = TaskStatus::Revealed;
            task.votes = reveal.votes.clone();
        }
        self.session.phase = Phase::Revealed;
        info!(
            "Coordinator: revealed {} with {} votes (partial: {}, discuss: {})",
            reveal.task_key,
            reveal.votes.len(),
            reveal.partial,
            reveal.discussion
        );

        let view = self.reveal_view(&reveal);
        self.registry
            .broadcast(&ServerMessage::VotingRevealed(view), &[]);
        self.last_reveal = Some(reveal);
        Ok(())
    }

    fn on_reveal(&mut self) -> SessionResult<()> {
        if !self.voting_open() {
            return Err(SessionError::state("no round is open"));
        }
        self.reveal(false)
    }

    fn on_revote(&mut self) -> SessionResult<()> {
        if self.session.phase != Phase::Revealed {
            return Err(SessionError::state("revote is only possible after a reveal"));
        }
        let index = self
            .session
            .current
            .ok_or_else(|| SessionError::state("no task is current"))?;
        info!("Coordinator: revote on {}", self.session.tasks[index].key);
        self.open_round(index);
        Ok(())
    }

    fn on_set_points(&mut self, task_key: &str, choice: PointsChoice) -> SessionResult<()> {
        if self.session.phase != Phase::Revealed {
            return Err(SessionError::state("points can only be set after a reveal"));
        }
        let reveal = self
            .last_reveal
            .as_ref()
            .ok_or_else(|| SessionError::state("nothing has been revealed"))?;
        if reveal.task_key != task_key {
            return Err(SessionError::state(format!("{} is not the revealed task", task_key)));
        }
        let points = reveal.resolve(choice)?;
        let index = self
            .session
            .task_index(task_key)
            .ok_or_else(|| SessionError::validation(format!("unknown task {}", task_key)))?;

        let task = &mut self.session.tasks[index];
        task.points = Some(points);
        task.status = TaskStatus::Finalized;
        self.round = None;
        self.last_reveal = None;
        self.advisory_note = None;
        self.session.phase = Phase::Forming;
        self.session.current = self.session.next_pending_after(index);

        let next_task_key = self.session.current_task().map(|t| t.key.clone());
        info!(
            "Coordinator: {} finalized at {} points, next {:?}",
            task_key, points, next_task_key
        );
        self.registry.broadcast(
            &ServerMessage::TaskFinalized {
                task_key: task_key.to_string(),
                points,
                next_task_key,
            },
            &[],
        );
        Ok(())
    }

    fn on_update_settings(&mut self, settings: Settings) -> SessionResult<()> {
        if self.session.phase != Phase::Forming || self.session.settings_locked {
            return Err(SessionError::state("settings are locked once voting has started"));
        }
        settings
            .validate()
            .map_err(|e| SessionError::validation(e.to_string()))?;

        info!("Coordinator: settings updated");
        self.session.settings = settings.clone();
        self.registry
            .broadcast(&ServerMessage::SettingsUpdated { settings }, &[]);
        self.broadcast_participants();
        Ok(())
    }

    // Distribution

    fn on_start_distribution(&mut self) -> SessionResult<()> {
        if self.session.phase != Phase::Forming {
            return Err(SessionError::state(format!(
                "cannot start distribution while {:?}",
                self.session.phase
            )));
        }
        if !self.session.all_finalized() {
            return Err(SessionError::state(
                "every task must be finalized before distribution",
            ));
        }

        let keys = self.session.tasks.iter().map(|t| t.key.clone()).collect();
        self.distribution = Some(DistributionRound::new(keys));
        self.session.phase = Phase::Distributing;
        self.session.current = None;
        info!("Coordinator: distributing {} tasks", self.session.tasks.len());

        self.registry.broadcast(
            &ServerMessage::DistributionStarted {
                tasks: self.session.task_views(),
            },
            &[],
        );
        Ok(())
    }

    fn distribution_mut(&mut self) -> SessionResult<&mut DistributionRound> {
        if self.session.phase != Phase::Distributing {
            return Err(SessionError::state("no tasks are being distributed"));
        }
        self.distribution
            .as_mut()
            .ok_or_else(|| SessionError::state("no tasks are being distributed"))
    }

    fn on_offer(&mut self, task_key: &str) -> SessionResult<()> {
        let epoch = self.distribution_mut()?.offer(task_key)?;
        let (summary, points) = self
            .session
            .task(task_key)
            .map(|t| (t.summary.clone(), t.points))
            .unwrap_or_default();

        self.registry.broadcast(
            &ServerMessage::TaskOffer {
                task_key: task_key.to_string(),
                summary,
                points,
            },
            &[],
        );
        if let Some(window) = self.session.settings.claim_window() {
            self.schedule(
                window,
                TimerEvent::ClaimWindow {
                    task_key: task_key.to_string(),
                    epoch,
                },
            );
        }
        Ok(())
    }

    fn on_claim(
        &mut self,
        participant: ParticipantId,
        task_key: &str,
        received_at: DateTime<Utc>,
    ) -> SessionResult<()> {
        let fresh = self
            .distribution_mut()?
            .claim(participant, task_key, received_at)?;
        if !fresh {
            return Ok(());
        }

        self.registry.broadcast(
            &ServerMessage::TaskClaimed {
                task_key: task_key.to_string(),
                claimant_name: self.session.name_of(participant),
            },
            &[],
        );
        self.send_candidates(task_key);
        Ok(())
    }

    /// Tell the leader who is in the running for `task_key`
    fn send_candidates(&self, task_key: &str) {
        let Some(leader) = self.session.leader else {
            return;
        };
        let Some(offer) = self.distribution.as_ref().and_then(|d| d.offer_for(task_key)) else {
            return;
        };
        let claimants: Vec<CandidateView> = offer
            .candidates()
            .into_iter()
            .map(|c| CandidateView {
                participant_id: c.claimant,
                name: self.session.name_of(c.claimant),
                claimed_at: c.received_at,
            })
            .collect();
        let default_candidate = claimants.first().map(|c| c.name.clone());

        self.registry.send(
            leader,
            ServerMessage::ClaimCandidates {
                task_key: task_key.to_string(),
                claimants,
                default_candidate,
                window_closed: offer.window_elapsed,
            },
        );
    }

    /// Resolve a participant named in a leader decision
    fn named_participant(&self, name: &str) -> SessionResult<ParticipantId> {
        self.registry
            .lookup(name)
            .filter(|id| self.session.role_of(*id).map_or(false, |r| r != Role::AdvisoryVoter))
            .ok_or_else(|| SessionError::validation(format!("unknown participant {:?}", name)))
    }

    fn on_decision(&mut self, task_key: &str, request: DecisionRequest) -> SessionResult<()> {
        let decision = match request {
            DecisionRequest::Confirm { claimant } => {
                Decision::Confirm(self.named_participant(&claimant)?)
            }
            DecisionRequest::Reassign { assignee } => {
                Decision::Reassign(self.named_participant(&assignee)?)
            }
            DecisionRequest::Skip => Decision::Skip,
        };

        let distribution = self.distribution_mut()?;
        let assignment = distribution.decide(task_key, decision)?;
        let complete = distribution.is_complete();

        let message = match assignment.assignee {
            Some(assignee) => ServerMessage::TaskAssigned {
                task_key: task_key.to_string(),
                assignee_name: self.session.name_of(assignee),
            },
            None => ServerMessage::TaskSkipped {
                task_key: task_key.to_string(),
            },
        };
        if let Some(task) = self.session.task_mut(task_key) {
            task.assignment = Some(assignment);
        }
        self.registry.broadcast(&message, &[]);

        if complete {
            self.complete_distribution();
        }
        Ok(())
    }

    fn complete_distribution(&mut self) {
        let Some(distribution) = self.distribution.as_ref() else {
            return;
        };
        let summary = distribution.summary();
        let assignments: Vec<AssignmentView> = summary
            .assigned
            .iter()
            .map(|(task_key, assignee)| AssignmentView {
                task_key: task_key.clone(),
                assignee_name: self.session.name_of(*assignee),
            })
            .collect();
        info!(
            "Coordinator: distribution complete, {} assigned, {} skipped",
            assignments.len(),
            summary.skipped.len()
        );

        self.registry.broadcast(
            &ServerMessage::DistributionComplete {
                assigned_count: assignments.len(),
                skipped_count: summary.skipped.len(),
                assignments,
                skipped: summary.skipped.clone(),
            },
            &[],
        );
        self.notify(LifecycleEvent::Distributed {
            session_id: self.session.id,
            assigned: summary.assigned.len(),
            skipped: summary.skipped.len(),
        });
    }

    // Timers

    fn schedule(&self, after: Duration, timer: TimerEvent) {
        let scheduler = self.scheduler.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(tx) = scheduler.upgrade() {
                let _ = tx.send(Event::Timer(timer)).await;
            }
        });
    }

    fn on_timer(&mut self, timer: TimerEvent) {
        match timer {
            TimerEvent::VoteTimeout { epoch } => {
                let live = self.voting_open()
                    && self.round.as_ref().map(VotingRound::epoch) == Some(epoch);
                if !live {
                    debug!("Coordinator: stale vote timer (epoch {})", epoch);
                    return;
                }
                info!("Coordinator: vote timeout, revealing what is in");
                if let Err(err) = self.reveal(true) {
                    warn!("Coordinator: timed reveal failed: {}", err);
                }
            }
            TimerEvent::ClaimWindow { task_key, epoch } => {
                let closed = self
                    .distribution
                    .as_mut()
                    .map(|d| d.close_window(&task_key, epoch))
                    .unwrap_or(false);
                if closed {
                    self.send_candidates(&task_key);
                }
            }
            TimerEvent::LeaderGrace { epoch } => {
                if epoch != self.session.leader_grace_epoch || self.session.leader_connected() {
                    debug!("Coordinator: stale leader grace timer (epoch {})", epoch);
                    return;
                }
                warn!("Coordinator: leader did not return, ending session");
                self.end(EndReason::LeaderLost);
            }
        }
    }

    // Lifecycle

    fn end(&mut self, reason: EndReason) {
        if self.ended.is_some() {
            return;
        }
        self.session.phase = Phase::Ended;
        if self.round.take().is_some() {
            self.abandon_current_task();
        }
        let summary = self.summary(reason);
        info!(
            "Coordinator: session {} ended ({:?}), {}/{} tasks finalized",
            self.session.id, reason, summary.totals.finalized_count, summary.totals.task_count
        );
        self.registry.broadcast_all(&ServerMessage::SessionEnded {
            summary: summary.clone(),
        });
        self.ended = Some(summary);
    }

    /// Put back a task whose round was cut short by the end of the session
    fn abandon_current_task(&mut self) {
        let Some(index) = self.session.current else {
            return;
        };
        let task = &mut self.session.tasks[index];
        if matches!(task.status, TaskStatus::Voting | TaskStatus::Revealed) {
            info!("Coordinator: round on {} abandoned", task.key);
            task.status = TaskStatus::Pending;
            task.votes.clear();
        }
    }

    fn summary(&self, reason: EndReason) -> SessionSummary {
        let tasks = &self.session.tasks;
        let totals = Totals {
            task_count: tasks.len(),
            finalized_count: tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Finalized)
                .count(),
            total_points: tasks.iter().filter_map(|t| t.points).sum(),
            assigned_count: tasks
                .iter()
                .filter(|t| t.assignment.as_ref().and_then(|a| a.assignee).is_some())
                .count(),
            skipped_count: tasks
                .iter()
                .filter(|t| {
                    t.assignment
                        .as_ref()
                        .map_or(false, |a| a.state == AssignmentState::Skipped)
                })
                .count(),
        };
        SessionSummary {
            session_id: self.session.id,
            tasks: self.session.task_views(),
            totals,
            participants: self
                .session
                .participants
                .values()
                .map(|p| p.name.clone())
                .collect(),
            duration_secs: (Utc::now() - self.session.started_at).num_seconds(),
            reason,
        }
    }

    fn results(&self) -> SessionResults {
        let mut results = SessionResults {
            session_id: self.session.id,
            points: Default::default(),
            assignees: Default::default(),
        };
        for task in &self.session.tasks {
            if let Some(points) = task.points {
                results.points.insert(task.key.clone(), points);
            }
            if let Some(assignee) = task.assignment.as_ref().and_then(|a| a.assignee) {
                results
                    .assignees
                    .insert(task.key.clone(), self.session.name_of(assignee));
            }
        }
        results
    }

    fn notify(&mut self, event: LifecycleEvent) {
        let Some(notifier) = self.collaborators.notifier.clone() else {
            return;
        };
        self.notifications.spawn(async move {
            if let Err(e) = notifier.notify(&event).await {
                warn!("Coordinator: notifier failed on {}: {}", event.name(), e);
            }
        });
    }

    // Views

    fn welcome(&self, participant: ParticipantId) -> ServerMessage {
        ServerMessage::Welcome {
            session_id: self.session.id,
            participant_id: participant,
            leader_name: self.session.leader_name.clone(),
            participants: self.session.participant_views(),
            settings: self.session.settings.clone(),
        }
    }

    fn broadcast_participants(&self) {
        self.registry.broadcast(
            &ServerMessage::ParticipantsUpdate {
                participants: self.session.participant_views(),
                connected_voters: self.session.connected_voters(),
                ready_to_start: self.session.ready_to_start(),
            },
            &[],
        );
    }

    fn reveal_view(&self, reveal: &Reveal) -> RevealView {
        let per_participant_votes = reveal
            .votes
            .iter()
            .map(|(id, vote)| {
                let advisory = self.advisor == Some(*id);
                VoteView {
                    participant_id: *id,
                    name: self.session.name_of(*id),
                    value: *vote,
                    advisory,
                    rationale: if advisory {
                        self.advisory_note.clone()
                    } else {
                        None
                    },
                }
            })
            .collect();
        let stats = reveal.statistics;
        RevealView {
            task_key: reveal.task_key.clone(),
            per_participant_votes,
            average: stats.map(|s| s.average),
            median: stats.map(|s| s.median),
            min: stats.map(|s| s.min),
            max: stats.map(|s| s.max),
            divergence: stats.map(|s| s.divergence).unwrap_or(0.0),
            discussion_flag: reveal.discussion,
            partial: reveal.partial,
            suggested_points: reveal.suggested_points(),
        }
    }

    fn snapshot(&self, participant: ParticipantId) -> SnapshotView {
        let open_round = self.round.as_ref().filter(|r| r.is_open());
        let open_offers = self
            .distribution
            .as_ref()
            .map(|d| {
                d.open_offers()
                    .map(|offer| {
                        let (summary, points) = self
                            .session
                            .task(&offer.task_key)
                            .map(|t| (t.summary.clone(), t.points))
                            .unwrap_or_default();
                        OfferView {
                            task_key: offer.task_key.clone(),
                            summary,
                            points,
                            claimants: offer
                                .candidates()
                                .into_iter()
                                .map(|c| self.session.name_of(c.claimant))
                                .collect(),
                            window_closed: offer.window_elapsed,
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        SnapshotView {
            phase: self.session.phase,
            tasks: self.session.task_views(),
            current_task: self.session.current_task().map(|t| t.key.clone()),
            votes_in: open_round.map(VotingRound::votes_in).unwrap_or(0),
            votes_expected: if open_round.is_some() {
                self.votes_expected()
            } else {
                0
            },
            your_vote: open_round.and_then(|r| r.vote_of(participant)),
            last_reveal: self.last_reveal.as_ref().map(|r| self.reveal_view(r)),
            open_offers,
        }
    }
}
