//! Connection registry
//!
//! Owns the live transport connections of a session and maps each to a
//! participant identity. Knows nothing about voting; the coordinator turns
//! the connectivity changes reported here into session state.

use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::RejectedReason;
use crate::protocol::ServerMessage;
use crate::types::{ConnectionId, ParticipantId};

/// Outbound half of a connection; the transport task drains it
pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

/// Connectivity change caused by a registry operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityChange {
    /// First time this name joined
    Joined,
    /// A previously disconnected participant came back
    Reconnected,
    /// The participant's transport went away
    Disconnected,
}

/// Participant affected by a join or a transport loss
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub participant: ParticipantId,
    pub change: ConnectivityChange,
}

struct Connection {
    outbound: Outbound,
    participant: Option<ParticipantId>,
}

/// Live connections and name → participant bindings
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Connection>,
    names: HashMap<String, ParticipantId>,
    bound: HashMap<ParticipantId, ConnectionId>,
    /// Transport-less participants that always count as connected
    reserved: HashSet<ParticipantId>,
    next_participant: ParticipantId,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
            names: HashMap::new(),
            bound: HashMap::new(),
            reserved: HashSet::new(),
            next_participant: 1,
        }
    }

    fn allocate(&mut self, name: &str) -> ParticipantId {
        let id = self.next_participant;
        self.next_participant += 1;
        self.names.insert(name.to_string(), id);
        id
    }

    /// Track a freshly opened transport that has not joined yet
    pub fn open(&mut self, connection: ConnectionId, outbound: Outbound) {
        debug!("Registry: connection {} opened", connection);
        self.connections.insert(
            connection,
            Connection {
                outbound,
                participant: None,
            },
        );
    }

    /// Bind `connection` to the participant named `proposed_name`
    pub fn register(
        &mut self,
        connection: ConnectionId,
        proposed_name: &str,
        session_ended: bool,
    ) -> Result<Registration, RejectedReason> {
        if session_ended {
            return Err(RejectedReason::SessionEnded);
        }
        let name = proposed_name.trim();
        if name.is_empty() {
            return Err(RejectedReason::InvalidName);
        }
        match self.connections.get(&connection) {
            None => return Err(RejectedReason::UnknownConnection),
            Some(conn) if conn.participant.is_some() => {
                return Err(RejectedReason::AlreadyJoined)
            }
            Some(_) => {}
        }

        let registration = match self.names.get(name).copied() {
            Some(id) if self.reserved.contains(&id) || self.bound.contains_key(&id) => {
                return Err(RejectedReason::NameTaken);
            }
            Some(id) => Registration {
                participant: id,
                change: ConnectivityChange::Reconnected,
            },
            None => Registration {
                participant: self.allocate(name),
                change: ConnectivityChange::Joined,
            },
        };

        self.bound.insert(registration.participant, connection);
        if let Some(conn) = self.connections.get_mut(&connection) {
            conn.participant = Some(registration.participant);
        }
        info!(
            "Registry: {} bound to participant {} ({:?})",
            name, registration.participant, registration.change
        );
        Ok(registration)
    }

    /// Register a participant without a transport (the advisory voter)
    pub fn reserve(&mut self, name: &str) -> Result<ParticipantId, RejectedReason> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RejectedReason::InvalidName);
        }
        if self.names.contains_key(name) {
            return Err(RejectedReason::NameTaken);
        }
        let id = self.allocate(name);
        self.reserved.insert(id);
        Ok(id)
    }

    /// Forget a closed transport; `None` if it never joined
    pub fn deregister(&mut self, connection: ConnectionId) -> Option<Registration> {
        let conn = self.connections.remove(&connection)?;
        let participant = conn.participant?;
        if self.bound.get(&participant) == Some(&connection) {
            self.bound.remove(&participant);
        }
        info!("Registry: participant {} disconnected", participant);
        Some(Registration {
            participant,
            change: ConnectivityChange::Disconnected,
        })
    }

    pub fn participant_of(&self, connection: ConnectionId) -> Option<ParticipantId> {
        self.connections.get(&connection)?.participant
    }

    pub fn lookup(&self, name: &str) -> Option<ParticipantId> {
        self.names.get(name.trim()).copied()
    }

    pub fn is_connected(&self, participant: ParticipantId) -> bool {
        self.reserved.contains(&participant) || self.bound.contains_key(&participant)
    }

    fn deliver(conn: &Connection, connection: ConnectionId, message: ServerMessage) -> bool {
        if conn.outbound.send(message).is_err() {
            debug!("Registry: outbound for connection {} is closed", connection);
            return false;
        }
        true
    }

    /// Send to one participant's current transport
    pub fn send(&self, participant: ParticipantId, message: ServerMessage) -> bool {
        let Some(connection) = self.bound.get(&participant) else {
            return false;
        };
        self.send_to_connection(*connection, message)
    }

    /// Send to a transport, joined or not
    pub fn send_to_connection(&self, connection: ConnectionId, message: ServerMessage) -> bool {
        match self.connections.get(&connection) {
            Some(conn) => Self::deliver(conn, connection, message),
            None => false,
        }
    }

    /// Send to every joined transport except `excluding`; returns deliveries
    pub fn broadcast(&self, message: &ServerMessage, excluding: &[ParticipantId]) -> usize {
        self.connections
            .iter()
            .filter(|(_, conn)| matches!(conn.participant, Some(p) if !excluding.contains(&p)))
            .filter(|(id, conn)| Self::deliver(conn, **id, message.clone()))
            .count()
    }

    /// Send to every open transport, including ones that never joined
    pub fn broadcast_all(&self, message: &ServerMessage) -> usize {
        self.connections
            .iter()
            .filter(|(id, conn)| Self::deliver(conn, **id, message.clone()))
            .count()
    }
}
