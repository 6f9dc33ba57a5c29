//! Tube negotiation for shared activity sessions.
//!
//! Once an instance is part of a collaborative session, one participant
//! offers a tube tagged with the activity's service identifier and every
//! other participant discovers and accepts it. [`SessionTubeManager`] runs
//! both sides of that exchange over a [`PresenceService`] and hands the
//! resulting [`TubeConnection`] to a [`CollaborationSink`], normally the
//! instance's readiness controller.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use instance_readiness::CollaborationSink;

mod config;
mod local;
mod manager;
mod presence;

pub use config::{TubeConfig, DEFAULT_SERVICE, SERVICE_ENV};
pub use local::{LocalPresence, LOCAL_INITIATOR_HANDLE};
pub use manager::{NegotiationPhase, SessionTubeManager};
pub use presence::PresenceService;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection to the presence service that carries the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionHandle(pub String);

/// Channel on which tubes for the session are offered and accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TubesChannelHandle(pub String);

/// Text channel whose group membership mirrors the session's participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChannelHandle(pub String);

/// Handles resolved from a session descriptor during setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandles {
    pub connection: ConnectionHandle,
    pub tubes: TubesChannelHandle,
    pub text: TextChannelHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TubeKind {
    #[serde(rename = "dbus")]
    DBus,
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TubeState {
    /// Offered by a peer and waiting for this side to accept it.
    LocalPending,
    /// Offered by this side and waiting for a peer.
    RemotePending,
    Open,
}

/// A tube some participant has offered on the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAdvertisement {
    pub id: ChannelId,
    /// Presence handle of the participant that offered the tube.
    pub initiator: u32,
    pub kind: TubeKind,
    pub service: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
    pub state: TubeState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Initiator,
    Joiner,
}

impl Role {
    pub fn is_initiator(self) -> bool {
        matches!(self, Role::Initiator)
    }
}

/// A negotiated tube, ready for collaborative traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TubeConnection {
    pub connection: ConnectionHandle,
    pub tubes: TubesChannelHandle,
    pub group: TextChannelHandle,
    pub channel: ChannelId,
}

impl TubeConnection {
    pub fn new(handles: &SessionHandles, channel: ChannelId) -> Self {
        Self {
            connection: handles.connection.clone(),
            tubes: handles.tubes.clone(),
            group: handles.text.clone(),
            channel,
        }
    }
}

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),
    #[error("presence transport error: {0}")]
    Transport(String),
}

pub type PresenceResult<T> = Result<T, PresenceError>;

#[derive(Debug, Error)]
pub enum TubeError {
    #[error("session {0} is not active")]
    SessionInactive(SessionId),
    #[error("session {0} has no usable descriptor")]
    MissingDescriptor(SessionId),
    #[error("session {0} is already negotiating")]
    AlreadyNegotiating(SessionId),
    #[error(transparent)]
    Presence(#[from] PresenceError),
}
