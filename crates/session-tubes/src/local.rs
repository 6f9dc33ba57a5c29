use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

use crate::presence::PresenceService;
use crate::{
    ChannelAdvertisement, ChannelId, ConnectionHandle, PresenceError, PresenceResult,
    SessionHandles, SessionId, TextChannelHandle, TubeKind, TubeState, TubesChannelHandle,
};

/// Presence handle recorded as the initiator of tubes offered through
/// [`LocalPresence::advertise_channel`].
pub const LOCAL_INITIATOR_HANDLE: u32 = 1;

#[derive(Debug)]
struct LocalSession {
    handles: Option<SessionHandles>,
    advertisements: Vec<ChannelAdvertisement>,
    accepted: HashSet<ChannelId>,
    sender: broadcast::Sender<ChannelAdvertisement>,
}

impl LocalSession {
    fn new(handles: Option<SessionHandles>, capacity: usize) -> Self {
        Self {
            handles,
            advertisements: Vec::new(),
            accepted: HashSet::new(),
            sender: broadcast::channel(capacity).0,
        }
    }
}

const DEFAULT_SUBSCRIPTION_CAPACITY: usize = 64;

/// Simple in-memory presence service for tests and local runs.
///
/// Every participant sharing one `LocalPresence` sees the same sessions.
/// Tubes offered through it are reported to everyone as locally pending.
#[derive(Debug)]
pub struct LocalPresence {
    sessions: RwLock<HashMap<SessionId, LocalSession>>,
    next_channel: AtomicU32,
    fail_next_list: Mutex<Option<String>>,
    capacity: usize,
}

impl Default for LocalPresence {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIPTION_CAPACITY)
    }
}

impl LocalPresence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribers that fall more than `capacity` advertisements behind lag.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_channel: AtomicU32::new(1),
            fail_next_list: Mutex::new(None),
            capacity: capacity.max(1),
        }
    }

    /// Opens a session with handles derived from its id.
    pub fn open_session(&self, session: &SessionId) -> SessionHandles {
        let base = format!("/org/sharedactivity/session/{session}");
        let handles = SessionHandles {
            connection: ConnectionHandle(format!("{base}/connection")),
            tubes: TubesChannelHandle(format!("{base}/tubes")),
            text: TextChannelHandle(format!("{base}/text")),
        };
        self.sessions
            .write()
            .insert(session.clone(), LocalSession::new(Some(handles.clone()), self.capacity));
        handles
    }

    /// Opens a session whose descriptor cannot be resolved to handles.
    pub fn open_session_without_descriptor(&self, session: &SessionId) {
        self.sessions
            .write()
            .insert(session.clone(), LocalSession::new(None, self.capacity));
    }

    pub fn close_session(&self, session: &SessionId) -> bool {
        self.sessions.write().remove(session).is_some()
    }

    /// Records an advertisement made by some peer and notifies subscribers.
    pub fn publish(
        &self,
        session: &SessionId,
        advertisement: ChannelAdvertisement,
    ) -> PresenceResult<()> {
        let sender = {
            let mut guard = self.sessions.write();
            let entry = guard
                .get_mut(session)
                .ok_or_else(|| PresenceError::UnknownSession(session.clone()))?;
            entry.advertisements.push(advertisement.clone());
            entry.sender.clone()
        };
        debug!(target: "session_tubes::presence", %session, channel = %advertisement.id, "advertisement published");
        // No subscribers yet is fine; late joiners list advertisements instead.
        let _ = sender.send(advertisement);
        Ok(())
    }

    /// Makes the next [`PresenceService::list_advertisements`] call fail.
    pub fn fail_next_list(&self, reason: impl Into<String>) {
        *self.fail_next_list.lock() = Some(reason.into());
    }

    pub fn accepted(&self, session: &SessionId) -> Vec<ChannelId> {
        let mut accepted: Vec<ChannelId> = self
            .sessions
            .read()
            .get(session)
            .map(|entry| entry.accepted.iter().copied().collect())
            .unwrap_or_default();
        accepted.sort();
        accepted
    }

    /// Allocates an id for a tube offered out of band, e.g. by a remote peer.
    pub fn allocate_channel(&self) -> ChannelId {
        ChannelId(self.next_channel.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait]
impl PresenceService for LocalPresence {
    fn is_session_active(&self, session: &SessionId) -> bool {
        self.sessions.read().contains_key(session)
    }

    fn session_handles(&self, session: &SessionId) -> Option<SessionHandles> {
        self.sessions
            .read()
            .get(session)
            .and_then(|entry| entry.handles.clone())
    }

    fn subscribe_advertisements(
        &self,
        session: &SessionId,
    ) -> PresenceResult<broadcast::Receiver<ChannelAdvertisement>> {
        self.sessions
            .read()
            .get(session)
            .map(|entry| entry.sender.subscribe())
            .ok_or_else(|| PresenceError::UnknownSession(session.clone()))
    }

    async fn list_advertisements(
        &self,
        session: &SessionId,
    ) -> PresenceResult<Vec<ChannelAdvertisement>> {
        if let Some(reason) = self.fail_next_list.lock().take() {
            return Err(PresenceError::Transport(reason));
        }
        self.sessions
            .read()
            .get(session)
            .map(|entry| entry.advertisements.clone())
            .ok_or_else(|| PresenceError::UnknownSession(session.clone()))
    }

    async fn advertise_channel(
        &self,
        session: &SessionId,
        service: &str,
        params: &HashMap<String, String>,
    ) -> PresenceResult<ChannelId> {
        if !self.is_session_active(session) {
            return Err(PresenceError::UnknownSession(session.clone()));
        }
        let id = self.allocate_channel();
        self.publish(
            session,
            ChannelAdvertisement {
                id,
                initiator: LOCAL_INITIATOR_HANDLE,
                kind: TubeKind::DBus,
                service: service.to_string(),
                params: params.clone(),
                state: TubeState::LocalPending,
            },
        )?;
        Ok(id)
    }

    async fn accept_pending_channel(
        &self,
        session: &SessionId,
        channel: ChannelId,
    ) -> PresenceResult<()> {
        let mut guard = self.sessions.write();
        let entry = guard
            .get_mut(session)
            .ok_or_else(|| PresenceError::UnknownSession(session.clone()))?;
        if !entry.advertisements.iter().any(|adv| adv.id == channel) {
            return Err(PresenceError::UnknownChannel(channel));
        }
        entry.accepted.insert(channel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionId {
        SessionId::new("activity-1")
    }

    #[tokio::test]
    async fn advertisements_reach_subscribers_and_listing() {
        let presence = LocalPresence::new();
        presence.open_session(&session());
        let mut sub = presence.subscribe_advertisements(&session()).expect("subscribe ok");

        let id = presence
            .advertise_channel(&session(), "org.example.Draw", &HashMap::new())
            .await
            .expect("advertise ok");

        let adv = sub.recv().await.expect("receive ok");
        assert_eq!(adv.id, id);
        assert_eq!(adv.service, "org.example.Draw");
        assert_eq!(adv.state, TubeState::LocalPending);

        let listed = presence.list_advertisements(&session()).await.expect("list ok");
        assert_eq!(listed, vec![adv]);
    }

    #[tokio::test]
    async fn fail_next_list_fails_once() {
        let presence = LocalPresence::new();
        presence.open_session(&session());
        presence.fail_next_list("bus went away");

        let err = presence.list_advertisements(&session()).await.unwrap_err();
        assert!(matches!(err, PresenceError::Transport(reason) if reason == "bus went away"));
        assert!(presence.list_advertisements(&session()).await.is_ok());
    }

    #[tokio::test]
    async fn accept_requires_a_known_channel() {
        let presence = LocalPresence::new();
        presence.open_session(&session());
        let id = presence
            .advertise_channel(&session(), "org.example.Draw", &HashMap::new())
            .await
            .expect("advertise ok");

        presence
            .accept_pending_channel(&session(), id)
            .await
            .expect("accept ok");
        assert_eq!(presence.accepted(&session()), vec![id]);

        let err = presence
            .accept_pending_channel(&session(), ChannelId(999))
            .await
            .unwrap_err();
        assert!(matches!(err, PresenceError::UnknownChannel(ChannelId(999))));
    }

    #[test]
    fn sessions_without_descriptor_have_no_handles() {
        let presence = LocalPresence::new();
        presence.open_session_without_descriptor(&session());
        assert!(presence.is_session_active(&session()));
        assert!(presence.session_handles(&session()).is_none());
        assert!(presence.close_session(&session()));
        assert!(!presence.is_session_active(&session()));
    }
}
