use std::collections::HashMap;
use std::sync::{Arc, Weak};

use instance_readiness::CollaborationSink;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::TubeConfig;
use crate::presence::PresenceService;
use crate::{
    ChannelAdvertisement, ChannelId, Role, SessionHandles, SessionId, TubeConnection, TubeError,
    TubeKind, TubeState,
};

/// Where a session's negotiation stands. A session with no record is idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    Setup,
    Offering,
    Discovering,
    Matched,
    Delivered,
}

struct NegotiationRecord {
    role: Role,
    service: String,
    handles: SessionHandles,
    phase: NegotiationPhase,
    discovered: Vec<ChannelAdvertisement>,
    matched: Option<ChannelId>,
    pump: Option<JoinHandle<()>>,
}

impl Drop for NegotiationRecord {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

struct ManagerInner {
    presence: Arc<dyn PresenceService>,
    sink: Arc<dyn CollaborationSink<TubeConnection>>,
    config: TubeConfig,
    sessions: RwLock<HashMap<SessionId, NegotiationRecord>>,
}

/// Negotiates one tube per session and delivers it to a [`CollaborationSink`].
///
/// The initiator offers a tube and is matched as soon as the offer is
/// acknowledged. A joiner subscribes to advertisements, replays the ones made
/// before it joined, and matches the first tube carrying the configured
/// service identifier.
#[derive(Clone)]
pub struct SessionTubeManager {
    inner: Arc<ManagerInner>,
}

impl SessionTubeManager {
    pub fn new(
        presence: Arc<dyn PresenceService>,
        sink: Arc<dyn CollaborationSink<TubeConnection>>,
        config: TubeConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                presence,
                sink,
                config,
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &TubeConfig {
        &self.inner.config
    }

    pub fn phase(&self, session: &SessionId) -> Option<NegotiationPhase> {
        self.inner
            .sessions
            .read()
            .get(session)
            .map(|record| record.phase)
    }

    pub fn role(&self, session: &SessionId) -> Option<Role> {
        self.inner
            .sessions
            .read()
            .get(session)
            .map(|record| record.role)
    }

    pub fn matched_channel(&self, session: &SessionId) -> Option<ChannelId> {
        self.inner
            .sessions
            .read()
            .get(session)
            .and_then(|record| record.matched)
    }

    /// Advertisements seen for the session that did not match.
    pub fn discovered(&self, session: &SessionId) -> Vec<ChannelAdvertisement> {
        self.inner
            .sessions
            .read()
            .get(session)
            .map(|record| record.discovered.clone())
            .unwrap_or_default()
    }

    /// This side created the session: offer a tube for it.
    pub async fn share(&self, session: &SessionId) -> Result<(), TubeError> {
        info!(target: "session_tubes::manager", %session, "session shared; offering tube");
        let handles = self.inner.setup(session, Role::Initiator)?;
        self.inner.set_phase(session, NegotiationPhase::Offering);

        let config = &self.inner.config;
        let channel = match self
            .inner
            .presence
            .advertise_channel(session, &config.service, &config.offer_params)
            .await
        {
            Ok(channel) => channel,
            Err(err) => {
                error!(target: "session_tubes::manager", %session, error = %err, "offering tube failed");
                return Err(err.into());
            }
        };

        let matched = {
            let mut sessions = self.inner.sessions.write();
            match sessions.get_mut(session) {
                Some(record) if record.phase == NegotiationPhase::Offering => {
                    record.phase = NegotiationPhase::Matched;
                    record.matched = Some(channel);
                    true
                }
                _ => false,
            }
        };
        if !matched {
            debug!(target: "session_tubes::manager", %session, %channel, "session ended before offer was acknowledged");
            return Ok(());
        }

        self.inner
            .deliver(session, TubeConnection::new(&handles, channel), Role::Initiator);
        Ok(())
    }

    /// This side joined an existing session: find the tube its initiator
    /// offered. Safe to call right after wiring when the session was already
    /// joined.
    pub async fn join(&self, session: &SessionId) -> Result<(), TubeError> {
        if !self.inner.presence.is_session_active(session) {
            debug!(target: "session_tubes::manager", %session, "join for inactive session ignored");
            return Err(TubeError::SessionInactive(session.clone()));
        }
        info!(target: "session_tubes::manager", %session, "joined shared session; waiting for tube");
        self.inner.setup(session, Role::Joiner)?;

        let rx = match self.inner.presence.subscribe_advertisements(session) {
            Ok(rx) => rx,
            Err(err) => {
                error!(target: "session_tubes::manager", %session, error = %err, "advertisement subscription failed");
                self.inner.sessions.write().remove(session);
                return Err(err.into());
            }
        };
        {
            let mut sessions = self.inner.sessions.write();
            if let Some(record) = sessions.get_mut(session) {
                record.phase = NegotiationPhase::Discovering;
                record.pump = Some(spawn_advertisement_pump(
                    Arc::downgrade(&self.inner),
                    session.clone(),
                    rx,
                ));
            }
        }

        self.inner.replay_listed(session).await;
        Ok(())
    }

    /// Consider one advertisement for the session. Returns whether it
    /// produced a delivered connection.
    pub async fn handle_advertisement(
        &self,
        session: &SessionId,
        advertisement: ChannelAdvertisement,
    ) -> Result<bool, TubeError> {
        self.inner.handle_advertisement(session, advertisement).await
    }

    /// Abandon the session's negotiation. Later advertisements for it are
    /// ignored.
    pub fn end_session(&self, session: &SessionId) -> bool {
        let removed = self.inner.sessions.write().remove(session);
        if let Some(record) = &removed {
            debug!(target: "session_tubes::manager", %session, phase = ?record.phase, "negotiation record discarded");
        }
        removed.is_some()
    }
}

impl ManagerInner {
    fn setup(&self, session: &SessionId, role: Role) -> Result<SessionHandles, TubeError> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(session) {
            warn!(target: "session_tubes::manager", %session, ?role, "session already negotiating");
            return Err(TubeError::AlreadyNegotiating(session.clone()));
        }
        let Some(handles) = self.presence.session_handles(session) else {
            error!(target: "session_tubes::manager", %session, ?role, "failed to share or join session: no descriptor");
            return Err(TubeError::MissingDescriptor(session.clone()));
        };
        debug!(
            target: "session_tubes::manager",
            %session,
            ?role,
            connection = %handles.connection.0,
            tubes = %handles.tubes.0,
            "session handles resolved"
        );
        sessions.insert(
            session.clone(),
            NegotiationRecord {
                role,
                service: self.config.service.clone(),
                handles: handles.clone(),
                phase: NegotiationPhase::Setup,
                discovered: Vec::new(),
                matched: None,
                pump: None,
            },
        );
        Ok(handles)
    }

    fn set_phase(&self, session: &SessionId, phase: NegotiationPhase) {
        if let Some(record) = self.sessions.write().get_mut(session) {
            record.phase = phase;
        }
    }

    async fn handle_advertisement(
        &self,
        session: &SessionId,
        advertisement: ChannelAdvertisement,
    ) -> Result<bool, TubeError> {
        debug!(
            target: "session_tubes::manager",
            %session,
            channel = %advertisement.id,
            initiator = advertisement.initiator,
            kind = ?advertisement.kind,
            service = %advertisement.service,
            params = ?advertisement.params,
            state = ?advertisement.state,
            "advertisement observed"
        );
        let channel = advertisement.id;

        let (handles, role) = {
            let mut sessions = self.sessions.write();
            let Some(record) = sessions.get_mut(session) else {
                debug!(target: "session_tubes::manager", %session, %channel, "no negotiation for session; advertisement ignored");
                return Ok(false);
            };
            if advertisement.kind != TubeKind::DBus || advertisement.service != record.service {
                debug!(target: "session_tubes::manager", %session, %channel, "service identifier does not match; advertisement ignored");
                if !record.discovered.iter().any(|seen| seen.id == channel) {
                    record.discovered.push(advertisement);
                }
                return Ok(false);
            }
            match record.phase {
                NegotiationPhase::Discovering => {}
                NegotiationPhase::Matched | NegotiationPhase::Delivered => {
                    if record.matched == Some(channel) {
                        debug!(target: "session_tubes::manager", %session, %channel, "advertisement already matched");
                    } else {
                        warn!(
                            target: "session_tubes::manager",
                            %session,
                            %channel,
                            matched = ?record.matched,
                            "second matching tube ignored"
                        );
                    }
                    return Ok(false);
                }
                NegotiationPhase::Setup | NegotiationPhase::Offering => {
                    debug!(target: "session_tubes::manager", %session, %channel, phase = ?record.phase, "not discovering; advertisement ignored");
                    return Ok(false);
                }
            }
            record.phase = NegotiationPhase::Matched;
            record.matched = Some(channel);
            (record.handles.clone(), record.role)
        };

        if advertisement.state == TubeState::LocalPending {
            if let Err(err) = self.presence.accept_pending_channel(session, channel).await {
                error!(target: "session_tubes::manager", %session, %channel, error = %err, "accepting tube failed");
                if let Some(record) = self.sessions.write().get_mut(session) {
                    if record.matched == Some(channel) && record.phase == NegotiationPhase::Matched {
                        record.phase = NegotiationPhase::Discovering;
                        record.matched = None;
                    }
                }
                return Err(err.into());
            }
            debug!(target: "session_tubes::manager", %session, %channel, "accepted pending tube");
        }

        Ok(self.deliver(session, TubeConnection::new(&handles, channel), role))
    }

    /// Run every advertisement the presence service currently lists through
    /// matching. A listing failure is logged and the subscription carries on.
    async fn replay_listed(&self, session: &SessionId) {
        match self.presence.list_advertisements(session).await {
            Ok(advertisements) => {
                debug!(target: "session_tubes::manager", %session, count = advertisements.len(), "replaying listed advertisements");
                for advertisement in advertisements {
                    if let Err(err) = self.handle_advertisement(session, advertisement).await {
                        warn!(target: "session_tubes::manager", %session, error = %err, "listed advertisement not accepted");
                    }
                }
            }
            Err(err) => {
                error!(
                    target: "session_tubes::manager",
                    %session,
                    error = %err,
                    "listing advertisements failed; waiting for new ones"
                );
            }
        }
    }

    fn deliver(&self, session: &SessionId, connection: TubeConnection, role: Role) -> bool {
        {
            let mut sessions = self.sessions.write();
            match sessions.get_mut(session) {
                Some(record) if record.phase == NegotiationPhase::Matched => {
                    record.phase = NegotiationPhase::Delivered;
                }
                _ => {
                    debug!(target: "session_tubes::manager", %session, "session ended before delivery");
                    return false;
                }
            }
        }
        info!(
            target: "session_tubes::manager",
            %session,
            channel = %connection.channel,
            is_initiator = role.is_initiator(),
            "tube ready"
        );
        self.sink
            .on_collaboration_requested(connection, role.is_initiator());
        true
    }
}

fn spawn_advertisement_pump(
    inner: Weak<ManagerInner>,
    session: SessionId,
    mut rx: broadcast::Receiver<ChannelAdvertisement>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(advertisement) => {
                    let Some(inner) = inner.upgrade() else {
                        break;
                    };
                    if let Err(err) = inner.handle_advertisement(&session, advertisement).await {
                        warn!(target: "session_tubes::manager", %session, error = %err, "new advertisement not accepted");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target: "session_tubes::manager", %session, skipped, "advertisement subscription lagged; relisting");
                    let Some(inner) = inner.upgrade() else {
                        break;
                    };
                    inner.replay_listed(&session).await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
