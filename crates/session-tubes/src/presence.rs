use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::{ChannelAdvertisement, ChannelId, PresenceResult, SessionHandles, SessionId};

/// Membership service that reports sessions and owns their tube channels.
#[async_trait]
pub trait PresenceService: Send + Sync {
    fn is_session_active(&self, session: &SessionId) -> bool;

    /// Handles for an active session, or `None` when its descriptor is absent.
    fn session_handles(&self, session: &SessionId) -> Option<SessionHandles>;

    /// Advertisements made on the session from now on.
    fn subscribe_advertisements(
        &self,
        session: &SessionId,
    ) -> PresenceResult<broadcast::Receiver<ChannelAdvertisement>>;

    /// Every advertisement already made on the session.
    async fn list_advertisements(
        &self,
        session: &SessionId,
    ) -> PresenceResult<Vec<ChannelAdvertisement>>;

    async fn advertise_channel(
        &self,
        session: &SessionId,
        service: &str,
        params: &HashMap<String, String>,
    ) -> PresenceResult<ChannelId>;

    async fn accept_pending_channel(
        &self,
        session: &SessionId,
        channel: ChannelId,
    ) -> PresenceResult<()>;
}
