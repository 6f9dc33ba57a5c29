use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("instance does not support saving")]
    Unsupported,
    #[error("failed to write instance state: {0}")]
    Io(#[from] std::io::Error),
    #[error("instance state rejected: {0}")]
    Rejected(String),
}

/// Lifecycle callbacks implemented by the application that owns an instance.
///
/// Exactly one of [`new_instance`](Self::new_instance) or
/// [`resume_instance`](Self::resume_instance) runs per lifecycle, before any
/// call to [`share_instance`](Self::share_instance).
pub trait InstanceHost<C>: Send + Sync {
    fn new_instance(&self) {}

    fn resume_instance(&self, _target: &Path) {}

    fn save_instance(&self, _target: &Path) -> Result<(), SaveError> {
        Err(SaveError::Unsupported)
    }

    fn share_instance(&self, _connection: C, _is_initiator: bool) {}
}

/// Receiver for "the instance should now join or create a shared session".
pub trait CollaborationSink<C>: Send + Sync {
    fn on_collaboration_requested(&self, request: C, is_initiator: bool);
}
