//! Exactly-once instantiation for a shared activity instance.
//!
//! Three signals arrive in no particular order: the presentation surface
//! becoming usable, a resume payload finishing its load, and requests to
//! share the instance with a collaborative session. [`ReadinessController`]
//! folds them into a single instantiation and replays any share requests that
//! arrived early, in order, once the instance exists.

mod config;
mod controller;
mod host;
mod state;

pub use config::{ConfigError, ReadinessConfig, ResumePolicy, RESUME_POLICY_ENV};
pub use controller::ReadinessController;
pub use host::{CollaborationSink, InstanceHost, SaveError};
pub use state::{Awaiting, LifecycleState};
