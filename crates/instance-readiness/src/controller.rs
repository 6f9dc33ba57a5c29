use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{ReadinessConfig, ResumePolicy};
use crate::host::{CollaborationSink, InstanceHost, SaveError};
use crate::state::{Awaiting, LifecycleState};

struct PendingShare<C> {
    request: C,
    is_initiator: bool,
}

/// Host work captured at the `Ready` edge and run after the lock is released.
struct Instantiation<C> {
    resume_target: Option<PathBuf>,
    pending: VecDeque<PendingShare<C>>,
}

enum ShareStep<C> {
    Deliver(C, bool),
    Instantiate(Instantiation<C>),
    Queued,
}

struct Inner<C> {
    state: LifecycleState,
    resume_target: Option<PathBuf>,
    pending: VecDeque<PendingShare<C>>,
}

impl<C> Inner<C> {
    fn transition(&mut self, next: LifecycleState) {
        debug!(target: "instance_readiness::controller", from = %self.state, to = %next, "lifecycle transition");
        self.state = next;
    }

    /// Flips to `Ready` and takes everything instantiation needs. Callers must
    /// run the returned work only after dropping the lock.
    fn begin_instantiation(&mut self) -> Instantiation<C> {
        self.transition(LifecycleState::Ready);
        Instantiation {
            resume_target: self.resume_target.take(),
            pending: std::mem::take(&mut self.pending),
        }
    }
}

/// Owns the instance lifecycle and runs instantiation exactly once.
///
/// Every entry point may be called in any order, and repeated signals after
/// instantiation are no-ops. Host callbacks never run while the internal lock
/// is held, so a host may issue new share requests from inside a callback;
/// those observe `Ready` and are delivered synchronously.
pub struct ReadinessController<C> {
    host: Arc<dyn InstanceHost<C>>,
    config: ReadinessConfig,
    inner: Mutex<Inner<C>>,
}

impl<C: Send> ReadinessController<C> {
    pub fn new(host: Arc<dyn InstanceHost<C>>, has_prior_state: bool) -> Self {
        Self::with_config(host, has_prior_state, ReadinessConfig::default())
    }

    pub fn with_config(
        host: Arc<dyn InstanceHost<C>>,
        has_prior_state: bool,
        config: ReadinessConfig,
    ) -> Self {
        let state = LifecycleState::initial(has_prior_state);
        debug!(target: "instance_readiness::controller", %state, policy = ?config.resume_policy, "controller created");
        Self {
            host,
            config,
            inner: Mutex::new(Inner {
                state,
                resume_target: None,
                pending: VecDeque::new(),
            }),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lock().state
    }

    /// Share requests waiting for instantiation.
    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn config(&self) -> &ReadinessConfig {
        &self.config
    }

    /// The presentation surface can now service work.
    pub fn on_surface_visible(&self) {
        let work = {
            let mut inner = self.inner.lock();
            let state = inner.state;
            match state {
                LifecycleState::Fresh
                | LifecycleState::PreInstantiate(Awaiting::Surface | Awaiting::Any) => {
                    Some(inner.begin_instantiation())
                }
                LifecycleState::AwaitingResume => {
                    inner.transition(LifecycleState::PreInstantiate(Awaiting::Load));
                    None
                }
                LifecycleState::PreInstantiate(Awaiting::Load) | LifecycleState::Ready => {
                    debug!(target: "instance_readiness::controller", %state, "redundant surface signal ignored");
                    None
                }
            }
        };
        if let Some(work) = work {
            self.instantiate(work);
        }
    }

    /// A resume payload finished loading. The latest payload wins until
    /// instantiation consumes it.
    pub fn on_load_requested(&self, target: PathBuf) {
        let work = {
            let mut inner = self.inner.lock();
            if inner.state.is_ready() {
                debug!(target: "instance_readiness::controller", path = %target.display(), "load after instantiation ignored");
                return;
            }
            inner.resume_target = Some(target);
            let state = inner.state;
            match state {
                LifecycleState::AwaitingResume => {
                    inner.transition(LifecycleState::PreInstantiate(Awaiting::Surface));
                    None
                }
                LifecycleState::PreInstantiate(Awaiting::Load | Awaiting::Any) => {
                    Some(inner.begin_instantiation())
                }
                LifecycleState::Fresh | LifecycleState::PreInstantiate(Awaiting::Surface) => {
                    debug!(target: "instance_readiness::controller", %state, "resume payload stored");
                    None
                }
                LifecycleState::Ready => None,
            }
        };
        if let Some(work) = work {
            self.instantiate(work);
        }
    }

    /// Share the instance, now if it exists, otherwise once it does.
    pub fn on_collaboration_requested(&self, request: C, is_initiator: bool) {
        let step = {
            let mut inner = self.inner.lock();
            if inner.state.is_ready() {
                ShareStep::Deliver(request, is_initiator)
            } else {
                inner.pending.push_back(PendingShare {
                    request,
                    is_initiator,
                });
                match (self.config.resume_policy, inner.state) {
                    (ResumePolicy::JoinUnblocksResume, LifecycleState::AwaitingResume) => {
                        warn!(
                            target: "instance_readiness::controller",
                            "share request advanced an awaiting resume before its prerequisites arrived"
                        );
                        inner.transition(LifecycleState::PreInstantiate(Awaiting::Any));
                        ShareStep::Queued
                    }
                    (ResumePolicy::JoinUnblocksResume, LifecycleState::PreInstantiate(awaiting)) => {
                        if awaiting != Awaiting::Any {
                            warn!(
                                target: "instance_readiness::controller",
                                ?awaiting,
                                "share request instantiating without its outstanding prerequisite"
                            );
                        }
                        ShareStep::Instantiate(inner.begin_instantiation())
                    }
                    _ => {
                        debug!(
                            target: "instance_readiness::controller",
                            state = %inner.state,
                            pending = inner.pending.len(),
                            "share request queued until instantiation"
                        );
                        ShareStep::Queued
                    }
                }
            }
        };

        match step {
            ShareStep::Deliver(request, is_initiator) => {
                debug!(target: "instance_readiness::controller", is_initiator, "delivering share request");
                self.host.share_instance(request, is_initiator);
            }
            ShareStep::Instantiate(work) => self.instantiate(work),
            ShareStep::Queued => {}
        }
    }

    /// Persist the instance. Failures are returned to the caller unchanged.
    pub fn save(&self, target: &Path) -> Result<(), SaveError> {
        self.host.save_instance(target).map_err(|err| {
            warn!(target: "instance_readiness::controller", path = %target.display(), error = %err, "save failed");
            err
        })
    }

    fn instantiate(&self, work: Instantiation<C>) {
        let Instantiation {
            resume_target,
            pending,
        } = work;
        info!(
            target: "instance_readiness::controller",
            resume = resume_target.is_some(),
            pending = pending.len(),
            "instantiating"
        );
        match resume_target {
            Some(target) => self.host.resume_instance(&target),
            None => self.host.new_instance(),
        }
        for share in pending {
            self.host.share_instance(share.request, share.is_initiator);
        }
    }
}

impl<C: Send> CollaborationSink<C> for ReadinessController<C> {
    fn on_collaboration_requested(&self, request: C, is_initiator: bool) {
        ReadinessController::on_collaboration_requested(self, request, is_initiator);
    }
}
