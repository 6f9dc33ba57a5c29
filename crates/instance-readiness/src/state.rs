use std::fmt;

/// Prerequisite still outstanding while an instance sits in
/// [`LifecycleState::PreInstantiate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Awaiting {
    /// The resume payload has loaded; the surface has not been shown yet.
    Surface,
    /// The surface is visible; the resume payload has not loaded yet.
    Load,
    /// A share request stood in for one prerequisite, so the next signal of
    /// any kind instantiates.
    Any,
}

/// Lifecycle of a single instance. Only [`crate::ReadinessController`]
/// mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// No prior state; the first surface signal instantiates.
    Fresh,
    /// Prior state exists and neither prerequisite has been seen.
    AwaitingResume,
    /// One prerequisite has been seen.
    PreInstantiate(Awaiting),
    /// Instantiated. Terminal.
    Ready,
}

impl LifecycleState {
    pub fn initial(has_prior_state: bool) -> Self {
        if has_prior_state {
            Self::AwaitingResume
        } else {
            Self::Fresh
        }
    }

    pub fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fresh => f.write_str("fresh"),
            Self::AwaitingResume => f.write_str("awaiting-resume"),
            Self::PreInstantiate(Awaiting::Surface) => f.write_str("pre-instantiate(surface)"),
            Self::PreInstantiate(Awaiting::Load) => f.write_str("pre-instantiate(load)"),
            Self::PreInstantiate(Awaiting::Any) => f.write_str("pre-instantiate(any)"),
            Self::Ready => f.write_str("ready"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_follows_prior_state() {
        assert_eq!(LifecycleState::initial(false), LifecycleState::Fresh);
        assert_eq!(LifecycleState::initial(true), LifecycleState::AwaitingResume);
        assert!(!LifecycleState::initial(true).is_ready());
    }

    #[test]
    fn displays_awaited_prerequisite() {
        let state = LifecycleState::PreInstantiate(Awaiting::Load);
        assert_eq!(state.to_string(), "pre-instantiate(load)");
    }
}
