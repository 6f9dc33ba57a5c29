use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const RESUME_POLICY_ENV: &str = "SHARED_ACTIVITY_RESUME_POLICY";

/// How a share request that arrives before a resume completes is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResumePolicy {
    /// Share requests are queued and never stand in for a prerequisite.
    #[default]
    Strict,
    /// A share request advances an awaiting resume as if one prerequisite had
    /// arrived, and a share request in pre-instantiate instantiates.
    JoinUnblocksResume,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown resume policy {0:?} (expected strict or join-unblocks-resume)")]
    UnknownPolicy(String),
}

impl FromStr for ResumePolicy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "join-unblocks-resume" | "join_unblocks_resume" => Ok(Self::JoinUnblocksResume),
            other => Err(ConfigError::UnknownPolicy(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessConfig {
    #[serde(default)]
    pub resume_policy: ResumePolicy,
}

impl ReadinessConfig {
    /// Load configuration from environment variables. Unparseable values fall
    /// back to the default policy.
    pub fn from_env() -> Self {
        let resume_policy = env::var(RESUME_POLICY_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .and_then(|value| match value.parse() {
                Ok(policy) => Some(policy),
                Err(err) => {
                    warn!(target: "instance_readiness::config", error = %err, "ignoring {RESUME_POLICY_ENV}");
                    None
                }
            })
            .unwrap_or_default();
        Self { resume_policy }
    }

    pub fn with_resume_policy(mut self, policy: ResumePolicy) -> Self {
        self.resume_policy = policy;
        self
    }
}
