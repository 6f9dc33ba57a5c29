use std::path::PathBuf;
use std::str::FromStr;

use clap::{Parser, ValueEnum};
use instance_readiness::{ReadinessConfig, ResumePolicy};
use session_tubes::TubeConfig;

#[derive(Debug, Parser)]
#[command(
    name = "shared-activity",
    author,
    version,
    about = "Run an initiator and a joiner through tube negotiation on an in-memory session"
)]
pub struct Cli {
    /// Order in which the joiner observes its signals (comma separated).
    #[arg(
        long,
        value_enum,
        value_delimiter = ',',
        default_values = ["surface", "load", "join"]
    )]
    pub order: Vec<Step>,

    /// Resume payload handed to the joiner. Without it the joiner starts fresh.
    #[arg(long)]
    pub resume: Option<PathBuf>,

    /// Service identifier both participants negotiate. Overrides
    /// SHARED_ACTIVITY_SERVICE.
    #[arg(long)]
    pub service: Option<String>,

    /// How the joiner treats a tube that arrives before its resume completes
    /// (strict or join-unblocks-resume). Overrides SHARED_ACTIVITY_RESUME_POLICY.
    #[arg(long, value_parser = ResumePolicy::from_str)]
    pub policy: Option<ResumePolicy>,

    #[arg(long, default_value = "demo-session")]
    pub session: String,

    /// Save the joiner's instance to this path once all signals ran.
    #[arg(long)]
    pub save: Option<PathBuf>,

    /// Print the joiner's callbacks as JSON (for scripting).
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Step {
    Surface,
    Load,
    Join,
}

impl Cli {
    /// Environment configuration with command-line overrides applied.
    pub fn tube_config(&self) -> TubeConfig {
        let mut config = TubeConfig::from_env();
        if let Some(service) = self
            .service
            .as_deref()
            .map(str::trim)
            .filter(|service| !service.is_empty())
        {
            config.service = service.to_string();
        }
        config
    }

    pub fn readiness_config(&self) -> ReadinessConfig {
        let config = ReadinessConfig::from_env();
        match self.policy {
            Some(policy) => config.with_resume_policy(policy),
            None => config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use instance_readiness::RESUME_POLICY_ENV;
    use session_tubes::{DEFAULT_SERVICE, SERVICE_ENV};
    use std::env;
    use std::sync::{LazyLock, Mutex};

    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    struct EnvGuard {
        saved: Vec<(&'static str, Option<String>)>,
    }

    impl EnvGuard {
        fn set(vars: &[(&'static str, Option<&str>)]) -> Self {
            let saved = vars
                .iter()
                .map(|(key, value)| {
                    let original = env::var(key).ok();
                    match value {
                        Some(value) => env::set_var(key, value),
                        None => env::remove_var(key),
                    }
                    (*key, original)
                })
                .collect();
            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, original) in self.saved.drain(..) {
                match original {
                    Some(value) => env::set_var(key, value),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    fn parses_order_list() {
        let cli = Cli::try_parse_from([
            "shared-activity",
            "--order",
            "join,surface,load",
            "--resume",
            "/journal/draw",
            "--policy",
            "join-unblocks-resume",
        ])
        .expect("valid args");
        assert_eq!(cli.order, vec![Step::Join, Step::Surface, Step::Load]);
        assert_eq!(cli.resume, Some(PathBuf::from("/journal/draw")));
        assert_eq!(cli.policy, Some(ResumePolicy::JoinUnblocksResume));
    }

    #[test]
    fn blank_service_env_falls_back_to_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _env = EnvGuard::set(&[
            (SERVICE_ENV, Some("   ")),
            (RESUME_POLICY_ENV, Some("join_unblocks_resume")),
        ]);

        let cli = Cli::try_parse_from(["shared-activity"]).expect("valid args");
        assert_eq!(cli.tube_config().service, DEFAULT_SERVICE);
        assert_eq!(
            cli.readiness_config().resume_policy,
            ResumePolicy::JoinUnblocksResume
        );
    }

    #[test]
    fn flags_override_environment() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _env = EnvGuard::set(&[
            (SERVICE_ENV, Some("org.example.Chat")),
            (RESUME_POLICY_ENV, Some("sometimes")),
        ]);

        let defaults = Cli::try_parse_from(["shared-activity"]).expect("valid args");
        assert_eq!(defaults.tube_config().service, "org.example.Chat");
        assert_eq!(defaults.readiness_config().resume_policy, ResumePolicy::Strict);

        let cli = Cli::try_parse_from([
            "shared-activity",
            "--service",
            "org.example.Draw",
            "--policy",
            "join_unblocks_resume",
        ])
        .expect("valid args");
        assert_eq!(cli.tube_config().service, "org.example.Draw");
        assert_eq!(
            cli.readiness_config().resume_policy,
            ResumePolicy::JoinUnblocksResume
        );
    }

    #[test]
    fn rejects_unknown_policy_flag() {
        assert!(Cli::try_parse_from(["shared-activity", "--policy", "eager"]).is_err());
    }

    #[test]
    fn rejects_unknown_step() {
        assert!(Cli::try_parse_from(["shared-activity", "--order", "surface,dance"]).is_err());
    }
}
