mod cli;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use instance_readiness::{InstanceHost, LifecycleState, ReadinessController, SaveError};
use parking_lot::Mutex;
use serde::Serialize;
use session_tubes::{ChannelId, LocalPresence, SessionId, SessionTubeManager, TubeConnection};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Step};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "callback", rename_all = "snake_case")]
enum Callback {
    NewInstance,
    ResumeInstance { target: PathBuf },
    ShareInstance { channel: ChannelId, is_initiator: bool },
}

/// Host that records every lifecycle callback it receives.
struct DemoHost {
    name: &'static str,
    callbacks: Mutex<Vec<Callback>>,
}

impl DemoHost {
    fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            callbacks: Mutex::new(Vec::new()),
        })
    }

    fn callbacks(&self) -> Vec<Callback> {
        self.callbacks.lock().clone()
    }

    fn record(&self, callback: Callback) {
        info!(participant = self.name, ?callback, "host callback");
        self.callbacks.lock().push(callback);
    }
}

impl InstanceHost<TubeConnection> for DemoHost {
    fn new_instance(&self) {
        self.record(Callback::NewInstance);
    }

    fn resume_instance(&self, target: &Path) {
        self.record(Callback::ResumeInstance {
            target: target.to_path_buf(),
        });
    }

    fn save_instance(&self, target: &Path) -> Result<(), SaveError> {
        let body = serde_json::to_vec_pretty(&self.callbacks())
            .map_err(|err| SaveError::Rejected(err.to_string()))?;
        std::fs::write(target, body)?;
        Ok(())
    }

    fn share_instance(&self, connection: TubeConnection, is_initiator: bool) {
        self.record(Callback::ShareInstance {
            channel: connection.channel,
            is_initiator,
        });
    }
}

struct Outcome {
    callbacks: Vec<Callback>,
    state: LifecycleState,
    pending: usize,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

async fn run(cli: &Cli) -> Result<Outcome> {
    let session = SessionId::new(cli.session.clone());
    let presence = Arc::new(LocalPresence::new());
    presence.open_session(&session);

    let tube_config = cli.tube_config();
    let readiness_config = cli.readiness_config();

    let initiator_host = DemoHost::new("initiator");
    let initiator: Arc<ReadinessController<TubeConnection>> = Arc::new(
        ReadinessController::with_config(initiator_host, false, readiness_config.clone()),
    );
    let initiator_tubes =
        SessionTubeManager::new(presence.clone(), initiator.clone(), tube_config.clone());
    initiator.on_surface_visible();
    initiator_tubes
        .share(&session)
        .await
        .context("initiator failed to offer a tube")?;

    let joiner_host = DemoHost::new("joiner");
    let joiner: Arc<ReadinessController<TubeConnection>> =
        Arc::new(ReadinessController::with_config(
            joiner_host.clone(),
            cli.resume.is_some(),
            readiness_config,
        ));
    let joiner_tubes = SessionTubeManager::new(presence.clone(), joiner.clone(), tube_config);

    for step in &cli.order {
        info!(?step, state = %joiner.state(), "joiner signal");
        match step {
            Step::Surface => joiner.on_surface_visible(),
            Step::Load => match &cli.resume {
                Some(target) => joiner.on_load_requested(target.clone()),
                None => info!("no resume payload; load signal skipped"),
            },
            Step::Join => joiner_tubes
                .join(&session)
                .await
                .context("joiner failed to join the session")?,
        }
    }

    if let Some(target) = &cli.save {
        joiner
            .save(target)
            .with_context(|| format!("saving instance to {}", target.display()))?;
    }

    Ok(Outcome {
        callbacks: joiner_host.callbacks(),
        state: joiner.state(),
        pending: joiner.pending_len(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let outcome = run(&cli).await?;
    if !outcome.state.is_ready() {
        warn!(
            state = %outcome.state,
            pending = outcome.pending,
            "joiner never instantiated; a prerequisite signal is missing from --order"
        );
    }

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&outcome.callbacks)?);
    } else if outcome.callbacks.is_empty() {
        println!("No callbacks fired (state: {}).", outcome.state);
    } else {
        for callback in &outcome.callbacks {
            match callback {
                Callback::NewInstance => println!("new_instance()"),
                Callback::ResumeInstance { target } => {
                    println!("resume_instance({})", target.display())
                }
                Callback::ShareInstance {
                    channel,
                    is_initiator,
                } => println!("share_instance(tube {channel}, initiator={is_initiator})"),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Pinned so the environment cli tests set cannot leak in.
    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec![
            "shared-activity",
            "--service",
            "org.example.Draw",
            "--policy",
            "strict",
        ];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).expect("valid args")
    }

    #[tokio::test]
    async fn join_before_resume_shares_after_resume() {
        let outcome = run(&cli(&["--order", "join,surface,load", "--resume", "/journal/a"]))
            .await
            .expect("run ok");
        assert!(outcome.state.is_ready());
        assert_eq!(
            outcome.callbacks,
            vec![
                Callback::ResumeInstance {
                    target: PathBuf::from("/journal/a")
                },
                Callback::ShareInstance {
                    channel: ChannelId(1),
                    is_initiator: false
                },
            ]
        );
    }

    #[tokio::test]
    async fn fresh_joiner_without_surface_stays_pending() {
        let outcome = run(&cli(&["--order", "join"])).await.expect("run ok");
        assert_eq!(outcome.state, LifecycleState::Fresh);
        assert_eq!(outcome.pending, 1);
        assert!(outcome.callbacks.is_empty());
    }

    #[tokio::test]
    async fn save_writes_recorded_callbacks() {
        let path = std::env::temp_dir().join(format!(
            "shared-activity-save-{}.json",
            std::process::id()
        ));
        let path_arg = path.to_string_lossy().into_owned();
        run(&cli(&["--order", "surface,join", "--save", &path_arg]))
            .await
            .expect("run ok");

        let saved: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).expect("saved file")).expect("json");
        assert_eq!(saved[0]["callback"], "new_instance");
        assert_eq!(saved[1]["callback"], "share_instance");
        let _ = std::fs::remove_file(&path);
    }
}
