use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser, ValueEnum};
use shaderlink_events::TaskEvent;
use shaderlink_kernel::{LinkBuilder, ShaderLink};
use shaderlink_protocol::{
    ConfirmChoice, ConnectionConfig, RequestId, SessionConfig, SessionId, TaskId, TaskStatus,
};
use shaderlink_runtime::RuntimeConfig;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod generator;

use crate::generator::FileGenerator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Decision {
    Continue,
    Accept,
    Abandon,
}

impl From<Decision> for ConfirmChoice {
    fn from(decision: Decision) -> Self {
        match decision {
            Decision::Continue => Self::Continue,
            Decision::Accept => Self::Accept,
            Decision::Abandon => Self::Abandon,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "shaderlinkd")]
#[command(about = "Run one shader request against a shaderlink tool host")]
struct Cli {
    /// What the shader should do.
    requirement: String,
    /// Shader source served to the orchestrator on every attempt.
    #[arg(long, env = "SHADER_FILE")]
    shader_file: PathBuf,
    #[arg(long, env = "WEBSOCKET_HOST", default_value = "localhost")]
    host: String,
    #[arg(long, env = "WEBSOCKET_PORT", default_value_t = 8765)]
    port: u16,
    #[arg(long, env = "AUTO_RECONNECT", default_value_t = true, action = ArgAction::Set)]
    auto_reconnect: bool,
    #[arg(long, env = "RECONNECT_INTERVAL_SECS", default_value_t = 3)]
    reconnect_interval_secs: u64,
    #[arg(long, env = "CONNECTION_TIMEOUT_SECS", default_value_t = 10)]
    connection_timeout_secs: u64,
    #[arg(long, env = "HEALTH_CHECK_INTERVAL_SECS", default_value_t = 5)]
    health_check_interval_secs: u64,
    #[arg(long, env = "VALIDATION_TIMEOUT_SECS", default_value_t = 30)]
    validation_timeout_secs: u64,
    #[arg(long, env = "MAX_RETRY_COUNT", default_value_t = 3)]
    max_retry_count: u32,
    #[arg(long, env = "OUTPUT_DIRECTORY", default_value = "Assets/Shaders/Generated")]
    output_directory: String,
    #[arg(long, env = "PROJECT_PATH", default_value = ".")]
    project_path: String,
    /// Resume this session instead of opening a new one.
    #[arg(long)]
    session_id: Option<String>,
    /// Persist session history under this directory.
    #[arg(long, env = "SHADERLINK_HISTORY")]
    history_root: Option<PathBuf>,
    /// Answer retry confirmations locally instead of leaving them to the
    /// tool host.
    #[arg(long, value_enum)]
    on_exhausted: Option<Decision>,
}

impl Cli {
    fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            auto_reconnect: self.auto_reconnect,
            reconnect_interval: Duration::from_secs(self.reconnect_interval_secs),
            connection_timeout: Duration::from_secs(self.connection_timeout_secs),
            health_check_interval: Duration::from_secs(self.health_check_interval_secs),
            ..ConnectionConfig::new(self.host.clone(), self.port)
        }
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            output_directory: self.output_directory.clone(),
            max_retry_count: self.max_retry_count,
            ..SessionConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .compact()
        .init();

    let cli = Cli::parse();
    let connection = cli.connection_config();
    connection.validate()?;
    cli.session_config().validate()?;

    let runtime = RuntimeConfig {
        validation_timeout: Duration::from_secs(cli.validation_timeout_secs),
        ..RuntimeConfig::default()
    };
    let mut builder = LinkBuilder::new(
        connection.clone(),
        Arc::new(FileGenerator::new(&cli.shader_file)),
    )
    .runtime_config(runtime);
    if let Some(root) = &cli.history_root {
        builder = builder.history_root(root);
    }
    let link = builder.build();

    link.start()
        .await
        .with_context(|| format!("could not reach tool host at {}", connection.url()))?;

    let session_id = match &cli.session_id {
        Some(existing) => {
            link.resume_session(
                SessionId::from(existing.as_str()),
                cli.project_path.clone(),
                cli.session_config(),
            )
            .await?
        }
        None => {
            link.open_session(cli.project_path.clone(), cli.session_config())
                .await?
        }
    };
    info!(session_id = %session_id, project = %cli.project_path, "session open");

    let mut events = link.subscribe_tasks();
    let task_id = link.submit(cli.requirement.clone(), Vec::new()).await?;
    info!(task_id = %task_id, "request submitted");

    let finished = tokio::select! {
        finished = follow(&link, &mut events, &task_id, cli.on_exhausted) => finished,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted; cancelling task");
            link.cancel_task(&task_id);
            false
        }
    };
    if !finished {
        debug!("event stream ended before the task finished");
    }

    let outcome = link.wait_for_task(&task_id).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    link.shutdown().await;

    if outcome.status != TaskStatus::Succeeded {
        bail!("task {task_id} {}: {}", outcome.status, outcome.message);
    }
    Ok(())
}

/// Log task events until `task_id` finishes. `false` if the stream closed
/// first.
async fn follow(
    link: &ShaderLink,
    events: &mut tokio::sync::broadcast::Receiver<TaskEvent>,
    task_id: &TaskId,
    on_exhausted: Option<Decision>,
) -> bool {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "task events dropped");
                continue;
            }
            Err(RecvError::Closed) => return false,
        };
        if event.task_id() != task_id {
            continue;
        }
        match &event {
            TaskEvent::StatusChanged {
                from,
                to,
                attempt,
                max_attempts,
                ..
            } => info!(%from, %to, attempt, max_attempts, "status"),
            TaskEvent::Progress {
                stage,
                progress,
                message,
                ..
            } => info!(stage = %stage, progress, detail = %message, "progress"),
            TaskEvent::Preview {
                attempt,
                shader_name,
                code,
                ..
            } => debug!(attempt, shader_name = %shader_name, bytes = code.len(), "preview"),
            TaskEvent::ConfirmationRequested {
                confirm_id,
                message,
                ..
            } => {
                warn!(detail = %message, "retries exhausted");
                if let Some(decision) = on_exhausted {
                    answer(link, confirm_id, decision).await;
                }
            }
            TaskEvent::Finished {
                status, message, ..
            } => {
                info!(%status, detail = %message, "finished");
                return true;
            }
        }
    }
}

/// The confirmation is registered just after its event is published, so
/// give it a moment to appear.
async fn answer(link: &ShaderLink, confirm_id: &RequestId, decision: Decision) {
    for _ in 0..50 {
        if link.confirm(confirm_id, decision.into()) {
            info!(?decision, "answered confirmation");
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    warn!(confirm_id = %confirm_id, "confirmation was never registered");
}
