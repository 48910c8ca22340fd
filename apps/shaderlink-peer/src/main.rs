use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use clap::{Parser, ValueEnum};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use shaderlink_protocol::{ConfirmChoice, Envelope, decode, encode};
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

mod host;

use crate::host::{HostConfig, ToolHost};

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
#[command(name = "shaderlink-peer")]
#[command(about = "Simulated shaderlink tool host")]
struct Cli {
    #[arg(long, env = "PEER_LISTEN", default_value = "127.0.0.1:8765")]
    listen: SocketAddr,
    /// How retry confirmations are answered.
    #[arg(long, env = "CONFIRM_DECISION", value_enum, default_value_t = Decision::Abandon)]
    decision: Decision,
    #[arg(
        long,
        env = "PREVIEW_OBJECTS",
        value_delimiter = ',',
        default_value = "Sphere,Cube,Plane"
    )]
    preview_objects: Vec<String>,
}

#[derive(Debug, Default)]
struct PeerStats {
    connections: AtomicU64,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Clone)]
struct AppState {
    host: HostConfig,
    decision: Arc<RwLock<ConfirmChoice>>,
    stats: Arc<PeerStats>,
}

#[derive(Debug, Deserialize)]
struct DecisionRequest {
    decision: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let state = AppState {
        host: HostConfig {
            preview_objects: cli.preview_objects.clone(),
            ..HostConfig::default()
        },
        decision: Arc::new(RwLock::new(cli.decision.into())),
        stats: Arc::new(PeerStats::default()),
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_upgrade))
        .route("/decision", put(set_decision))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!(listen = %cli.listen, decision = ?cli.decision, "shaderlink-peer listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    let decision = *state.decision.read().await;
    Json(json!({
        "status": "ok",
        "service": "shaderlink-peer",
        "decision": decision.as_str(),
        "connections": state.stats.connections.load(Ordering::Relaxed),
        "framesIn": state.stats.frames_in.load(Ordering::Relaxed),
        "framesOut": state.stats.frames_out.load(Ordering::Relaxed),
        "dropped": state.stats.dropped.load(Ordering::Relaxed),
    }))
}

async fn set_decision(
    State(state): State<AppState>,
    Json(request): Json<DecisionRequest>,
) -> ApiResult<StatusCode> {
    let decision = parse_decision(&request.decision)?;
    *state.decision.write().await = decision;
    info!(decision = decision.as_str(), "confirmation decision changed");
    Ok(StatusCode::NO_CONTENT)
}

fn parse_decision(raw: &str) -> ApiResult<ConfirmChoice> {
    ConfirmChoice::OPTIONS
        .into_iter()
        .find(|choice| choice.as_str().eq_ignore_ascii_case(raw.trim()))
        .ok_or_else(|| {
            ApiError::bad_request(format!(
                "invalid decision {raw:?}; expected continue, accept or abandon"
            ))
        })
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, mut socket: WebSocket) {
    let connection = state.stats.connections.fetch_add(1, Ordering::Relaxed) + 1;
    let mut host = ToolHost::new(state.host.clone());
    info!(connection, "client connected");

    loop {
        let Some(message) = socket.next().await else {
            break;
        };

        match message {
            Ok(Message::Text(text)) => {
                state.stats.frames_in.fetch_add(1, Ordering::Relaxed);
                let envelope = match decode(text.as_str()) {
                    Ok(envelope) => envelope,
                    Err(error) => {
                        state.stats.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(connection, %error, "dropping malformed frame");
                        continue;
                    }
                };
                debug!(connection, kind = envelope.kind.type_name(), "received");

                let decision = *state.decision.read().await;
                let Some(reply) = host.handle(envelope, decision) else {
                    continue;
                };
                let encoded = match encode(&Envelope::new(reply)) {
                    Ok(encoded) => encoded,
                    Err(error) => {
                        warn!(connection, %error, "failed encoding reply");
                        continue;
                    }
                };
                if socket.send(Message::Text(encoded.into())).await.is_err() {
                    break;
                }
                state.stats.frames_out.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(payload)) => {
                if socket.send(Message::Pong(payload)).await.is_err() {
                    break;
                }
            }
            Ok(Message::Pong(_)) | Ok(Message::Binary(_)) => {}
            Err(error) => {
                warn!(connection, %error, "socket error");
                break;
            }
        }
    }

    info!(
        connection,
        session = ?host.session().map(ToString::to_string),
        "client disconnected"
    );
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(error) => {
                    tracing::error!(%error, "failed to install SIGTERM handler");
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}
