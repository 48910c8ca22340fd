//! Scripted peer and generator shared by the runtime tests.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use shaderlink_connection::ConnectionManager;
use shaderlink_events::{EventStreamHub, TaskEvent};
use shaderlink_protocol::{
    CompileReport, ConfirmChoice, ConfirmResult, ConnectionConfig, Diagnostic, Envelope,
    GeneratedShader, GenerationRequest, Heartbeat, HistoryEntry, LinkError, LinkResult,
    MessageKind, SessionReady, ShaderGenerator, ToolResult, decode, encode,
};
use shaderlink_transport::{MemoryPeer, memory_transport};
use tokio::task::JoinHandle;

use crate::{GenerationOrchestrator, RuntimeConfig};

pub(crate) const GLOW_SHADER: &str = r#"Shader "Custom/Glow"
{
    SubShader
    {
        Pass
        {
            HLSLPROGRAM
            #pragma vertex vert
            #pragma fragment frag
            #include "Packages/com.unity.render-pipelines.universal/ShaderLibrary/Core.hlsl"
            ENDHLSL
        }
    }
}"#;

/// Returns [`GLOW_SHADER`] wrapped in a markdown fence and remembers every
/// request it saw.
#[derive(Default)]
pub(crate) struct ScriptedGenerator {
    requests: Mutex<Vec<GenerationRequest>>,
    offline: bool,
}

impl ScriptedGenerator {
    pub(crate) fn offline() -> Self {
        Self {
            offline: true,
            ..Self::default()
        }
    }

    pub(crate) fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ShaderGenerator for ScriptedGenerator {
    async fn generate(&self, request: GenerationRequest) -> LinkResult<GeneratedShader> {
        self.requests.lock().push(request);
        if self.offline {
            return Err(LinkError::Generator("model endpoint unreachable".into()));
        }
        Ok(GeneratedShader::new(format!("```hlsl\n{GLOW_SHADER}\n```")))
    }
}

type CompileScript = Box<dyn Fn(u32) -> Option<CompileReport> + Send + Sync>;

pub(crate) struct PeerScript {
    pub answer_session_init: bool,
    pub history: Vec<HistoryEntry>,
    /// Report for the nth `compile_shader` call, counting from 1. `None`
    /// leaves the call unanswered.
    pub compile: CompileScript,
    /// `compile_shader` calls answered with `success: false`.
    pub crashed_compiles: Vec<u32>,
    /// `compile_shader` calls answered with a result that is no report.
    pub garbled_compiles: Vec<u32>,
    pub confirm: Option<ConfirmChoice>,
}

impl Default for PeerScript {
    fn default() -> Self {
        Self {
            answer_session_init: true,
            history: Vec::new(),
            compile: Box::new(|_| Some(CompileReport::clean())),
            crashed_compiles: Vec::new(),
            garbled_compiles: Vec::new(),
            confirm: None,
        }
    }
}

impl PeerScript {
    pub(crate) fn always_failing() -> Self {
        Self {
            compile: Box::new(|_| {
                Some(CompileReport::failed(vec![Diagnostic::error(
                    7,
                    "undeclared identifier '_GlowColor'",
                )]))
            }),
            ..Self::default()
        }
    }
}

/// Everything the peer received, in order.
#[derive(Clone, Default)]
pub(crate) struct PeerLog {
    received: Arc<Mutex<Vec<Envelope>>>,
}

impl PeerLog {
    pub(crate) fn count(&self, kind: &str) -> usize {
        self.received
            .lock()
            .iter()
            .filter(|envelope| envelope.kind.type_name() == kind)
            .count()
    }

    pub(crate) fn envelopes(&self) -> Vec<Envelope> {
        self.received.lock().clone()
    }

    pub(crate) fn tool_calls(&self) -> Vec<String> {
        self.received
            .lock()
            .iter()
            .filter_map(|envelope| match &envelope.kind {
                MessageKind::ToolCall(call) => Some(call.tool_name.clone()),
                _ => None,
            })
            .collect()
    }
}

pub(crate) async fn connected() -> Result<(ConnectionManager, MemoryPeer)> {
    let (connector, mut acceptor) = memory_transport();
    let connection = ConnectionManager::new(ConnectionConfig::default(), Arc::new(connector));
    connection.connect().await?;
    let peer = acceptor.accept().await.context("peer never connected")?;
    Ok((connection, peer))
}

pub(crate) async fn scripted(script: PeerScript) -> Result<(ConnectionManager, PeerLog, JoinHandle<()>)> {
    let (connection, peer) = connected().await?;
    let (log, task) = serve(peer, script);
    Ok((connection, log, task))
}

/// Run `script` on an already accepted peer.
pub(crate) fn serve(peer: MemoryPeer, script: PeerScript) -> (PeerLog, JoinHandle<()>) {
    let log = PeerLog::default();
    let task = tokio::spawn(run_peer(peer, script, log.clone()));
    (log, task)
}

pub(crate) fn orchestrator(
    connection: &ConnectionManager,
    generator: Arc<ScriptedGenerator>,
) -> GenerationOrchestrator {
    GenerationOrchestrator::new(
        connection.clone(),
        generator,
        RuntimeConfig::default(),
        EventStreamHub::<TaskEvent>::new(256),
    )
}

pub(crate) fn reply(kind: MessageKind) -> String {
    encode(&Envelope::new(kind)).expect("catalogue kinds always encode")
}

pub(crate) fn tool_ok(call: &shaderlink_protocol::ToolCall, result: serde_json::Value) -> MessageKind {
    MessageKind::ToolResult(ToolResult {
        request_id: call.request_id.clone(),
        tool_name: call.tool_name.clone(),
        success: true,
        result: Some(result),
        error: None,
    })
}

async fn run_peer(mut peer: MemoryPeer, script: PeerScript, log: PeerLog) {
    let mut compiles = 0;
    while let Some(text) = peer.recv_text().await {
        let Ok(envelope) = decode(&text) else {
            continue;
        };
        log.received.lock().push(envelope.clone());
        let answer = match envelope.kind {
            MessageKind::Ping(_) => Some(MessageKind::Pong(Heartbeat::default())),
            MessageKind::SessionInit(init) if script.answer_session_init => {
                Some(MessageKind::SessionReady(SessionReady {
                    session_id: init.session_id.unwrap_or_default(),
                    history: script.history.clone(),
                }))
            }
            MessageKind::ToolCall(call) if call.tool_name == "compile_shader" => {
                compiles += 1;
                if script.crashed_compiles.contains(&compiles) {
                    Some(MessageKind::ToolResult(ToolResult {
                        request_id: call.request_id.clone(),
                        tool_name: call.tool_name.clone(),
                        success: false,
                        result: None,
                        error: Some("shader compiler crashed".to_owned()),
                    }))
                } else if script.garbled_compiles.contains(&compiles) {
                    Some(tool_ok(&call, json!({ "diagnostics": "not a list" })))
                } else {
                    (script.compile)(compiles).map(|report| tool_ok(&call, json!(report)))
                }
            }
            MessageKind::ToolCall(call) => {
                let path = format!("Assets/Shaders/Generated/{}", call.tool_name);
                Some(tool_ok(&call, json!({ "path": path })))
            }
            MessageKind::ConfirmRequest(request) => script.confirm.map(|choice| {
                MessageKind::ConfirmResult(ConfirmResult {
                    confirm_id: request.confirm_id,
                    confirmed: choice != ConfirmChoice::Abandon,
                    note: None,
                    choice: Some(choice),
                })
            }),
            _ => None,
        };
        if let Some(kind) = answer
            && !peer.send_text(reply(kind))
        {
            break;
        }
    }
}

/// Poll `condition` for up to a second.
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
