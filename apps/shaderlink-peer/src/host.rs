//! The tool-hosting side of the protocol, minus the editor: compiles are
//! structural checks and assets are paths nobody writes.

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use shaderlink_protocol::{
    ApplyToPreviewArgs, CaptureScreenshotArgs, CompileReport, CompileShaderArgs, ConfirmChoice,
    ConfirmResult, CreateMaterialArgs, Envelope, Heartbeat, MessageKind, PreviewObjects,
    SaveShaderArgs, SavedAsset, Screenshot, SessionId, SessionReady, SetBackgroundArgs,
    SwitchPreviewObjectArgs, ToolCall, ToolName, ToolResult, structural_diagnostics,
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub preview_objects: Vec<String>,
    pub screenshot_width: u32,
    pub screenshot_height: u32,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            preview_objects: vec!["Sphere".to_owned(), "Cube".to_owned(), "Plane".to_owned()],
            screenshot_width: 512,
            screenshot_height: 512,
        }
    }
}

/// Per-connection state of the simulated editor.
#[derive(Debug)]
pub struct ToolHost {
    config: HostConfig,
    session: Option<SessionId>,
    current_object: Option<String>,
    material: Option<String>,
    background: String,
}

impl ToolHost {
    pub fn new(config: HostConfig) -> Self {
        let current_object = config.preview_objects.first().cloned();
        Self {
            config,
            session: None,
            current_object,
            material: None,
            background: "#000000".to_owned(),
        }
    }

    pub fn session(&self) -> Option<&SessionId> {
        self.session.as_ref()
    }

    /// The reply to `envelope`, if it needs one. `decision` answers retry
    /// confirmations.
    pub fn handle(&mut self, envelope: Envelope, decision: ConfirmChoice) -> Option<MessageKind> {
        match envelope.kind {
            MessageKind::Ping(_) => Some(MessageKind::Pong(Heartbeat::default())),
            MessageKind::SessionInit(init) => {
                let session_id = init.session_id.unwrap_or_else(SessionId::new_uuid);
                info!(session_id = %session_id, project = %init.project_path, "session opened");
                self.session = Some(session_id.clone());
                Some(MessageKind::SessionReady(SessionReady {
                    session_id,
                    history: Vec::new(),
                }))
            }
            MessageKind::SessionEnd(end) => {
                info!(session_id = %end.session_id, "session ended");
                if self.session.as_ref() == Some(&end.session_id) {
                    self.session = None;
                }
                None
            }
            MessageKind::ToolCall(call) => Some(MessageKind::ToolResult(self.call(call))),
            MessageKind::ConfirmRequest(request) => {
                info!(
                    confirm_id = %request.confirm_id,
                    kind = %request.kind,
                    choice = decision.as_str(),
                    "answering confirmation"
                );
                Some(MessageKind::ConfirmResult(ConfirmResult {
                    confirm_id: request.confirm_id,
                    confirmed: decision != ConfirmChoice::Abandon,
                    note: None,
                    choice: Some(decision),
                }))
            }
            MessageKind::Progress(progress) => {
                info!(stage = %progress.stage, progress = progress.progress, "{}", progress.message);
                None
            }
            MessageKind::TaskComplete(complete) => {
                info!(task_id = %complete.task_id, success = complete.success, "{}", complete.message);
                None
            }
            MessageKind::Error(notice) => {
                warn!(code = ?notice.code, recoverable = notice.recoverable, "{}", notice.message);
                None
            }
            other => {
                debug!(kind = other.type_name(), "no reply");
                None
            }
        }
    }

    fn call(&mut self, call: ToolCall) -> ToolResult {
        let outcome = match ToolName::parse(&call.tool_name) {
            Some(tool) => self.run(tool, call.arguments),
            None => Err(format!("unknown tool {}", call.tool_name)),
        };
        match outcome {
            Ok(result) => ToolResult {
                request_id: call.request_id,
                tool_name: call.tool_name,
                success: true,
                result: Some(result),
                error: None,
            },
            Err(error) => {
                warn!(tool = %call.tool_name, %error, "tool failed");
                ToolResult {
                    request_id: call.request_id,
                    tool_name: call.tool_name,
                    success: false,
                    result: None,
                    error: Some(error),
                }
            }
        }
    }

    fn run(&mut self, tool: ToolName, arguments: Value) -> Result<Value, String> {
        match tool {
            ToolName::CompileShader => {
                let args: CompileShaderArgs = parse_args(arguments)?;
                let diagnostics = structural_diagnostics(&args.code);
                let report = CompileReport {
                    has_errors: diagnostics.iter().any(|d| d.is_error()),
                    diagnostics,
                };
                info!(shader = %args.name, errors = report.errors().count(), "compiled");
                to_value(&report)
            }
            ToolName::SaveShader => {
                let args: SaveShaderArgs = parse_args(arguments)?;
                let path = format!(
                    "{}/{}.shader",
                    args.output_directory.trim_end_matches('/'),
                    file_stem(&args.name)
                );
                to_value(&SavedAsset { path })
            }
            ToolName::CreateMaterial => {
                let args: CreateMaterialArgs = parse_args(arguments)?;
                let (directory, shader_file) = args
                    .shader_path
                    .rsplit_once('/')
                    .unwrap_or(("", args.shader_path.as_str()));
                let name = args
                    .material_name
                    .clone()
                    .unwrap_or_else(|| shader_file.trim_end_matches(".shader").to_owned());
                let path = if directory.is_empty() {
                    format!("{name}.mat")
                } else {
                    format!("{directory}/{name}.mat")
                };
                to_value(&SavedAsset { path })
            }
            ToolName::ApplyToPreview => {
                let args: ApplyToPreviewArgs = parse_args(arguments)?;
                self.material = Some(args.material_path);
                Ok(json!({
                    "applied": true,
                    "object": self.current_object,
                    "material": self.material,
                }))
            }
            ToolName::CaptureScreenshot => {
                let args: CaptureScreenshotArgs = parse_args(arguments)?;
                to_value(&Screenshot {
                    image: String::new(),
                    width: args.width.unwrap_or(self.config.screenshot_width),
                    height: args.height.unwrap_or(self.config.screenshot_height),
                })
            }
            ToolName::ListPreviewObjects => to_value(&PreviewObjects {
                objects: self.config.preview_objects.clone(),
                current: self.current_object.clone(),
            }),
            ToolName::SwitchPreviewObject => {
                let args: SwitchPreviewObjectArgs = parse_args(arguments)?;
                if !self.config.preview_objects.contains(&args.object_name) {
                    return Err(format!("no preview object named {}", args.object_name));
                }
                self.current_object = Some(args.object_name);
                Ok(json!({}))
            }
            ToolName::SetBackground => {
                let args: SetBackgroundArgs = parse_args(arguments)?;
                if !is_hex_color(&args.color) {
                    return Err(format!("not a #rrggbb color: {}", args.color));
                }
                self.background = args.color;
                Ok(json!({ "background": self.background }))
            }
        }
    }
}

fn parse_args<T: DeserializeOwned>(arguments: Value) -> Result<T, String> {
    let arguments = if arguments.is_null() { json!({}) } else { arguments };
    serde_json::from_value(arguments).map_err(|error| format!("invalid arguments: {error}"))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|error| error.to_string())
}

/// `Custom/Glow Rim` -> `Glow_Rim`.
fn file_stem(shader_name: &str) -> String {
    let last = shader_name.rsplit('/').next().unwrap_or(shader_name);
    let stem: String = last
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    if stem.is_empty() {
        "Shader".to_owned()
    } else {
        stem
    }
}

fn is_hex_color(color: &str) -> bool {
    color
        .strip_prefix('#')
        .is_some_and(|hex| matches!(hex.len(), 6 | 8) && hex.chars().all(|c| c.is_ascii_hexdigit()))
}
