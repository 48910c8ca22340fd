//! # shaderlink-protocol
//!
//! Contract crate for the shaderlink control plane: everything two endpoints
//! must agree on, with no runtime dependencies.
//!
//! - [`ids`]: typed ids (MessageId, SessionId, TaskId, RequestId)
//! - [`message`]: Envelope + MessageKind catalogue (forward-compatible)
//! - [`codec`]: text-frame encode/decode
//! - [`config`]: SessionConfig, ConnectionConfig
//! - [`tool`]: remote tool catalogue and compile reports
//! - [`shader`]: shader source helpers
//! - [`ports`]: generator boundary
//! - [`task`]: task status and failure reasons
//! - [`error`]: LinkError, ErrorCode

pub mod codec;
pub mod config;
pub mod error;
pub mod ids;
pub mod message;
pub mod ports;
pub mod shader;
pub mod task;
pub mod tool;

pub use codec::{DecodeError, EncodeError, decode, encode, encode_kind};
pub use config::{ConnectionConfig, MAX_RETRY_COUNT, MIN_RETRY_COUNT, ModelConfig, SessionConfig};
pub use error::{ErrorCode, LinkError, LinkResult};
pub use ids::{MessageId, RequestId, SessionId, TaskId};
pub use message::{
    CancelTask, ConfirmChoice, ConfirmRequest, ConfirmResult, Direction, Envelope, ErrorNotice,
    Heartbeat, HistoryEntry, HistoryRole, MessageKind, Progress, SessionEnd, SessionInit,
    SessionReady, ShaderPreview, StreamChunk, TaskComplete, Thinking, ToolCall, ToolResult,
    UserRequest,
};
pub use ports::{GeneratedShader, GenerationRequest, ShaderGenerator};
pub use task::{FailureReason, TaskStatus};
pub use shader::{
    DEFAULT_SHADER_NAME, extract_shader_code, extract_shader_name, shader_name_or_default,
    structural_diagnostics,
};
pub use tool::{
    ApplyToPreviewArgs, CaptureScreenshotArgs, CompileReport, CompileShaderArgs,
    CreateMaterialArgs, Diagnostic, PreviewObjects, SaveShaderArgs, SavedAsset, Screenshot,
    SetBackgroundArgs, Severity, SwitchPreviewObjectArgs, ToolName,
};
