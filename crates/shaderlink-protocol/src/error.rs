//! Error types shared by every shaderlink crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::ids::{RequestId, SessionId, TaskId};

/// Error codes surfaced to the user-facing layer in `Error` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    CompileFailed,
    LlmError,
    Timeout,
    InvalidInput,
    FileError,
    ConnectionError,
    #[default]
    InternalError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CompileFailed => "COMPILE_FAILED",
            Self::LlmError => "LLM_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::InvalidInput => "INVALID_INPUT",
            Self::FileError => "FILE_ERROR",
            Self::ConnectionError => "CONNECTION_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("invalid session config: {0}")]
    InvalidConfig(String),
    #[error("not connected")]
    NotConnected,
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("duplicate request id registered: {0}")]
    DuplicateRequest(RequestId),
    #[error("session unavailable: {0}")]
    SessionUnavailable(String),
    #[error("no active session")]
    NoActiveSession,
    #[error("session {0} is not active")]
    SessionNotActive(SessionId),
    #[error("unknown task: {0}")]
    UnknownTask(TaskId),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("generator error: {0}")]
    Generator(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("{0} timed out")]
    Timeout(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("tool {tool} failed: {message}")]
    ToolFailed { tool: String, message: String },
}

impl LinkError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidConfig(_) | Self::InvalidInput(_) => ErrorCode::InvalidInput,
            Self::NotConnected
            | Self::ConnectFailed(_)
            | Self::SessionUnavailable(_)
            | Self::Transport(_) => ErrorCode::ConnectionError,
            Self::Generator(_) => ErrorCode::LlmError,
            Self::Io(_) | Self::ToolFailed { .. } => ErrorCode::FileError,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::DuplicateRequest(_)
            | Self::NoActiveSession
            | Self::SessionNotActive(_)
            | Self::UnknownTask(_)
            | Self::Serialization(_)
            | Self::InvalidState(_)
            | Self::Cancelled(_) => ErrorCode::InternalError,
        }
    }

    /// Faults of the link rather than of the work: a retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::ConnectFailed(_) | Self::Transport(_) | Self::Timeout(_)
        )
    }

    /// Caller bugs that must not be swallowed or retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DuplicateRequest(_) | Self::InvalidConfig(_))
    }
}

pub type LinkResult<T> = Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_use_wire_spelling() {
        let json = serde_json::to_string(&ErrorCode::CompileFailed).unwrap();
        assert_eq!(json, "\"COMPILE_FAILED\"");
        let back: ErrorCode = serde_json::from_str("\"CONNECTION_ERROR\"").unwrap();
        assert_eq!(back, ErrorCode::ConnectionError);
        assert_eq!(ErrorCode::LlmError.to_string(), "LLM_ERROR");
    }

    #[test]
    fn only_caller_bugs_are_fatal() {
        assert!(LinkError::DuplicateRequest(RequestId::from("r")).is_fatal());
        assert!(LinkError::InvalidConfig("x".into()).is_fatal());
        assert!(!LinkError::NotConnected.is_fatal());
        assert_eq!(LinkError::NotConnected.code(), ErrorCode::ConnectionError);
    }

    #[test]
    fn timeouts_are_transient_tool_failures_are_not() {
        let timeout = LinkError::Timeout("compile_shader".into());
        assert!(timeout.is_transient());
        assert_eq!(timeout.code(), ErrorCode::Timeout);
        let failed = LinkError::ToolFailed {
            tool: "save_shader".into(),
            message: "disk full".into(),
        };
        assert!(!failed.is_transient());
        assert_eq!(failed.code(), ErrorCode::FileError);
    }
}
