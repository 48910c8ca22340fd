//! Boundary to the external code generator.
//!
//! The generator is opaque to shaderlink: it turns a requirement (plus the
//! previous attempt and its diagnostics when repairing) into shader source.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LinkResult;
use crate::ids::{SessionId, TaskId};
use crate::tool::Diagnostic;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub session_id: SessionId,
    pub task_id: TaskId,
    pub requirement: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    /// 1-based attempt number.
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_code: Option<String>,
    /// Diagnostics from the previous attempt only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
}

impl GenerationRequest {
    pub fn is_repair(&self) -> bool {
        self.previous_code.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedShader {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl GeneratedShader {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: None,
        }
    }
}

#[async_trait]
pub trait ShaderGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> LinkResult<GeneratedShader>;
}
