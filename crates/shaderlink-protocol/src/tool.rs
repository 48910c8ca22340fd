//! Remote tool catalogue: names, argument shapes and typed results.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Tools the peer executes on our behalf via `ToolCall`/`ToolResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    CompileShader,
    SaveShader,
    CreateMaterial,
    ApplyToPreview,
    CaptureScreenshot,
    ListPreviewObjects,
    SwitchPreviewObject,
    SetBackground,
}

impl ToolName {
    pub const ALL: [ToolName; 8] = [
        Self::CompileShader,
        Self::SaveShader,
        Self::CreateMaterial,
        Self::ApplyToPreview,
        Self::CaptureScreenshot,
        Self::ListPreviewObjects,
        Self::SwitchPreviewObject,
        Self::SetBackground,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CompileShader => "compile_shader",
            Self::SaveShader => "save_shader",
            Self::CreateMaterial => "create_material",
            Self::ApplyToPreview => "apply_to_preview",
            Self::CaptureScreenshot => "capture_screenshot",
            Self::ListPreviewObjects => "list_preview_objects",
            Self::SwitchPreviewObject => "switch_preview_object",
            Self::SetBackground => "set_background",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.as_str() == name)
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Diagnostic {
    pub line: u32,
    pub column: u32,
    pub message: String,
    pub severity: Severity,
}

impl Default for Diagnostic {
    fn default() -> Self {
        Self {
            line: 0,
            column: 0,
            message: String::new(),
            severity: Severity::Error,
        }
    }
}

impl Diagnostic {
    pub fn error(line: u32, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn warning(line: u32, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
            severity: Severity::Warning,
            ..Self::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

/// Result of `compile_shader`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CompileReport {
    pub has_errors: bool,
    pub diagnostics: Vec<Diagnostic>,
}

impl CompileReport {
    pub fn clean() -> Self {
        Self::default()
    }

    pub fn failed(diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            has_errors: true,
            diagnostics,
        }
    }

    /// Warnings alone never block; only errors do.
    pub fn is_blocking(&self) -> bool {
        self.has_errors || self.diagnostics.iter().any(Diagnostic::is_error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.is_error())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileShaderArgs {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveShaderArgs {
    pub code: String,
    pub name: String,
    pub output_directory: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMaterialArgs {
    pub shader_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub material_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyToPreviewArgs {
    pub material_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CaptureScreenshotArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchPreviewObjectArgs {
    pub object_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetBackgroundArgs {
    pub color: String,
}

/// Result of `save_shader` and `create_material`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SavedAsset {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Screenshot {
    /// Base64 encoded PNG.
    pub image: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewObjects {
    pub objects: Vec<String>,
    pub current: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_names_round_trip_through_wire_spelling() {
        for tool in ToolName::ALL {
            assert_eq!(ToolName::parse(tool.as_str()), Some(tool));
            let json = serde_json::to_string(&tool).unwrap();
            assert_eq!(json, format!("\"{}\"", tool.as_str()));
        }
        assert_eq!(ToolName::parse("format_disk"), None);
    }

    #[test]
    fn warnings_alone_do_not_block() {
        let report = CompileReport {
            has_errors: false,
            diagnostics: vec![Diagnostic::warning(3, "implicit truncation")],
        };
        assert!(!report.is_blocking());
        assert_eq!(report.errors().count(), 0);
    }

    #[test]
    fn error_diagnostic_blocks_even_without_flag() {
        let report = CompileReport {
            has_errors: false,
            diagnostics: vec![Diagnostic::error(12, "undeclared identifier 'uv'")],
        };
        assert!(report.is_blocking());
    }

    #[test]
    fn compile_report_tolerates_sparse_payloads() {
        let report: CompileReport = serde_json::from_str(
            r#"{"hasErrors":true,"diagnostics":[{"line":4,"message":"syntax error"}]}"#,
        )
        .unwrap();
        assert!(report.is_blocking());
        assert_eq!(report.diagnostics[0].column, 0);
        assert_eq!(report.diagnostics[0].severity, Severity::Error);
    }
}
