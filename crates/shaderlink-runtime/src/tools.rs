//! Client for the tools the peer hosts. Each call is a `ToolCall` frame
//! whose `ToolResult` comes back through the correlation registry.

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use shaderlink_connection::ConnectionManager;
use shaderlink_correlation::{CallOutcome, PendingReply};
use shaderlink_protocol::{
    ApplyToPreviewArgs, CaptureScreenshotArgs, CompileReport, CompileShaderArgs,
    CreateMaterialArgs, Envelope, LinkError, LinkResult, MessageKind, PreviewObjects, RequestId,
    SaveShaderArgs, SavedAsset, Screenshot, SetBackgroundArgs, SwitchPreviewObjectArgs, ToolCall,
    ToolName,
};
use tracing::{debug, instrument, warn};

#[derive(Clone)]
pub struct RemoteTools {
    connection: ConnectionManager,
    call_timeout: Duration,
}

/// A tool call that has been sent and is waiting for its result.
pub struct InFlightCall {
    tool: ToolName,
    reply: PendingReply<Envelope>,
}

impl InFlightCall {
    pub fn request_id(&self) -> &RequestId {
        self.reply.request_id()
    }

    pub async fn finish(self) -> LinkResult<Value> {
        let tool = self.tool;
        match self.reply.wait().await {
            CallOutcome::Resolved(envelope) => tool_value(tool, envelope),
            CallOutcome::TimedOut => Err(LinkError::Timeout(tool.to_string())),
            CallOutcome::Cancelled(reason) => Err(LinkError::Cancelled(reason.to_string())),
        }
    }
}

fn tool_value(tool: ToolName, envelope: Envelope) -> LinkResult<Value> {
    match envelope.kind {
        MessageKind::ToolResult(result) if result.success => Ok(result.result.unwrap_or(Value::Null)),
        MessageKind::ToolResult(result) => Err(LinkError::ToolFailed {
            tool: tool.to_string(),
            message: result
                .error
                .unwrap_or_else(|| "peer reported failure without a message".to_owned()),
        }),
        other => Err(LinkError::InvalidState(format!(
            "{} arrived under the request id of {tool}",
            other.type_name()
        ))),
    }
}

fn parse_result<R: DeserializeOwned>(tool: ToolName, value: Value) -> LinkResult<R> {
    // Peers may omit `result` entirely; typed results all default cleanly.
    let value = if value.is_null() {
        Value::Object(Default::default())
    } else {
        value
    };
    serde_json::from_value(value)
        .map_err(|error| LinkError::Serialization(format!("{tool} result: {error}")))
}

impl RemoteTools {
    pub fn new(connection: ConnectionManager, call_timeout: Duration) -> Self {
        Self {
            connection,
            call_timeout,
        }
    }

    /// Send a `ToolCall` and register for its result. `timeout` bounds both
    /// the wait for a usable connection and the wait for the reply.
    #[instrument(skip(self, arguments), fields(tool = %tool))]
    pub async fn begin<A: Serialize>(
        &self,
        tool: ToolName,
        arguments: &A,
        timeout: Duration,
    ) -> LinkResult<InFlightCall> {
        let arguments = serde_json::to_value(arguments)
            .map_err(|error| LinkError::Serialization(error.to_string()))?;
        if !self.connection.wait_connected(timeout).await {
            warn!("no connection for tool call");
            return Err(LinkError::NotConnected);
        }

        let request_id = RequestId::new_uuid();
        let reply = self
            .connection
            .registry()
            .register(request_id.clone(), tool.as_str(), Some(timeout))?;
        self.connection
            .send_kind(MessageKind::ToolCall(ToolCall {
                request_id: request_id.clone(),
                tool_name: tool.as_str().to_owned(),
                arguments,
            }))
            .await?;
        debug!(request_id = %request_id, "tool call sent");
        Ok(InFlightCall { tool, reply })
    }

    pub async fn call<A: Serialize, R: DeserializeOwned>(
        &self,
        tool: ToolName,
        arguments: &A,
    ) -> LinkResult<R> {
        let value = self
            .begin(tool, arguments, self.call_timeout)
            .await?
            .finish()
            .await?;
        parse_result(tool, value)
    }

    async fn call_unit<A: Serialize>(&self, tool: ToolName, arguments: &A) -> LinkResult<()> {
        self.begin(tool, arguments, self.call_timeout)
            .await?
            .finish()
            .await
            .map(drop)
    }

    pub async fn compile_shader(&self, code: &str, name: &str) -> LinkResult<CompileReport> {
        let args = CompileShaderArgs {
            code: code.to_owned(),
            name: name.to_owned(),
        };
        self.call(ToolName::CompileShader, &args).await
    }

    pub async fn save_shader(&self, args: &SaveShaderArgs) -> LinkResult<SavedAsset> {
        self.call(ToolName::SaveShader, args).await
    }

    pub async fn create_material(&self, args: &CreateMaterialArgs) -> LinkResult<SavedAsset> {
        self.call(ToolName::CreateMaterial, args).await
    }

    pub async fn apply_to_preview(&self, material_path: &str) -> LinkResult<()> {
        let args = ApplyToPreviewArgs {
            material_path: material_path.to_owned(),
        };
        self.call_unit(ToolName::ApplyToPreview, &args).await
    }

    pub async fn capture_screenshot(&self, args: &CaptureScreenshotArgs) -> LinkResult<Screenshot> {
        self.call(ToolName::CaptureScreenshot, args).await
    }

    pub async fn list_preview_objects(&self) -> LinkResult<PreviewObjects> {
        self.call(ToolName::ListPreviewObjects, &serde_json::json!({}))
            .await
    }

    pub async fn switch_preview_object(&self, object_name: &str) -> LinkResult<()> {
        let args = SwitchPreviewObjectArgs {
            object_name: object_name.to_owned(),
        };
        self.call_unit(ToolName::SwitchPreviewObject, &args).await
    }

    pub async fn set_background(&self, color: &str) -> LinkResult<()> {
        let args = SetBackgroundArgs {
            color: color.to_owned(),
        };
        self.call_unit(ToolName::SetBackground, &args).await
    }
}
