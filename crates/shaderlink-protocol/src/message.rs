//! Envelope and the closed message catalogue.
//!
//! Every frame is `{id, type, timestamp, payload}`. `type` selects a
//! [`MessageKind`] variant; unrecognised types decode into
//! [`MessageKind::Unknown`] so newer peers never break older ones.
//!
//! Payload fields that say what a message is about (request, confirm,
//! session or task ids) are required. Every other field falls back to a
//! typed default when it is absent or has the wrong shape, and a known kind
//! whose payload is not an object decodes as if it were `{}`.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::ser::SerializeStruct;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::config::SessionConfig;
use crate::error::ErrorCode;
use crate::ids::{MessageId, RequestId, SessionId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToPeer,
    PeerToClient,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub id: MessageId,
    #[serde(flatten)]
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            id: MessageId::new_uuid(),
            kind,
            timestamp: Utc::now(),
        }
    }

    /// Key under which a pending call waits for this message, if any.
    pub fn correlation_key(&self) -> Option<RequestId> {
        match &self.kind {
            MessageKind::ToolResult(p) => Some(p.request_id.clone()),
            MessageKind::ConfirmResult(p) => Some(p.confirm_id.clone()),
            MessageKind::SessionReady(p) => Some(RequestId::for_session(&p.session_id)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum MessageKind {
    // client -> peer
    SessionInit(SessionInit),
    UserRequest(UserRequest),
    ToolResult(ToolResult),
    ConfirmResult(ConfirmResult),
    CancelTask(CancelTask),
    SessionEnd(SessionEnd),
    Ping(Heartbeat),
    // peer -> client
    SessionReady(SessionReady),
    Thinking(Thinking),
    StreamChunk(StreamChunk),
    ToolCall(ToolCall),
    Progress(Progress),
    ConfirmRequest(ConfirmRequest),
    TaskComplete(TaskComplete),
    Error(ErrorNotice),
    ShaderPreview(ShaderPreview),
    Pong(Heartbeat),
    /// A `type` this build does not know. Carried verbatim and ignored.
    Unknown { kind: String, payload: Value },
}

impl MessageKind {
    pub fn type_name(&self) -> &str {
        match self {
            Self::SessionInit(_) => "SessionInit",
            Self::UserRequest(_) => "UserRequest",
            Self::ToolResult(_) => "ToolResult",
            Self::ConfirmResult(_) => "ConfirmResult",
            Self::CancelTask(_) => "CancelTask",
            Self::SessionEnd(_) => "SessionEnd",
            Self::Ping(_) => "Ping",
            Self::SessionReady(_) => "SessionReady",
            Self::Thinking(_) => "Thinking",
            Self::StreamChunk(_) => "StreamChunk",
            Self::ToolCall(_) => "ToolCall",
            Self::Progress(_) => "Progress",
            Self::ConfirmRequest(_) => "ConfirmRequest",
            Self::TaskComplete(_) => "TaskComplete",
            Self::Error(_) => "Error",
            Self::ShaderPreview(_) => "ShaderPreview",
            Self::Pong(_) => "Pong",
            Self::Unknown { kind, .. } => kind,
        }
    }

    pub fn direction(&self) -> Option<Direction> {
        match self {
            Self::SessionInit(_)
            | Self::UserRequest(_)
            | Self::ToolResult(_)
            | Self::ConfirmResult(_)
            | Self::CancelTask(_)
            | Self::SessionEnd(_)
            | Self::Ping(_) => Some(Direction::ClientToPeer),
            Self::SessionReady(_)
            | Self::Thinking(_)
            | Self::StreamChunk(_)
            | Self::ToolCall(_)
            | Self::Progress(_)
            | Self::ConfirmRequest(_)
            | Self::TaskComplete(_)
            | Self::Error(_)
            | Self::ShaderPreview(_)
            | Self::Pong(_) => Some(Direction::PeerToClient),
            Self::Unknown { .. } => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown { .. })
    }

    /// Build a variant from a wire `type` and its payload object.
    pub fn from_parts(kind: &str, payload: Value) -> Result<Self, serde_json::Error> {
        let payload = match payload {
            Value::Object(_) => payload,
            _ if KNOWN_TYPES.contains(&kind) => Value::Object(Map::new()),
            other => other,
        };
        Ok(match kind {
            "SessionInit" => Self::SessionInit(serde_json::from_value(payload)?),
            "UserRequest" => Self::UserRequest(serde_json::from_value(payload)?),
            "ToolResult" => Self::ToolResult(serde_json::from_value(payload)?),
            "ConfirmResult" => Self::ConfirmResult(serde_json::from_value(payload)?),
            "CancelTask" => Self::CancelTask(serde_json::from_value(payload)?),
            "SessionEnd" => Self::SessionEnd(serde_json::from_value(payload)?),
            "Ping" => Self::Ping(serde_json::from_value(payload)?),
            "SessionReady" => Self::SessionReady(serde_json::from_value(payload)?),
            "Thinking" => Self::Thinking(serde_json::from_value(payload)?),
            "StreamChunk" => Self::StreamChunk(serde_json::from_value(payload)?),
            "ToolCall" => Self::ToolCall(serde_json::from_value(payload)?),
            "Progress" => Self::Progress(serde_json::from_value(payload)?),
            "ConfirmRequest" => Self::ConfirmRequest(serde_json::from_value(payload)?),
            "TaskComplete" => Self::TaskComplete(serde_json::from_value(payload)?),
            "Error" => Self::Error(serde_json::from_value(payload)?),
            "ShaderPreview" => Self::ShaderPreview(serde_json::from_value(payload)?),
            "Pong" => Self::Pong(serde_json::from_value(payload)?),
            other => Self::Unknown {
                kind: other.to_owned(),
                payload,
            },
        })
    }
}

const KNOWN_TYPES: [&str; 17] = [
    "SessionInit",
    "UserRequest",
    "ToolResult",
    "ConfirmResult",
    "CancelTask",
    "SessionEnd",
    "Ping",
    "SessionReady",
    "Thinking",
    "StreamChunk",
    "ToolCall",
    "Progress",
    "ConfirmRequest",
    "TaskComplete",
    "Error",
    "ShaderPreview",
    "Pong",
];

/// Deserialize a field, falling back to its default when the value has the
/// wrong shape.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

impl Serialize for MessageKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("MessageKind", 2)?;
        state.serialize_field("type", self.type_name())?;
        match self {
            Self::SessionInit(p) => state.serialize_field("payload", p)?,
            Self::UserRequest(p) => state.serialize_field("payload", p)?,
            Self::ToolResult(p) => state.serialize_field("payload", p)?,
            Self::ConfirmResult(p) => state.serialize_field("payload", p)?,
            Self::CancelTask(p) => state.serialize_field("payload", p)?,
            Self::SessionEnd(p) => state.serialize_field("payload", p)?,
            Self::Ping(p) | Self::Pong(p) => state.serialize_field("payload", p)?,
            Self::SessionReady(p) => state.serialize_field("payload", p)?,
            Self::Thinking(p) => state.serialize_field("payload", p)?,
            Self::StreamChunk(p) => state.serialize_field("payload", p)?,
            Self::ToolCall(p) => state.serialize_field("payload", p)?,
            Self::Progress(p) => state.serialize_field("payload", p)?,
            Self::ConfirmRequest(p) => state.serialize_field("payload", p)?,
            Self::TaskComplete(p) => state.serialize_field("payload", p)?,
            Self::Error(p) => state.serialize_field("payload", p)?,
            Self::ShaderPreview(p) => state.serialize_field("payload", p)?,
            Self::Unknown { payload, .. } => state.serialize_field("payload", payload)?,
        }
        state.end()
    }
}

// ---- client -> peer payloads -------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInit {
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, deserialize_with = "lenient")]
    pub project_path: String,
    #[serde(default, deserialize_with = "lenient")]
    pub config: SessionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRequest {
    pub session_id: SessionId,
    #[serde(default, deserialize_with = "lenient")]
    pub content: String,
    /// Reference images, base64 encoded.
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub request_id: RequestId,
    #[serde(default, deserialize_with = "lenient")]
    pub tool_name: String,
    #[serde(default, deserialize_with = "lenient")]
    pub success: bool,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmChoice {
    Continue,
    Accept,
    Abandon,
}

impl ConfirmChoice {
    pub const OPTIONS: [ConfirmChoice; 3] = [Self::Continue, Self::Accept, Self::Abandon];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Accept => "accept",
            Self::Abandon => "abandon",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmResult {
    pub confirm_id: RequestId,
    #[serde(default, deserialize_with = "lenient")]
    pub confirmed: bool,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Which of the offered options was picked. Older peers only send
    /// `confirmed`, which maps to continue/abandon.
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub choice: Option<ConfirmChoice>,
}

impl ConfirmResult {
    pub fn choice(&self) -> ConfirmChoice {
        match (self.choice, self.confirmed) {
            (Some(choice), _) => choice,
            (None, true) => ConfirmChoice::Continue,
            (None, false) => ConfirmChoice::Abandon,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelTask {
    pub task_id: TaskId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEnd {
    pub session_id: SessionId,
}

/// Empty body of `Ping` and `Pong`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Heartbeat {}

// ---- peer -> client payloads -------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryRole {
    #[default]
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryEntry {
    #[serde(deserialize_with = "lenient")]
    pub sequence: u64,
    #[serde(deserialize_with = "lenient")]
    pub role: HistoryRole,
    #[serde(deserialize_with = "lenient")]
    pub content: String,
    #[serde(deserialize_with = "lenient")]
    pub at: DateTime<Utc>,
}

impl Default for HistoryEntry {
    fn default() -> Self {
        Self {
            sequence: 0,
            role: HistoryRole::User,
            content: String::new(),
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReady {
    pub session_id: SessionId,
    #[serde(default, deserialize_with = "lenient")]
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thinking {
    pub task_id: TaskId,
    #[serde(default, deserialize_with = "lenient")]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChunk {
    pub task_id: TaskId,
    #[serde(default, deserialize_with = "lenient")]
    pub delta: String,
    #[serde(default, deserialize_with = "lenient")]
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub request_id: RequestId,
    #[serde(default, deserialize_with = "lenient")]
    pub tool_name: String,
    #[serde(default, deserialize_with = "lenient")]
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub task_id: TaskId,
    #[serde(default, deserialize_with = "lenient")]
    pub stage: String,
    /// Fraction in `[0, 1]`.
    #[serde(default, deserialize_with = "lenient")]
    pub progress: f32,
    #[serde(default, deserialize_with = "lenient")]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmRequest {
    pub confirm_id: RequestId,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, deserialize_with = "lenient")]
    pub kind: String,
    #[serde(default, deserialize_with = "lenient")]
    pub message: String,
    #[serde(default, deserialize_with = "lenient")]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskComplete {
    pub task_id: TaskId,
    #[serde(default, deserialize_with = "lenient")]
    pub success: bool,
    #[serde(default, deserialize_with = "lenient")]
    pub artifacts: IndexMap<String, String>,
    #[serde(default, deserialize_with = "lenient")]
    pub message: String,
}

/// Body of an `Error` message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ErrorNotice {
    #[serde(deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(deserialize_with = "lenient")]
    pub code: ErrorCode,
    #[serde(deserialize_with = "lenient")]
    pub message: String,
    #[serde(deserialize_with = "lenient")]
    pub recoverable: bool,
    #[serde(deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShaderPreview {
    pub task_id: TaskId,
    #[serde(default, deserialize_with = "lenient")]
    pub attempt: u32,
    #[serde(default, deserialize_with = "lenient")]
    pub shader_name: String,
    #[serde(default, deserialize_with = "lenient")]
    pub code: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_serializes_flat() {
        let envelope = Envelope::new(MessageKind::CancelTask(CancelTask {
            task_id: TaskId::from("task-1"),
        }));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "CancelTask");
        assert_eq!(value["payload"]["taskId"], "task-1");
        assert!(value["id"].is_string());
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn unknown_kind_keeps_its_type_and_payload() {
        let kind = MessageKind::from_parts("Telemetry", json!({"fps": 60})).unwrap();
        assert!(kind.is_unknown());
        assert_eq!(kind.type_name(), "Telemetry");
        assert_eq!(kind.direction(), None);
    }

    #[test]
    fn correlation_keys_cover_every_reply_kind() {
        let tool = Envelope::new(MessageKind::ToolResult(ToolResult {
            request_id: RequestId::from("r1"),
            tool_name: "compile_shader".into(),
            success: true,
            result: None,
            error: None,
        }));
        assert_eq!(tool.correlation_key(), Some(RequestId::from("r1")));

        let ready = Envelope::new(MessageKind::SessionReady(SessionReady {
            session_id: SessionId::from("s1"),
            history: Vec::new(),
        }));
        assert_eq!(ready.correlation_key(), Some(RequestId::from("s1")));

        let ping = Envelope::new(MessageKind::Ping(Heartbeat::default()));
        assert_eq!(ping.correlation_key(), None);
    }

    #[test]
    fn confirm_result_without_choice_maps_from_flag() {
        let accepted: ConfirmResult =
            serde_json::from_value(json!({"confirmId": "c", "confirmed": true})).unwrap();
        assert_eq!(accepted.choice(), ConfirmChoice::Continue);
        let declined: ConfirmResult = serde_json::from_value(json!({"confirmId": "c"})).unwrap();
        assert_eq!(declined.choice(), ConfirmChoice::Abandon);
        let explicit: ConfirmResult = serde_json::from_value(
            json!({"confirmId": "c", "confirmed": true, "choice": "accept"}),
        )
        .unwrap();
        assert_eq!(explicit.choice(), ConfirmChoice::Accept);
    }

    #[test]
    fn catalogue_directions() {
        let ping = MessageKind::Ping(Heartbeat::default());
        let pong = MessageKind::Pong(Heartbeat::default());
        assert_eq!(ping.direction(), Some(Direction::ClientToPeer));
        assert_eq!(pong.direction(), Some(Direction::PeerToClient));
    }
}
