use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

use crate::constants::DONE_MARKER;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ToolCallId(pub String);

impl ToolCallId {
    pub fn new() -> Self {
        Self(format!("call_{}", Uuid::new_v4().simple()))
    }
}

impl Default for ToolCallId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(axum::http::StatusCode, String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Upstream stream ended before [DONE]")]
    IncompleteStream,

    #[error("Session aborted by client")]
    Aborted,

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

impl RelayError {
    /// Message carried by a downstream `error` event.
    pub fn event_message(&self) -> String {
        match self {
            RelayError::Upstream(status, body) => {
                format!("API Error ({}): {}", status.as_u16(), body)
            }
            RelayError::Network(e) => format!("Upstream request failed: {}", e),
            RelayError::Io(e) => format!("Upstream stream failed: {}", e),
            other => other.to_string(),
        }
    }
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        let (status, msg, code) = match &self.inner {
            RelayError::Config(m) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                m.clone(),
                "CONFIG_ERROR",
            ),
            RelayError::Upstream(s, m) => (*s, m.clone(), "UPSTREAM_ERROR"),
            RelayError::Network(e) => (
                axum::http::StatusCode::BAD_GATEWAY,
                e.to_string(),
                "NETWORK_ERROR",
            ),
            RelayError::Serialization(e) => (
                axum::http::StatusCode::BAD_REQUEST,
                e.to_string(),
                "SERIALIZATION_ERROR",
            ),
            RelayError::Io(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "IO_ERROR",
            ),
            RelayError::Tool(m) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                m.clone(),
                "TOOL_ERROR",
            ),
            RelayError::IncompleteStream => (
                axum::http::StatusCode::BAD_GATEWAY,
                self.inner.to_string(),
                "INCOMPLETE_STREAM",
            ),
            RelayError::Aborted => (
                axum::http::StatusCode::BAD_REQUEST,
                self.inner.to_string(),
                "ABORTED",
            ),
            RelayError::Internal(m, _) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                m.clone(),
                "INTERNAL_ERROR",
            ),
        };
        (
            status,
            axum::Json(serde_json::json!({
                "error": msg,
                "code": code,
            })),
        )
            .into_response()
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: RelayError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<RelayError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

/// --- CORE ROLES ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

/// A fully assembled tool call. `function.arguments` is only valid JSON once
/// the stream that produced it has finished.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "default_tool_type")]
    pub r#type: String,
    pub function: FunctionCall,
}

fn default_tool_type() -> String {
    "function".to_string()
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            r#type: default_tool_type(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    /// Identity of a call within one round.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.function.name, self.function.arguments)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolResult {
    pub role: Role,
    pub tool_call_id: String,
    pub content: String,
}

impl ToolResult {
    pub fn new(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            tool_call_id: tool_call_id.into(),
            content: content.into(),
        }
    }
}

/// --- RELAY -> CLIENT WIRE EVENTS ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Content(String),
    ToolCalls(Vec<ToolCall>),
    ToolResults(Vec<ToolResult>),
    Error(String),
    Done,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TypedEvent {
    Content { content: String },
    ToolCalls { tool_calls: Vec<ToolCall> },
    ToolResults { results: Vec<ToolResult> },
}

#[derive(Serialize, Deserialize)]
struct ErrorEvent {
    error: String,
}

impl RelayEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RelayEvent::Done)
    }

    /// Payload of the `data:` field for this event.
    pub fn to_data(&self) -> std::result::Result<String, serde_json::Error> {
        match self {
            RelayEvent::Done => Ok(DONE_MARKER.to_string()),
            RelayEvent::Error(error) => serde_json::to_string(&ErrorEvent {
                error: error.clone(),
            }),
            RelayEvent::Content(content) => serde_json::to_string(&TypedEvent::Content {
                content: content.clone(),
            }),
            RelayEvent::ToolCalls(calls) => serde_json::to_string(&TypedEvent::ToolCalls {
                tool_calls: calls.clone(),
            }),
            RelayEvent::ToolResults(results) => serde_json::to_string(&TypedEvent::ToolResults {
                results: results.clone(),
            }),
        }
    }

    /// Parses one `data:` payload. Unrecognised payloads yield `None`.
    pub fn from_data(data: &str) -> Option<Self> {
        if data == DONE_MARKER {
            return Some(RelayEvent::Done);
        }
        let value: serde_json::Value = serde_json::from_str(data).ok()?;
        if let Some(error) = value.get("error").and_then(|e| e.as_str()) {
            return Some(RelayEvent::Error(error.to_string()));
        }
        match serde_json::from_value::<TypedEvent>(value).ok()? {
            TypedEvent::Content { content } => Some(RelayEvent::Content(content)),
            TypedEvent::ToolCalls { tool_calls } => Some(RelayEvent::ToolCalls(tool_calls)),
            TypedEvent::ToolResults { results } => Some(RelayEvent::ToolResults(results)),
        }
    }
}

/// --- PROVIDER WIRE TYPES ---

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, Default)]
pub struct PulseDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ProviderToolCallDelta>>,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
pub struct ProviderPulseChoice {
    #[serde(default)]
    pub delta: PulseDelta,
    pub finish_reason: Option<String>,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
pub struct ProviderPulse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ProviderPulseChoice>,
}

impl ProviderPulse {
    /// Delta of the first choice, the only one a chat stream carries.
    pub fn delta(&self) -> Option<&PulseDelta> {
        self.choices.first().map(|c| &c.delta)
    }
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ProviderToolCallDelta {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<RawFunction>,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, PartialEq, Eq)]
pub struct RawFunction {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

#[derive(Debug)]
pub enum LineEvent {
    Done,
    Pulse(ProviderPulse),
    Unknown(String),
}

pub fn parse_provider_line(data: &str) -> LineEvent {
    if data == DONE_MARKER {
        return LineEvent::Done;
    }
    match serde_json::from_str::<ProviderPulse>(data) {
        Ok(pulse) => LineEvent::Pulse(pulse),
        Err(e) => {
            tracing::debug!(
                "[STREAM] Skipping malformed line ({}): {}",
                e,
                crate::str_utils::prefix_chars(data, 200)
            );
            LineEvent::Unknown(data.to_string())
        }
    }
}
