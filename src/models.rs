//! Core data models for the financial assistant

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use uuid::Uuid;

/// Untyped argument/result object exchanged with tools and the model.
pub type JsonMap = Map<String, Value>;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
    ToolResult,
}

/// Lifecycle of a turn. Only `Streaming` turns may still change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Streaming,
    Complete,
    Interrupted,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    AwaitingModel,
    ExecutingTools,
    Error,
}

//
// ================= Tool I/O =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// `<transcript length at assignment>-<index>`, unique within a session
    pub call_id: String,
    pub name: String,
    pub args: JsonMap,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success(JsonMap),
    Failure(String),
    /// Abort marker for a call interrupted by cancellation
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    pub outcome: ToolOutcome,
}

impl ToolResult {
    pub fn success(call: &ToolCall, data: JsonMap) -> Self {
        Self {
            call_id: call.call_id.clone(),
            name: call.name.clone(),
            outcome: ToolOutcome::Success(data),
        }
    }

    pub fn failure(call: &ToolCall, message: impl Into<String>) -> Self {
        Self {
            call_id: call.call_id.clone(),
            name: call.name.clone(),
            outcome: ToolOutcome::Failure(message.into()),
        }
    }

    pub fn aborted(call: &ToolCall) -> Self {
        Self {
            call_id: call.call_id.clone(),
            name: call.name.clone(),
            outcome: ToolOutcome::Aborted,
        }
    }

    pub fn is_error(&self) -> bool {
        !matches!(self.outcome, ToolOutcome::Success(_))
    }

    /// The object handed back to the model for this call.
    pub fn payload(&self) -> Value {
        match &self.outcome {
            ToolOutcome::Success(data) => Value::Object(data.clone()),
            ToolOutcome::Failure(message) => json!({ "error": message }),
            ToolOutcome::Aborted => json!({ "error": "Tool call aborted", "aborted": true }),
        }
    }
}

/// Tool description handed to the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

//
// ================= Turns =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Part {
    Text(String),
    ToolCall(ToolCall),
    ToolResult(ToolResult),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: Uuid,
    pub role: Role,
    pub parts: Vec<Part>,
    pub timestamp: DateTime<Utc>,
    pub state: TurnState,
}

impl Turn {
    fn new(role: Role, parts: Vec<Part>, state: TurnState) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            parts,
            timestamp: Utc::now(),
            state,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::Text(text.into())], TurnState::Complete)
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self::new(Role::Model, vec![Part::Text(text.into())], TurnState::Complete)
    }

    pub fn model_tool_calls(calls: Vec<ToolCall>) -> Self {
        let parts = calls.into_iter().map(Part::ToolCall).collect();
        Self::new(Role::Model, parts, TurnState::Complete)
    }

    pub fn tool_result(result: ToolResult) -> Self {
        Self::new(Role::ToolResult, vec![Part::ToolResult(result)], TurnState::Complete)
    }

    /// An empty model turn that receives text deltas until finalized
    pub fn streaming_model() -> Self {
        Self::new(Role::Model, vec![Part::Text(String::new())], TurnState::Streaming)
    }

    pub fn is_complete(&self) -> bool {
        self.state == TurnState::Complete
    }

    /// Concatenated text parts
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.parts.iter().filter_map(|p| match p {
            Part::ToolCall(call) => Some(call),
            _ => None,
        })
    }

    pub fn tool_results(&self) -> impl Iterator<Item = &ToolResult> {
        self.parts.iter().filter_map(|p| match p {
            Part::ToolResult(result) => Some(result),
            _ => None,
        })
    }
}

//
// ================= Model Exchange =================
//

/// A tool invocation as requested by the model, before a call id is assigned
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestedCall {
    pub name: String,
    #[serde(default)]
    pub args: JsonMap,
}

impl RequestedCall {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        let args = match args {
            Value::Object(map) => map,
            _ => JsonMap::new(),
        };
        Self {
            name: name.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelResponse {
    FinalAnswer { text: String },
    ToolCallsRequested { calls: Vec<RequestedCall> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta { chunk: String },
    Completed(ModelResponse),
}

/// Everything the gateway needs for one model call
#[derive(Debug, Clone)]
pub struct ModelRequest {
    /// Finalized turns preceding `new_input`
    pub history: Vec<Turn>,
    pub tools: Vec<ToolDescriptor>,
    pub new_input: Vec<Part>,
}

//
// ================= Final Result =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutput {
    pub session_id: Uuid,
    pub answer: String,
    pub tool_rounds: u32,
    pub turns_appended: usize,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::User => "User",
            Role::Model => "Model",
            Role::ToolResult => "ToolResult",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Idle => "idle",
            SessionStatus::AwaitingModel => "awaiting_model",
            SessionStatus::ExecutingTools => "executing_tools",
            SessionStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}
