use cc_domain::error::ErrorClass;
use cc_domain::stream::Usage;
use cc_domain::tool::ToolCall;
use serde::Serialize;

/// An event pushed into a Stream Entry. The union is closed: every kind
/// that reaches a subscriber is one of these variants, tagged by `type` on
/// the wire so the Tool Loop dispatcher can match exhaustively.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "token")]
    Token { text: String },

    #[serde(rename = "tool_call")]
    ToolCall {
        call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        call_id: String,
        output: String,
        is_error: bool,
    },

    #[serde(rename = "usage")]
    Usage { usage: Usage },

    #[serde(rename = "debug")]
    Debug { request: serde_json::Value },

    #[serde(rename = "done")]
    Done { has_tool_calls: bool },

    #[serde(rename = "error")]
    Error { class: ErrorClass, message: String },

    #[serde(rename = "snapshot")]
    Snapshot {
        assistant_id: String,
        content: String,
        tool_calls: Vec<ToolCall>,
    },
}

impl StreamEvent {
    /// Whether this event kind marks a turn as finished (first one wins
    /// when arriving out of order, per the registry's failure model).
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }
}
