//! Wire protocol for the WebSocket Gateway: client requests, server
//! responses, and the tagged union of every push event a connection can
//! receive.

use cc_domain::error::ErrorClass;
use cc_domain::tool::ToolCall;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A client-issued request. `seq` is echoed back on the matching
/// [`ServerResponse`] so a client can correlate out-of-order replies.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientRequest {
    pub seq: u64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

/// The direct reply to a [`ClientRequest`].
#[derive(Debug, Clone, Serialize)]
pub struct ServerResponse {
    pub seq: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ServerResponse {
    pub fn ok(seq: u64, data: Value) -> Self {
        Self { seq, ok: true, data: Some(data), error: None, status: None }
    }

    pub fn err(seq: u64, status: u16, message: impl Into<String>) -> Self {
        Self { seq, ok: false, data: None, error: Some(message.into()), status: Some(status) }
    }
}

/// An unsolicited, server-initiated push. `session_id` is `Some` for
/// events scoped to one session (delivered only to connections that have
/// called `sessions.watch` on it); it is `None` for events that concern
/// the whole workspace (session list changes, settings) and are broadcast
/// to every connection.
#[derive(Debug, Clone, Serialize)]
pub struct PushMessage {
    pub push: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub event: GatewayEvent,
}

/// Every event type a connection can be pushed. The first eight variants
/// mirror [`cc_streamhub::StreamEvent`] field-for-field (see the `From`
/// impl below); the rest are gateway-originated and have no Stream
/// Registry equivalent.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum GatewayEvent {
    #[serde(rename = "token")]
    Token { text: String },
    #[serde(rename = "tool_call")]
    ToolCall { call_id: String, tool_name: String, arguments: Value },
    #[serde(rename = "tool_result")]
    ToolResult { call_id: String, output: String, is_error: bool },
    #[serde(rename = "usage")]
    Usage { prompt_tokens: u32, completion_tokens: u32, total_tokens: u32 },
    #[serde(rename = "debug")]
    Debug { request: Value },
    #[serde(rename = "done")]
    Done { has_tool_calls: bool },
    #[serde(rename = "error")]
    Error { class: ErrorClass, message: String },
    #[serde(rename = "snapshot")]
    Snapshot { assistant_id: String, content: String, tool_calls: Vec<ToolCall> },

    #[serde(rename = "compaction")]
    Compaction { session_id: String, messages_summarized: usize, verbatim_kept: usize },
    #[serde(rename = "compaction_started")]
    CompactionStarted { session_id: String },
    #[serde(rename = "compaction_error")]
    CompactionError { session_id: String, message: String },
    #[serde(rename = "auto_approved")]
    AutoApproved { call_id: String, tool_name: String },
    #[serde(rename = "approval_changed")]
    ApprovalChanged { call_id: String, status: String },
    #[serde(rename = "session_created")]
    SessionCreated { session_id: String },
    #[serde(rename = "session_updated")]
    SessionUpdated { session_id: String },
    #[serde(rename = "session_deleted")]
    SessionDeleted { session_id: String },
    #[serde(rename = "settings_changed")]
    SettingsChanged { key: String },
    #[serde(rename = "new_message")]
    NewMessage { session_id: String, message_id: String },
    #[serde(rename = "memory_changed")]
    MemoryChanged { memory_id: String },
}

impl From<cc_streamhub::StreamEvent> for GatewayEvent {
    fn from(ev: cc_streamhub::StreamEvent) -> Self {
        match ev {
            cc_streamhub::StreamEvent::Token { text } => GatewayEvent::Token { text },
            cc_streamhub::StreamEvent::ToolCall { call_id, tool_name, arguments } => {
                GatewayEvent::ToolCall { call_id, tool_name, arguments }
            }
            cc_streamhub::StreamEvent::ToolResult { call_id, output, is_error } => {
                GatewayEvent::ToolResult { call_id, output, is_error }
            }
            cc_streamhub::StreamEvent::Usage { usage } => GatewayEvent::Usage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            },
            cc_streamhub::StreamEvent::Debug { request } => GatewayEvent::Debug { request },
            cc_streamhub::StreamEvent::Done { has_tool_calls } => {
                GatewayEvent::Done { has_tool_calls }
            }
            cc_streamhub::StreamEvent::Error { class, message } => {
                GatewayEvent::Error { class, message }
            }
            cc_streamhub::StreamEvent::Snapshot { assistant_id, content, tool_calls } => {
                GatewayEvent::Snapshot { assistant_id, content, tool_calls }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_message_without_session_id_omits_the_field() {
        let msg = PushMessage {
            push: true,
            session_id: None,
            event: GatewayEvent::SettingsChanged { key: "default_model".into() },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("session_id").is_none());
        assert_eq!(json["type"], "settings_changed");
    }

    #[test]
    fn stream_event_conversion_preserves_token_text() {
        let ev = cc_streamhub::StreamEvent::Token { text: "hi".into() };
        match GatewayEvent::from(ev) {
            GatewayEvent::Token { text } => assert_eq!(text, "hi"),
            _ => panic!("expected Token"),
        }
    }

    #[test]
    fn server_response_err_sets_ok_false() {
        let resp = ServerResponse::err(3, 404, "session not found");
        assert!(!resp.ok);
        assert_eq!(resp.status, Some(404));
    }
}
