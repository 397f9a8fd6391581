use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tool::{Message, Role};

/// A durable chat session. Owns a monotonic message log and, once
/// compaction has run at least once, an `active_snapshot_id` pointer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Most recent compaction snapshot, if any. When set, the Context
    /// Assembler builds the prompt from this snapshot's summary plus the
    /// verbatim tail rather than the full message log.
    pub active_snapshot_id: Option<String>,
    /// Bumped every time a new turn supersedes a previous one for this
    /// session; mirrors the Stream Registry's generation counter so a
    /// persisted session and its in-memory stream entry can be correlated.
    pub generation: u64,
    /// When true, the Tool Loop executes tool calls without waiting for a
    /// `messages.approve` round trip.
    pub auto_approve: bool,
    /// Model identifier ("provider_id/model_name") new turns use. `None`
    /// defers to the `default_model` runtime setting.
    pub model: Option<String>,
    /// Total token usage last reported for this session, reset to a
    /// snapshot's aggregate whenever compaction runs.
    pub cached_total_tokens: u32,
}

impl Session {
    pub fn new(title: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title,
            created_at: now,
            updated_at: now,
            active_snapshot_id: None,
            generation: 0,
            auto_approve: false,
            model: None,
            cached_total_tokens: 0,
        }
    }
}

/// A single durable message row. `seq` gives monotonic ordering within a
/// session independent of wall-clock timestamp collisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub session_id: String,
    pub seq: i64,
    pub role: Role,
    pub content: serde_json::Value,
    /// Present on assistant messages containing tool calls still pending a
    /// decision; cleared once resolved.
    pub pending_approval: bool,
    /// Local tokenizer estimate of this message's content, set at append
    /// time via [`cc_domain::tokens::estimate_tokens`].
    pub estimated_token_count: u32,
    /// Provider-reported token count attributable to this message, if one
    /// has been observed. `None` until a `Usage` event lands for the round
    /// that produced (or consumed) it.
    pub raw_token_count: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn to_message(&self) -> crate::error::Result<Message> {
        Ok(Message {
            role: self.role,
            content: serde_json::from_value(self.content.clone())?,
        })
    }
}

/// A compaction snapshot: a generated summary of everything before
/// `boundary_seq`, plus the list of message ids that remain verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionSnapshot {
    pub id: String,
    pub session_id: String,
    /// Messages with `seq <= boundary_seq` are represented by `summary`;
    /// everything after is replayed verbatim.
    pub boundary_seq: i64,
    pub summary: String,
    pub summary_token_count: u32,
    pub verbatim_message_ids: Vec<String>,
    pub verbatim_token_count: u32,
    /// Total session tokens observed at the turn that triggered compaction.
    pub trigger_token_count: u32,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

/// A durable, user- or assistant-authored fact retained outside the normal
/// message log. Global when `session_id` is `None`, otherwise scoped to one
/// session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub session_id: Option<String>,
    pub content: String,
    pub token_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle states of a single in-flight turn, tracked by the Stream
/// Registry. Mirrors the Tool Loop's state machine one-to-one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Streaming,
    NeedsApproval,
    ExecutingTools,
    Done,
    Error,
    Cancelled,
}
