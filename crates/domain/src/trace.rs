use serde::Serialize;

/// Structured trace events emitted across all chatcore crates, logged as a
/// single JSON-encoded field so they remain greppable in either plain or
/// JSON log output.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    LlmRequest {
        provider: String,
        model: String,
        role: String,
        streaming: bool,
        duration_ms: u64,
        prompt_tokens: Option<u32>,
        completion_tokens: Option<u32>,
    },
    LlmFallback {
        from_provider: String,
        from_model: String,
        to_provider: String,
        to_model: String,
        reason: String,
    },
    SessionCreated {
        session_id: String,
    },
    TurnStarted {
        session_id: String,
        run_id: String,
        generation: u64,
    },
    TurnSuperseded {
        session_id: String,
        old_run_id: String,
        new_run_id: String,
    },
    CompactionRan {
        session_id: String,
        messages_summarized: usize,
        verbatim_kept: usize,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "chatcore_event");
    }
}
