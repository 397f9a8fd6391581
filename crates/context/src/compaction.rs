//! Compaction Engine: summarizes a session's older messages into a single
//! snapshot once its token usage crosses a configured threshold, keeping a
//! verbatim tail so recent turns stay exact.

use cc_domain::capability::ModelRole;
use cc_domain::config::CompactionConfig;
use cc_domain::error::{Error, Result};
use cc_domain::tokens::estimate_tokens;
use cc_domain::tool::{Message, Role};
use cc_domain::types::StoredMessage;
use cc_providers::{ChatRequest, LlmRouter};
use cc_store::{SnapshotInput, Store};

const SUMMARY_PROMPT: &str = "Summarize the conversation below for your own future reference. \
Cover, in order: (1) the user's overall goal, (2) key decisions made, (3) facts or \
constraints established, (4) work already completed, (5) anything still outstanding. \
Be concise but do not drop information the assistant would need to continue the work.";

/// What caused a compaction run to be considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionTrigger {
    /// The session's cached total token count crossed the configured
    /// percentage of the model's context window.
    TokenBudget,
    /// Requested directly (e.g. a `sessions.compact` gateway call).
    Manual,
}

#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub snapshot_id: String,
    pub messages_summarized: usize,
    pub verbatim_kept: usize,
}

/// Run compaction for a session if it needs it (or unconditionally, for
/// `CompactionTrigger::Manual`). Returns `Ok(None)` when there is nothing to
/// compact (fewer than 4 non-compaction messages, or the active snapshot
/// already covers everything).
pub async fn run_compaction(
    store: &Store,
    router: &LlmRouter,
    session_id: &str,
    config: &CompactionConfig,
    context_window_tokens: u32,
    trigger: CompactionTrigger,
) -> Result<Option<CompactionOutcome>> {
    let session = store
        .get_session(session_id)?
        .ok_or_else(|| Error::Store(format!("session '{session_id}' not found")))?;

    let since = session_floor(store, session_id)?;
    let all = store.list_messages(session_id, since)?;
    let non_marker: Vec<&StoredMessage> = all.iter().filter(|m| m.role != Role::Compaction).collect();

    if non_marker.len() < 4 {
        return Ok(None);
    }

    if trigger == CompactionTrigger::TokenBudget && !should_compact(&session, config, context_window_tokens) {
        return Ok(None);
    }

    let verbatim_budget = verbatim_message_budget(config, context_window_tokens, &non_marker);
    let split_at = non_marker.len().saturating_sub(verbatim_budget);
    let (to_summarize, to_keep) = non_marker.split_at(split_at);

    if to_summarize.is_empty() {
        return Ok(None);
    }

    let transcript = build_transcript(to_summarize);
    let summary = summarize(router, &transcript).await?;
    let summary_token_count = estimate_tokens(&summary);

    let verbatim_message_ids: Vec<String> = to_keep.iter().map(|m| m.id.clone()).collect();
    let verbatim_token_count = to_keep
        .iter()
        .map(|m| estimate_tokens(&transcript_line(m)))
        .sum();

    let model = session.model.clone().unwrap_or_else(|| "unknown".to_string());
    let boundary_seq = to_summarize.last().map(|m| m.seq).unwrap_or(0);

    let snapshot = store.create_snapshot(SnapshotInput {
        session_id: session_id.to_string(),
        boundary_seq,
        summary: summary.clone(),
        summary_token_count,
        verbatim_message_ids,
        verbatim_token_count,
        trigger_token_count: session.cached_total_tokens,
        model,
    })?;

    store.append_message(
        session_id,
        Role::Compaction,
        serde_json::json!({
            "text": format!(
                "Compacted {} earlier messages into a summary; {} kept verbatim.",
                to_summarize.len(),
                to_keep.len()
            ),
            "snapshot_id": snapshot.id,
        }),
    )?;

    store.set_cached_total_tokens(session_id, summary_token_count + verbatim_token_count)?;

    Ok(Some(CompactionOutcome {
        snapshot_id: snapshot.id,
        messages_summarized: to_summarize.len(),
        verbatim_kept: to_keep.len(),
    }))
}

/// Messages already folded into the active snapshot's summary must not be
/// re-summarized; start scanning from just after its verbatim tail.
fn session_floor(store: &Store, session_id: &str) -> Result<Option<i64>> {
    match store.get_active_snapshot(session_id)? {
        Some(snapshot) => Ok(Some(snapshot.boundary_seq.max(
            snapshot
                .verbatim_message_ids
                .iter()
                .filter_map(|id| store.get_message(id).ok().flatten().map(|m| m.seq))
                .max()
                .unwrap_or(snapshot.boundary_seq),
        ))),
        None => Ok(None),
    }
}

fn should_compact(
    session: &cc_domain::types::Session,
    config: &CompactionConfig,
    context_window_tokens: u32,
) -> bool {
    if !config.auto {
        return false;
    }
    let threshold = (context_window_tokens as u64 * config.trigger_percent as u64) / 100;
    session.cached_total_tokens as u64 >= threshold
}

/// Verbatim budget in *messages*: `floor(contextWindow * pct / 100)` worth of
/// tokens. Walks `messages` newest-to-oldest, accumulating each message's
/// actual estimated token count, and counts how many fit before the budget
/// is exhausted — rather than assuming a flat per-message size. Floored at
/// `min_verbatim_messages` whenever the budget is non-zero.
fn verbatim_message_budget(
    config: &CompactionConfig,
    context_window_tokens: u32,
    messages: &[&StoredMessage],
) -> usize {
    let budget_tokens = (context_window_tokens as u64 * config.verbatim_budget_percent.min(50) as u64) / 100;
    if budget_tokens == 0 {
        return 0;
    }

    let mut spent = 0u64;
    let mut count = 0usize;
    for m in messages.iter().rev() {
        let cost = estimate_tokens(&transcript_line(m)) as u64;
        if spent + cost > budget_tokens && count > 0 {
            break;
        }
        spent += cost;
        count += 1;
    }

    count.max(config.min_verbatim_messages.min(messages.len()))
}

fn build_transcript(messages: &[&StoredMessage]) -> String {
    messages
        .iter()
        .map(|m| transcript_line(m))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Render one stored message as a labelled transcript line, truncating long
/// tool results to their first 1000 and last 500 characters so a single
/// giant result can't dominate the summarization prompt.
fn transcript_line(m: &StoredMessage) -> String {
    let label = match m.role {
        Role::System => "System",
        Role::User => "User",
        Role::Assistant => "Assistant",
        Role::Tool => "Tool",
        Role::Compaction => "Compaction",
    };
    let text = m
        .to_message()
        .ok()
        .map(|msg| render_message_text(&msg))
        .unwrap_or_default();
    let truncated = if text.len() > 2000 {
        format!("{}...[truncated]...{}", &text[..1000], &text[text.len() - 500..])
    } else {
        text
    };
    format!("{label}: {truncated}")
}

/// Render a message's text for the summarization transcript, including tool
/// call/result content that `MessageContent::extract_all_text` deliberately
/// skips (that method is for provider-facing history, not a human summary).
fn render_message_text(msg: &Message) -> String {
    use cc_domain::tool::ContentPart;
    match &msg.content {
        cc_domain::tool::MessageContent::Text(t) => t.clone(),
        cc_domain::tool::MessageContent::Parts(parts) => parts
            .iter()
            .map(|p| match p {
                ContentPart::Text { text } => text.clone(),
                ContentPart::ToolUse { name, input, .. } => format!("[called {name} with {input}]"),
                ContentPart::ToolResult { content, is_error, .. } => {
                    if *is_error {
                        format!("[tool error: {content}]")
                    } else {
                        format!("[tool result: {content}]")
                    }
                }
                ContentPart::Image { .. } => "[image]".to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

async fn summarize(router: &LlmRouter, transcript: &str) -> Result<String> {
    let req = ChatRequest {
        messages: vec![
            Message::system(SUMMARY_PROMPT),
            Message::user(transcript.to_string()),
        ],
        ..Default::default()
    };
    let resp = router.chat_for_role(ModelRole::Summarizer, req).await?;
    Ok(resp.content)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CompactionConfig {
        CompactionConfig {
            auto: true,
            token_budget: 128_000,
            trigger_percent: 80,
            min_verbatim_messages: 2,
            verbatim_budget_percent: 30,
        }
    }

    #[test]
    fn should_compact_respects_threshold() {
        let mut session = cc_domain::types::Session::new(None);
        session.cached_total_tokens = 50_000;
        assert!(!should_compact(&session, &config(), 100_000));
        session.cached_total_tokens = 85_000;
        assert!(should_compact(&session, &config(), 100_000));
    }

    #[test]
    fn should_compact_is_false_when_auto_disabled() {
        let mut cfg = config();
        cfg.auto = false;
        let mut session = cc_domain::types::Session::new(None);
        session.cached_total_tokens = 99_000;
        assert!(!should_compact(&session, &cfg, 100_000));
    }

    fn stub_message(seq: i64, text: &str) -> StoredMessage {
        StoredMessage {
            id: format!("m{seq}"),
            session_id: "s".into(),
            seq,
            role: Role::User,
            content: serde_json::to_value(cc_domain::tool::MessageContent::Text(text.to_string())).unwrap(),
            pending_approval: false,
            estimated_token_count: 0,
            raw_token_count: None,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn verbatim_budget_floors_at_min_verbatim_messages() {
        let cfg = config();
        let messages: Vec<StoredMessage> = (0..10).map(|i| stub_message(i, "hi")).collect();
        let refs: Vec<&StoredMessage> = messages.iter().collect();
        let budget = verbatim_message_budget(&cfg, 1_000, &refs);
        assert!(budget >= cfg.min_verbatim_messages);
    }

    #[test]
    fn verbatim_budget_counts_fewer_messages_when_they_are_large() {
        let cfg = config();
        let small: Vec<StoredMessage> = (0..10).map(|i| stub_message(i, "hi")).collect();
        let small_refs: Vec<&StoredMessage> = small.iter().collect();
        let small_budget = verbatim_message_budget(&cfg, 10_000, &small_refs);

        let big_text = "x".repeat(20_000);
        let big: Vec<StoredMessage> = (0..10).map(|i| stub_message(i, &big_text)).collect();
        let big_refs: Vec<&StoredMessage> = big.iter().collect();
        let big_budget = verbatim_message_budget(&cfg, 10_000, &big_refs);

        assert!(big_budget < small_budget);
    }

    #[test]
    fn transcript_truncates_long_tool_output() {
        let m = StoredMessage {
            id: "m1".into(),
            session_id: "s1".into(),
            seq: 0,
            role: Role::User,
            content: serde_json::json!("x".repeat(5000)),
            pending_approval: false,
            estimated_token_count: 0,
            raw_token_count: None,
            created_at: chrono::Utc::now(),
        };
        let line = transcript_line(&m);
        assert!(line.contains("...[truncated]..."));
        assert!(line.len() < 2000);
    }
}
