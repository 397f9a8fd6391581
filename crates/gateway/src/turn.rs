//! Tool Loop — the orchestrator that streams one LLM round, executes or
//! gates any tool calls it requests, and repeats until the turn finishes,
//! fails, is cancelled, or suspends waiting on a human approval decision.
//!
//! Two entry points: [`run_turn`] starts a fresh turn from the session's
//! most recently appended user message; [`resume_turn`] continues a turn
//! that suspended in [`RoundOutcome::NeedsApproval`] once every pending
//! tool call in the batch has been approved or denied.

use cc_domain::capability::ModelRole;
use cc_domain::error::classify_error;
use cc_domain::tool::{ContentPart, Message, MessageContent, Role, ToolCall};
use cc_providers::ChatRequest;
use cc_streamhub::StreamEntry;
use cc_tools::ToolContext;
use futures_util::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::settings;
use crate::state::AppState;
use crate::ws::protocol::GatewayEvent;

/// One provider round's result.
enum RoundOutcome {
    /// No tool calls: the turn is complete.
    Finished { text: String, usage: cc_domain::stream::Usage },
    /// The model requested tool calls, all auto-executable.
    ToolCalls { text: String, calls: Vec<ToolCall>, usage: cc_domain::stream::Usage },
    /// The stream failed outright.
    Failed { message: String },
    /// The entry was aborted mid-stream (`messages.interrupt`).
    Cancelled { text: String },
}

/// Start a fresh turn. Call after appending the triggering user message to
/// the store.
pub async fn run_turn(state: AppState, session_id: String) {
    let assistant_id = Uuid::new_v4().to_string();
    let model = state
        .store
        .get_session(&session_id)
        .ok()
        .flatten()
        .and_then(|s| s.model)
        .unwrap_or_default();
    let entry = state.streams.create(&session_id, &assistant_id, &model);
    drive(state, session_id, entry).await;
}

/// Resume a turn that suspended on a pending approval. The caller has
/// already resolved every call in the batch via `store.approve`/`store.deny`.
pub async fn resume_turn(state: AppState, session_id: String) {
    let assistant_id = Uuid::new_v4().to_string();
    let Some(entry) = state.streams.continue_turn(&session_id, &assistant_id) else {
        return;
    };

    let Some(pending) = latest_pending_message(&state, &session_id) else {
        return;
    };
    let calls = match pending.to_message() {
        Ok(msg) => extract_tool_calls(&msg),
        Err(_) => return,
    };
    if calls.is_empty() {
        return;
    }

    let Some(any_denied) = resolve_and_dispatch(&state, &session_id, &entry, &calls).await else {
        // Some calls are still pending (shouldn't happen — the caller is
        // expected to resolve the whole batch before resuming); bail
        // without starting another round.
        return;
    };
    let _ = state.store.mark_pending_approval(&pending.id, false);

    if any_denied {
        // Denied approval: persist denial rows (already done by
        // `resolve_and_dispatch`) and terminate instead of continuing the loop.
        state.streams.push(&session_id, cc_streamhub::StreamEvent::Done { has_tool_calls: false });
        state.streams.schedule_removal(&session_id);
        return;
    }

    drive(state, session_id, entry).await;
}

/// Run rounds until the turn finishes, fails, is cancelled, or suspends on
/// an approval gate.
async fn drive(state: AppState, session_id: String, mut entry: Arc<StreamEntry>) {
    let max_rounds = state.config.tools.max_rounds;
    for round in 0..max_rounds {
        if entry.is_aborted() {
            state.streams.push(&session_id, cc_streamhub::StreamEvent::Done { has_tool_calls: false });
            state.streams.schedule_removal(&session_id);
            return;
        }

        match stream_round(&state, &session_id, &entry).await {
            RoundOutcome::Finished { text, usage } => {
                let assistant_id = append_assistant_text(&state, &session_id, &text);
                record_round_token_counts(&state, &session_id, assistant_id.as_deref(), &usage);
                state.streams.push(&session_id, cc_streamhub::StreamEvent::Done { has_tool_calls: false });
                state.streams.schedule_removal(&session_id);
                maybe_compact(&state, &session_id).await;
                return;
            }
            RoundOutcome::Cancelled { text } => {
                if !text.is_empty() {
                    append_assistant_text(&state, &session_id, &text);
                }
                state.streams.push(&session_id, cc_streamhub::StreamEvent::Done { has_tool_calls: false });
                state.streams.schedule_removal(&session_id);
                return;
            }
            RoundOutcome::Failed { message } => {
                state.streams.push(
                    &session_id,
                    cc_streamhub::StreamEvent::Error { class: classify_error(&message), message },
                );
                state.streams.schedule_removal(&session_id);
                return;
            }
            RoundOutcome::ToolCalls { text, calls, usage } => {
                let message_id = append_assistant_tool_calls(&state, &session_id, &text, &calls);
                record_round_token_counts(&state, &session_id, message_id.as_deref(), &usage);
                let auto_approve = state
                    .store
                    .get_session(&session_id)
                    .ok()
                    .flatten()
                    .map(|s| s.auto_approve)
                    .unwrap_or(false);

                if auto_approve {
                    for call in &calls {
                        broadcast_auto_approved(&state, &session_id, call);
                    }
                    dispatch_calls(&state, &session_id, &entry, &calls, false).await;
                } else {
                    for call in &calls {
                        let _ = state.store.create_pending_approval(
                            &call.call_id,
                            &session_id,
                            &call.tool_name,
                            &call.arguments,
                        );
                    }
                    // Suspend: the client resolves each call via
                    // `messages.approve`/`messages.deny`, then the gateway
                    // calls `resume_turn`.
                    let _ = message_id;
                    return;
                }
            }
        }

        if round + 1 < max_rounds {
            let next_assistant_id = Uuid::new_v4().to_string();
            match state.streams.continue_turn(&session_id, &next_assistant_id) {
                Some(next) => entry = next,
                None => return,
            }
        }
    }

    state.streams.push(
        &session_id,
        cc_streamhub::StreamEvent::Error {
            class: cc_domain::error::ErrorClass::Unknown,
            message: format!("tool loop limit reached ({max_rounds} rounds)"),
        },
    );
    state.streams.schedule_removal(&session_id);
}

/// Approve/deny-resolve every call in `calls` against the store, dispatch
/// the approved ones, append tool-result messages, and push stream events.
/// Returns `None` if any call in the batch is still pending (the caller
/// should not resume yet), otherwise `Some(any_denied)`. A message's tool
/// calls are approved/denied as a unit, so one denial cancels every
/// remaining call in the batch, exactly like the first-error-cancels-rest
/// execution rule.
async fn resolve_and_dispatch(
    state: &AppState,
    session_id: &str,
    entry: &Arc<StreamEntry>,
    calls: &[ToolCall],
) -> Option<bool> {
    let mut any_denied = false;
    for call in calls {
        let Ok(Some(record)) = state.store.get_approval(&call.call_id) else {
            return None;
        };
        match record.status {
            cc_store::ApprovalStatus::Pending => return None,
            cc_store::ApprovalStatus::Denied => any_denied = true,
            cc_store::ApprovalStatus::Approved => {}
        }
    }
    dispatch_calls(state, session_id, entry, calls, any_denied).await;
    Some(any_denied)
}

/// Execute every call in order. The first erroring (or, if `force_cancel`,
/// every) result cancels all subsequent calls in the batch; cancelled calls
/// still produce a result row with a sentinel output and `isError:true`.
async fn dispatch_calls(state: &AppState, session_id: &str, entry: &Arc<StreamEntry>, calls: &[ToolCall], force_cancel: bool) {
    let mut cancel_rest = force_cancel;
    for call in calls {
        let aborted = entry.is_aborted();
        let (content, is_error) = if aborted {
            ("cancelled: turn aborted".to_string(), true)
        } else if cancel_rest {
            ("cancelled: a prior tool call in this batch failed or was denied".to_string(), true)
        } else {
            let ctx = ToolContext {
                workspace_root: &state.config.tools.workspace_path,
                store: &state.store,
                session_id,
            };
            cc_tools::dispatch_tool(&ctx, &call.tool_name, &call.arguments).await
        };

        if is_error {
            cancel_rest = true;
        }

        state.streams.push(
            session_id,
            cc_streamhub::StreamEvent::ToolResult {
                call_id: call.call_id.clone(),
                output: content.clone(),
                is_error,
            },
        );

        let msg = Message::tool_result(&call.call_id, &content);
        if let Ok(stored) = state.store.append_message(session_id, msg.role, serde_json::to_value(&msg.content).unwrap_or(Value::Null)) {
            broadcast_new_message(state, session_id, &stored.id);
        }

        if aborted {
            return;
        }
    }
}

/// Stream one provider round, accumulating text and any tool calls.
async fn stream_round(state: &AppState, session_id: &str, entry: &Arc<StreamEntry>) -> RoundOutcome {
    let messages = match cc_context::assemble(&state.store, session_id, &state.config.context) {
        Ok(m) => m,
        Err(e) => return RoundOutcome::Failed { message: e.to_string() },
    };
    let tools = cc_tools::tool_definitions();
    let session = state.store.get_session(session_id).ok().flatten();
    let model_override = session.as_ref().and_then(|s| s.model.clone());

    let req = ChatRequest { messages, tools, temperature: Some(0.2), max_tokens: None, json_mode: false, model: None };

    let (mut stream, provider_id, model_name) =
        match state.llm.chat_stream_for_role(ModelRole::Executor, req, model_override.as_deref()).await {
            Ok(v) => v,
            Err(e) => return RoundOutcome::Failed { message: e.to_string() },
        };

    let _ = state.store.set_model(session_id, &format!("{provider_id}/{model_name}"));

    let mut text_buf = String::new();
    let mut finished_calls: Vec<ToolCall> = Vec::new();
    let mut pending_bufs: HashMap<String, (String, String)> = HashMap::new();
    let mut total_usage = cc_domain::stream::Usage::default();

    const INTERRUPTED_SENTINEL: &str = "\n\n[Interrupted by user]";
    let cancel = entry.cancel_token();

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                text_buf.push_str(INTERRUPTED_SENTINEL);
                return RoundOutcome::Cancelled { text: text_buf };
            }
            next = stream.next() => match next {
                Some(event) => event,
                None => break,
            },
        };
        if entry.is_aborted() {
            text_buf.push_str(INTERRUPTED_SENTINEL);
            return RoundOutcome::Cancelled { text: text_buf };
        }
        let event = match event {
            Ok(e) => e,
            Err(e) => return RoundOutcome::Failed { message: e.to_string() },
        };
        match event {
            cc_domain::stream::StreamEvent::Token { text } => {
                state.streams.push(session_id, cc_streamhub::StreamEvent::Token { text: text.clone() });
                text_buf.push_str(&text);
            }
            cc_domain::stream::StreamEvent::Thought { .. } => {
                // Not surfaced: the Stream Registry's closed event union has
                // no reasoning-token variant.
            }
            cc_domain::stream::StreamEvent::ToolCallStarted { call_id, tool_name } => {
                pending_bufs.insert(call_id, (tool_name, String::new()));
            }
            cc_domain::stream::StreamEvent::ToolCallDelta { call_id, delta } => {
                if let Some((_, args)) = pending_bufs.get_mut(&call_id) {
                    args.push_str(&delta);
                }
            }
            cc_domain::stream::StreamEvent::ToolCallFinished { call_id, tool_name, arguments } => {
                pending_bufs.remove(&call_id);
                state.streams.push(
                    session_id,
                    cc_streamhub::StreamEvent::ToolCall {
                        call_id: call_id.clone(),
                        tool_name: tool_name.clone(),
                        arguments: arguments.clone(),
                    },
                );
                finished_calls.push(ToolCall { call_id, tool_name, arguments });
            }
            cc_domain::stream::StreamEvent::Done { usage, .. } => {
                if let Some(u) = usage {
                    total_usage = u;
                }
            }
            cc_domain::stream::StreamEvent::Error { message } => {
                return RoundOutcome::Failed { message };
            }
        }
    }

    // Calls that only ever got a start/delta (provider never sent
    // ToolCallFinished) still count; default malformed arguments to `{}`.
    for (call_id, (tool_name, args_str)) in pending_bufs {
        let arguments = if args_str.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(&args_str).unwrap_or(Value::Object(Default::default()))
        };
        state.streams.push(
            session_id,
            cc_streamhub::StreamEvent::ToolCall {
                call_id: call_id.clone(),
                tool_name: tool_name.clone(),
                arguments: arguments.clone(),
            },
        );
        finished_calls.push(ToolCall { call_id, tool_name, arguments });
    }

    state.streams.push(session_id, cc_streamhub::StreamEvent::Usage { usage: total_usage });
    let new_total = session.map(|s| s.cached_total_tokens).unwrap_or(0) + total_usage.total_tokens;
    let _ = state.store.set_cached_total_tokens(session_id, new_total);

    if finished_calls.is_empty() {
        RoundOutcome::Finished { text: text_buf, usage: total_usage }
    } else {
        RoundOutcome::ToolCalls { text: text_buf, calls: finished_calls, usage: total_usage }
    }
}

/// Run compaction if the session's cached token total has crossed the
/// configured threshold. Resolves the runtime `context_compaction_threshold`
/// setting (falling back to the static config) before calling into the
/// Compaction Engine, since `cc_context::run_compaction` itself is
/// settings-agnostic.
async fn maybe_compact(state: &AppState, session_id: &str) {
    let Some(window) = state
        .llm
        .registry()
        .for_role("executor")
        .map(|p| p.capabilities().context_window_tokens.unwrap_or(128_000))
    else {
        return;
    };
    let config = settings::resolved_compaction_config(&state.store, &state.config.compaction);

    match cc_context::run_compaction(
        &state.store,
        &state.llm,
        session_id,
        &config,
        window,
        cc_context::CompactionTrigger::TokenBudget,
    )
    .await
    {
        Ok(Some(outcome)) => {
            broadcast_global(
                state,
                GatewayEvent::Compaction {
                    session_id: session_id.to_string(),
                    messages_summarized: outcome.messages_summarized,
                    verbatim_kept: outcome.verbatim_kept,
                },
            );
        }
        Ok(None) => {}
        Err(e) => {
            broadcast_global(
                state,
                GatewayEvent::CompactionError { session_id: session_id.to_string(), message: e.to_string() },
            );
        }
    }
}

fn latest_pending_message(state: &AppState, session_id: &str) -> Option<cc_domain::types::StoredMessage> {
    let messages = state.store.list_messages(session_id, None).ok()?;
    messages.into_iter().rev().find(|m| m.pending_approval)
}

fn extract_tool_calls(message: &Message) -> Vec<ToolCall> {
    match &message.content {
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolUse { id, name, input } => Some(ToolCall {
                    call_id: id.clone(),
                    tool_name: name.clone(),
                    arguments: input.clone(),
                }),
                _ => None,
            })
            .collect(),
        MessageContent::Text(_) => Vec::new(),
    }
}

fn append_assistant_text(state: &AppState, session_id: &str, text: &str) -> Option<String> {
    let msg = Message::assistant(text);
    let stored = state
        .store
        .append_message(session_id, Role::Assistant, serde_json::to_value(&msg.content).unwrap_or(Value::Null))
        .ok()?;
    broadcast_new_message(state, session_id, &stored.id);
    Some(stored.id)
}

/// Attribute a finished round's usage to its messages: the new assistant
/// message gets the completion side, the most recent user message gets the
/// prompt side (per-message raw token counts, spec §3/§8 scenario 1).
fn record_round_token_counts(
    state: &AppState,
    session_id: &str,
    assistant_message_id: Option<&str>,
    usage: &cc_domain::stream::Usage,
) {
    if let Some(id) = assistant_message_id {
        let _ = state.store.set_raw_token_count(id, usage.completion_tokens);
    }
    if let Ok(messages) = state.store.list_messages(session_id, None) {
        if let Some(last_user) = messages.iter().rev().find(|m| m.role == Role::User) {
            let _ = state.store.set_raw_token_count(&last_user.id, usage.prompt_tokens);
        }
    }
}

fn append_assistant_tool_calls(state: &AppState, session_id: &str, text: &str, calls: &[ToolCall]) -> Option<String> {
    let mut parts = Vec::new();
    if !text.is_empty() {
        parts.push(ContentPart::Text { text: text.to_string() });
    }
    for call in calls {
        parts.push(ContentPart::ToolUse { id: call.call_id.clone(), name: call.tool_name.clone(), input: call.arguments.clone() });
    }
    let content = serde_json::to_value(MessageContent::Parts(parts)).ok()?;
    let stored = state.store.append_message(session_id, Role::Assistant, content).ok()?;
    let _ = state.store.mark_pending_approval(&stored.id, true);
    broadcast_new_message(state, session_id, &stored.id);
    Some(stored.id)
}

fn broadcast_new_message(state: &AppState, session_id: &str, message_id: &str) {
    broadcast_session(
        state,
        session_id,
        GatewayEvent::NewMessage { session_id: session_id.to_string(), message_id: message_id.to_string() },
    );
}

fn broadcast_auto_approved(state: &AppState, session_id: &str, call: &ToolCall) {
    broadcast_session(
        state,
        session_id,
        GatewayEvent::AutoApproved { call_id: call.call_id.clone(), tool_name: call.tool_name.clone() },
    );
}

fn broadcast_session(state: &AppState, session_id: &str, event: GatewayEvent) {
    state.connections.broadcast_session(
        session_id,
        crate::ws::protocol::PushMessage { push: true, session_id: Some(session_id.to_string()), event },
    );
}

fn broadcast_global(state: &AppState, event: GatewayEvent) {
    state.connections.broadcast_global(crate::ws::protocol::PushMessage { push: true, session_id: None, event });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_tool_calls_from_parts() {
        let msg = Message {
            role: Role::Assistant,
            content: MessageContent::Parts(vec![
                ContentPart::Text { text: "checking".into() },
                ContentPart::ToolUse { id: "c1".into(), name: "memory_search".into(), input: serde_json::json!({"query": "x"}) },
            ]),
        };
        let calls = extract_tool_calls(&msg);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].call_id, "c1");
        assert_eq!(calls[0].tool_name, "memory_search");
    }

    #[test]
    fn extract_tool_calls_from_plain_text_is_empty() {
        let msg = Message::assistant("hello");
        assert!(extract_tool_calls(&msg).is_empty());
    }

    #[tokio::test]
    async fn latest_pending_message_finds_most_recent_flagged_row() {
        let store = cc_store::Store::open_in_memory().unwrap();
        let session = store.create_session(None).unwrap();
        store.append_message(&session.id, Role::User, serde_json::json!("hi")).unwrap();
        let pending = store
            .append_message(&session.id, Role::Assistant, serde_json::json!("thinking"))
            .unwrap();
        store.mark_pending_approval(&pending.id, true).unwrap();

        let state_store = Arc::new(store);
        let state = AppState {
            config: Arc::new(cc_domain::config::Config::default()),
            store: state_store,
            llm: Arc::new(cc_providers::LlmRouter::new(
                cc_providers::ProviderRegistry::from_config(&cc_domain::config::LlmConfig::default()).unwrap(),
                Default::default(),
                20_000,
            )),
            streams: Arc::new(cc_streamhub::StreamRegistry::new()),
            connections: Arc::new(crate::state::ConnectionRegistry::new()),
            attachments_root: std::env::temp_dir(),
        };

        let found = latest_pending_message(&state, &session.id).unwrap();
        assert_eq!(found.id, pending.id);
    }
}
