//! WebSocket upgrade handler: the reader/writer task split that serves the
//! request/response/push protocol defined in [`protocol`].

pub mod protocol;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};

use crate::state::AppState;
use crate::{files, settings, turn};
use protocol::{ClientRequest, GatewayEvent, PushMessage, ServerResponse};

/// Request types the server retries on handler failure, up to the
/// connection's negotiated `retryCount+1` attempts. Limited to read-mostly
/// or otherwise idempotent operations — retrying `messages.create` or a
/// tool execution could duplicate a side effect.
const RETRYABLE_TYPES: &[&str] = &[
    "sessions.list",
    "sessions.get",
    "messages.list",
    "memories.list",
    "settings.get",
    "models.list",
    "tools.list",
];

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PING_INTERVAL: Duration = Duration::from_secs(30);

pub async fn upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (conn_id, mut outbound) = state.connections.register();

    // Ping/pong liveness (spec §4.6 pt.2): a connection that never answers
    // a ping within one interval is considered dead and torn down.
    let pong_due = Arc::new(AtomicBool::new(false));
    let pong_due_writer = pong_due.clone();

    let writer = tokio::spawn(async move {
        let mut ping_timer = tokio::time::interval(PING_INTERVAL);
        ping_timer.tick().await; // first tick fires immediately; skip it
        loop {
            tokio::select! {
                maybe_msg = outbound.recv() => {
                    match maybe_msg {
                        Some(msg) => {
                            let Ok(text) = serde_json::to_string(&msg) else { continue };
                            if ws_sink.send(WsMessage::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_timer.tick() => {
                    if pong_due_writer.swap(true, Ordering::SeqCst) {
                        // Previous ping never got a pong back.
                        break;
                    }
                    if ws_sink.send(WsMessage::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(frame) = ws_stream.next().await {
        let frame = match frame {
            Ok(f) => f,
            Err(_) => break,
        };
        match frame {
            WsMessage::Text(text) => {
                let reply = match serde_json::from_str::<ClientRequest>(&text) {
                    Ok(req) => dispatch(&state, conn_id, req.clone()).await,
                    Err(e) => ServerResponse::err(0, 400, format!("invalid request: {e}")),
                };
                let _ = state.connections.send_direct(conn_id, &reply);
            }
            WsMessage::Close(_) => break,
            WsMessage::Pong(_) => {
                pong_due.store(false, Ordering::SeqCst);
            }
            WsMessage::Ping(_) => {}
            WsMessage::Binary(_) => {}
        }
    }

    writer.abort();
    for (session_id, subscriber_id) in state.connections.take_stream_subs(conn_id) {
        state.streams.unsubscribe(&session_id, subscriber_id);
    }
    state.connections.unregister(conn_id);
}

/// Dispatch one request, applying the per-request timeout and, for
/// retryable request types, retrying the handler up to the connection's
/// negotiated `retryCount+1` attempts before giving up.
async fn dispatch(state: &AppState, conn_id: u64, req: ClientRequest) -> ServerResponse {
    let seq = req.seq;
    let attempts = if RETRYABLE_TYPES.contains(&req.kind.as_str()) {
        state.connections.retry_count(conn_id) as usize + 1
    } else {
        1
    };

    let mut outcome = Err((500, "no attempt made".to_string()));
    for _ in 0..attempts {
        outcome = match tokio::time::timeout(REQUEST_TIMEOUT, route(state, conn_id, &req.kind, req.payload.clone())).await {
            Ok(result) => result,
            Err(_) => Err((504, "request timed out".to_string())),
        };
        if outcome.is_ok() {
            break;
        }
    }

    match outcome {
        Ok(data) => ServerResponse::ok(seq, data),
        Err((status, message)) => ServerResponse::err(seq, status, message),
    }
}

type HandlerResult = Result<Value, (u16, String)>;

async fn route(state: &AppState, conn_id: u64, kind: &str, payload: Value) -> HandlerResult {
    match kind {
        "config.init" | "config.retries" => {
            let retry_count = payload
                .get("retryCount")
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
                .min(10) as u8;
            state.connections.set_retry_count(conn_id, retry_count);
            Ok(json!({ "version": 1, "retryCount": retry_count }))
        }

        "sessions.list" => {
            let sessions = state.store.list_sessions().map_err(store_err)?;
            Ok(json!({ "sessions": sessions }))
        }
        "sessions.get" => {
            let id = require_str(&payload, "sessionId")?;
            let session = state.store.get_session(id).map_err(store_err)?;
            session.map(|s| json!(s)).ok_or_else(|| not_found("session"))
        }
        "sessions.create" => {
            let title = payload.get("title").and_then(|v| v.as_str()).map(str::to_string);
            let session = state.store.create_session(title).map_err(store_err)?;
            broadcast_global(state, GatewayEvent::SessionCreated { session_id: session.id.clone() });
            Ok(json!(session))
        }
        "sessions.update" => {
            let id = require_str(&payload, "sessionId")?.to_string();
            if let Some(title) = payload.get("title").and_then(|v| v.as_str()) {
                state.store.set_title(&id, title).map_err(store_err)?;
            }
            if let Some(auto) = payload.get("autoApprove").and_then(|v| v.as_bool()) {
                state.store.set_auto_approve(&id, auto).map_err(store_err)?;
            }
            broadcast_global(state, GatewayEvent::SessionUpdated { session_id: id.clone() });
            Ok(json!({ "sessionId": id }))
        }
        "sessions.delete" => {
            let id = require_str(&payload, "sessionId")?.to_string();
            let deleted = state.store.delete_session(&id).map_err(store_err)?;
            if deleted {
                files::delete_session_files(&state.attachments_root, &id).map_err(files_err)?;
                broadcast_global(state, GatewayEvent::SessionDeleted { session_id: id.clone() });
            }
            Ok(json!({ "deleted": deleted }))
        }
        "sessions.watch" => {
            let id = require_str(&payload, "sessionId")?;
            state.connections.watch(conn_id, id);
            Ok(json!({ "watching": id }))
        }
        "sessions.unwatch" => {
            let id = require_str(&payload, "sessionId")?;
            state.connections.unwatch(conn_id, id);
            Ok(json!({ "watching": false }))
        }
        "sessions.switchModel" => {
            let id = require_str(&payload, "sessionId")?.to_string();
            let model = require_str(&payload, "model")?.to_string();
            state.store.set_model(&id, &model).map_err(store_err)?;
            broadcast_global(state, GatewayEvent::SessionUpdated { session_id: id });
            Ok(json!({ "model": model }))
        }
        "sessions.compact" => {
            let id = require_str(&payload, "sessionId")?.to_string();
            handle_manual_compaction(state, &id).await
        }

        "messages.list" => {
            let id = require_str(&payload, "sessionId")?;
            let since_seq = payload.get("sinceSeq").and_then(|v| v.as_i64());
            let page = settings::messages_page_size(&state.store, 50).unwrap_or(50);
            let mut messages = state.store.list_messages(id, since_seq).map_err(store_err)?;
            if messages.len() > page {
                let drop = messages.len() - page;
                messages.drain(0..drop);
            }
            Ok(json!({ "messages": messages }))
        }
        "messages.create" => {
            let id = require_str(&payload, "sessionId")?.to_string();
            let text = require_str(&payload, "text")?.to_string();
            let stored = state
                .store
                .append_message(&id, cc_domain::tool::Role::User, json!(text))
                .map_err(store_err)?;
            broadcast_session(
                state,
                &id,
                GatewayEvent::NewMessage { session_id: id.clone(), message_id: stored.id.clone() },
            );
            let loop_state = state.clone();
            let session_id = id.clone();
            tokio::spawn(async move { turn::run_turn(loop_state, session_id).await });
            Ok(json!(stored))
        }
        "messages.update" => {
            let id = require_str(&payload, "sessionId")?;
            let _ = id;
            Err((501, "message edits are not supported".to_string()))
        }
        "messages.approve" => handle_decision(state, &payload, true).await,
        "messages.deny" => handle_decision(state, &payload, false).await,
        "messages.interrupt" => {
            let id = require_str(&payload, "sessionId")?;
            state.streams.mark_aborted(id);
            Ok(json!({ "interrupted": true }))
        }

        "chat.subscribe" => {
            let id = require_str(&payload, "sessionId")?.to_string();
            state.connections.watch(conn_id, &id);
            subscribe_to_stream(state, conn_id, &id);
            Ok(json!({ "subscribed": id }))
        }
        "chat.stream" => {
            let id = require_str(&payload, "sessionId")?.to_string();
            let text = require_str(&payload, "text")?.to_string();
            state.connections.watch(conn_id, &id);
            subscribe_to_stream(state, conn_id, &id);
            let stored = state
                .store
                .append_message(&id, cc_domain::tool::Role::User, json!(text))
                .map_err(store_err)?;
            broadcast_session(
                state,
                &id,
                GatewayEvent::NewMessage { session_id: id.clone(), message_id: stored.id.clone() },
            );
            let loop_state = state.clone();
            let session_id = id.clone();
            tokio::spawn(async move { turn::run_turn(loop_state, session_id).await });
            Ok(json!({ "subscribed": id, "message": stored }))
        }

        "files.upload" => {
            let id = require_str(&payload, "sessionId")?.to_string();
            let data_hex = require_str(&payload, "data")?;
            let bytes = hex::decode(data_hex).map_err(|e| (400, format!("invalid hex payload: {e}")))?;
            let reference = files::store(&state.attachments_root, &id, &bytes).map_err(files_err)?;
            Ok(json!({ "sessionId": reference.session_id, "hash": reference.hash }))
        }
        "files.get" => {
            let id = require_str(&payload, "sessionId")?.to_string();
            let hash = require_str(&payload, "hash")?.to_string();
            let reference = files::FileRef { session_id: id, hash };
            let bytes = files::load(&state.attachments_root, &reference).map_err(files_err)?;
            Ok(json!({ "data": hex::encode(bytes) }))
        }

        "memories.list" => {
            let id = require_str(&payload, "sessionId")?;
            let memories = state.store.list_memories(id).map_err(store_err)?;
            Ok(json!({ "memories": memories }))
        }
        "memories.create" => {
            let session_id = payload.get("sessionId").and_then(|v| v.as_str());
            let content = require_str(&payload, "content")?;
            let tokens = cc_domain::tokens::estimate_tokens(content);
            let memory = state.store.create_memory(session_id, content, tokens).map_err(store_err)?;
            broadcast_global(state, GatewayEvent::MemoryChanged { memory_id: memory.id.clone() });
            Ok(json!(memory))
        }
        "memories.delete" => {
            let id = require_str(&payload, "memoryId")?.to_string();
            state.store.delete_memory(&id).map_err(store_err)?;
            broadcast_global(state, GatewayEvent::MemoryChanged { memory_id: id });
            Ok(json!({ "deleted": true }))
        }

        "settings.get" => {
            let all = state.store.all_settings().map_err(store_err)?;
            Ok(json!({ "settings": all }))
        }
        "settings.update" => {
            let key = require_str(&payload, "key")?.to_string();
            let value = payload.get("value").cloned().unwrap_or(Value::Null);
            let applied = settings::update(&state.store, &key, &value).map_err(store_err)?;
            if applied {
                broadcast_global(state, GatewayEvent::SettingsChanged { key: key.clone() });
                Ok(json!({ "applied": true }))
            } else {
                Err((403, format!("'{key}' is UI-managed and cannot be set via settings.update")))
            }
        }

        "models.list" => {
            let roles = state.llm.registry().list_roles();
            let providers = state.llm.registry().list_providers();
            Ok(json!({ "roles": roles, "providers": providers }))
        }
        "tools.list" => Ok(json!({ "tools": cc_tools::tool_definitions() })),
        "chat.tools.validate" => {
            let name = require_str(&payload, "name")?;
            let known = cc_tools::tool_definitions().iter().any(|t| t.name == name);
            Ok(json!({ "valid": known }))
        }
        "chat.tools.execute" => {
            let session_id = require_str(&payload, "sessionId")?.to_string();
            let name = require_str(&payload, "name")?.to_string();
            let arguments = payload.get("arguments").cloned().unwrap_or(json!({}));
            let ctx = cc_tools::ToolContext {
                workspace_root: &state.config.tools.workspace_path,
                store: &state.store,
                session_id: &session_id,
            };
            let (output, is_error) = cc_tools::dispatch_tool(&ctx, &name, &arguments).await;
            Ok(json!({ "output": output, "isError": is_error }))
        }

        _ => Err((400, format!("unknown request type '{kind}'"))),
    }
}

/// A message's tool calls are approved/denied as a unit: every call_id in
/// its `tool_use` parts is resolved together, and the turn resumes only
/// once every one of them has moved off `pending`.
async fn handle_decision(state: &AppState, payload: &Value, approve: bool) -> HandlerResult {
    let message_id = require_str(payload, "messageId")?.to_string();
    let message = state
        .store
        .get_message(&message_id)
        .map_err(store_err)?
        .ok_or_else(|| not_found("message"))?;
    let call_ids = tool_call_ids(&message);
    if call_ids.is_empty() {
        return Err((409, "message has no pending tool calls".to_string()));
    }

    let mut any_applied = false;
    for call_id in &call_ids {
        let applied = if approve {
            state.store.approve(call_id).map_err(store_err)?
        } else {
            state.store.deny(call_id).map_err(store_err)?
        };
        any_applied |= applied;
    }
    if !any_applied {
        return Err((409, "already decided".to_string()));
    }

    let status = if approve { "approved" } else { "denied" };
    for call_id in &call_ids {
        broadcast_session(
            state,
            &message.session_id,
            GatewayEvent::ApprovalChanged { call_id: call_id.clone(), status: status.to_string() },
        );
    }

    let loop_state = state.clone();
    let session_id = message.session_id.clone();
    tokio::spawn(async move { turn::resume_turn(loop_state, session_id).await });
    Ok(json!({ "applied": true }))
}

fn tool_call_ids(message: &cc_domain::types::StoredMessage) -> Vec<String> {
    use cc_domain::tool::{ContentPart, MessageContent};
    match message.to_message() {
        Ok(msg) => match msg.content {
            MessageContent::Parts(parts) => parts
                .into_iter()
                .filter_map(|p| match p {
                    ContentPart::ToolUse { id, .. } => Some(id),
                    _ => None,
                })
                .collect(),
            MessageContent::Text(_) => Vec::new(),
        },
        Err(_) => Vec::new(),
    }
}

async fn handle_manual_compaction(state: &AppState, session_id: &str) -> HandlerResult {
    broadcast_global(state, GatewayEvent::CompactionStarted { session_id: session_id.to_string() });
    let config = settings::resolved_compaction_config(&state.store, &state.config.compaction);
    let window = state
        .llm
        .registry()
        .for_role("executor")
        .map(|p| p.capabilities().context_window_tokens.unwrap_or(128_000))
        .unwrap_or(128_000);

    match cc_context::run_compaction(
        &state.store,
        &state.llm,
        session_id,
        &config,
        window,
        cc_context::CompactionTrigger::Manual,
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
            Ok(json!({ "compacted": true, "snapshotId": outcome.snapshot_id }))
        }
        Ok(None) => Ok(json!({ "compacted": false })),
        Err(e) => {
            broadcast_global(
                state,
                GatewayEvent::CompactionError { session_id: session_id.to_string(), message: e.to_string() },
            );
            Err((500, e.to_string()))
        }
    }
}

fn require_str<'a>(payload: &'a Value, field: &str) -> Result<&'a str, (u16, String)> {
    payload
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| (400, format!("missing or non-string field '{field}'")))
}

fn store_err(e: cc_domain::error::Error) -> (u16, String) {
    (500, e.to_string())
}

fn files_err(e: cc_domain::error::Error) -> (u16, String) {
    (500, e.to_string())
}

fn not_found(what: &str) -> (u16, String) {
    (404, format!("{what} not found"))
}

fn broadcast_session(state: &AppState, session_id: &str, event: GatewayEvent) {
    state.connections.broadcast_session(
        session_id,
        PushMessage { push: true, session_id: Some(session_id.to_string()), event },
    );
}

fn broadcast_global(state: &AppState, event: GatewayEvent) {
    state.connections.broadcast_global(PushMessage { push: true, session_id: None, event });
}

/// Register a connection's live interest in a session's Stream Entry:
/// push the current snapshot immediately (so a client that just connected
/// sees in-progress content), then forward every subsequent event from the
/// Stream Registry to this connection alone. A no-op on the snapshot push
/// if no entry is running yet — `subscribe` still registers the callback
/// so a turn started moments later is observed from its first event.
fn subscribe_to_stream(state: &AppState, conn_id: u64, session_id: &str) {
    if let Some(snapshot) = state.streams.snapshot(session_id) {
        state.connections.push_event(
            conn_id,
            PushMessage {
                push: true,
                session_id: Some(session_id.to_string()),
                event: GatewayEvent::Snapshot {
                    assistant_id: snapshot.assistant_id,
                    content: snapshot.content,
                    tool_calls: snapshot.tool_calls,
                },
            },
        );
    }

    let connections = state.connections.clone();
    let forwarded_session_id = session_id.to_string();
    let callback: cc_streamhub::Subscriber = Arc::new(move |ev: &cc_streamhub::StreamEvent| {
        connections.push_event(
            conn_id,
            PushMessage {
                push: true,
                session_id: Some(forwarded_session_id.clone()),
                event: GatewayEvent::from(ev.clone()),
            },
        );
    });

    if let Some(subscriber_id) = state.streams.subscribe(session_id, callback) {
        state.connections.add_stream_sub(conn_id, session_id.to_string(), subscriber_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_request_type_returns_400() {
        let state = test_state();
        let err = route(&state, 1, "bogus.thing", json!({})).await.unwrap_err();
        assert_eq!(err.0, 400);
    }

    #[tokio::test]
    async fn sessions_create_then_get_roundtrips() {
        let state = test_state();
        let created = route(&state, 1, "sessions.create", json!({ "title": "hi" })).await.unwrap();
        let id = created["id"].as_str().unwrap().to_string();
        let fetched = route(&state, 1, "sessions.get", json!({ "sessionId": id })).await.unwrap();
        assert_eq!(fetched["title"], "hi");
    }

    #[tokio::test]
    async fn settings_update_rejects_ui_managed_key() {
        let state = test_state();
        let err = route(&state, 1, "settings.update", json!({ "key": "auto_approve", "value": true }))
            .await
            .unwrap_err();
        assert_eq!(err.0, 403);
    }

    #[tokio::test]
    async fn chat_subscribe_watches_without_starting_a_turn() {
        let state = test_state();
        let created = route(&state, 1, "sessions.create", json!({})).await.unwrap();
        let id = created["id"].as_str().unwrap().to_string();

        let result = route(&state, 1, "chat.subscribe", json!({ "sessionId": id })).await.unwrap();
        assert_eq!(result["subscribed"], id);

        let messages = route(&state, 1, "messages.list", json!({ "sessionId": id })).await.unwrap();
        assert!(messages["messages"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn chat_stream_appends_a_user_message_and_subscribes() {
        let state = test_state();
        let created = route(&state, 1, "sessions.create", json!({})).await.unwrap();
        let id = created["id"].as_str().unwrap().to_string();

        let result = route(&state, 1, "chat.stream", json!({ "sessionId": id, "text": "hi there" }))
            .await
            .unwrap();
        assert_eq!(result["subscribed"], id);

        let messages = route(&state, 1, "messages.list", json!({ "sessionId": id })).await.unwrap();
        assert_eq!(messages["messages"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn config_init_negotiates_and_clamps_retry_count() {
        let state = test_state();
        let result = route(&state, 7, "config.init", json!({ "retryCount": 99 })).await.unwrap();
        assert_eq!(result["retryCount"], 10);
        assert_eq!(state.connections.retry_count(7), 10);
    }

    #[tokio::test]
    async fn files_upload_then_get_roundtrips_as_hex() {
        let state = test_state();
        let created = route(&state, 1, "sessions.create", json!({})).await.unwrap();
        let id = created["id"].as_str().unwrap().to_string();

        let uploaded = route(&state, 1, "files.upload", json!({ "sessionId": id, "data": hex::encode(b"hello") }))
            .await
            .unwrap();
        let hash = uploaded["hash"].as_str().unwrap().to_string();

        let fetched = route(&state, 1, "files.get", json!({ "sessionId": id, "hash": hash })).await.unwrap();
        assert_eq!(hex::decode(fetched["data"].as_str().unwrap()).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn sessions_delete_removes_session_attachments() {
        let state = test_state();
        let created = route(&state, 1, "sessions.create", json!({})).await.unwrap();
        let id = created["id"].as_str().unwrap().to_string();
        files::store(&state.attachments_root, &id, b"bytes").unwrap();

        route(&state, 1, "sessions.delete", json!({ "sessionId": id })).await.unwrap();

        assert!(!state.attachments_root.join(&id).exists());
    }

    fn test_state() -> AppState {
        AppState {
            config: Arc::new(cc_domain::config::Config::default()),
            store: Arc::new(cc_store::Store::open_in_memory().unwrap()),
            llm: Arc::new(cc_providers::LlmRouter::new(
                cc_providers::ProviderRegistry::from_config(&cc_domain::config::LlmConfig::default()).unwrap(),
                Default::default(),
                20_000,
            )),
            streams: Arc::new(cc_streamhub::StreamRegistry::new()),
            connections: Arc::new(crate::state::ConnectionRegistry::new()),
            attachments_root: std::env::temp_dir(),
        }
    }
}
