use std::collections::HashSet;

use cc_domain::config::ContextConfig;
use cc_domain::error::Result;
use cc_domain::tool::{ContentPart, Message, MessageContent, Role};
use cc_domain::types::StoredMessage;
use cc_store::Store;

/// Output content-part type tags that mark a tool result as "large" and
/// subject to the single-latest-verbatim collapsing rule. Matches the
/// structured-error contract `cc-tools` returns for its stub browser/vnc/
/// vision operations (see `cc_tools::contract`).
const LARGE_RESULT_TAGS: &[&str] = &["browser_content", "vnc_frame", "vision_result"];

/// Build the LLM-facing message history for a session: active snapshot (or
/// full log), minus empty/duplicate tool-result noise, with large tool
/// results collapsed to their single latest occurrence.
pub fn assemble(store: &Store, session_id: &str, config: &ContextConfig) -> Result<Vec<Message>> {
    let raw = if let Some(snapshot) = store.get_active_snapshot(session_id)? {
        assemble_from_snapshot(store, session_id, &snapshot)?
    } else {
        assemble_full_log(store, session_id)?
    };

    let collapsed = collapse_large_results(raw, config.large_result_collapse_chars);
    Ok(apply_image_policy(collapsed, config.allow_images))
}

/// Images attached to tool results are passed inline only for the single
/// most recent tool-result message that carries any; earlier tool results
/// keep their text but lose the image. When the provider has no
/// multi-modal support at all (`allow_images: false`), images are stripped
/// everywhere and replaced with a hint to use a separate vision tool.
fn apply_image_policy(messages: Vec<Message>, allow_images: bool) -> Vec<Message> {
    if !allow_images {
        return messages.into_iter().map(strip_images_with_hint).collect();
    }

    let latest_image_index = messages
        .iter()
        .enumerate()
        .rev()
        .find(|(_, m)| has_image(m))
        .map(|(i, _)| i);

    messages
        .into_iter()
        .enumerate()
        .map(|(i, m)| if Some(i) == latest_image_index { m } else { strip_images_quietly(m) })
        .collect()
}

fn has_image(msg: &Message) -> bool {
    matches!(&msg.content, MessageContent::Parts(parts) if parts.iter().any(|p| matches!(p, ContentPart::Image { .. })))
}

fn strip_images_quietly(msg: Message) -> Message {
    match msg.content {
        MessageContent::Parts(parts) => {
            let parts = parts.into_iter().filter(|p| !matches!(p, ContentPart::Image { .. })).collect();
            Message { role: msg.role, content: MessageContent::Parts(parts) }
        }
        other => Message { role: msg.role, content: other },
    }
}

const VISION_HINT: &str =
    "[image omitted: this model has no vision support; use a vision tool to describe image content if needed]";

fn strip_images_with_hint(msg: Message) -> Message {
    match msg.content {
        MessageContent::Parts(parts) => {
            let had_image = parts.iter().any(|p| matches!(p, ContentPart::Image { .. }));
            let mut parts: Vec<ContentPart> =
                parts.into_iter().filter(|p| !matches!(p, ContentPart::Image { .. })).collect();
            if had_image {
                parts.push(ContentPart::Text { text: VISION_HINT.to_string() });
            }
            Message { role: msg.role, content: MessageContent::Parts(parts) }
        }
        other => Message { role: msg.role, content: other },
    }
}

fn assemble_from_snapshot(
    store: &Store,
    session_id: &str,
    snapshot: &cc_domain::types::CompactionSnapshot,
) -> Result<Vec<Message>> {
    let mut out = Vec::new();
    out.push(Message::user(format!(
        "[Summary of conversation prior to the messages below]\n{}",
        snapshot.summary
    )));
    out.push(Message::assistant(
        "Understood. I have the summary of our earlier conversation and will continue from here.",
    ));

    let mut verbatim: Vec<StoredMessage> = Vec::new();
    for id in &snapshot.verbatim_message_ids {
        if let Some(m) = store.get_message(id)? {
            verbatim.push(m);
        }
    }
    let tail_floor = verbatim.iter().map(|m| m.seq).max();

    for m in &verbatim {
        if let Some(msg) = to_assembled_message(m) {
            out.push(msg);
        }
    }

    if let Some(floor) = tail_floor {
        let after = store.list_messages(session_id, Some(floor))?;
        append_filtered(&mut out, after);
    } else {
        // No verbatim ids resolved (e.g. they were since deleted); fall
        // back to everything after the snapshot's boundary.
        let after = store.list_messages(session_id, Some(snapshot.boundary_seq))?;
        append_filtered(&mut out, after);
    }

    Ok(out)
}

fn assemble_full_log(store: &Store, session_id: &str) -> Result<Vec<Message>> {
    let all = store.list_messages(session_id, None)?;
    let mut out = Vec::new();
    append_filtered(&mut out, all);
    Ok(out)
}

/// Append stored messages to `out`, skipping compaction-role and empty
/// tool-result messages and deduplicating consecutive tool-result messages
/// that carry identical tool-call id sets.
fn append_filtered(out: &mut Vec<Message>, messages: Vec<StoredMessage>) {
    let mut last_tool_result_ids: Option<HashSet<String>> = None;
    for m in messages {
        if m.role == Role::Compaction {
            continue;
        }
        let Some(msg) = to_assembled_message(&m) else {
            continue;
        };
        if m.role == Role::Tool {
            if is_empty_tool_result(&msg) {
                continue;
            }
            let ids = tool_result_ids(&msg);
            if last_tool_result_ids.as_ref() == Some(&ids) {
                continue;
            }
            last_tool_result_ids = Some(ids);
        } else {
            last_tool_result_ids = None;
        }
        out.push(msg);
    }
}

fn to_assembled_message(m: &StoredMessage) -> Option<Message> {
    m.to_message().ok()
}

fn is_empty_tool_result(msg: &Message) -> bool {
    match &msg.content {
        MessageContent::Parts(parts) => parts.iter().all(|p| match p {
            ContentPart::ToolResult { content, .. } => content.trim().is_empty(),
            _ => false,
        }),
        MessageContent::Text(t) => t.trim().is_empty(),
    }
}

fn tool_result_ids(msg: &Message) -> HashSet<String> {
    match &msg.content {
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolResult { tool_use_id, .. } => Some(tool_use_id.clone()),
                _ => None,
            })
            .collect(),
        _ => HashSet::new(),
    }
}

/// Replace every large tool result except the single most recent one with
/// a short descriptor, per the spec's large-result-collapsing rule.
fn collapse_large_results(messages: Vec<Message>, _collapse_chars: usize) -> Vec<Message> {
    let latest_large_index = messages
        .iter()
        .enumerate()
        .rev()
        .find(|(_, m)| has_large_result(m))
        .map(|(i, _)| i);

    messages
        .into_iter()
        .enumerate()
        .map(|(i, m)| {
            if Some(i) == latest_large_index {
                m
            } else {
                collapse_message(m)
            }
        })
        .collect()
}

fn has_large_result(msg: &Message) -> bool {
    match &msg.content {
        MessageContent::Parts(parts) => parts.iter().any(|p| match p {
            ContentPart::ToolResult { content, .. } => large_result_tag(content).is_some(),
            _ => false,
        }),
        _ => false,
    }
}

fn large_result_tag(content: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(content).ok()?;
    let obj = value.as_object()?;
    let tag = obj.get("type")?.as_str()?;
    LARGE_RESULT_TAGS
        .iter()
        .find(|t| **t == tag)
        .map(|t| t.to_string())
}

fn collapse_message(msg: Message) -> Message {
    match msg.content {
        MessageContent::Parts(parts) => {
            let parts = parts
                .into_iter()
                .map(|p| match p {
                    ContentPart::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => {
                        if let Some(tag) = large_result_tag(&content) {
                            ContentPart::ToolResult {
                                tool_use_id,
                                content: collapsed_descriptor(&tag, &content),
                                is_error,
                            }
                        } else {
                            ContentPart::ToolResult {
                                tool_use_id,
                                content,
                                is_error,
                            }
                        }
                    }
                    other => other,
                })
                .collect();
            Message {
                role: msg.role,
                content: MessageContent::Parts(parts),
            }
        }
        other => Message {
            role: msg.role,
            content: other,
        },
    }
}

fn collapsed_descriptor(tag: &str, content: &str) -> String {
    let ids = serde_json::from_str::<serde_json::Value>(content)
        .ok()
        .and_then(|v| {
            v.as_object().map(|o| {
                o.iter()
                    .filter(|(k, _)| *k != "type")
                    .take(3)
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            })
        })
        .unwrap_or_default();
    format!("[{tag} content omitted; {ids}]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use cc_domain::tool::Role as MsgRole;

    fn config() -> ContextConfig {
        ContextConfig {
            large_result_collapse_chars: 4000,
            allow_images: true,
        }
    }

    #[test]
    fn full_log_skips_empty_tool_results() {
        let store = Store::open_in_memory().unwrap();
        let s = store.create_session(None).unwrap();
        store
            .append_message(&s.id, cc_domain::tool::Role::User, serde_json::json!("hi"))
            .unwrap();
        let empty_tool_result = Message {
            role: MsgRole::Tool,
            content: MessageContent::Parts(vec![ContentPart::ToolResult {
                tool_use_id: "c1".into(),
                content: "".into(),
                is_error: false,
            }]),
        };
        store
            .append_message(
                &s.id,
                cc_domain::tool::Role::Tool,
                serde_json::to_value(&empty_tool_result.content).unwrap(),
            )
            .unwrap();

        let assembled = assemble(&store, &s.id, &config()).unwrap();
        assert_eq!(assembled.len(), 1);
    }

    #[test]
    fn dedups_consecutive_identical_tool_result_sets() {
        let store = Store::open_in_memory().unwrap();
        let s = store.create_session(None).unwrap();
        let result = MessageContent::Parts(vec![ContentPart::ToolResult {
            tool_use_id: "c1".into(),
            content: "same result".into(),
            is_error: false,
        }]);
        store
            .append_message(&s.id, cc_domain::tool::Role::Tool, serde_json::to_value(&result).unwrap())
            .unwrap();
        store
            .append_message(&s.id, cc_domain::tool::Role::Tool, serde_json::to_value(&result).unwrap())
            .unwrap();

        let assembled = assemble(&store, &s.id, &config()).unwrap();
        assert_eq!(assembled.len(), 1);
    }

    #[test]
    fn only_latest_large_result_kept_verbatim() {
        let store = Store::open_in_memory().unwrap();
        let s = store.create_session(None).unwrap();
        let make_result = |id: &str| {
            MessageContent::Parts(vec![ContentPart::ToolResult {
                tool_use_id: id.into(),
                content: serde_json::json!({"type": "browser_content", "url": "a.com", "text": "x".repeat(5000)})
                    .to_string(),
                is_error: false,
            }])
        };
        store
            .append_message(&s.id, cc_domain::tool::Role::Tool, serde_json::to_value(&make_result("c1")).unwrap())
            .unwrap();
        store
            .append_message(&s.id, cc_domain::tool::Role::User, serde_json::json!("continue"))
            .unwrap();
        store
            .append_message(&s.id, cc_domain::tool::Role::Tool, serde_json::to_value(&make_result("c2")).unwrap())
            .unwrap();

        let assembled = assemble(&store, &s.id, &config()).unwrap();
        let MessageContent::Parts(first_parts) = &assembled[0].content else {
            panic!("expected parts")
        };
        let ContentPart::ToolResult { content, .. } = &first_parts[0] else {
            panic!("expected tool result")
        };
        assert!(content.starts_with("[browser_content content omitted"));

        let MessageContent::Parts(last_parts) = &assembled[2].content else {
            panic!("expected parts")
        };
        let ContentPart::ToolResult { content, .. } = &last_parts[0] else {
            panic!("expected tool result")
        };
        assert!(content.contains("browser_content"));
        assert!(!content.starts_with('['));
    }

    #[test]
    fn snapshot_path_emits_summary_turn_then_verbatim_then_tail() {
        let store = Store::open_in_memory().unwrap();
        let s = store.create_session(None).unwrap();
        let m1 = store
            .append_message(&s.id, cc_domain::tool::Role::User, serde_json::json!("old message"))
            .unwrap();
        let m2 = store
            .append_message(&s.id, cc_domain::tool::Role::User, serde_json::json!("kept verbatim"))
            .unwrap();
        store
            .create_snapshot(cc_store::SnapshotInput {
                session_id: s.id.clone(),
                boundary_seq: m1.seq,
                summary: "earlier discussion summarized".into(),
                summary_token_count: 10,
                verbatim_message_ids: vec![m2.id.clone()],
                verbatim_token_count: 5,
                trigger_token_count: 1000,
                model: "gpt-4o".into(),
            })
            .unwrap();
        store
            .append_message(&s.id, cc_domain::tool::Role::User, serde_json::json!("fresh message"))
            .unwrap();

        let assembled = assemble(&store, &s.id, &config()).unwrap();
        assert_eq!(assembled.len(), 4);
        assert!(assembled[0]
            .content
            .text()
            .unwrap()
            .contains("earlier discussion summarized"));
        assert_eq!(assembled[1].role, MsgRole::Assistant);
        assert_eq!(assembled[2].content.text().unwrap(), "kept verbatim");
        assert_eq!(assembled[3].content.text().unwrap(), "fresh message");
    }

    fn tool_result_with_image(id: &str) -> MessageContent {
        MessageContent::Parts(vec![
            ContentPart::ToolResult { tool_use_id: id.into(), content: "a photo".into(), is_error: false },
            ContentPart::Image { url: "blob://x".into(), media_type: Some("image/png".into()) },
        ])
    }

    #[test]
    fn only_latest_tool_image_kept_when_images_allowed() {
        let store = Store::open_in_memory().unwrap();
        let s = store.create_session(None).unwrap();
        store
            .append_message(&s.id, cc_domain::tool::Role::Tool, serde_json::to_value(&tool_result_with_image("c1")).unwrap())
            .unwrap();
        store
            .append_message(&s.id, cc_domain::tool::Role::User, serde_json::json!("continue"))
            .unwrap();
        store
            .append_message(&s.id, cc_domain::tool::Role::Tool, serde_json::to_value(&tool_result_with_image("c2")).unwrap())
            .unwrap();

        let assembled = assemble(&store, &s.id, &config()).unwrap();
        assert!(!has_image(&assembled[0]));
        assert!(has_image(&assembled[2]));
    }

    #[test]
    fn images_stripped_everywhere_with_hint_when_disallowed() {
        let store = Store::open_in_memory().unwrap();
        let s = store.create_session(None).unwrap();
        store
            .append_message(&s.id, cc_domain::tool::Role::Tool, serde_json::to_value(&tool_result_with_image("c1")).unwrap())
            .unwrap();

        let mut cfg = config();
        cfg.allow_images = false;
        let assembled = assemble(&store, &s.id, &cfg).unwrap();
        assert!(!has_image(&assembled[0]));
        let MessageContent::Parts(parts) = &assembled[0].content else { panic!("expected parts") };
        assert!(parts.iter().any(|p| matches!(p, ContentPart::Text { text } if text == VISION_HINT)));
    }
}
