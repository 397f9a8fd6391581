//! Builds the tool definitions advertised to the LLM and dispatches tool
//! calls to the filesystem, memory, or stub handlers.

use std::path::Path;

use cc_domain::tool::ToolDefinition;
use cc_store::Store;
use serde_json::Value;

use crate::{fs, memory, stub};

/// Everything a tool call needs beyond its own arguments.
pub struct ToolContext<'a> {
    pub workspace_root: &'a Path,
    pub store: &'a Store,
    pub session_id: &'a str,
}

pub fn tool_definitions() -> Vec<ToolDefinition> {
    let mut defs = vec![
        ToolDefinition {
            name: "filesystem_read".into(),
            description: "Read a file's contents, optionally a line range.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "offset": { "type": "integer", "description": "0-indexed starting line" },
                    "limit": { "type": "integer", "description": "Max lines to return" }
                },
                "required": ["path"]
            }),
        },
        ToolDefinition {
            name: "filesystem_write".into(),
            description: "Write (create or overwrite) a file.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": { "path": { "type": "string" }, "content": { "type": "string" } },
                "required": ["path", "content"]
            }),
        },
        ToolDefinition {
            name: "filesystem_append".into(),
            description: "Append content to an existing or new file.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": { "path": { "type": "string" }, "content": { "type": "string" } },
                "required": ["path", "content"]
            }),
        },
        ToolDefinition {
            name: "filesystem_move".into(),
            description: "Move or rename a file or directory.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": { "source": { "type": "string" }, "destination": { "type": "string" } },
                "required": ["source", "destination"]
            }),
        },
        ToolDefinition {
            name: "filesystem_delete".into(),
            description: "Delete a file or empty directory.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"]
            }),
        },
        ToolDefinition {
            name: "filesystem_list_directory".into(),
            description: "List a directory's entries with size/modified metadata.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": { "path": { "type": "string" } }
            }),
        },
        ToolDefinition {
            name: "memory_search".into(),
            description: "Search stored memories (global and session-scoped) for relevant facts.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "limit": { "type": "integer" }
                },
                "required": ["query"]
            }),
        },
        ToolDefinition {
            name: "memory_ingest".into(),
            description: "Store a fact or note in long-term memory.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "content": { "type": "string" },
                    "session_scoped": { "type": "boolean", "description": "Scope to this session instead of global" }
                },
                "required": ["content"]
            }),
        },
    ];

    for op in stub::OPERATIONS {
        defs.push(ToolDefinition {
            name: op.name.to_string(),
            description: op.description.to_string(),
            parameters: (op.parameters)(),
        });
    }

    defs
}

/// Dispatch a single tool call. Returns `(result_content, is_error)`,
/// matching the shape the Tool Loop persists as a `tool_result` content
/// part.
pub async fn dispatch_tool(ctx: &ToolContext<'_>, tool_name: &str, arguments: &Value) -> (String, bool) {
    match tool_name {
        "filesystem_read" => run_fs(arguments, |req| fs::read(ctx.workspace_root, req)).await,
        "filesystem_write" => run_fs(arguments, |req| fs::write(ctx.workspace_root, req)).await,
        "filesystem_append" => run_fs(arguments, |req| fs::append(ctx.workspace_root, req)).await,
        "filesystem_move" => run_fs(arguments, |req| fs::move_path(ctx.workspace_root, req)).await,
        "filesystem_delete" => run_fs(arguments, |req| fs::delete(ctx.workspace_root, req)).await,
        "filesystem_list_directory" => run_fs(arguments, |req| fs::list(ctx.workspace_root, req)).await,
        "memory_search" => run_store(arguments, |req| memory::search(ctx.store, ctx.session_id, req)),
        "memory_ingest" => run_store(arguments, |req| memory::ingest(ctx.store, ctx.session_id, req)),
        _ => match stub::find(tool_name) {
            Some(op) => stub::dispatch(op, arguments),
            None => (
                serde_json::json!({ "error": format!("unknown tool '{tool_name}'") }).to_string(),
                true,
            ),
        },
    }
}

async fn run_fs<Req, Fut>(arguments: &Value, f: impl FnOnce(Req) -> Fut) -> (String, bool)
where
    Req: serde::de::DeserializeOwned,
    Fut: std::future::Future<Output = Result<Value, String>>,
{
    let req: Req = match serde_json::from_value(arguments.clone()) {
        Ok(r) => r,
        Err(e) => return (format!("invalid arguments: {e}"), true),
    };
    match f(req).await {
        Ok(v) => (v.to_string(), false),
        Err(e) => (e, true),
    }
}

fn run_store<Req>(arguments: &Value, f: impl FnOnce(Req) -> cc_domain::error::Result<Value>) -> (String, bool)
where
    Req: serde::de::DeserializeOwned,
{
    let req: Req = match serde_json::from_value(arguments.clone()) {
        Ok(r) => r,
        Err(e) => return (format!("invalid arguments: {e}"), true),
    };
    match f(req) {
        Ok(v) => (v.to_string(), false),
        Err(e) => (e.to_string(), true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn dispatches_filesystem_write_then_read() {
        let ws = TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let session = store.create_session(None).unwrap();
        let ctx = ToolContext { workspace_root: ws.path(), store: &store, session_id: &session.id };

        let (write_out, write_err) = dispatch_tool(
            &ctx,
            "filesystem_write",
            &serde_json::json!({"path": "note.txt", "content": "hi"}),
        )
        .await;
        assert!(!write_err, "{write_out}");

        let (read_out, read_err) =
            dispatch_tool(&ctx, "filesystem_read", &serde_json::json!({"path": "note.txt"})).await;
        assert!(!read_err);
        assert!(read_out.contains("\"hi\""));
    }

    #[tokio::test]
    async fn dispatches_memory_ingest_then_search() {
        let ws = TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let session = store.create_session(None).unwrap();
        let ctx = ToolContext { workspace_root: ws.path(), store: &store, session_id: &session.id };

        dispatch_tool(&ctx, "memory_ingest", &serde_json::json!({"content": "remember this"})).await;
        let (out, is_error) =
            dispatch_tool(&ctx, "memory_search", &serde_json::json!({"query": "remember"})).await;
        assert!(!is_error);
        assert!(out.contains("\"count\":1"));
    }

    #[tokio::test]
    async fn unknown_tool_reports_error() {
        let ws = TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let session = store.create_session(None).unwrap();
        let ctx = ToolContext { workspace_root: ws.path(), store: &store, session_id: &session.id };

        let (_, is_error) = dispatch_tool(&ctx, "nonexistent", &serde_json::json!({})).await;
        assert!(is_error);
    }
}
