use cc_domain::error::{Error, Result};
use cc_domain::tokens::estimate_tokens;
use cc_domain::tool::Role;
use cc_domain::types::StoredMessage;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::Store;

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
        Role::Compaction => "compaction",
    }
}

fn role_from_str(s: &str) -> Role {
    match s {
        "system" => Role::System,
        "user" => Role::User,
        "assistant" => Role::Assistant,
        "compaction" => Role::Compaction,
        _ => Role::Tool,
    }
}

/// Flatten a content JSON value into plain text for indexing. Tool-result
/// and tool-call content is skipped; only text parts are searchable.
fn extract_searchable_text(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

impl Store {
    /// Append a message to a session, allocating the next monotonic `seq`
    /// within a transaction so two concurrent appends can never collide.
    pub fn append_message(
        &self,
        session_id: &str,
        role: Role,
        content: serde_json::Value,
    ) -> Result<StoredMessage> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(|e| Error::Store(e.to_string()))?;

        let next_seq: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(seq), -1) + 1 FROM messages WHERE session_id = ?1",
                params![session_id],
                |r| r.get(0),
            )
            .map_err(|e| Error::Store(e.to_string()))?;

        let content_str = serde_json::to_string(&content)?;
        let estimated_token_count = estimate_tokens(&content_str);
        tx.execute(
            "INSERT INTO messages (id, session_id, seq, role, content, pending_approval, estimated_token_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7)",
            params![id, session_id, next_seq, role_str(role), content_str, estimated_token_count, now.to_rfc3339()],
        )
        .map_err(|e| Error::Store(e.to_string()))?;

        let searchable = extract_searchable_text(&content);
        if !searchable.is_empty() {
            tx.execute(
                "INSERT INTO messages_fts(rowid, body) VALUES (
                    (SELECT rowid FROM messages WHERE id = ?1), ?2)",
                params![id, searchable],
            )
            .map_err(|e| Error::Store(e.to_string()))?;
        }

        tx.commit().map_err(|e| Error::Store(e.to_string()))?;

        Ok(StoredMessage {
            id,
            session_id: session_id.to_string(),
            seq: next_seq,
            role,
            content,
            pending_approval: false,
            estimated_token_count,
            raw_token_count: None,
            created_at: now,
        })
    }

    pub fn mark_pending_approval(&self, message_id: &str, pending: bool) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE messages SET pending_approval = ?2 WHERE id = ?1",
            params![message_id, pending as i64],
        )
        .map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }

    /// Record the provider-reported token count for a message once a
    /// `Usage` event attributable to it has been observed.
    pub fn set_raw_token_count(&self, message_id: &str, raw_token_count: u32) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE messages SET raw_token_count = ?2 WHERE id = ?1",
            params![message_id, raw_token_count],
        )
        .map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }

    /// List messages for a session in `seq` order. When `since_seq` is
    /// `Some(n)`, only messages with `seq > n` are returned — used to
    /// fetch the verbatim tail after a compaction snapshot's boundary.
    pub fn list_messages(&self, session_id: &str, since_seq: Option<i64>) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock();
        let floor = since_seq.unwrap_or(-1);
        let mut stmt = conn
            .prepare(
                "SELECT id, session_id, seq, role, content, pending_approval, estimated_token_count, raw_token_count, created_at
                 FROM messages WHERE session_id = ?1 AND seq > ?2 ORDER BY seq ASC",
            )
            .map_err(|e| Error::Store(e.to_string()))?;
        let rows = stmt
            .query_map(params![session_id, floor], row_to_message)
            .map_err(|e| Error::Store(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Store(e.to_string()))
    }

    pub fn get_message(&self, id: &str) -> Result<Option<StoredMessage>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, session_id, seq, role, content, pending_approval, estimated_token_count, raw_token_count, created_at
             FROM messages WHERE id = ?1",
            params![id],
            row_to_message,
        )
        .optional()
        .map_err(|e| Error::Store(e.to_string()))
    }

    /// Trigram full-text search across a session's message bodies.
    pub fn search_messages(&self, session_id: &str, query: &str, limit: usize) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT m.id, m.session_id, m.seq, m.role, m.content, m.pending_approval, m.estimated_token_count, m.raw_token_count, m.created_at
                 FROM messages_fts f
                 JOIN messages m ON m.rowid = f.rowid
                 WHERE f.body MATCH ?2 AND m.session_id = ?1
                 ORDER BY rank LIMIT ?3",
            )
            .map_err(|e| Error::Store(e.to_string()))?;
        let rows = stmt
            .query_map(params![session_id, query, limit as i64], row_to_message)
            .map_err(|e| Error::Store(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Store(e.to_string()))
    }
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<StoredMessage> {
    let content_str: String = row.get(4)?;
    let created_at: String = row.get(8)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        seq: row.get(2)?,
        role: role_from_str(&row.get::<_, String>(3)?),
        content: serde_json::from_str(&content_str).unwrap_or(serde_json::Value::Null),
        pending_approval: row.get::<_, i64>(5)? != 0,
        estimated_token_count: row.get::<_, i64>(6)? as u32,
        raw_token_count: row.get::<_, Option<i64>>(7)?.map(|v| v as u32),
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .unwrap()
            .with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_assigns_monotonic_seq() {
        let store = Store::open_in_memory().unwrap();
        let s = store.create_session(None).unwrap();
        let m1 = store
            .append_message(&s.id, Role::User, serde_json::json!("first"))
            .unwrap();
        let m2 = store
            .append_message(&s.id, Role::Assistant, serde_json::json!("second"))
            .unwrap();
        assert_eq!(m1.seq, 0);
        assert_eq!(m2.seq, 1);
    }

    #[test]
    fn list_since_seq_excludes_boundary() {
        let store = Store::open_in_memory().unwrap();
        let s = store.create_session(None).unwrap();
        for i in 0..5 {
            store
                .append_message(&s.id, Role::User, serde_json::json!(format!("m{i}")))
                .unwrap();
        }
        let tail = store.list_messages(&s.id, Some(2)).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].seq, 3);
    }

    #[test]
    fn search_finds_substring_via_trigram() {
        let store = Store::open_in_memory().unwrap();
        let s = store.create_session(None).unwrap();
        store
            .append_message(&s.id, Role::User, serde_json::json!("the quick brown fox"))
            .unwrap();
        store
            .append_message(&s.id, Role::User, serde_json::json!("totally unrelated text"))
            .unwrap();
        let hits = store.search_messages(&s.id, "quick", 10).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn pending_approval_flag_roundtrips() {
        let store = Store::open_in_memory().unwrap();
        let s = store.create_session(None).unwrap();
        let m = store
            .append_message(&s.id, Role::Assistant, serde_json::json!("calling a tool"))
            .unwrap();
        store.mark_pending_approval(&m.id, true).unwrap();
        let fetched = store.get_message(&m.id).unwrap().unwrap();
        assert!(fetched.pending_approval);
    }

    #[test]
    fn append_sets_estimated_token_count() {
        let store = Store::open_in_memory().unwrap();
        let s = store.create_session(None).unwrap();
        let m = store
            .append_message(&s.id, Role::User, serde_json::json!("hello there"))
            .unwrap();
        assert!(m.estimated_token_count > 0);
        assert!(m.raw_token_count.is_none());
    }

    #[test]
    fn raw_token_count_roundtrips_once_set() {
        let store = Store::open_in_memory().unwrap();
        let s = store.create_session(None).unwrap();
        let m = store
            .append_message(&s.id, Role::Assistant, serde_json::json!("a reply"))
            .unwrap();
        store.set_raw_token_count(&m.id, 5).unwrap();
        let fetched = store.get_message(&m.id).unwrap().unwrap();
        assert_eq!(fetched.raw_token_count, Some(5));
    }
}
