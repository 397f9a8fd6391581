use cc_domain::error::{Error, Result};
use cc_domain::types::Session;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::Store;

const SESSION_COLUMNS: &str = "id, title, created_at, updated_at, active_snapshot_id, generation, \
     auto_approve, model, cached_total_tokens";

impl Store {
    pub fn create_session(&self, title: Option<String>) -> Result<Session> {
        let session = Session::new(title);
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions
                (id, title, created_at, updated_at, active_snapshot_id, generation,
                 auto_approve, model, cached_total_tokens)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                session.id,
                session.title,
                session.created_at.to_rfc3339(),
                session.updated_at.to_rfc3339(),
                session.active_snapshot_id,
                session.generation as i64,
                session.auto_approve as i64,
                session.model,
                session.cached_total_tokens,
            ],
        )
        .map_err(|e| Error::Store(e.to_string()))?;
        Ok(session)
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
            params![id],
            row_to_session,
        )
        .optional()
        .map_err(|e| Error::Store(e.to_string()))
    }

    /// Bump a session's generation counter, returning the new value. Used by
    /// the Tool Loop whenever a new turn supersedes a prior one, so the
    /// persisted generation and the Stream Registry's in-memory counter stay
    /// correlated for cross-client staleness checks.
    pub fn bump_generation(&self, session_id: &str) -> Result<u64> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sessions SET generation = generation + 1, updated_at = ?2 WHERE id = ?1",
            params![session_id, Utc::now().to_rfc3339()],
        )
        .map_err(|e| Error::Store(e.to_string()))?;
        conn.query_row(
            "SELECT generation FROM sessions WHERE id = ?1",
            params![session_id],
            |r| r.get::<_, i64>(0),
        )
        .map(|g| g as u64)
        .map_err(|e| Error::Store(e.to_string()))
    }

    pub fn set_active_snapshot(&self, session_id: &str, snapshot_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sessions SET active_snapshot_id = ?2, updated_at = ?3 WHERE id = ?1",
            params![session_id, snapshot_id, Utc::now().to_rfc3339()],
        )
        .map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }

    pub fn set_title(&self, session_id: &str, title: &str) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "UPDATE sessions SET title = ?2, updated_at = ?3 WHERE id = ?1",
                params![session_id, title, Utc::now().to_rfc3339()],
            )
            .map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }

    pub fn set_auto_approve(&self, session_id: &str, auto_approve: bool) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "UPDATE sessions SET auto_approve = ?2, updated_at = ?3 WHERE id = ?1",
                params![session_id, auto_approve as i64, Utc::now().to_rfc3339()],
            )
            .map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }

    pub fn set_model(&self, session_id: &str, model: &str) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "UPDATE sessions SET model = ?2, updated_at = ?3 WHERE id = ?1",
                params![session_id, model, Utc::now().to_rfc3339()],
            )
            .map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }

    /// Overwrite the session's cached total-token count. Called by the Tool
    /// Loop after every turn's `usage` event, and by the Compaction Engine
    /// to reset the count to the new snapshot's aggregate.
    pub fn set_cached_total_tokens(&self, session_id: &str, total: u32) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "UPDATE sessions SET cached_total_tokens = ?2, updated_at = ?3 WHERE id = ?1",
                params![session_id, total, Utc::now().to_rfc3339()],
            )
            .map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }

    /// Delete a session and everything that cascades from it (messages,
    /// snapshots, approvals, via `ON DELETE CASCADE`).
    pub fn delete_session(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let affected = conn
            .execute("DELETE FROM sessions WHERE id = ?1", params![id])
            .map_err(|e| Error::Store(e.to_string()))?;
        Ok(affected > 0)
    }

    pub fn list_sessions(&self) -> Result<Vec<Session>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY updated_at DESC"
            ))
            .map_err(|e| Error::Store(e.to_string()))?;
        let rows = stmt
            .query_map([], row_to_session)
            .map_err(|e| Error::Store(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Store(e.to_string()))
    }
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
    let created_at: String = row.get(2)?;
    let updated_at: String = row.get(3)?;
    Ok(Session {
        id: row.get(0)?,
        title: row.get(1)?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .unwrap()
            .with_timezone(&Utc),
        updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at)
            .unwrap()
            .with_timezone(&Utc),
        active_snapshot_id: row.get(4)?,
        generation: row.get::<_, i64>(5)? as u64,
        auto_approve: row.get::<_, i64>(6)? != 0,
        model: row.get(7)?,
        cached_total_tokens: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_get_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let s = store.create_session(Some("hi".into())).unwrap();
        let fetched = store.get_session(&s.id).unwrap().unwrap();
        assert_eq!(fetched.id, s.id);
        assert_eq!(fetched.generation, 0);
        assert!(!fetched.auto_approve);
    }

    #[test]
    fn bump_generation_increments() {
        let store = Store::open_in_memory().unwrap();
        let s = store.create_session(None).unwrap();
        assert_eq!(store.bump_generation(&s.id).unwrap(), 1);
        assert_eq!(store.bump_generation(&s.id).unwrap(), 2);
    }

    #[test]
    fn delete_session_cascades_messages() {
        let store = Store::open_in_memory().unwrap();
        let s = store.create_session(None).unwrap();
        store
            .append_message(&s.id, cc_domain::tool::Role::User, serde_json::json!("hi"))
            .unwrap();
        assert!(store.delete_session(&s.id).unwrap());
        assert!(store.list_messages(&s.id, None).unwrap().is_empty());
    }

    #[test]
    fn get_missing_session_returns_none() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.get_session("nope").unwrap().is_none());
    }

    #[test]
    fn auto_approve_and_model_and_token_setters_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let s = store.create_session(None).unwrap();
        store.set_auto_approve(&s.id, true).unwrap();
        store.set_model(&s.id, "openai/gpt-4o").unwrap();
        store.set_cached_total_tokens(&s.id, 12345).unwrap();
        let fetched = store.get_session(&s.id).unwrap().unwrap();
        assert!(fetched.auto_approve);
        assert_eq!(fetched.model.as_deref(), Some("openai/gpt-4o"));
        assert_eq!(fetched.cached_total_tokens, 12345);
    }
}
