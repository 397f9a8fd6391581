use cc_domain::error::{Error, Result};
use cc_domain::types::CompactionSnapshot;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::Store;

/// What the Compaction Engine hands the store once it has produced a new
/// summary: everything needed to create the snapshot row and flip the
/// session's `active_snapshot_id` pointer in one call.
pub struct SnapshotInput {
    pub session_id: String,
    pub boundary_seq: i64,
    pub summary: String,
    pub summary_token_count: u32,
    pub verbatim_message_ids: Vec<String>,
    pub verbatim_token_count: u32,
    pub trigger_token_count: u32,
    pub model: String,
}

impl Store {
    /// Persist a new compaction snapshot and make it the session's active
    /// one. Does not delete the summarized messages — they remain in
    /// `messages` for audit/search; the Context Assembler is what skips
    /// past them using `boundary_seq`.
    pub fn create_snapshot(&self, input: SnapshotInput) -> Result<CompactionSnapshot> {
        let snapshot = CompactionSnapshot {
            id: Uuid::new_v4().to_string(),
            session_id: input.session_id,
            boundary_seq: input.boundary_seq,
            summary: input.summary,
            summary_token_count: input.summary_token_count,
            verbatim_message_ids: input.verbatim_message_ids,
            verbatim_token_count: input.verbatim_token_count,
            trigger_token_count: input.trigger_token_count,
            model: input.model,
            created_at: Utc::now(),
        };
        let verbatim_json = serde_json::to_string(&snapshot.verbatim_message_ids)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO compaction_snapshots
                (id, session_id, boundary_seq, summary, summary_token_count,
                 verbatim_message_ids, verbatim_token_count, trigger_token_count,
                 model, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                snapshot.id,
                snapshot.session_id,
                snapshot.boundary_seq,
                snapshot.summary,
                snapshot.summary_token_count,
                verbatim_json,
                snapshot.verbatim_token_count,
                snapshot.trigger_token_count,
                snapshot.model,
                snapshot.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| Error::Store(e.to_string()))?;
        conn.execute(
            "UPDATE sessions SET active_snapshot_id = ?2, updated_at = ?3 WHERE id = ?1",
            params![snapshot.session_id, snapshot.id, snapshot.created_at.to_rfc3339()],
        )
        .map_err(|e| Error::Store(e.to_string()))?;
        Ok(snapshot)
    }

    pub fn get_snapshot(&self, id: &str) -> Result<Option<CompactionSnapshot>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, session_id, boundary_seq, summary, summary_token_count,
                    verbatim_message_ids, verbatim_token_count, trigger_token_count,
                    model, created_at
             FROM compaction_snapshots WHERE id = ?1",
            params![id],
            row_to_snapshot,
        )
        .optional()
        .map_err(|e| Error::Store(e.to_string()))
    }

    /// Convenience lookup following a session's `active_snapshot_id`.
    pub fn get_active_snapshot(&self, session_id: &str) -> Result<Option<CompactionSnapshot>> {
        let active_id = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT active_snapshot_id FROM sessions WHERE id = ?1",
                params![session_id],
                |r| r.get::<_, Option<String>>(0),
            )
            .optional()
            .map_err(|e| Error::Store(e.to_string()))?
            .flatten()
        };
        match active_id {
            Some(id) => self.get_snapshot(&id),
            None => Ok(None),
        }
    }
}

fn row_to_snapshot(row: &rusqlite::Row) -> rusqlite::Result<CompactionSnapshot> {
    let verbatim_json: String = row.get(5)?;
    let created_at: String = row.get(9)?;
    Ok(CompactionSnapshot {
        id: row.get(0)?,
        session_id: row.get(1)?,
        boundary_seq: row.get(2)?,
        summary: row.get(3)?,
        summary_token_count: row.get(4)?,
        verbatim_message_ids: serde_json::from_str(&verbatim_json).unwrap_or_default(),
        verbatim_token_count: row.get(6)?,
        trigger_token_count: row.get(7)?,
        model: row.get(8)?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .unwrap()
            .with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(session_id: &str, boundary_seq: i64, summary: &str, ids: Vec<&str>) -> SnapshotInput {
        SnapshotInput {
            session_id: session_id.to_string(),
            boundary_seq,
            summary: summary.to_string(),
            summary_token_count: 42,
            verbatim_message_ids: ids.into_iter().map(String::from).collect(),
            verbatim_token_count: 100,
            trigger_token_count: 9000,
            model: "gpt-4o".to_string(),
        }
    }

    #[test]
    fn create_snapshot_updates_session_pointer() {
        let store = Store::open_in_memory().unwrap();
        let s = store.create_session(None).unwrap();
        let snap = store
            .create_snapshot(input(&s.id, 10, "earlier turns discussed onboarding", vec!["m11", "m12"]))
            .unwrap();
        let fetched = store.get_session(&s.id).unwrap().unwrap();
        assert_eq!(fetched.active_snapshot_id.as_deref(), Some(snap.id.as_str()));
    }

    #[test]
    fn active_snapshot_roundtrips_verbatim_ids() {
        let store = Store::open_in_memory().unwrap();
        let s = store.create_session(None).unwrap();
        store
            .create_snapshot(input(&s.id, 3, "summary", vec!["a", "b"]))
            .unwrap();
        let active = store.get_active_snapshot(&s.id).unwrap().unwrap();
        assert_eq!(active.verbatim_message_ids, vec!["a", "b"]);
        assert_eq!(active.verbatim_token_count, 100);
        assert_eq!(active.model, "gpt-4o");
    }

    #[test]
    fn no_snapshot_returns_none() {
        let store = Store::open_in_memory().unwrap();
        let s = store.create_session(None).unwrap();
        assert!(store.get_active_snapshot(&s.id).unwrap().is_none());
    }
}
