use cc_domain::error::{Error, Result};
use cc_domain::types::Memory;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::Store;

impl Store {
    /// Create a memory entry. `session_id = None` makes it global (visible
    /// regardless of which session's context is being assembled).
    pub fn create_memory(&self, session_id: Option<&str>, content: &str, token_count: u32) -> Result<Memory> {
        let now = Utc::now();
        let memory = Memory {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.map(String::from),
            content: content.to_string(),
            token_count,
            created_at: now,
            updated_at: now,
        };
        self.conn
            .lock()
            .execute(
                "INSERT INTO memories (id, session_id, content, token_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    memory.id,
                    memory.session_id,
                    memory.content,
                    memory.token_count,
                    memory.created_at.to_rfc3339(),
                    memory.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| Error::Store(e.to_string()))?;
        Ok(memory)
    }

    pub fn delete_memory(&self, id: &str) -> Result<()> {
        self.conn
            .lock()
            .execute("DELETE FROM memories WHERE id = ?1", params![id])
            .map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }

    /// List memories visible to `session_id`: the session's own plus every
    /// global memory, newest first.
    pub fn list_memories(&self, session_id: &str) -> Result<Vec<Memory>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, session_id, content, token_count, created_at, updated_at
                 FROM memories WHERE session_id = ?1 OR session_id IS NULL
                 ORDER BY created_at DESC",
            )
            .map_err(|e| Error::Store(e.to_string()))?;
        let rows = stmt
            .query_map(params![session_id], row_to_memory)
            .map_err(|e| Error::Store(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Store(e.to_string()))
    }

    pub fn get_memory(&self, id: &str) -> Result<Option<Memory>> {
        self.conn
            .lock()
            .query_row(
                "SELECT id, session_id, content, token_count, created_at, updated_at
                 FROM memories WHERE id = ?1",
                params![id],
                row_to_memory,
            )
            .optional()
            .map_err(|e| Error::Store(e.to_string()))
    }
}

fn row_to_memory(row: &rusqlite::Row) -> rusqlite::Result<Memory> {
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;
    Ok(Memory {
        id: row.get(0)?,
        session_id: row.get(1)?,
        content: row.get(2)?,
        token_count: row.get(3)?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .unwrap()
            .with_timezone(&Utc),
        updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at)
            .unwrap()
            .with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_memory_visible_to_any_session() {
        let store = Store::open_in_memory().unwrap();
        let s = store.create_session(None).unwrap();
        store.create_memory(None, "user prefers dark mode", 6).unwrap();
        let memories = store.list_memories(&s.id).unwrap();
        assert_eq!(memories.len(), 1);
    }

    #[test]
    fn session_scoped_memory_not_visible_to_other_session() {
        let store = Store::open_in_memory().unwrap();
        let s1 = store.create_session(None).unwrap();
        let s2 = store.create_session(None).unwrap();
        store.create_memory(Some(&s1.id), "s1-only fact", 3).unwrap();
        assert_eq!(store.list_memories(&s1.id).unwrap().len(), 1);
        assert_eq!(store.list_memories(&s2.id).unwrap().len(), 0);
    }

    #[test]
    fn delete_removes_memory() {
        let store = Store::open_in_memory().unwrap();
        let m = store.create_memory(None, "fact", 1).unwrap();
        store.delete_memory(&m.id).unwrap();
        assert!(store.get_memory(&m.id).unwrap().is_none());
    }
}
