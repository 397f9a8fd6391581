use cc_domain::error::{Error, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use crate::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
}

impl ApprovalStatus {
    fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "approved" => ApprovalStatus::Approved,
            "denied" => ApprovalStatus::Denied,
            _ => ApprovalStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRecord {
    pub call_id: String,
    pub session_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub status: ApprovalStatus,
}

impl Store {
    /// Record a tool call as awaiting a human decision. Called by the Tool
    /// Loop when it enters `NeedsApproval` for a gated tool.
    pub fn create_pending_approval(
        &self,
        call_id: &str,
        session_id: &str,
        tool_name: &str,
        arguments: &serde_json::Value,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO approvals (call_id, session_id, tool_name, arguments, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
            params![
                call_id,
                session_id,
                tool_name,
                serde_json::to_string(arguments)?,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }

    pub fn get_approval(&self, call_id: &str) -> Result<Option<ApprovalRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT call_id, session_id, tool_name, arguments, status
             FROM approvals WHERE call_id = ?1",
            params![call_id],
            row_to_approval,
        )
        .optional()
        .map_err(|e| Error::Store(e.to_string()))
    }

    /// Resolve a pending approval with a compare-and-swap on `status`: the
    /// `UPDATE` only takes effect while the row is still `pending`, so a
    /// decision that arrives twice (e.g. a retried WebSocket request) only
    /// wins once. Returns whether this call is the one that made the
    /// transition.
    fn resolve(&self, call_id: &str, new_status: ApprovalStatus) -> Result<bool> {
        let conn = self.conn.lock();
        let affected = conn
            .execute(
                "UPDATE approvals SET status = ?2, decided_at = ?3
                 WHERE call_id = ?1 AND status = 'pending'",
                params![call_id, new_status.as_str(), Utc::now().to_rfc3339()],
            )
            .map_err(|e| Error::Store(e.to_string()))?;
        Ok(affected > 0)
    }

    pub fn approve(&self, call_id: &str) -> Result<bool> {
        self.resolve(call_id, ApprovalStatus::Approved)
    }

    pub fn deny(&self, call_id: &str) -> Result<bool> {
        self.resolve(call_id, ApprovalStatus::Denied)
    }
}

fn row_to_approval(row: &rusqlite::Row) -> rusqlite::Result<ApprovalRecord> {
    let arguments_str: String = row.get(3)?;
    let status_str: String = row.get(4)?;
    Ok(ApprovalRecord {
        call_id: row.get(0)?,
        session_id: row.get(1)?,
        tool_name: row.get(2)?,
        arguments: serde_json::from_str(&arguments_str).unwrap_or(serde_json::Value::Null),
        status: ApprovalStatus::from_str(&status_str),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approve_transitions_from_pending() {
        let store = Store::open_in_memory().unwrap();
        let s = store.create_session(None).unwrap();
        store
            .create_pending_approval("call-1", &s.id, "run_shell", &serde_json::json!({"cmd": "ls"}))
            .unwrap();
        assert!(store.approve("call-1").unwrap());
        let record = store.get_approval("call-1").unwrap().unwrap();
        assert_eq!(record.status, ApprovalStatus::Approved);
    }

    #[test]
    fn second_decision_on_same_call_is_a_no_op() {
        let store = Store::open_in_memory().unwrap();
        let s = store.create_session(None).unwrap();
        store
            .create_pending_approval("call-2", &s.id, "run_shell", &serde_json::json!({}))
            .unwrap();
        assert!(store.approve("call-2").unwrap());
        // A second, conflicting decision must not flip an already-resolved row.
        assert!(!store.deny("call-2").unwrap());
        assert_eq!(store.get_approval("call-2").unwrap().unwrap().status, ApprovalStatus::Approved);
    }

    #[test]
    fn unknown_call_id_resolves_to_false() {
        let store = Store::open_in_memory().unwrap();
        assert!(!store.approve("does-not-exist").unwrap());
    }
}
