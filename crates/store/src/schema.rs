use rusqlite::Connection;

/// Create every table and index this crate depends on. Called once per
/// connection at open time; every statement is `IF NOT EXISTS` so this is
/// idempotent and doubles as the only "migration" mechanism this crate
/// needs at its current scale — a real schema_migrations table can be
/// reintroduced if the shape ever needs to evolve destructively.
pub fn init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA foreign_keys = ON;
        PRAGMA journal_mode = WAL;

        CREATE TABLE IF NOT EXISTS sessions (
            id                  TEXT PRIMARY KEY,
            title               TEXT,
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL,
            active_snapshot_id  TEXT,
            generation          INTEGER NOT NULL DEFAULT 0,
            auto_approve        INTEGER NOT NULL DEFAULT 0,
            model               TEXT,
            cached_total_tokens INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS messages (
            id                    TEXT PRIMARY KEY,
            session_id            TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            seq                   INTEGER NOT NULL,
            role                  TEXT NOT NULL,
            content               TEXT NOT NULL,
            pending_approval      INTEGER NOT NULL DEFAULT 0,
            estimated_token_count INTEGER NOT NULL DEFAULT 0,
            raw_token_count       INTEGER,
            created_at            TEXT NOT NULL,
            UNIQUE(session_id, seq)
        );
        CREATE INDEX IF NOT EXISTS idx_messages_session_seq ON messages(session_id, seq);

        CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
            body,
            content='',
            tokenize='trigram'
        );

        CREATE TABLE IF NOT EXISTS compaction_snapshots (
            id                       TEXT PRIMARY KEY,
            session_id               TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            boundary_seq             INTEGER NOT NULL,
            summary                  TEXT NOT NULL,
            summary_token_count      INTEGER NOT NULL,
            verbatim_message_ids     TEXT NOT NULL,
            verbatim_token_count     INTEGER NOT NULL,
            trigger_token_count      INTEGER NOT NULL,
            model                    TEXT NOT NULL,
            created_at               TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_snapshots_session ON compaction_snapshots(session_id);

        CREATE TABLE IF NOT EXISTS memories (
            id         TEXT PRIMARY KEY,
            session_id TEXT REFERENCES sessions(id) ON DELETE CASCADE,
            content    TEXT NOT NULL,
            token_count INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_memories_session ON memories(session_id);

        CREATE TABLE IF NOT EXISTS approvals (
            call_id      TEXT PRIMARY KEY,
            session_id   TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            tool_name    TEXT NOT NULL,
            arguments    TEXT NOT NULL,
            status       TEXT NOT NULL DEFAULT 'pending',
            created_at   TEXT NOT NULL,
            decided_at   TEXT
        );

        CREATE TABLE IF NOT EXISTS settings (
            key        TEXT PRIMARY KEY,
            value      TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        "#,
    )
}
