//! Table definitions and schema versioning.

use rusqlite::Connection;

use strand_domain::error::{Error, Result};

/// Schema version (increment when changing table definitions).
pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|e| Error::Storage(format!("reading schema version: {e}")))?;

    if current_version != 0 && current_version != SCHEMA_VERSION {
        return Err(Error::Storage(format!(
            "database schema version {current_version} is not supported (expected {SCHEMA_VERSION})"
        )));
    }

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            working_directory TEXT NOT NULL,
            model TEXT NOT NULL,
            root_event_id TEXT,
            head_event_id TEXT,
            parent_session_id TEXT,
            spawn_type TEXT,
            spawn_task TEXT,
            turn_count INTEGER NOT NULL DEFAULT 0,
            total_input_tokens INTEGER NOT NULL DEFAULT 0,
            total_output_tokens INTEGER NOT NULL DEFAULT 0,
            cache_read_tokens INTEGER NOT NULL DEFAULT 0,
            cache_creation_tokens INTEGER NOT NULL DEFAULT 0,
            total_cost REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            last_activity_at TEXT NOT NULL,
            ended_at TEXT
        );

        CREATE TABLE IF NOT EXISTS events (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            parent_id TEXT,
            sequence INTEGER NOT NULL,
            type TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            workspace_id TEXT NOT NULL,
            run_id TEXT,
            payload TEXT NOT NULL,
            deleted INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (session_id) REFERENCES sessions(id)
        );

        CREATE TABLE IF NOT EXISTS blobs (
            id TEXT PRIMARY KEY,
            content_type TEXT NOT NULL,
            data BLOB NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_events_session_seq ON events(session_id, sequence);
        CREATE INDEX IF NOT EXISTS idx_events_parent ON events(parent_id);
        CREATE INDEX IF NOT EXISTS idx_events_type_ts ON events(type, timestamp);

        CREATE VIRTUAL TABLE IF NOT EXISTS events_fts USING fts5(
            event_id UNINDEXED,
            session_id UNINDEXED,
            component UNINDEXED,
            message,
            error_message
        );
        "#,
    )
    .map_err(|e| Error::Storage(format!("initializing schema: {e}")))?;

    conn.pragma_update(None, "user_version", SCHEMA_VERSION)
        .map_err(|e| Error::Storage(format!("setting schema version: {e}")))?;

    Ok(())
}
