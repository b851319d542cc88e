//! Session rows — creation, lookup, spawn metadata, aggregate stats.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use strand_domain::error::{Error, Result};
use strand_domain::tokens::{TokenRecord, TokenUsage};

use crate::db::{storage_err, Database};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One row of the `sessions` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub working_directory: String,
    pub model: String,
    pub root_event_id: Option<String>,
    pub head_event_id: Option<String>,
    pub parent_session_id: Option<String>,
    /// `None` | `"subsession"` | `"tmux"` | `"fork"`.
    pub spawn_type: Option<String>,
    pub spawn_task: Option<String>,
    pub turn_count: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub total_cost: f64,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

pub(crate) fn session_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    let parse_ts = |s: String| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    };
    Ok(SessionRecord {
        id: row.get("id")?,
        working_directory: row.get("working_directory")?,
        model: row.get("model")?,
        root_event_id: row.get("root_event_id")?,
        head_event_id: row.get("head_event_id")?,
        parent_session_id: row.get("parent_session_id")?,
        spawn_type: row.get("spawn_type")?,
        spawn_task: row.get("spawn_task")?,
        turn_count: row.get::<_, i64>("turn_count")? as u64,
        total_input_tokens: row.get::<_, i64>("total_input_tokens")? as u64,
        total_output_tokens: row.get::<_, i64>("total_output_tokens")? as u64,
        cache_read_tokens: row.get::<_, i64>("cache_read_tokens")? as u64,
        cache_creation_tokens: row.get::<_, i64>("cache_creation_tokens")? as u64,
        total_cost: row.get("total_cost")?,
        created_at: parse_ts(row.get("created_at")?),
        last_activity_at: parse_ts(row.get("last_activity_at")?),
        ended_at: row
            .get::<_, Option<String>>("ended_at")?
            .map(parse_ts),
    })
}

const SESSION_COLUMNS: &str = "id, working_directory, model, root_event_id, head_event_id, \
     parent_session_id, spawn_type, spawn_task, turn_count, total_input_tokens, \
     total_output_tokens, cache_read_tokens, cache_creation_tokens, total_cost, \
     created_at, last_activity_at, ended_at";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Filters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Filter for `list_sessions`.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub parent_session_id: Option<String>,
    pub spawn_type: Option<String>,
    /// When true, only sessions without an `ended_at`.
    pub active_only: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Operations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) fn create_session(
    db: &Database,
    id: &str,
    working_directory: &str,
    model: &str,
) -> Result<SessionRecord> {
    let now = Utc::now().to_rfc3339();
    db.conn()
        .execute(
            "INSERT INTO sessions (id, working_directory, model, created_at, last_activity_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![id, working_directory, model, now],
        )
        .map_err(|e| storage_err("creating session", e))?;
    get_session(db, id)?.ok_or_else(|| Error::SessionNotFound(id.to_owned()))
}

pub(crate) fn get_session(db: &Database, id: &str) -> Result<Option<SessionRecord>> {
    db.conn()
        .query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
            params![id],
            session_from_row,
        )
        .optional()
        .map_err(|e| storage_err("reading session", e))
}

pub(crate) fn update_spawn_info(
    db: &Database,
    id: &str,
    parent_session_id: &str,
    spawn_type: &str,
    spawn_task: &str,
) -> Result<()> {
    let changed = db
        .conn()
        .execute(
            "UPDATE sessions SET parent_session_id = ?2, spawn_type = ?3, spawn_task = ?4
             WHERE id = ?1",
            params![id, parent_session_id, spawn_type, spawn_task],
        )
        .map_err(|e| storage_err("updating spawn info", e))?;
    if changed == 0 {
        return Err(Error::SessionNotFound(id.to_owned()));
    }
    Ok(())
}

pub(crate) fn update_latest_model(db: &Database, id: &str, model: &str) -> Result<()> {
    let changed = db
        .conn()
        .execute(
            "UPDATE sessions SET model = ?2, last_activity_at = ?3 WHERE id = ?1",
            params![id, model, Utc::now().to_rfc3339()],
        )
        .map_err(|e| storage_err("updating model", e))?;
    if changed == 0 {
        return Err(Error::SessionNotFound(id.to_owned()));
    }
    Ok(())
}

/// Fold one finished turn into the session aggregates.
pub(crate) fn record_turn_stats(
    db: &Database,
    id: &str,
    record: &TokenRecord,
    usage: &TokenUsage,
    cost: f64,
) -> Result<()> {
    let changed = db
        .conn()
        .execute(
            "UPDATE sessions SET
                turn_count = turn_count + 1,
                total_input_tokens = total_input_tokens + ?2,
                total_output_tokens = total_output_tokens + ?3,
                cache_read_tokens = cache_read_tokens + ?4,
                cache_creation_tokens = cache_creation_tokens + ?5,
                total_cost = total_cost + ?6,
                last_activity_at = ?7
             WHERE id = ?1",
            params![
                id,
                record.computed.new_input_tokens as i64,
                usage.output_tokens as i64,
                usage.cache_read_tokens as i64,
                usage.cache_creation_tokens as i64,
                cost,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| storage_err("recording turn stats", e))?;
    if changed == 0 {
        return Err(Error::SessionNotFound(id.to_owned()));
    }
    Ok(())
}

/// List sessions newest-first with filters and pagination.
/// Returns `(page, total_matching)`.
pub(crate) fn list_sessions(
    db: &Database,
    filter: &SessionFilter,
    limit: usize,
    offset: usize,
) -> Result<(Vec<SessionRecord>, usize)> {
    let mut clauses: Vec<String> = Vec::new();
    let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(parent) = &filter.parent_session_id {
        args.push(Box::new(parent.clone()));
        clauses.push(format!("parent_session_id = ?{}", args.len()));
    }
    if let Some(spawn) = &filter.spawn_type {
        args.push(Box::new(spawn.clone()));
        clauses.push(format!("spawn_type = ?{}", args.len()));
    }
    if filter.active_only {
        clauses.push("ended_at IS NULL".to_string());
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };

    let conn = db.conn();
    let total: i64 = conn
        .query_row(
            &format!("SELECT COUNT(*) FROM sessions {where_sql}"),
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            |row| row.get(0),
        )
        .map_err(|e| storage_err("counting sessions", e))?;

    let mut stmt = conn
        .prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions {where_sql}
             ORDER BY last_activity_at DESC LIMIT {limit} OFFSET {offset}"
        ))
        .map_err(|e| storage_err("listing sessions", e))?;
    let rows = stmt
        .query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            session_from_row,
        )
        .map_err(|e| storage_err("listing sessions", e))?;

    let mut page = Vec::new();
    for row in rows {
        page.push(row.map_err(|e| storage_err("listing sessions", e))?);
    }
    Ok((page, total as usize))
}

pub(crate) fn mark_ended(db: &Database, id: &str) -> Result<()> {
    db.conn()
        .execute(
            "UPDATE sessions SET ended_at = ?2 WHERE id = ?1",
            params![id, Utc::now().to_rfc3339()],
        )
        .map_err(|e| storage_err("marking session ended", e))?;
    Ok(())
}
