//! Full-text search over textual payload fields.
//!
//! Indexable kinds contribute their `message`/`content`/`text` fields (and
//! `error`/`errorMessage` for error events) to the `events_fts` FTS5 table at
//! append time; queries join back to `events` for kind/session/workspace
//! filtering and rank with bm25.

use rusqlite::params_from_iter;
use serde::Serialize;
use serde_json::Value;

use strand_domain::error::Result;
use strand_domain::event::EventKind;

use crate::db::{storage_err, Database};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Public types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Filters for a search query.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub session_id: Option<String>,
    pub workspace_id: Option<String>,
    pub kinds: Option<Vec<EventKind>>,
    pub limit: Option<usize>,
}

/// One ranked search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub event_id: String,
    pub session_id: String,
    /// Event kind string of the matched event.
    pub component: String,
    /// Highlighted snippet around the match.
    pub snippet: String,
    /// Higher is more relevant.
    pub relevance: f64,
}

const DEFAULT_LIMIT: usize = 50;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Query
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) fn search(db: &Database, query: &str, filters: &SearchFilters) -> Result<Vec<SearchHit>> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    // Quote each term so user input cannot inject FTS5 query syntax.
    let match_expr = trimmed
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "")))
        .collect::<Vec<_>>()
        .join(" ");

    let mut clauses: Vec<String> = vec!["events_fts MATCH ?1".into()];
    let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(match_expr)];

    if let Some(session_id) = &filters.session_id {
        args.push(Box::new(session_id.clone()));
        clauses.push(format!("events_fts.session_id = ?{}", args.len()));
    }
    if let Some(workspace_id) = &filters.workspace_id {
        args.push(Box::new(workspace_id.clone()));
        clauses.push(format!("e.workspace_id = ?{}", args.len()));
    }
    if let Some(kinds) = &filters.kinds {
        if !kinds.is_empty() {
            let mut placeholders = Vec::new();
            for kind in kinds {
                args.push(Box::new(kind.as_str().to_owned()));
                placeholders.push(format!("?{}", args.len()));
            }
            clauses.push(format!("e.type IN ({})", placeholders.join(", ")));
        }
    }

    let limit = filters.limit.unwrap_or(DEFAULT_LIMIT);
    let sql = format!(
        "SELECT events_fts.event_id, events_fts.session_id, events_fts.component,
                snippet(events_fts, -1, '[', ']', '…', 12) AS snip,
                bm25(events_fts) AS rank
         FROM events_fts
         JOIN events e ON e.id = events_fts.event_id
         WHERE {} AND e.deleted = 0
         ORDER BY rank
         LIMIT {limit}",
        clauses.join(" AND "),
    );

    let conn = db.conn();
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| storage_err("preparing search", e))?;
    let rows = stmt
        .query_map(params_from_iter(args.iter().map(|a| a.as_ref())), |row| {
            let rank: f64 = row.get(4)?;
            Ok(SearchHit {
                event_id: row.get(0)?,
                session_id: row.get(1)?,
                component: row.get(2)?,
                snippet: row.get(3)?,
                // bm25 returns lower-is-better negative scores.
                relevance: -rank,
            })
        })
        .map_err(|e| storage_err("running search", e))?;

    let mut hits = Vec::new();
    for row in rows {
        hits.push(row.map_err(|e| storage_err("running search", e))?);
    }
    Ok(hits)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Index extraction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pull the indexable text out of a payload: `(message, error_message)`.
pub(crate) fn indexable_text(kind: EventKind, payload: &Value) -> (Option<String>, Option<String>) {
    match kind {
        EventKind::ErrorAgent => {
            let error = payload
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_owned);
            (None, error)
        }
        EventKind::MessageAssistant => {
            // Assistant content is a block array; index the text blocks.
            let text = payload
                .get("content")
                .and_then(Value::as_array)
                .map(|blocks| {
                    blocks
                        .iter()
                        .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                        .filter_map(|b| b.get("text").and_then(Value::as_str))
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .filter(|t| !t.is_empty());
            (text, None)
        }
        _ => {
            let text = ["message", "text", "content", "reason"]
                .iter()
                .find_map(|key| payload.get(key).and_then(Value::as_str))
                .map(str::to_owned)
                .filter(|t| !t.is_empty());
            (text, None)
        }
    }
}
