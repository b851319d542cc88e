//! The event store — append-only, ordered, branchable.
//!
//! `append` is the single write path. It runs entirely under a per-session
//! lock plus one SQLite transaction, so readers observe either the whole new
//! event (row, index entry, head pointer) or none of it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, OptionalExtension, Row, Transaction};
use serde_json::Value;

use strand_domain::config::StorageConfig;
use strand_domain::error::{Error, Result};
use strand_domain::event::{Event, EventKind};
use strand_domain::payload::validate_payload;

use crate::blobs::{self, Blob};
use crate::db::{storage_err, Database};
use crate::search::{self, SearchFilters, SearchHit};
use crate::sessions::{self, SessionFilter, SessionRecord};
use crate::tree::{self, BranchGroup, TreeNode};

pub(crate) const EVENT_COLUMNS: &str =
    "id, session_id, parent_id, sequence, type, timestamp, workspace_id, run_id, payload";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Append request
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Input to `append`.
#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub kind: EventKind,
    pub payload: Value,
    /// Defaults to the current head when omitted. An explicit parent that is
    /// not the head creates a branch point and does not advance head.
    pub parent_id: Option<String>,
    pub run_id: Option<String>,
}

impl AppendRequest {
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            parent_id: None,
            run_id: None,
        }
    }

    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// EventStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct EventStore {
    db: Database,
    storage: StorageConfig,
    /// Per-session write locks — the only in-process serialization point
    /// for appends.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Workspace identifier stamped on every event.
    workspace_id: String,
}

impl EventStore {
    pub fn new(db: Database, workspace_id: impl Into<String>, storage: StorageConfig) -> Self {
        Self {
            db,
            storage,
            locks: Mutex::new(HashMap::new()),
            workspace_id: workspace_id.into(),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(session_id.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ── Sessions ──────────────────────────────────────────────────

    /// Create a session row. The caller appends `session.start` separately.
    pub fn create_session(&self, working_directory: &str, model: &str) -> Result<SessionRecord> {
        let id = uuid::Uuid::new_v4().to_string();
        sessions::create_session(&self.db, &id, working_directory, model)
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        sessions::get_session(&self.db, session_id)
    }

    pub fn list_sessions(
        &self,
        filter: &SessionFilter,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<SessionRecord>, usize)> {
        sessions::list_sessions(&self.db, filter, limit, offset)
    }

    pub fn update_session_spawn_info(
        &self,
        session_id: &str,
        parent_session_id: &str,
        spawn_type: &str,
        spawn_task: &str,
    ) -> Result<()> {
        sessions::update_spawn_info(&self.db, session_id, parent_session_id, spawn_type, spawn_task)
    }

    pub fn update_latest_model(&self, session_id: &str, model: &str) -> Result<()> {
        sessions::update_latest_model(&self.db, session_id, model)
    }

    pub fn record_turn_stats(
        &self,
        session_id: &str,
        record: &strand_domain::tokens::TokenRecord,
        usage: &strand_domain::tokens::TokenUsage,
        cost: f64,
    ) -> Result<()> {
        sessions::record_turn_stats(&self.db, session_id, record, usage, cost)
    }

    // ── Append ────────────────────────────────────────────────────

    /// Append one event. All-or-nothing: on any failure no row, no index
    /// entry, and no head movement are visible.
    pub fn append(&self, session_id: &str, req: AppendRequest) -> Result<Event> {
        validate_payload(req.kind, &req.payload)?;

        let lock = self.session_lock(session_id);
        let _guard = lock.lock();

        let mut conn = self.db.conn();
        let tx = conn
            .transaction()
            .map_err(|e| storage_err("opening append transaction", e))?;

        // Current head + root under the same transaction the write uses.
        let head: Option<(Option<String>, Option<String>)> = tx
            .query_row(
                "SELECT head_event_id, root_event_id FROM sessions WHERE id = ?1",
                params![session_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| storage_err("reading session head", e))?;
        let (head_event_id, _root_event_id) = match head {
            Some(pair) => pair,
            None => return Err(Error::SessionNotFound(session_id.to_owned())),
        };

        // Resolve parent: explicit parent must belong to this session;
        // omitted parent defaults to the head.
        let parent_id = match &req.parent_id {
            Some(pid) => {
                let owner: Option<String> = tx
                    .query_row(
                        "SELECT session_id FROM events WHERE id = ?1",
                        params![pid],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(|e| storage_err("resolving parent", e))?;
                match owner {
                    Some(sid) if sid == session_id => Some(pid.clone()),
                    _ => {
                        return Err(Error::ParentMismatch {
                            session_id: session_id.to_owned(),
                            parent_id: pid.clone(),
                        })
                    }
                }
            }
            None => head_event_id.clone(),
        };

        // Next sequence: MAX+1 keeps sequences strictly increasing for the
        // whole session and contiguous on the active branch.
        let sequence: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM events WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .map_err(|e| storage_err("assigning sequence", e))?;

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let timestamp = now.to_rfc3339_opts(SecondsFormat::Millis, true);

        // Oversized `content` spills to the blob table before the row lands.
        let payload = spill_oversized_content(&tx, &self.storage, req.payload)?;

        tx.execute(
            "INSERT INTO events (id, session_id, parent_id, sequence, type, timestamp, workspace_id, run_id, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                session_id,
                parent_id,
                sequence,
                req.kind.as_str(),
                timestamp,
                self.workspace_id,
                req.run_id,
                serde_json::to_string(&payload)?,
            ],
        )
        .map_err(|e| storage_err("inserting event", e))?;

        if req.kind.is_indexable() {
            let (message, error_message) = search::indexable_text(req.kind, &payload);
            if message.is_some() || error_message.is_some() {
                tx.execute(
                    "INSERT INTO events_fts (event_id, session_id, component, message, error_message)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        id,
                        session_id,
                        req.kind.as_str(),
                        message.unwrap_or_default(),
                        error_message.unwrap_or_default(),
                    ],
                )
                .map_err(|e| storage_err("indexing event", e))?;
            }
        }

        // Head advances only when the new event extends the current head.
        // An append under any other parent is a branch point and leaves the
        // head where it is.
        let advances_head = parent_id == head_event_id;
        if advances_head {
            tx.execute(
                "UPDATE sessions SET
                    head_event_id = ?2,
                    root_event_id = COALESCE(root_event_id, ?2),
                    last_activity_at = ?3
                 WHERE id = ?1",
                params![session_id, id, timestamp],
            )
            .map_err(|e| storage_err("advancing head", e))?;
        } else {
            tx.execute(
                "UPDATE sessions SET last_activity_at = ?2 WHERE id = ?1",
                params![session_id, timestamp],
            )
            .map_err(|e| storage_err("touching session", e))?;
        }

        if req.kind == EventKind::SessionEnd {
            tx.execute(
                "UPDATE sessions SET ended_at = ?2 WHERE id = ?1",
                params![session_id, timestamp],
            )
            .map_err(|e| storage_err("marking session ended", e))?;
        }

        tx.commit()
            .map_err(|e| storage_err("committing append", e))?;

        tracing::debug!(
            session_id,
            event_id = %id,
            kind = %req.kind,
            sequence,
            advances_head,
            "event appended"
        );

        Ok(Event {
            id,
            parent_id,
            session_id: session_id.to_owned(),
            workspace_id: self.workspace_id.clone(),
            sequence: sequence as u64,
            timestamp: now,
            kind: req.kind,
            payload,
            run_id: req.run_id,
        })
    }

    // ── Reads ─────────────────────────────────────────────────────

    pub fn get_event(&self, event_id: &str) -> Result<Option<Event>> {
        self.db
            .conn()
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"),
                params![event_id],
                event_from_row,
            )
            .optional()
            .map_err(|e| storage_err("reading event", e))
    }

    /// Events on the active branch, root → head, in sequence order.
    pub fn get_events(&self, session_id: &str) -> Result<Vec<Event>> {
        let session = self
            .get_session(session_id)?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_owned()))?;
        let head = match session.head_event_id {
            Some(head) => head,
            None => return Ok(Vec::new()),
        };
        self.lineage_of(&head)
    }

    /// Every event of a session regardless of branch, in sequence order.
    pub fn get_all_events(&self, session_id: &str) -> Result<Vec<Event>> {
        let conn = self.db.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM events WHERE session_id = ?1 ORDER BY sequence ASC"
            ))
            .map_err(|e| storage_err("reading session events", e))?;
        let rows = stmt
            .query_map(params![session_id], event_from_row)
            .map_err(|e| storage_err("reading session events", e))?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row.map_err(|e| storage_err("reading session events", e))?);
        }
        Ok(events)
    }

    /// Direct children of an event, in sequence order.
    pub fn get_children(&self, event_id: &str) -> Result<Vec<Event>> {
        let conn = self.db.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM events WHERE parent_id = ?1 ORDER BY sequence ASC"
            ))
            .map_err(|e| storage_err("reading children", e))?;
        let rows = stmt
            .query_map(params![event_id], event_from_row)
            .map_err(|e| storage_err("reading children", e))?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row.map_err(|e| storage_err("reading children", e))?);
        }
        Ok(events)
    }

    /// Events from the session root to `event_id`, inclusive, in sequence
    /// order.
    pub fn get_ancestors(&self, event_id: &str) -> Result<Vec<Event>> {
        if self.get_event(event_id)?.is_none() {
            return Err(Error::EventNotFound(event_id.to_owned()));
        }
        self.lineage_of(event_id)
    }

    fn lineage_of(&self, event_id: &str) -> Result<Vec<Event>> {
        let conn = self.db.conn();
        let mut stmt = conn
            .prepare(&format!(
                "WITH RECURSIVE lineage(id) AS (
                     SELECT ?1
                     UNION ALL
                     SELECT e.parent_id FROM events e
                     JOIN lineage l ON e.id = l.id
                     WHERE e.parent_id IS NOT NULL
                 )
                 SELECT {EVENT_COLUMNS} FROM events
                 WHERE id IN (SELECT id FROM lineage)
                 ORDER BY sequence ASC"
            ))
            .map_err(|e| storage_err("walking lineage", e))?;
        let rows = stmt
            .query_map(params![event_id], event_from_row)
            .map_err(|e| storage_err("walking lineage", e))?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row.map_err(|e| storage_err("walking lineage", e))?);
        }
        Ok(events)
    }

    // ── Deletion marker ───────────────────────────────────────────

    /// Append a `message.deleted` marker and flag the target. The target
    /// row itself is preserved.
    pub fn delete_message(
        &self,
        session_id: &str,
        target_event_id: &str,
        reason: &str,
    ) -> Result<Event> {
        let target = self
            .get_event(target_event_id)?
            .ok_or_else(|| Error::EventNotFound(target_event_id.to_owned()))?;
        if target.session_id != session_id {
            return Err(Error::EventNotFound(target_event_id.to_owned()));
        }

        let marker = self.append(
            session_id,
            AppendRequest::new(
                EventKind::MessageDeleted,
                serde_json::json!({
                    "targetEventId": target_event_id,
                    "targetType": target.kind.as_str(),
                    "reason": reason,
                }),
            ),
        )?;

        self.db
            .conn()
            .execute(
                "UPDATE events SET deleted = 1 WHERE id = ?1",
                params![target_event_id],
            )
            .map_err(|e| storage_err("flagging deleted event", e))?;

        Ok(marker)
    }

    // ── Fork ──────────────────────────────────────────────────────

    /// Create a new session whose root event references `source_event_id`
    /// by payload. The source session is untouched.
    pub fn fork(
        &self,
        source_session_id: &str,
        source_event_id: &str,
        name: Option<&str>,
    ) -> Result<(SessionRecord, Event)> {
        let source = self
            .get_session(source_session_id)?
            .ok_or_else(|| Error::SessionNotFound(source_session_id.to_owned()))?;
        let source_event = self
            .get_event(source_event_id)?
            .ok_or_else(|| Error::EventNotFound(source_event_id.to_owned()))?;
        if source_event.session_id != source_session_id {
            return Err(Error::EventNotFound(source_event_id.to_owned()));
        }

        let fork = self.create_session(&source.working_directory, &source.model)?;
        sessions::update_spawn_info(&self.db, &fork.id, source_session_id, "fork", "")?;

        let mut payload = serde_json::json!({
            "sourceSessionId": source_session_id,
            "sourceEventId": source_event_id,
        });
        if let Some(name) = name {
            payload["name"] = Value::String(name.to_owned());
        }
        let root = self.append(&fork.id, AppendRequest::new(EventKind::SessionFork, payload))?;

        let fork = self
            .get_session(&fork.id)?
            .ok_or_else(|| Error::SessionNotFound(fork.id.clone()))?;

        tracing::info!(
            source_session_id,
            source_event_id,
            fork_session_id = %fork.id,
            "session forked"
        );

        Ok((fork, root))
    }

    pub fn mark_session_ended(&self, session_id: &str) -> Result<()> {
        sessions::mark_ended(&self.db, session_id)
    }

    // ── Blobs ─────────────────────────────────────────────────────

    pub fn store_blob(&self, data: &[u8], content_type: &str) -> Result<String> {
        blobs::store_blob(&self.db, data, content_type)
    }

    pub fn get_blob(&self, blob_id: &str) -> Result<Option<Blob>> {
        blobs::get_blob(&self.db, blob_id)
    }

    // ── Search ────────────────────────────────────────────────────

    pub fn search(&self, query: &str, filters: &SearchFilters) -> Result<Vec<SearchHit>> {
        search::search(&self.db, query, filters)
    }

    // ── Branch / tree queries ─────────────────────────────────────

    /// Whether any event of this session has more than one child.
    pub fn session_has_branches(&self, session_id: &str) -> Result<bool> {
        tree::has_branches(&self.db, session_id)
    }

    pub fn list_branches(&self, session_id: &str) -> Result<Vec<BranchGroup>> {
        let events = self.get_all_events(session_id)?;
        let session = self
            .get_session(session_id)?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_owned()))?;
        Ok(tree::branch_groups(&events, session.head_event_id.as_deref()))
    }

    pub fn event_tree(&self, session_id: &str) -> Result<Vec<TreeNode>> {
        let events = self.get_all_events(session_id)?;
        let session = self
            .get_session(session_id)?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_owned()))?;
        Ok(tree::build_tree(&events, session.head_event_id.as_deref()))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payload filtering
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Spill an oversized `content` string to the blob table.
///
/// Over the blob threshold the full content is stored as a blob and the
/// payload gains a `blobId`; over the preview threshold the inline copy is
/// additionally replaced by a truncated preview with `truncated: true`.
fn spill_oversized_content(
    tx: &Transaction<'_>,
    storage: &StorageConfig,
    mut payload: Value,
) -> Result<Value> {
    let content_len = payload
        .get("content")
        .and_then(|v| v.as_str())
        .map(str::len)
        .unwrap_or(0);
    if content_len <= storage.blob_threshold_bytes {
        return Ok(payload);
    }

    let content = payload
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_owned();

    let blob_id = blobs::blob_id(content.as_bytes());
    tx.execute(
        "INSERT OR IGNORE INTO blobs (id, content_type, data) VALUES (?1, ?2, ?3)",
        params![blob_id, "text/plain", content.as_bytes()],
    )
    .map_err(|e| storage_err("spilling content blob", e))?;

    let obj = payload
        .as_object_mut()
        .ok_or_else(|| Error::Validation("payload must be an object".into()))?;
    obj.insert("blobId".into(), Value::String(blob_id));

    if content_len > storage.preview_threshold_bytes {
        let preview = truncate_utf8(&content, storage.preview_bytes);
        obj.insert("content".into(), Value::String(preview));
        obj.insert("truncated".into(), Value::Bool(true));
    }

    Ok(payload)
}

fn truncate_utf8(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_owned();
    }
    let mut end = max;
    while !s.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Row mapping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    let kind_str: String = row.get("type")?;
    let kind = EventKind::parse(&kind_str).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown event kind '{kind_str}'").into(),
        )
    })?;
    let payload_str: String = row.get("payload")?;
    let payload: Value = serde_json::from_str(&payload_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            8,
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    })?;
    let ts_str: String = row.get("timestamp")?;
    let timestamp = DateTime::parse_from_rfc3339(&ts_str)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    Ok(Event {
        id: row.get("id")?,
        parent_id: row.get("parent_id")?,
        session_id: row.get("session_id")?,
        workspace_id: row.get("workspace_id")?,
        sequence: row.get::<_, i64>("sequence")? as u64,
        timestamp,
        kind,
        payload,
        run_id: row.get("run_id")?,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> EventStore {
        EventStore::new(
            Database::open_in_memory().unwrap(),
            "ws1",
            StorageConfig::default(),
        )
    }

    fn start_payload() -> Value {
        json!({"workingDirectory": "/w", "model": "m1"})
    }

    fn user_payload(text: &str) -> Value {
        json!({"content": text, "turn": 1})
    }

    fn seeded(store: &EventStore) -> SessionRecord {
        let session = store.create_session("/w", "m1").unwrap();
        store
            .append(
                &session.id,
                AppendRequest::new(EventKind::SessionStart, start_payload()),
            )
            .unwrap();
        store.get_session(&session.id).unwrap().unwrap()
    }

    #[test]
    fn append_assigns_contiguous_sequences() {
        let store = store();
        let session = seeded(&store);

        let e2 = store
            .append(
                &session.id,
                AppendRequest::new(EventKind::MessageUser, user_payload("hello")),
            )
            .unwrap();
        let e3 = store
            .append(
                &session.id,
                AppendRequest::new(EventKind::MessageUser, user_payload("again")),
            )
            .unwrap();

        assert_eq!(e2.sequence, 2);
        assert_eq!(e3.sequence, 3);
        assert_eq!(e3.parent_id.as_deref(), Some(e2.id.as_str()));
    }

    #[test]
    fn head_advances_on_default_parent() {
        let store = store();
        let session = seeded(&store);
        let event = store
            .append(
                &session.id,
                AppendRequest::new(EventKind::MessageUser, user_payload("hi")),
            )
            .unwrap();

        let session = store.get_session(&session.id).unwrap().unwrap();
        assert_eq!(session.head_event_id.as_deref(), Some(event.id.as_str()));
        // Head is a leaf right after any head-advancing append.
        assert!(store.get_children(&event.id).unwrap().is_empty());
    }

    #[test]
    fn explicit_head_parent_equals_default() {
        let store = store();
        let session = seeded(&store);
        let head = session.head_event_id.clone().unwrap();

        let explicit = store
            .append(
                &session.id,
                AppendRequest::new(EventKind::MessageUser, user_payload("a")).with_parent(head),
            )
            .unwrap();

        let session = store.get_session(&session.id).unwrap().unwrap();
        assert_eq!(session.head_event_id.as_deref(), Some(explicit.id.as_str()));
    }

    #[test]
    fn branch_append_does_not_advance_head() {
        let store = store();
        let session = seeded(&store);
        let root_id = session.head_event_id.clone().unwrap();

        let tip = store
            .append(
                &session.id,
                AppendRequest::new(EventKind::MessageUser, user_payload("main")),
            )
            .unwrap();
        // Branch off the root while head sits on `tip`.
        let branch = store
            .append(
                &session.id,
                AppendRequest::new(EventKind::MessageUser, user_payload("branch"))
                    .with_parent(root_id.clone()),
            )
            .unwrap();

        let session = store.get_session(&session.id).unwrap().unwrap();
        assert_eq!(session.head_event_id.as_deref(), Some(tip.id.as_str()));
        assert!(branch.sequence > tip.sequence);
        assert_eq!(store.get_children(&root_id).unwrap().len(), 2);
        assert!(store.session_has_branches(&session.id).unwrap());
    }

    #[test]
    fn parent_from_other_session_rejected() {
        let store = store();
        let a = seeded(&store);
        let b = seeded(&store);
        let foreign_parent = a.head_event_id.unwrap();

        let err = store
            .append(
                &b.id,
                AppendRequest::new(EventKind::MessageUser, user_payload("x"))
                    .with_parent(foreign_parent),
            )
            .unwrap_err();
        assert_eq!(err.code(), "parent_mismatch");
    }

    #[test]
    fn unknown_session_rejected() {
        let store = store();
        let err = store
            .append(
                "nope",
                AppendRequest::new(EventKind::MessageUser, user_payload("x")),
            )
            .unwrap_err();
        assert_eq!(err.code(), "session_not_found");
    }

    #[test]
    fn invalid_payload_rejected_before_any_write() {
        let store = store();
        let session = seeded(&store);
        let before = store.get_events(&session.id).unwrap().len();

        let err = store
            .append(
                &session.id,
                AppendRequest::new(EventKind::MessageUser, json!({"turn": 1})),
            )
            .unwrap_err();
        assert_eq!(err.code(), "validation");
        assert_eq!(store.get_events(&session.id).unwrap().len(), before);
    }

    #[test]
    fn get_events_returns_active_branch_only() {
        let store = store();
        let session = seeded(&store);
        let root_id = session.head_event_id.clone().unwrap();

        let main1 = store
            .append(
                &session.id,
                AppendRequest::new(EventKind::MessageUser, user_payload("main1")),
            )
            .unwrap();
        store
            .append(
                &session.id,
                AppendRequest::new(EventKind::MessageUser, user_payload("side"))
                    .with_parent(root_id),
            )
            .unwrap();
        let main2 = store
            .append(
                &session.id,
                AppendRequest::new(EventKind::MessageUser, user_payload("main2"))
                    .with_parent(main1.id.clone()),
            )
            .unwrap();

        let events = store.get_events(&session.id).unwrap();
        let ids: Vec<_> = events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(events.len(), 3);
        assert_eq!(*ids.last().unwrap(), main2.id.as_str());
        assert!(ids.contains(&main1.id.as_str()));
    }

    #[test]
    fn ancestors_match_events_prefix() {
        let store = store();
        let session = seeded(&store);
        for i in 0..4 {
            store
                .append(
                    &session.id,
                    AppendRequest::new(EventKind::MessageUser, user_payload(&format!("m{i}"))),
                )
                .unwrap();
        }
        let events = store.get_events(&session.id).unwrap();
        let mid = &events[2];

        let ancestors = store.get_ancestors(&mid.id).unwrap();
        let prefix: Vec<_> = events[..3].iter().map(|e| e.id.clone()).collect();
        let got: Vec<_> = ancestors.iter().map(|e| e.id.clone()).collect();
        assert_eq!(got, prefix);
    }

    #[test]
    fn ancestors_of_unknown_event_fails() {
        let store = store();
        let err = store.get_ancestors("ghost").unwrap_err();
        assert_eq!(err.code(), "event_not_found");
    }

    #[test]
    fn delete_message_flags_and_appends_marker() {
        let store = store();
        let session = seeded(&store);
        let target = store
            .append(
                &session.id,
                AppendRequest::new(EventKind::MessageUser, user_payload("oops")),
            )
            .unwrap();

        let marker = store
            .delete_message(&session.id, &target.id, "user request")
            .unwrap();
        assert_eq!(marker.kind, EventKind::MessageDeleted);
        assert_eq!(marker.payload_str("targetEventId"), Some(target.id.as_str()));
        assert_eq!(marker.payload_str("targetType"), Some("message.user"));

        // Target row preserved.
        assert!(store.get_event(&target.id).unwrap().is_some());
    }

    #[test]
    fn fork_creates_disjoint_session() {
        let store = store();
        let session = seeded(&store);
        let mut last = None;
        for i in 0..3 {
            last = Some(
                store
                    .append(
                        &session.id,
                        AppendRequest::new(EventKind::MessageUser, user_payload(&format!("m{i}"))),
                    )
                    .unwrap(),
            );
        }
        let fork_point = last.unwrap();
        let head_before = store
            .get_session(&session.id)
            .unwrap()
            .unwrap()
            .head_event_id;

        let (fork, root) = store
            .fork(&session.id, &fork_point.id, Some("experiment"))
            .unwrap();

        assert_ne!(fork.id, session.id);
        assert_eq!(fork.spawn_type.as_deref(), Some("fork"));
        assert_eq!(fork.parent_session_id.as_deref(), Some(session.id.as_str()));
        // Root references the source by payload, not by parent id.
        assert!(root.parent_id.is_none());
        assert_eq!(root.payload_str("sourceSessionId"), Some(session.id.as_str()));
        assert_eq!(root.payload_str("sourceEventId"), Some(fork_point.id.as_str()));
        assert_eq!(root.payload_str("name"), Some("experiment"));
        // Fork's log is just its root; source head untouched.
        assert_eq!(store.get_events(&fork.id).unwrap().len(), 1);
        assert_eq!(
            store.get_session(&session.id).unwrap().unwrap().head_event_id,
            head_before
        );
    }

    #[test]
    fn large_content_spills_to_blob() {
        let store = store();
        let session = seeded(&store);
        let big = "x".repeat(3 * 1024);

        let event = store
            .append(
                &session.id,
                AppendRequest::new(
                    EventKind::ToolResult,
                    json!({
                        "toolCallId": "t1",
                        "content": big,
                        "isError": false,
                        "runId": "r1",
                    }),
                ),
            )
            .unwrap();

        let blob_id = event.payload_str("blobId").unwrap().to_owned();
        let blob = store.get_blob(&blob_id).unwrap().unwrap();
        assert_eq!(blob.data.len(), 3 * 1024);
        // Under the preview threshold the inline copy stays complete.
        assert_eq!(event.payload_str("content").unwrap().len(), 3 * 1024);
        assert!(event.payload.get("truncated").is_none());
    }

    #[test]
    fn huge_content_replaced_by_preview() {
        let store = store();
        let session = seeded(&store);
        let huge = "y".repeat(20 * 1024);

        let event = store
            .append(
                &session.id,
                AppendRequest::new(
                    EventKind::ToolResult,
                    json!({
                        "toolCallId": "t1",
                        "content": huge,
                        "isError": false,
                        "runId": "r1",
                    }),
                ),
            )
            .unwrap();

        assert_eq!(event.payload["truncated"], json!(true));
        let inline = event.payload_str("content").unwrap();
        assert!(inline.len() < 2 * 1024);
        // Full content recoverable through the blob.
        let blob = store
            .get_blob(event.payload_str("blobId").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(blob.data.len(), 20 * 1024);
    }

    #[test]
    fn run_id_carried_on_events() {
        let store = store();
        let session = seeded(&store);
        let event = store
            .append(
                &session.id,
                AppendRequest::new(EventKind::MessageUser, user_payload("hi")).with_run("r42"),
            )
            .unwrap();
        assert_eq!(event.run_id.as_deref(), Some("r42"));

        let reread = store.get_event(&event.id).unwrap().unwrap();
        assert_eq!(reread.run_id.as_deref(), Some("r42"));
    }

    #[test]
    fn session_end_sets_ended_at() {
        let store = store();
        let session = seeded(&store);
        store
            .append(
                &session.id,
                AppendRequest::new(EventKind::SessionEnd, json!({"reason": "done"})),
            )
            .unwrap();
        let session = store.get_session(&session.id).unwrap().unwrap();
        assert!(session.ended_at.is_some());
    }

    #[test]
    fn concurrent_appends_keep_sequences_strict() {
        use std::sync::Arc;
        let store = Arc::new(store());
        let session = seeded(&store);

        let mut handles = Vec::new();
        for t in 0..4 {
            let store = store.clone();
            let sid = session.id.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..10 {
                    store
                        .append(
                            &sid,
                            AppendRequest::new(
                                EventKind::MessageUser,
                                json!({"content": format!("t{t}m{i}"), "turn": 1}),
                            ),
                        )
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let events = store.get_all_events(&session.id).unwrap();
        assert_eq!(events.len(), 41); // session.start + 40 appends
        for pair in events.windows(2) {
            assert!(pair[0].sequence < pair[1].sequence);
        }
    }
}
