//! Branch detection and tree visualization over a session's event DAG.

use std::collections::{HashMap, HashSet};

use rusqlite::params;
use serde::Serialize;

use strand_domain::error::Result;
use strand_domain::event::{Event, EventKind};

use crate::db::{storage_err, Database};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Public types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One node of the visualized event tree.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    pub id: String,
    pub parent_id: Option<String>,
    pub kind: String,
    pub timestamp: String,
    /// Short human-readable label derived from the payload.
    pub summary: String,
    pub has_children: bool,
    pub child_count: usize,
    /// Distance from the session root.
    pub depth: usize,
    pub is_branch_point: bool,
    pub is_head: bool,
}

/// The children of one branch point, with the main-line child marked.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchGroup {
    pub branch_point_id: String,
    /// Child on the head's ancestor path, if any.
    pub main_child_id: Option<String>,
    /// All children in sequence order.
    pub child_ids: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Queries
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A session has branches iff some event has at least two children.
pub(crate) fn has_branches(db: &Database, session_id: &str) -> Result<bool> {
    let count: i64 = db
        .conn()
        .query_row(
            "SELECT COUNT(*) FROM (
                 SELECT parent_id FROM events
                 WHERE session_id = ?1 AND parent_id IS NOT NULL
                 GROUP BY parent_id HAVING COUNT(*) > 1
             )",
            params![session_id],
            |row| row.get(0),
        )
        .map_err(|e| storage_err("counting branch points", e))?;
    Ok(count > 0)
}

/// Group the children of every branch point, marking the main-line child
/// (the one on the head's ancestor path).
pub(crate) fn branch_groups(events: &[Event], head_event_id: Option<&str>) -> Vec<BranchGroup> {
    let children = children_by_parent(events);
    let head_path = head_ancestor_path(events, head_event_id);

    let mut groups = Vec::new();
    for event in events {
        let kids = match children.get(event.id.as_str()) {
            Some(kids) if kids.len() > 1 => kids,
            _ => continue,
        };
        let main_child_id = kids
            .iter()
            .find(|id| head_path.contains(id.as_str()))
            .cloned();
        groups.push(BranchGroup {
            branch_point_id: event.id.clone(),
            main_child_id,
            child_ids: kids.clone(),
        });
    }
    groups
}

/// Build the visualization tree for a session's full event set.
pub(crate) fn build_tree(events: &[Event], head_event_id: Option<&str>) -> Vec<TreeNode> {
    let children = children_by_parent(events);

    // Depth via parent chain; events arrive in sequence order so parents
    // resolve before children.
    let mut depths: HashMap<&str, usize> = HashMap::new();
    for event in events {
        let depth = event
            .parent_id
            .as_deref()
            .and_then(|pid| depths.get(pid).copied())
            .map(|d| d + 1)
            .unwrap_or(0);
        depths.insert(event.id.as_str(), depth);
    }

    events
        .iter()
        .map(|event| {
            let child_count = children
                .get(event.id.as_str())
                .map(Vec::len)
                .unwrap_or(0);
            TreeNode {
                id: event.id.clone(),
                parent_id: event.parent_id.clone(),
                kind: event.kind.as_str().to_owned(),
                timestamp: event.timestamp.to_rfc3339(),
                summary: summarize(event),
                has_children: child_count > 0,
                child_count,
                depth: depths.get(event.id.as_str()).copied().unwrap_or(0),
                is_branch_point: child_count > 1,
                is_head: Some(event.id.as_str()) == head_event_id,
            }
        })
        .collect()
}

fn children_by_parent(events: &[Event]) -> HashMap<&str, Vec<String>> {
    let mut children: HashMap<&str, Vec<String>> = HashMap::new();
    for event in events {
        if let Some(parent) = event.parent_id.as_deref() {
            children.entry(parent).or_default().push(event.id.clone());
        }
    }
    children
}

fn head_ancestor_path<'a>(events: &'a [Event], head_event_id: Option<&str>) -> HashSet<&'a str> {
    let by_id: HashMap<&str, &Event> = events.iter().map(|e| (e.id.as_str(), e)).collect();
    let mut path = HashSet::new();
    let mut cursor = head_event_id.and_then(|id| by_id.get(id).copied());
    while let Some(event) = cursor {
        path.insert(event.id.as_str());
        cursor = event
            .parent_id
            .as_deref()
            .and_then(|pid| by_id.get(pid).copied());
    }
    path
}

/// A short label for the tree view, derived from kind-specific payload.
fn summarize(event: &Event) -> String {
    const MAX: usize = 60;
    let text = match event.kind {
        EventKind::SessionStart => format!(
            "session started ({})",
            event.payload_str("model").unwrap_or("?")
        ),
        EventKind::SessionEnd => format!(
            "session ended: {}",
            event.payload_str("reason").unwrap_or("?")
        ),
        EventKind::SessionFork => format!(
            "forked from {}",
            event.payload_str("sourceSessionId").unwrap_or("?")
        ),
        EventKind::MessageUser => event.payload_str("content").unwrap_or("").to_owned(),
        EventKind::MessageAssistant => {
            let text = event
                .payload
                .get("content")
                .and_then(|c| c.as_array())
                .and_then(|blocks| {
                    blocks.iter().find_map(|b| {
                        (b.get("type").and_then(|t| t.as_str()) == Some("text"))
                            .then(|| b.get("text").and_then(|t| t.as_str()))
                            .flatten()
                    })
                })
                .unwrap_or("");
            if text.is_empty() {
                "assistant message".to_owned()
            } else {
                text.to_owned()
            }
        }
        EventKind::MessageDeleted => format!(
            "deleted {}",
            event.payload_str("targetEventId").unwrap_or("?")
        ),
        EventKind::ToolCall => format!("tool: {}", event.payload_str("name").unwrap_or("?")),
        EventKind::ToolResult => {
            let err = event
                .payload
                .get("isError")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if err {
                "tool result (error)".to_owned()
            } else {
                "tool result".to_owned()
            }
        }
        EventKind::StreamTurnStart => {
            format!("turn {} started", event.payload_u64("turn").unwrap_or(0))
        }
        EventKind::StreamTurnEnd => {
            format!("turn {} ended", event.payload_u64("turn").unwrap_or(0))
        }
        EventKind::ConfigModelSwitch => format!(
            "model → {}",
            event.payload_str("newModel").unwrap_or("?")
        ),
        EventKind::CompactBoundary => "context compacted".to_owned(),
        EventKind::ContextCleared => "context cleared".to_owned(),
        EventKind::HookTriggered => "hooks triggered".to_owned(),
        EventKind::HookCompleted => "hooks completed".to_owned(),
        EventKind::PlanModeEntered => "plan mode entered".to_owned(),
        EventKind::PlanModeExited => "plan mode exited".to_owned(),
        EventKind::SubagentSpawned => format!(
            "subagent: {}",
            event.payload_str("task").unwrap_or("?")
        ),
        EventKind::SubagentStatusUpdate => format!(
            "subagent {}",
            event.payload_str("status").unwrap_or("?")
        ),
        EventKind::SubagentCompleted => "subagent completed".to_owned(),
        EventKind::SubagentFailed => "subagent failed".to_owned(),
        EventKind::ErrorAgent => format!("error: {}", event.payload_str("error").unwrap_or("?")),
    };

    let mut summary = text.replace('\n', " ");
    if summary.len() > MAX {
        let mut end = MAX;
        while !summary.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        summary.truncate(end);
        summary.push_str("...");
    }
    summary
}
