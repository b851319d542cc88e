//! Persisted event kinds and the event record.
//!
//! The kind set is closed: clients reconstruct UI state from these strings,
//! so adding or renaming a kind is a wire-contract change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// EventKind
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

macro_rules! event_kinds {
    ($( $(#[$doc:meta])* $variant:ident => $str:literal ),+ $(,)?) => {
        /// The closed set of persisted event kinds.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum EventKind {
            $( $(#[$doc])* #[serde(rename = $str)] $variant, )+
        }

        impl EventKind {
            /// The wire string for this kind (e.g. `"message.assistant"`).
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( EventKind::$variant => $str, )+
                }
            }

            /// Parse a wire string; fails with `InvalidKind` on anything
            /// outside the closed set.
            pub fn parse(s: &str) -> Result<Self> {
                match s {
                    $( $str => Ok(EventKind::$variant), )+
                    other => Err(Error::InvalidKind(other.to_string())),
                }
            }

            /// All kinds, in declaration order.
            pub fn all() -> &'static [EventKind] {
                &[ $( EventKind::$variant, )+ ]
            }
        }
    };
}

event_kinds! {
    /// New session started.
    SessionStart => "session.start",
    /// Session ended.
    SessionEnd => "session.end",
    /// Session forked from another session's event.
    SessionFork => "session.fork",
    /// User message.
    MessageUser => "message.user",
    /// Assistant (model) message.
    MessageAssistant => "message.assistant",
    /// Message deleted (soft delete marker).
    MessageDeleted => "message.deleted",
    /// Tool call issued by the model.
    ToolCall => "tool.call",
    /// Tool execution result.
    ToolResult => "tool.result",
    /// Turn started streaming.
    StreamTurnStart => "stream.turn_start",
    /// Turn finished streaming.
    StreamTurnEnd => "stream.turn_end",
    /// Model switched.
    ConfigModelSwitch => "config.model_switch",
    /// Compaction boundary marker.
    CompactBoundary => "compact.boundary",
    /// Context cleared.
    ContextCleared => "context.cleared",
    /// Blocking hooks about to run.
    HookTriggered => "hook.triggered",
    /// Blocking hooks finished.
    HookCompleted => "hook.completed",
    /// Plan mode entered.
    PlanModeEntered => "plan.mode_entered",
    /// Plan mode exited.
    PlanModeExited => "plan.mode_exited",
    /// Subagent spawned.
    SubagentSpawned => "subagent.spawned",
    /// Subagent status update.
    SubagentStatusUpdate => "subagent.status_update",
    /// Subagent completed.
    SubagentCompleted => "subagent.completed",
    /// Subagent failed.
    SubagentFailed => "subagent.failed",
    /// Agent-level error.
    ErrorAgent => "error.agent",
}

impl EventKind {
    /// Whether textual payload fields of this kind go into the full-text
    /// index (`message`, `text`, `content`, `error_message`).
    pub fn is_indexable(&self) -> bool {
        matches!(
            self,
            EventKind::MessageUser
                | EventKind::MessageAssistant
                | EventKind::MessageDeleted
                | EventKind::ToolResult
                | EventKind::ErrorAgent
        )
    }

    /// Whether this is a session lifecycle kind (`session.*`).
    pub fn is_session_kind(&self) -> bool {
        matches!(
            self,
            EventKind::SessionStart | EventKind::SessionEnd | EventKind::SessionFork
        )
    }

    /// Whether this is a message kind (`message.*`).
    pub fn is_message_kind(&self) -> bool {
        matches!(
            self,
            EventKind::MessageUser | EventKind::MessageAssistant | EventKind::MessageDeleted
        )
    }

    /// Whether this is a subagent kind (`subagent.*`).
    pub fn is_subagent_kind(&self) -> bool {
        matches!(
            self,
            EventKind::SubagentSpawned
                | EventKind::SubagentStatusUpdate
                | EventKind::SubagentCompleted
                | EventKind::SubagentFailed
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single persisted event. Immutable once visible to any reader;
/// corrections appear as new events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    /// `None` for session roots (including fork roots — a fork references
    /// its source event by payload, not by parent id).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub session_id: String,
    pub workspace_id: String,
    /// Strictly increasing per session; contiguous on the active branch.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    /// Correlates all events produced by one prompt invocation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl Event {
    /// Fetch a string field from the payload.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    /// Fetch an unsigned integer field from the payload.
    pub fn payload_u64(&self, key: &str) -> Option<u64> {
        self.payload.get(key).and_then(|v| v.as_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_wire_string() {
        for kind in EventKind::all() {
            assert_eq!(EventKind::parse(kind.as_str()).unwrap(), *kind);
        }
    }

    #[test]
    fn unknown_kind_rejected() {
        let err = EventKind::parse("message.imaginary").unwrap_err();
        assert_eq!(err.code(), "invalid_kind");
    }

    #[test]
    fn kind_serde_uses_wire_string() {
        let json = serde_json::to_string(&EventKind::MessageAssistant).unwrap();
        assert_eq!(json, "\"message.assistant\"");
        let back: EventKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, EventKind::MessageAssistant);
    }

    #[test]
    fn indexable_kinds() {
        assert!(EventKind::MessageUser.is_indexable());
        assert!(EventKind::MessageAssistant.is_indexable());
        assert!(EventKind::ToolResult.is_indexable());
        assert!(EventKind::ErrorAgent.is_indexable());
        assert!(!EventKind::StreamTurnStart.is_indexable());
        assert!(!EventKind::ToolCall.is_indexable());
    }

    #[test]
    fn domain_groups() {
        assert!(EventKind::SessionFork.is_session_kind());
        assert!(EventKind::SubagentFailed.is_subagent_kind());
        assert!(!EventKind::ToolCall.is_message_kind());
    }
}
