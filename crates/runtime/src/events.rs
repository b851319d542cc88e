//! Streaming runtime events and the per-session broadcast hub.
//!
//! These events are delivered to clients live and are never persisted; the
//! durable record is the event store. Each session gets its own broadcast
//! channel, created on first subscribe/emit and cleaned up when the session
//! is released.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RuntimeEvent
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Events streamed to clients while a session is live.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    #[serde(rename = "agent.turn_start")]
    TurnStart {
        session_id: String,
        turn: u32,
        run_id: String,
    },

    #[serde(rename = "agent.turn_end")]
    TurnEnd {
        session_id: String,
        turn: u32,
        run_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "agent.tool_start")]
    ToolStart {
        session_id: String,
        tool_call_id: String,
        tool_name: String,
        run_id: String,
    },

    /// Streaming tool output chunk; not persisted.
    #[serde(rename = "agent.tool_output")]
    ToolOutput {
        session_id: String,
        tool_call_id: String,
        chunk: String,
    },

    #[serde(rename = "agent.tool_end")]
    ToolEnd {
        session_id: String,
        tool_call_id: String,
        is_error: bool,
        duration_ms: u64,
    },

    #[serde(rename = "agent.compaction_started")]
    CompactionStarted { session_id: String, reason: String },

    #[serde(rename = "agent.compaction")]
    Compaction {
        session_id: String,
        original_tokens: u64,
        compacted_tokens: u64,
    },

    #[serde(rename = "agent.subagent_spawned")]
    SubagentSpawned {
        session_id: String,
        subagent_session_id: String,
        spawn_type: String,
        task: String,
    },

    #[serde(rename = "agent.subagent_completed")]
    SubagentCompleted {
        session_id: String,
        subagent_session_id: String,
        result_summary: String,
    },

    #[serde(rename = "agent.subagent_failed")]
    SubagentFailed {
        session_id: String,
        subagent_session_id: String,
        error: String,
    },

    #[serde(rename = "hook_triggered")]
    HookTriggered {
        session_id: String,
        hook_names: Vec<String>,
        hook_event: String,
    },

    #[serde(rename = "hook_completed")]
    HookCompleted {
        session_id: String,
        hook_names: Vec<String>,
        hook_event: String,
        result: String,
        duration_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    #[serde(rename = "hook.background_started")]
    HookBackgroundStarted { session_id: String, hook: String },

    #[serde(rename = "hook.background_completed")]
    HookBackgroundCompleted {
        session_id: String,
        hook: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "turn_interrupted")]
    TurnInterrupted { session_id: String, run_id: String },
}

impl RuntimeEvent {
    pub fn session_id(&self) -> &str {
        match self {
            RuntimeEvent::TurnStart { session_id, .. }
            | RuntimeEvent::TurnEnd { session_id, .. }
            | RuntimeEvent::ToolStart { session_id, .. }
            | RuntimeEvent::ToolOutput { session_id, .. }
            | RuntimeEvent::ToolEnd { session_id, .. }
            | RuntimeEvent::CompactionStarted { session_id, .. }
            | RuntimeEvent::Compaction { session_id, .. }
            | RuntimeEvent::SubagentSpawned { session_id, .. }
            | RuntimeEvent::SubagentCompleted { session_id, .. }
            | RuntimeEvent::SubagentFailed { session_id, .. }
            | RuntimeEvent::HookTriggered { session_id, .. }
            | RuntimeEvent::HookCompleted { session_id, .. }
            | RuntimeEvent::HookBackgroundStarted { session_id, .. }
            | RuntimeEvent::HookBackgroundCompleted { session_id, .. }
            | RuntimeEvent::TurnInterrupted { session_id, .. } => session_id,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// EventHub
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const CHANNEL_CAPACITY: usize = 256;

/// Per-session fan-out of runtime events to any number of subscribers.
#[derive(Default)]
pub struct EventHub {
    channels: RwLock<HashMap<String, broadcast::Sender<RuntimeEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a session's stream, creating the channel if needed.
    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<RuntimeEvent> {
        let mut channels = self.channels.write();
        channels
            .entry(session_id.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Emit an event to the session's subscribers (no-op without any).
    pub fn emit(&self, event: RuntimeEvent) {
        let channels = self.channels.read();
        if let Some(tx) = channels.get(event.session_id()) {
            let _ = tx.send(event);
        }
    }

    /// Deliver an event to a specific session's channel regardless of the
    /// event's own session id (used to forward child-session events to the
    /// parent's subscribers).
    pub fn emit_to(&self, session_id: &str, event: RuntimeEvent) {
        let channels = self.channels.read();
        if let Some(tx) = channels.get(session_id) {
            let _ = tx.send(event);
        }
    }

    /// Drop a session's channel once it is fully released.
    pub fn cleanup(&self, session_id: &str) {
        self.channels.write().remove(session_id);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_reaches_subscriber() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe("s1");
        hub.emit(RuntimeEvent::TurnStart {
            session_id: "s1".into(),
            turn: 1,
            run_id: "r1".into(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.session_id(), "s1");
    }

    #[tokio::test]
    async fn emit_without_subscriber_is_noop() {
        let hub = EventHub::new();
        hub.emit(RuntimeEvent::TurnInterrupted {
            session_id: "ghost".into(),
            run_id: "r1".into(),
        });
        assert_eq!(hub.channel_count(), 0);
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let hub = EventHub::new();
        let mut rx1 = hub.subscribe("s1");
        let mut rx2 = hub.subscribe("s2");

        hub.emit(RuntimeEvent::TurnStart {
            session_id: "s2".into(),
            turn: 1,
            run_id: "r".into(),
        });

        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn cleanup_removes_channel() {
        let hub = EventHub::new();
        let _rx = hub.subscribe("s1");
        assert_eq!(hub.channel_count(), 1);
        hub.cleanup("s1");
        assert_eq!(hub.channel_count(), 0);
    }

    #[test]
    fn runtime_events_serialize_with_dotted_tags() {
        let v = serde_json::to_value(RuntimeEvent::ToolStart {
            session_id: "s".into(),
            tool_call_id: "t".into(),
            tool_name: "Read".into(),
            run_id: "r".into(),
        })
        .unwrap();
        assert_eq!(v["type"], "agent.tool_start");
    }
}
