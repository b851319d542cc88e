//! Rebuild runtime state from persisted events.
//!
//! Any new active session — resume of a cold session, or a fork primed from
//! its source event's ancestors — replays its history through here so the
//! trackers come back identical to what a live session would hold.

use strand_domain::event::{Event, EventKind};

use crate::subagent::SubagentTracker;

/// State recovered from an event replay.
pub struct ReconstructedState {
    pub subagents: SubagentTracker,
    /// Highest turn seen on the branch.
    pub current_turn: u32,
    /// Context-window tokens of the last finished turn (the next baseline).
    pub context_baseline: u64,
    /// Model after any `config.model_switch` on the branch.
    pub model: Option<String>,
}

/// Replay events (root → tip order) into fresh runtime state.
pub fn reconstruct(events: &[Event]) -> ReconstructedState {
    let mut current_turn = 0;
    let mut context_baseline = 0;
    let mut model = None;

    for event in events {
        match event.kind {
            EventKind::SessionStart => {
                if let Some(m) = event.payload_str("model") {
                    model = Some(m.to_owned());
                }
            }
            EventKind::ConfigModelSwitch => {
                if let Some(m) = event.payload_str("newModel") {
                    model = Some(m.to_owned());
                }
            }
            EventKind::StreamTurnEnd => {
                let turn = event.payload_u64("turn").unwrap_or(0) as u32;
                current_turn = current_turn.max(turn);
                if let Some(window) = event
                    .payload
                    .get("tokenRecord")
                    .and_then(|r| r.get("computed"))
                    .and_then(|c| c.get("contextWindowTokens"))
                    .and_then(|v| v.as_u64())
                {
                    context_baseline = window;
                }
            }
            EventKind::MessageUser => {
                let turn = event.payload_u64("turn").unwrap_or(0) as u32;
                current_turn = current_turn.max(turn.saturating_sub(1));
            }
            EventKind::CompactBoundary => {
                if let Some(compacted) = event.payload_u64("compactedTokens") {
                    context_baseline = compacted;
                }
            }
            _ => {}
        }
    }

    ReconstructedState {
        subagents: SubagentTracker::from_events(events),
        current_turn,
        context_baseline,
        model,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn mk(kind: EventKind, payload: serde_json::Value, seq: u64) -> Event {
        Event {
            id: format!("e{seq}"),
            parent_id: None,
            session_id: "s1".into(),
            workspace_id: "ws".into(),
            sequence: seq,
            timestamp: Utc::now(),
            kind,
            payload,
            run_id: None,
        }
    }

    #[test]
    fn recovers_turn_model_and_baseline() {
        let events = vec![
            mk(
                EventKind::SessionStart,
                json!({"workingDirectory": "/w", "model": "m1"}),
                1,
            ),
            mk(
                EventKind::StreamTurnEnd,
                json!({
                    "turn": 2,
                    "tokenUsage": {"inputTokens": 500},
                    "tokenRecord": {"computed": {"contextWindowTokens": 500, "newInputTokens": 500, "calculation": "c"}},
                    "cost": 0.0,
                    "runId": "r",
                }),
                2,
            ),
            mk(
                EventKind::ConfigModelSwitch,
                json!({"previousModel": "m1", "newModel": "m2"}),
                3,
            ),
        ];

        let state = reconstruct(&events);
        assert_eq!(state.current_turn, 2);
        assert_eq!(state.context_baseline, 500);
        assert_eq!(state.model.as_deref(), Some("m2"));
    }

    #[test]
    fn compaction_resets_baseline() {
        let events = vec![
            mk(
                EventKind::StreamTurnEnd,
                json!({
                    "turn": 5,
                    "tokenUsage": {},
                    "tokenRecord": {"computed": {"contextWindowTokens": 90_000, "newInputTokens": 10, "calculation": "c"}},
                    "cost": 0.0,
                    "runId": "r",
                }),
                1,
            ),
            mk(
                EventKind::CompactBoundary,
                json!({
                    "originalTokens": 90_000, "compactedTokens": 4_000,
                    "compressionRatio": 0.05, "reason": "auto",
                    "summary": "summary", "runId": "r",
                }),
                2,
            ),
        ];

        let state = reconstruct(&events);
        assert_eq!(state.context_baseline, 4_000);
        // Subagent tracker also reset by the boundary.
        assert_eq!(state.subagents.active_count(), 0);
    }

    #[test]
    fn empty_history_is_fresh_state() {
        let state = reconstruct(&[]);
        assert_eq!(state.current_turn, 0);
        assert_eq!(state.context_baseline, 0);
        assert!(state.model.is_none());
    }
}
