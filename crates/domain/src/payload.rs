//! Typed payloads for each persisted event kind, plus append-time
//! validation.
//!
//! Payload keys are camelCase on the wire; clients reconstruct transcript UI
//! from them. `validate_payload` enforces the required keys for a kind before
//! anything hits the store, so a malformed append fails loudly instead of
//! producing an event no client can render.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::content::ContentBlock;
use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::tokens::{TokenRecord, TokenUsage};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStartPayload {
    pub working_directory: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEndPayload {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionForkPayload {
    pub source_session_id: String,
    pub source_event_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessagePayload {
    pub content: String,
    pub turn: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skills: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantMessagePayload {
    pub content: Vec<ContentBlock>,
    pub token_usage: TokenUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_record: Option<TokenRecord>,
    pub turn: u32,
    pub model: String,
    pub stop_reason: String,
    /// Wall-clock latency of the model response in milliseconds.
    pub latency: u64,
    pub has_thinking: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeletedPayload {
    pub target_event_id: String,
    pub target_type: String,
    pub reason: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallPayload {
    pub tool_call_id: String,
    pub name: String,
    pub arguments: Value,
    pub turn: u32,
    pub run_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultPayload {
    pub tool_call_id: String,
    pub content: String,
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob_id: Option<String>,
    pub truncated: bool,
    pub run_id: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming boundaries
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamTurnStartPayload {
    pub turn: u32,
    pub run_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamTurnEndPayload {
    pub turn: u32,
    pub token_usage: TokenUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_record: Option<TokenRecord>,
    pub cost: f64,
    pub run_id: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config / context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSwitchPayload {
    pub previous_model: String,
    pub new_model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactBoundaryPayload {
    pub original_tokens: u64,
    pub compacted_tokens: u64,
    pub compression_ratio: f64,
    pub reason: String,
    pub summary: String,
    pub run_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextClearedPayload {
    pub reason: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Hooks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookTriggeredPayload {
    pub hook_names: Vec<String>,
    pub hook_event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub run_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookCompletedPayload {
    pub hook_names: Vec<String>,
    pub hook_event: String,
    /// `"continue"`, `"modify"`, or `"block"`.
    pub result: String,
    pub duration: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub run_id: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Plan mode
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanModeEnteredPayload {
    pub skill_name: String,
    pub blocked_tools: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanModeExitedPayload {
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_path: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subagents
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentSpawnedPayload {
    pub subagent_session_id: String,
    /// `"subsession"` | `"tmux"`.
    pub spawn_type: String,
    pub task: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skills: Option<Vec<String>>,
    pub working_directory: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmux_session_name: Option<String>,
    pub max_turns: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentStatusUpdatePayload {
    pub subagent_session_id: String,
    pub status: String,
    pub current_turn: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentCompletedPayload {
    pub subagent_session_id: String,
    pub result_summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_output: Option<String>,
    pub total_turns: u32,
    pub total_token_usage: TokenUsage,
    pub duration: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentFailedPayload {
    pub subagent_session_id: String,
    pub error: String,
    pub recoverable: bool,
    pub duration: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorAgentPayload {
    pub error: String,
    pub recoverable: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Required top-level keys per kind. Optional keys are not listed.
fn required_keys(kind: EventKind) -> &'static [&'static str] {
    match kind {
        EventKind::SessionStart => &["workingDirectory", "model"],
        EventKind::SessionEnd => &["reason"],
        EventKind::SessionFork => &["sourceSessionId", "sourceEventId"],
        EventKind::MessageUser => &["content", "turn"],
        EventKind::MessageAssistant => &["content", "tokenUsage", "turn", "model", "stopReason"],
        EventKind::MessageDeleted => &["targetEventId", "targetType", "reason"],
        EventKind::ToolCall => &["toolCallId", "name", "arguments", "turn", "runId"],
        EventKind::ToolResult => &["toolCallId", "content", "isError", "runId"],
        EventKind::StreamTurnStart => &["turn", "runId"],
        EventKind::StreamTurnEnd => &["turn", "tokenUsage", "runId"],
        EventKind::ConfigModelSwitch => &["previousModel", "newModel"],
        EventKind::CompactBoundary => &["originalTokens", "compactedTokens", "reason", "summary"],
        EventKind::ContextCleared => &["reason"],
        EventKind::HookTriggered => &["hookNames", "hookEvent"],
        EventKind::HookCompleted => &["hookNames", "hookEvent", "result", "duration"],
        EventKind::PlanModeEntered => &["skillName", "blockedTools"],
        EventKind::PlanModeExited => &["reason"],
        EventKind::SubagentSpawned => &["subagentSessionId", "spawnType", "task"],
        EventKind::SubagentStatusUpdate => &["subagentSessionId", "status"],
        EventKind::SubagentCompleted => &["subagentSessionId", "resultSummary", "totalTurns"],
        EventKind::SubagentFailed => &["subagentSessionId", "error"],
        EventKind::ErrorAgent => &["error", "recoverable"],
    }
}

/// Validate a payload against its kind's required-key table.
pub fn validate_payload(kind: EventKind, payload: &Value) -> Result<()> {
    let obj = payload.as_object().ok_or_else(|| {
        Error::Validation(format!("{kind} payload must be a JSON object"))
    })?;
    for key in required_keys(kind) {
        if !obj.contains_key(*key) {
            return Err(Error::Validation(format!(
                "{kind} payload missing required key '{key}'"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_session_start_passes() {
        let payload = json!({"workingDirectory": "/w", "model": "m1"});
        assert!(validate_payload(EventKind::SessionStart, &payload).is_ok());
    }

    #[test]
    fn missing_key_rejected() {
        let payload = json!({"workingDirectory": "/w"});
        let err = validate_payload(EventKind::SessionStart, &payload).unwrap_err();
        assert!(err.to_string().contains("model"));
    }

    #[test]
    fn non_object_payload_rejected() {
        let payload = json!("just a string");
        assert!(validate_payload(EventKind::MessageUser, &payload).is_err());
    }

    #[test]
    fn typed_payloads_satisfy_their_own_tables() {
        let p = serde_json::to_value(ToolResultPayload {
            tool_call_id: "t1".into(),
            content: "ok".into(),
            is_error: false,
            blob_id: None,
            truncated: false,
            run_id: "r1".into(),
        })
        .unwrap();
        assert!(validate_payload(EventKind::ToolResult, &p).is_ok());

        let p = serde_json::to_value(SubagentCompletedPayload {
            subagent_session_id: "s2".into(),
            result_summary: "done".into(),
            full_output: None,
            total_turns: 3,
            total_token_usage: TokenUsage::default(),
            duration: 1200,
        })
        .unwrap();
        assert!(validate_payload(EventKind::SubagentCompleted, &p).is_ok());
    }

    #[test]
    fn optional_keys_are_not_required() {
        let payload = json!({
            "subagentSessionId": "s2",
            "spawnType": "subsession",
            "task": "analyze",
        });
        assert!(validate_payload(EventKind::SubagentSpawned, &payload).is_ok());
    }

    #[test]
    fn every_kind_has_a_key_table() {
        for kind in EventKind::all() {
            // Empty object should fail for every kind (all have required keys).
            assert!(validate_payload(*kind, &json!({})).is_err(), "{kind}");
        }
    }
}
