//! Provider stream events — the ordered event sequence the core consumes
//! from a language-model provider during one prompt invocation.

use serde::{Deserialize, Serialize};
use std::pin::Pin;

use crate::tokens::TokenUsage;
use crate::tool::ToolCall;

/// A boxed async stream, used for provider streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Aborted,
}

impl Default for StopReason {
    fn default() -> Self {
        StopReason::EndTurn
    }
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::EndTurn => "end_turn",
            StopReason::ToolUse => "tool_use",
            StopReason::MaxTokens => "max_tokens",
            StopReason::Aborted => "aborted",
        }
    }
}

/// Events yielded by a provider stream, in arrival order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderEvent {
    /// A model turn begins.
    TurnStart { turn: u32 },

    /// Incremental assistant text.
    TextDelta { text: String },

    /// Incremental reasoning text; the final delta may carry a signature.
    ThinkingDelta {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },

    /// The model declared a batch of tool intents.
    ToolUseBatch { calls: Vec<ToolCall> },

    /// A tool invocation is starting.
    ToolExecutionStart {
        tool_call_id: String,
        name: String,
        arguments: serde_json::Value,
    },

    /// Streaming output chunk from a running tool.
    ToolExecutionUpdate { tool_call_id: String, chunk: String },

    /// A tool invocation finished.
    ToolExecutionEnd {
        tool_call_id: String,
        content: String,
        is_error: bool,
        duration_ms: u64,
    },

    /// The model response is complete; cumulative usage is available early,
    /// before any trailing tool work.
    ResponseComplete {
        usage: TokenUsage,
        #[serde(skip_serializing_if = "Option::is_none")]
        cost: Option<f64>,
    },

    /// The turn is over.
    TurnEnd {
        turn: u32,
        duration_ms: u64,
        usage: TokenUsage,
        #[serde(skip_serializing_if = "Option::is_none")]
        cost: Option<f64>,
        #[serde(default)]
        stop_reason: StopReason,
    },

    /// Provider-side error.
    Error { message: String, retryable: bool },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_serde_round_trip() {
        let event = ProviderEvent::ToolExecutionStart {
            tool_call_id: "t1".into(),
            name: "Read".into(),
            arguments: serde_json::json!({"file_path": "/a"}),
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "tool_execution_start");
        let back: ProviderEvent = serde_json::from_value(v).unwrap();
        match back {
            ProviderEvent::ToolExecutionStart { tool_call_id, .. } => {
                assert_eq!(tool_call_id, "t1")
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn stop_reason_defaults_to_end_turn() {
        let v = serde_json::json!({
            "type": "turn_end",
            "turn": 1,
            "duration_ms": 100,
            "usage": {},
        });
        let event: ProviderEvent = serde_json::from_value(v).unwrap();
        match event {
            ProviderEvent::TurnEnd { stop_reason, .. } => {
                assert_eq!(stop_reason, StopReason::EndTurn)
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
