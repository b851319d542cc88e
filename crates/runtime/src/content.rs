//! Content-block assembly for assistant messages.
//!
//! Stateless and pure: the same inputs always produce the same blocks. The
//! turn pipeline calls [`build_content_blocks`] for the single per-turn
//! assistant emission (at the first tool start, or at turn end), and
//! [`build_interrupted_content_blocks`] when a cancelled turn must be
//! persisted faithfully.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use strand_domain::content::{BlockMeta, ContentBlock, ToolCallStatus};

/// Fixed output recorded for tool calls that never finished.
pub const INTERRUPTED_OUTPUT: &str = "Command interrupted (no output captured)";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inputs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Ordered per-turn accumulation: text runs, embedded thinking, and tool
/// references in model order.
#[derive(Debug, Clone, PartialEq)]
pub enum SequenceItem {
    Text(String),
    Thinking(String),
    /// References an entry in the tool-call map by call id.
    ToolRef(String),
}

/// Lifecycle record for one tool call within a turn.
#[derive(Debug, Clone)]
pub struct ToolCallState {
    pub id: String,
    pub name: String,
    pub arguments: Value,
    pub status: ToolCallStatus,
    pub output: Option<String>,
    pub is_error: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ToolCallState {
    pub fn pending(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            status: ToolCallStatus::Pending,
            output: None,
            is_error: false,
            started_at: None,
            completed_at: None,
        }
    }

    fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Canonical builder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build the canonical content-block array for one turn.
///
/// Order: the accumulated thinking block first (with its signature), then
/// sequence items in model order — non-empty text, embedded thinking, and
/// tool uses resolved from the call map.
///
/// Returns `None` when there is nothing to flush, or when the turn's
/// assistant message was already emitted.
pub fn build_content_blocks(
    thinking: &str,
    thinking_signature: Option<&str>,
    sequence: &[SequenceItem],
    tool_calls: &HashMap<String, ToolCallState>,
    already_flushed: bool,
) -> Option<Vec<ContentBlock>> {
    if already_flushed {
        return None;
    }

    let mut blocks = Vec::new();
    if !thinking.is_empty() {
        blocks.push(ContentBlock::thinking(
            thinking,
            thinking_signature.map(str::to_owned),
        ));
    }

    for item in sequence {
        match item {
            SequenceItem::Text(text) => {
                if !text.is_empty() {
                    blocks.push(ContentBlock::text(text.clone()));
                }
            }
            SequenceItem::Thinking(text) => {
                if !text.is_empty() {
                    blocks.push(ContentBlock::thinking(text.clone(), None));
                }
            }
            SequenceItem::ToolRef(call_id) => {
                if let Some(call) = tool_calls.get(call_id) {
                    blocks.push(ContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: call.arguments.clone(),
                        meta: None,
                    });
                }
            }
        }
    }

    if blocks.is_empty() {
        None
    } else {
        Some(blocks)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Interrupted builder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Output of [`build_interrupted_content_blocks`].
#[derive(Debug, Clone)]
pub struct InterruptedContent {
    /// The assistant message blocks, `_meta`-annotated per tool use.
    pub blocks: Vec<ContentBlock>,
    /// Paired results: real output for completed calls, the fixed
    /// interruption string for pending/running ones.
    pub tool_results: Vec<ContentBlock>,
}

/// Build the interruption-faithful variant of the turn's blocks.
///
/// Every tool use carries `_meta` with its status at cancellation time;
/// calls that were pending or running are marked interrupted and paired
/// with a synthesized result. Completed calls keep their real output and a
/// duration derived from `completed_at − started_at`.
pub fn build_interrupted_content_blocks(
    thinking: &str,
    thinking_signature: Option<&str>,
    sequence: &[SequenceItem],
    tool_calls: &HashMap<String, ToolCallState>,
    already_flushed: bool,
) -> Option<InterruptedContent> {
    if already_flushed {
        return None;
    }

    let mut blocks = Vec::new();
    let mut tool_results = Vec::new();

    if !thinking.is_empty() {
        blocks.push(ContentBlock::thinking(
            thinking,
            thinking_signature.map(str::to_owned),
        ));
    }

    for item in sequence {
        match item {
            SequenceItem::Text(text) => {
                if !text.is_empty() {
                    blocks.push(ContentBlock::text(text.clone()));
                }
            }
            SequenceItem::Thinking(text) => {
                if !text.is_empty() {
                    blocks.push(ContentBlock::thinking(text.clone(), None));
                }
            }
            SequenceItem::ToolRef(call_id) => {
                let call = match tool_calls.get(call_id) {
                    Some(call) => call,
                    None => continue,
                };
                let interrupted = call.status.is_interrupted();
                blocks.push(ContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.arguments.clone(),
                    meta: Some(BlockMeta {
                        status: Some(call.status),
                        interrupted: Some(interrupted),
                        duration_ms: call.duration_ms(),
                        tool_name: None,
                    }),
                });

                if interrupted {
                    tool_results.push(ContentBlock::ToolResult {
                        tool_use_id: call.id.clone(),
                        content: INTERRUPTED_OUTPUT.to_owned(),
                        is_error: false,
                        meta: Some(BlockMeta {
                            status: None,
                            interrupted: Some(true),
                            duration_ms: None,
                            tool_name: Some(call.name.clone()),
                        }),
                    });
                } else {
                    tool_results.push(ContentBlock::ToolResult {
                        tool_use_id: call.id.clone(),
                        content: call.output.clone().unwrap_or_default(),
                        is_error: call.is_error,
                        meta: Some(BlockMeta {
                            status: Some(call.status),
                            interrupted: Some(false),
                            duration_ms: call.duration_ms(),
                            tool_name: Some(call.name.clone()),
                        }),
                    });
                }
            }
        }
    }

    if blocks.is_empty() && tool_results.is_empty() {
        None
    } else {
        Some(InterruptedContent {
            blocks,
            tool_results,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
