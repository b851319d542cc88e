//! Event log → provider message history.
//!
//! Only events after the last compaction boundary feed the provider; the
//! boundary itself becomes a system message carrying the summary.

use serde_json::Value;

use strand_domain::content::ContentBlock;
use strand_domain::event::{Event, EventKind};
use strand_domain::tool::Message;

/// Index of the first event to include: the last `compact.boundary`, or 0.
pub fn compaction_boundary(events: &[Event]) -> usize {
    events
        .iter()
        .rposition(|e| e.kind == EventKind::CompactBoundary)
        .unwrap_or(0)
}

/// Convert active-branch events into provider messages.
pub fn events_to_messages(events: &[Event]) -> Vec<Message> {
    let start = compaction_boundary(events);
    let mut messages = Vec::new();

    for event in &events[start..] {
        match event.kind {
            EventKind::CompactBoundary => {
                let summary = event.payload_str("summary").unwrap_or_default();
                if !summary.is_empty() {
                    messages.push(Message::system(format!(
                        "Summary of the conversation so far:\n{summary}"
                    )));
                }
            }
            EventKind::MessageUser => {
                if let Some(content) = event.payload_str("content") {
                    messages.push(Message::user(content));
                }
            }
            EventKind::MessageAssistant => {
                let blocks: Vec<ContentBlock> = event
                    .payload
                    .get("content")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                if !blocks.is_empty() {
                    messages.push(Message::assistant_blocks(blocks));
                }
            }
            EventKind::ToolResult => {
                let call_id = event.payload_str("toolCallId").unwrap_or_default();
                let content = event.payload_str("content").unwrap_or_default();
                let is_error = event
                    .payload
                    .get("isError")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if !call_id.is_empty() {
                    messages.push(Message::tool_result(call_id, content, is_error));
                }
            }
            // Lifecycle, hook, subagent, and config events do not feed the
            // model context.
            _ => {}
        }
    }

    messages
}
