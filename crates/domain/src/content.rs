//! Content blocks — the sum type inside `message.assistant` payloads.

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Block metadata
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lifecycle status of a tool call at persistence time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ToolCallStatus {
    /// A call that never finished: it was still pending or running when the
    /// turn was interrupted.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, ToolCallStatus::Pending | ToolCallStatus::Running)
    }
}

/// Per-block metadata attached when a turn is persisted after interruption,
/// so the transcript faithfully records what actually happened.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ToolCallStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl BlockMeta {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.interrupted.is_none()
            && self.duration_ms.is_none()
            && self.tool_name.is_none()
    }
}

fn meta_is_absent(meta: &Option<BlockMeta>) -> bool {
    meta.as_ref().map_or(true, BlockMeta::is_empty)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ContentBlock
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One block inside an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
        #[serde(rename = "_meta", default, skip_serializing_if = "meta_is_absent")]
        meta: Option<BlockMeta>,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
        #[serde(rename = "_meta", default, skip_serializing_if = "meta_is_absent")]
        meta: Option<BlockMeta>,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn thinking(thinking: impl Into<String>, signature: Option<String>) -> Self {
        ContentBlock::Thinking {
            thinking: thinking.into(),
            signature,
        }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        ContentBlock::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
            meta: None,
        }
    }

    /// Extract plain text, if this is a text block.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, ContentBlock::ToolUse { .. })
    }

    pub fn is_thinking(&self) -> bool {
        matches!(self, ContentBlock::Thinking { .. })
    }
}

/// Join all text blocks of a message into one string.
pub fn joined_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(ContentBlock::as_text)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serde_tag_round_trip() {
        let block = ContentBlock::tool_use("t1", "Read", json!({"file_path": "/a"}));
        let v = serde_json::to_value(&block).unwrap();
        assert_eq!(v["type"], "tool_use");
        assert_eq!(v["name"], "Read");
        // Empty meta must not appear on the wire.
        assert!(v.get("_meta").is_none());
        let back: ContentBlock = serde_json::from_value(v).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn meta_serializes_under_underscore_key() {
        let block = ContentBlock::ToolUse {
            id: "t1".into(),
            name: "Bash".into(),
            input: json!({"command": "sleep 100"}),
            meta: Some(BlockMeta {
                status: Some(ToolCallStatus::Running),
                interrupted: Some(true),
                ..Default::default()
            }),
        };
        let v = serde_json::to_value(&block).unwrap();
        assert_eq!(v["_meta"]["status"], "running");
        assert_eq!(v["_meta"]["interrupted"], true);
    }

    #[test]
    fn interrupted_statuses() {
        assert!(ToolCallStatus::Pending.is_interrupted());
        assert!(ToolCallStatus::Running.is_interrupted());
        assert!(!ToolCallStatus::Completed.is_interrupted());
        assert!(!ToolCallStatus::Failed.is_interrupted());
    }

    #[test]
    fn joined_text_skips_non_text_blocks() {
        let blocks = vec![
            ContentBlock::thinking("hmm", None),
            ContentBlock::text("one"),
            ContentBlock::tool_use("t1", "Read", json!({})),
            ContentBlock::text("two"),
        ];
        assert_eq!(joined_text(&blocks), "one\ntwo");
    }
}
