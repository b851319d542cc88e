//! Provider-agnostic tool and message types, plus the tool execution seam.

use serde::{Deserialize, Serialize};

use crate::content::ContentBlock;
use crate::error::Result;

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

/// Tool definition exposed to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema (subset) for the tool's parameters.
    pub parameters: serde_json::Value,
}

/// A message in the conversation (provider-agnostic).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

// ── Convenience constructors ───────────────────────────────────────

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }
    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Blocks(blocks),
        }
    }
    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: tool_use_id.into(),
                content: content.into(),
                is_error,
                meta: None,
            }]),
        }
    }
}

impl MessageContent {
    /// Extract and join all text content.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Blocks(blocks) => crate::content::joined_text(blocks),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool execution seam
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What a tool hands back to the turn pipeline.
#[derive(Debug, Clone, Default)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
    /// Structured extras for clients (diff stats, exit codes, etc.).
    pub details: Option<serde_json::Value>,
}

/// Per-invocation context handed to a tool.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub working_directory: std::path::PathBuf,
    /// Set when the turn is being aborted; long-running tools should observe
    /// this at their next await point.
    pub cancelled: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl ToolContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::Acquire)
    }
}

/// The narrow interface the core consumes from tool implementations.
///
/// Filesystem/shell/browser tools live outside the core; anything satisfying
/// this contract can be registered.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn execute(&self, arguments: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_result_message_shape() {
        let msg = Message::tool_result("t1", "output", false);
        assert_eq!(msg.role, Role::Tool);
        match &msg.content {
            MessageContent::Blocks(blocks) => {
                assert_eq!(blocks.len(), 1);
                match &blocks[0] {
                    ContentBlock::ToolResult { tool_use_id, content, is_error, .. } => {
                        assert_eq!(tool_use_id, "t1");
                        assert_eq!(content, "output");
                        assert!(!is_error);
                    }
                    other => panic!("unexpected block: {other:?}"),
                }
            }
            _ => panic!("expected Blocks content"),
        }
    }

    #[test]
    fn message_text_extraction() {
        let msg = Message::assistant_blocks(vec![
            ContentBlock::text("a"),
            ContentBlock::tool_use("t1", "Read", serde_json::json!({})),
            ContentBlock::text("b"),
        ]);
        assert_eq!(msg.content.text(), "a\nb");
    }
}
