//! Test doubles for the runtime: a scripted provider and simple tools.
//!
//! Lives outside `#[cfg(test)]` so integration tests and downstream crates
//! can drive the full pipeline without a network.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use strand_domain::error::{Error, Result};
use strand_domain::provider::{Provider, ProviderRequest};
use strand_domain::stream::{BoxStream, ProviderEvent, StopReason};
use strand_domain::tokens::TokenUsage;
use strand_domain::tool::{Tool, ToolContext, ToolDefinition, ToolOutcome};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Script items
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One step of a scripted provider stream.
#[derive(Debug, Clone)]
pub enum ScriptItem {
    Event(ProviderEvent),
    /// Yield an error mid-stream.
    Fail { message: String, retryable: bool },
    /// Never yield again (for cancellation tests).
    Hang,
}

impl From<ProviderEvent> for ScriptItem {
    fn from(event: ProviderEvent) -> Self {
        ScriptItem::Event(event)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ScriptedProvider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A provider that replays queued scripts, one per `stream` call.
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Vec<ScriptItem>>>,
    /// Requests seen, for assertions on messages/models.
    requests: Mutex<Vec<ProviderRequest>>,
    id: String,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Vec<ScriptItem>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            id: "scripted".into(),
        }
    }

    /// One script per reply: a single-turn text response.
    pub fn text_replies(replies: Vec<&str>) -> Self {
        let scripts = replies
            .into_iter()
            .map(|text| simple_text_turn(1, text, 10, 3))
            .collect();
        Self::new(scripts)
    }

    /// Queue an additional script.
    pub fn push_script(&self, script: Vec<ScriptItem>) {
        self.scripts.lock().push_back(script);
    }

    pub fn seen_requests(&self) -> usize {
        self.requests.lock().len()
    }

    /// Messages of the nth request (for loopback assertions).
    pub fn request_messages(&self, n: usize) -> Option<Vec<strand_domain::tool::Message>> {
        self.requests.lock().get(n).map(|r| r.messages.clone())
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> Result<BoxStream<'static, Result<ProviderEvent>>> {
        self.requests.lock().push(request);
        let script = self.scripts.lock().pop_front().ok_or_else(|| {
            Error::ProviderTerminal {
                provider: self.id.clone(),
                message: "scripted provider exhausted".into(),
            }
        })?;

        let stream = async_stream::stream! {
            for item in script {
                match item {
                    ScriptItem::Event(event) => yield Ok(event),
                    ScriptItem::Fail { message, retryable } => {
                        yield Ok(ProviderEvent::Error { message, retryable });
                    }
                    ScriptItem::Hang => {
                        futures_util::future::pending::<()>().await;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

/// A provider whose `stream` call itself fails N times before delegating.
pub struct FlakyProvider {
    failures_left: Mutex<u32>,
    inner: ScriptedProvider,
}

impl FlakyProvider {
    pub fn new(failures: u32, inner: ScriptedProvider) -> Self {
        Self {
            failures_left: Mutex::new(failures),
            inner,
        }
    }
}

#[async_trait::async_trait]
impl Provider for FlakyProvider {
    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> Result<BoxStream<'static, Result<ProviderEvent>>> {
        {
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                return Err(Error::ProviderTransient {
                    provider: "flaky".into(),
                    message: "simulated 529".into(),
                });
            }
        }
        self.inner.stream(request).await
    }

    fn provider_id(&self) -> &str {
        "flaky"
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Script builders
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn usage(input: u64, output: u64) -> TokenUsage {
    TokenUsage {
        input_tokens: input,
        output_tokens: output,
        ..Default::default()
    }
}

/// `turn_start`, one text delta, `response_complete`, `turn_end`.
pub fn simple_text_turn(turn: u32, text: &str, input: u64, output: u64) -> Vec<ScriptItem> {
    vec![
        ProviderEvent::TurnStart { turn }.into(),
        ProviderEvent::TextDelta { text: text.into() }.into(),
        ProviderEvent::ResponseComplete {
            usage: usage(input, output),
            cost: None,
        }
        .into(),
        ProviderEvent::TurnEnd {
            turn,
            duration_ms: 100,
            usage: usage(input, output),
            cost: None,
            stop_reason: StopReason::EndTurn,
        }
        .into(),
    ]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Test tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Echoes its `text` argument back.
pub struct EchoTool;

#[async_trait::async_trait]
impl Tool for EchoTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "Echo".into(),
            description: "Echo the given text".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
            }),
        }
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutcome> {
        let text = arguments
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        Ok(ToolOutcome {
            content: format!("echo: {text}"),
            is_error: false,
            details: None,
        })
    }
}

/// Sleeps for `ms` (default: a long time); used for cancellation tests.
pub struct SleepTool;

#[async_trait::async_trait]
impl Tool for SleepTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "Sleep".into(),
            description: "Sleep for the given number of milliseconds".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {"ms": {"type": "integer"}},
            }),
        }
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutcome> {
        let ms = arguments.get("ms").and_then(|v| v.as_u64()).unwrap_or(60_000);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(ToolOutcome {
            content: format!("slept {ms}ms"),
            is_error: false,
            details: None,
        })
    }
}

/// Always returns an error outcome (tool-failure path).
pub struct BrokenTool;

#[async_trait::async_trait]
impl Tool for BrokenTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "Broken".into(),
            description: "Always fails".into(),
            parameters: serde_json::json!({"type": "object"}),
        }
    }

    async fn execute(
        &self,
        _arguments: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutcome> {
        Ok(ToolOutcome {
            content: "tool exploded".into(),
            is_error: true,
            details: None,
        })
    }
}

/// Convenience: an Arc'd tool list for registry setup.
pub fn default_test_tools() -> Vec<Arc<dyn Tool>> {
    vec![Arc::new(EchoTool), Arc::new(SleepTool), Arc::new(BrokenTool)]
}
