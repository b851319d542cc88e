//! Hook kinds, results, contexts, and definitions.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use strand_domain::error::Result;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HookKind
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lifecycle points a hook can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookKind {
    PreToolUse,
    PostToolUse,
    Stop,
    SubagentStop,
    SessionStart,
    SessionEnd,
    UserPromptSubmit,
    PreCompact,
    Notification,
}

impl HookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::PreToolUse => "PreToolUse",
            HookKind::PostToolUse => "PostToolUse",
            HookKind::Stop => "Stop",
            HookKind::SubagentStop => "SubagentStop",
            HookKind::SessionStart => "SessionStart",
            HookKind::SessionEnd => "SessionEnd",
            HookKind::UserPromptSubmit => "UserPromptSubmit",
            HookKind::PreCompact => "PreCompact",
            HookKind::Notification => "Notification",
        }
    }

    /// Kinds that can mutate agent flow always run blocking, whatever mode
    /// the caller asked for.
    pub fn forces_blocking(&self) -> bool {
        matches!(
            self,
            HookKind::PreToolUse | HookKind::UserPromptSubmit | HookKind::PreCompact
        )
    }
}

impl std::fmt::Display for HookKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Results
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookAction {
    Continue,
    Modify,
    Block,
}

/// What one hook handler returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookResult {
    pub action: HookAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modifications: Option<serde_json::Map<String, Value>>,
}

impl HookResult {
    pub fn proceed() -> Self {
        Self {
            action: HookAction::Continue,
            reason: None,
            message: None,
            modifications: None,
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            action: HookAction::Block,
            reason: Some(reason.into()),
            message: None,
            modifications: None,
        }
    }

    pub fn modify(modifications: serde_json::Map<String, Value>) -> Self {
        Self {
            action: HookAction::Modify,
            reason: None,
            message: None,
            modifications: Some(modifications),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What a hook sees when invoked. Kind-specific fields are optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookContext {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_arguments: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Anything else the call site wants to expose.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl HookContext {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    pub fn with_tool(
        mut self,
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: Value,
    ) -> Self {
        self.tool_call_id = Some(tool_call_id.into());
        self.tool_name = Some(tool_name.into());
        self.tool_arguments = Some(arguments);
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler + definition
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Execution mode requested at registration; some kinds override it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookMode {
    Blocking,
    Background,
}

#[async_trait::async_trait]
pub trait HookHandler: Send + Sync {
    async fn run(&self, ctx: &HookContext) -> Result<HookResult>;
}

/// Adapter so plain closures register as hooks.
pub struct HookFn<F>(pub F);

#[async_trait::async_trait]
impl<F> HookHandler for HookFn<F>
where
    F: Fn(&HookContext) -> HookResult + Send + Sync,
{
    async fn run(&self, ctx: &HookContext) -> Result<HookResult> {
        Ok((self.0)(ctx))
    }
}

pub type FilterPredicate = Arc<dyn Fn(&HookContext) -> bool + Send + Sync>;

/// A registered hook.
#[derive(Clone)]
pub struct HookDefinition {
    /// Unique name; re-registration replaces.
    pub name: String,
    pub kind: HookKind,
    /// Higher runs first. Default 0.
    pub priority: i32,
    /// Per-hook timeout; engine default when `None`.
    pub timeout_ms: Option<u64>,
    pub mode: HookMode,
    pub filter: Option<FilterPredicate>,
    pub handler: Arc<dyn HookHandler>,
}

impl HookDefinition {
    pub fn new(
        name: impl Into<String>,
        kind: HookKind,
        handler: Arc<dyn HookHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            priority: 0,
            timeout_ms: None,
            mode: HookMode::Blocking,
            filter: None,
            handler,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn background(mut self) -> Self {
        self.mode = HookMode::Background;
        self
    }

    pub fn with_filter(mut self, filter: FilterPredicate) -> Self {
        self.filter = Some(filter);
        self
    }
}

impl std::fmt::Debug for HookDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookDefinition")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("timeout_ms", &self.timeout_ms)
            .field("mode", &self.mode)
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}
