//! Lifecycle hook engine.
//!
//! Hooks intercept lifecycle points (tool use, prompt submit, session
//! start/end, stop, compaction) with prioritized blocking or fire-and-forget
//! background execution. Errors never break agent flow: a throwing or
//! timed-out hook is logged and treated as `continue`.

pub mod discovery;
pub mod engine;
pub mod types;

pub use discovery::discover_hooks;
pub use engine::{BackgroundHookEvent, ExecutionReport, HookEngine};
pub use types::{
    HookAction, HookContext, HookDefinition, HookFn, HookHandler, HookKind, HookMode, HookResult,
};
