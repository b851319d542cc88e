//! The strand orchestrator and turn pipeline.
//!
//! Owns the per-session runtime state machine: a prompt enters, the provider
//! stream is consumed, tools run behind the hook engine, and every boundary
//! is persisted to the event store at exactly the right point. Sub-agents
//! spawn as in-process child sessions or detached processes and report back
//! through the tracker.

pub mod active;
pub mod cancel;
pub mod compaction;
pub mod content;
pub mod events;
pub mod orchestrator;
pub mod pipeline;
pub mod plan;
pub mod reconstruct;
pub mod registry;
pub mod session_context;
pub mod spawn;
pub mod subagent;
pub mod testing;
pub mod tokens;
pub mod transcript;

pub use cancel::{CancelMap, RunCancel};
pub use content::{
    build_content_blocks, build_interrupted_content_blocks, InterruptedContent, SequenceItem,
    ToolCallState, INTERRUPTED_OUTPUT,
};
pub use events::{EventHub, RuntimeEvent};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, RunHandle, RunSummary};
pub use pipeline::PromptInput;
pub use registry::ToolRegistry;
pub use spawn::{SpawnRequest, SpawnType};
pub use subagent::{SubagentResult, SubagentStatus, SubagentTracker, TrackedSubagent};
pub use tokens::ContextManager;
