//! Shared domain types for the strand core runtime.
//!
//! Everything the other crates agree on lives here: the closed event-kind
//! set and per-kind payloads, content blocks, token accounting types, the
//! provider stream contract, tool/message types, the shared error enum, and
//! the core configuration.

pub mod config;
pub mod content;
pub mod context;
pub mod error;
pub mod event;
pub mod payload;
pub mod provider;
pub mod stream;
pub mod tokens;
pub mod tool;

pub use content::{BlockMeta, ContentBlock, ToolCallStatus};
pub use context::EventContext;
pub use error::{Error, ErrorCategory, Result};
pub use event::{Event, EventKind};
pub use provider::{CredentialLookup, Provider, ProviderRequest};
pub use stream::{BoxStream, ProviderEvent, StopReason};
pub use tokens::{AccumulatedTokens, ModelRates, TokenRecord, TokenUsage};
pub use tool::{Message, MessageContent, Role, Tool, ToolCall, ToolContext, ToolDefinition, ToolOutcome};
