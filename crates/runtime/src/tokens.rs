//! Context-window snapshots shared with UI consumers.
//!
//! The turn pipeline records `context_window_tokens` here at
//! `response_complete` (early) and `turn_end` (final) so transcript views
//! and progress bars read the same figure.

use parking_lot::RwLock;

use strand_domain::tokens::TokenRecord;

#[derive(Debug, Clone, Copy, Default)]
pub struct ContextSnapshot {
    pub context_window_tokens: u64,
    pub turn: u32,
}

/// Latest context-window figure per session runtime.
#[derive(Default)]
pub struct ContextManager {
    snapshot: RwLock<ContextSnapshot>,
}

impl ContextManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, record: &TokenRecord) {
        let mut snapshot = self.snapshot.write();
        snapshot.context_window_tokens = record.computed.context_window_tokens;
        snapshot.turn = record.meta.turn;
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        *self.snapshot.read()
    }

    pub fn context_window_tokens(&self) -> u64 {
        self.snapshot.read().context_window_tokens
    }
}
