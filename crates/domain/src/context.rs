//! Ambient call context, passed explicitly.
//!
//! Handlers receive an `EventContext` value instead of reading task-local
//! state; logs pick the fields up as structured attributes.

use serde::{Deserialize, Serialize};

/// Identifies where in a session a piece of work is happening.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventContext {
    pub session_id: String,
    pub workspace_id: String,
    pub turn: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl EventContext {
    pub fn new(session_id: impl Into<String>, workspace_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            workspace_id: workspace_id.into(),
            turn: 0,
            run_id: None,
        }
    }

    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn at_turn(mut self, turn: u32) -> Self {
        self.turn = turn;
        self
    }
}
