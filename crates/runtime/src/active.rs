//! In-memory runtime state for a session currently being served.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;

use crate::plan::PlanMode;
use crate::session_context::SessionContext;
use crate::subagent::SubagentTracker;
use crate::tokens::ContextManager;

/// Runtime handle for one session. Created lazily when a prompt arrives for
/// a cold session; destroyed on shutdown, session end, or idle eviction.
pub struct ActiveSession {
    pub session_id: String,
    pub working_directory: PathBuf,
    model: RwLock<String>,
    reasoning_level: RwLock<Option<String>>,

    pub context: Mutex<SessionContext>,
    pub context_manager: Arc<ContextManager>,
    pub subagents: Arc<SubagentTracker>,
    pub plan_mode: Mutex<Option<PlanMode>>,

    /// One turn loop at a time; `prompt()` try-acquires and rejects with
    /// `AlreadyProcessing` when held.
    pub processing: Arc<Semaphore>,
    was_interrupted: AtomicBool,
    current_run_id: Mutex<Option<String>>,
    last_activity: Mutex<Instant>,
}

impl ActiveSession {
    pub fn new(session_id: impl Into<String>, working_directory: PathBuf, model: String) -> Self {
        Self::with_state(
            session_id,
            working_directory,
            model,
            Arc::new(SubagentTracker::new()),
        )
    }

    /// Build with a reconstructed subagent tracker (resume/fork replay).
    pub fn with_state(
        session_id: impl Into<String>,
        working_directory: PathBuf,
        model: String,
        subagents: Arc<SubagentTracker>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            working_directory,
            model: RwLock::new(model),
            reasoning_level: RwLock::new(None),
            context: Mutex::new(SessionContext::default()),
            context_manager: Arc::new(ContextManager::new()),
            subagents,
            plan_mode: Mutex::new(None),
            processing: Arc::new(Semaphore::new(1)),
            was_interrupted: AtomicBool::new(false),
            current_run_id: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn model(&self) -> String {
        self.model.read().clone()
    }

    pub fn set_model(&self, model: impl Into<String>) {
        *self.model.write() = model.into();
    }

    pub fn reasoning_level(&self) -> Option<String> {
        self.reasoning_level.read().clone()
    }

    pub fn set_reasoning_level(&self, level: Option<String>) {
        *self.reasoning_level.write() = level;
    }

    pub fn is_processing(&self) -> bool {
        self.processing.available_permits() == 0
    }

    pub fn was_interrupted(&self) -> bool {
        self.was_interrupted.load(Ordering::Acquire)
    }

    pub fn set_interrupted(&self, value: bool) {
        self.was_interrupted.store(value, Ordering::Release);
    }

    pub fn current_run_id(&self) -> Option<String> {
        self.current_run_id.lock().clone()
    }

    pub fn set_current_run_id(&self, run_id: Option<String>) {
        *self.current_run_id.lock() = run_id;
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.lock().elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processing_flag_follows_permit() {
        let active = ActiveSession::new("s1", PathBuf::from("/w"), "m1".into());
        assert!(!active.is_processing());
        let permit = active.processing.clone().try_acquire_owned().unwrap();
        assert!(active.is_processing());
        drop(permit);
        assert!(!active.is_processing());
    }

    #[test]
    fn run_id_lifecycle() {
        let active = ActiveSession::new("s1", PathBuf::from("/w"), "m1".into());
        assert!(active.current_run_id().is_none());
        active.set_current_run_id(Some("r1".into()));
        assert_eq!(active.current_run_id().as_deref(), Some("r1"));
        active.set_current_run_id(None);
        assert!(active.current_run_id().is_none());
    }
}
