//! Multi-session coordinator.
//!
//! Owns the active-session map (bounded, LRU-evicted on idle), dispatches
//! prompts into per-session turn loops, and fronts session lifecycle
//! operations: create, resume, fork, model switch, compaction, end,
//! shutdown.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tracing::Instrument;

use strand_domain::config::CoreConfig;
use strand_domain::error::{Error, Result};
use strand_domain::event::EventKind;
use strand_domain::provider::{CredentialLookup, NoCredentials, Provider};
use strand_hooks::{HookContext, HookEngine, HookKind};
use strand_store::{AppendRequest, EventStore, SessionRecord};

use crate::active::ActiveSession;
use crate::cancel::CancelMap;
use crate::compaction::{self, CompactionOutcome};
use crate::events::{EventHub, RuntimeEvent};
use crate::pipeline::{self, PipelineDeps, PromptInput};
use crate::plan;
use crate::reconstruct;
use crate::registry::ToolRegistry;

pub use crate::pipeline::RunSummary;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RunHandle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Handle to an in-flight prompt run.
pub struct RunHandle {
    pub run_id: String,
    pub join: tokio::task::JoinHandle<Result<RunSummary>>,
}

impl RunHandle {
    /// Await the run's completion.
    pub async fn wait(self) -> Result<RunSummary> {
        self.join
            .await
            .map_err(|e| Error::Other(format!("run task aborted: {e}")))?
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Builder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct OrchestratorBuilder {
    store: Arc<EventStore>,
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    hooks: Option<Arc<HookEngine>>,
    credentials: Arc<dyn CredentialLookup>,
    config: Arc<CoreConfig>,
}

impl OrchestratorBuilder {
    pub fn new(store: Arc<EventStore>, provider: Arc<dyn Provider>) -> Self {
        Self {
            store,
            provider,
            tools: Arc::new(ToolRegistry::new()),
            hooks: None,
            credentials: Arc::new(NoCredentials),
            config: Arc::new(CoreConfig::default()),
        }
    }

    pub fn tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn hooks(mut self, hooks: Arc<HookEngine>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn credentials(mut self, credentials: Arc<dyn CredentialLookup>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn config(mut self, config: Arc<CoreConfig>) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Orchestrator {
        let hooks = self
            .hooks
            .unwrap_or_else(|| Arc::new(HookEngine::new(self.config.hooks.default_timeout_ms)));
        Orchestrator {
            store: self.store,
            provider: self.provider,
            tools: self.tools,
            hooks,
            credentials: self.credentials,
            config: self.config,
            hub: Arc::new(EventHub::new()),
            cancel_map: Arc::new(CancelMap::new()),
            active: Mutex::new(HashMap::new()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Orchestrator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Orchestrator {
    store: Arc<EventStore>,
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    hooks: Arc<HookEngine>,
    credentials: Arc<dyn CredentialLookup>,
    config: Arc<CoreConfig>,
    hub: Arc<EventHub>,
    pub(crate) cancel_map: Arc<CancelMap>,
    active: Mutex<HashMap<String, Arc<ActiveSession>>>,
}

impl Orchestrator {
    pub fn builder(store: Arc<EventStore>, provider: Arc<dyn Provider>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(store, provider)
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    pub fn hooks(&self) -> &Arc<HookEngine> {
        &self.hooks
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    pub fn config(&self) -> &Arc<CoreConfig> {
        &self.config
    }

    pub(crate) fn deps(&self) -> PipelineDeps {
        PipelineDeps {
            store: self.store.clone(),
            provider: self.provider.clone(),
            tools: self.tools.clone(),
            hooks: self.hooks.clone(),
            credentials: self.credentials.clone(),
            hub: self.hub.clone(),
            config: self.config.clone(),
        }
    }

    /// Subscribe to a session's streaming events.
    pub fn subscribe(
        &self,
        session_id: &str,
    ) -> tokio::sync::broadcast::Receiver<RuntimeEvent> {
        self.hub.subscribe(session_id)
    }

    // ── Session lifecycle ─────────────────────────────────────────

    /// Create a session and append its `session.start` root event.
    pub fn create_session(&self, working_directory: &str, model: &str) -> Result<SessionRecord> {
        let session = self.store.create_session(working_directory, model)?;
        self.store.append(
            &session.id,
            AppendRequest::new(
                EventKind::SessionStart,
                json!({"workingDirectory": working_directory, "model": model}),
            ),
        )?;
        tracing::info!(session_id = %session.id, model, "session created");
        self.store
            .get_session(&session.id)?
            .ok_or_else(|| Error::SessionNotFound(session.id))
    }

    /// Get or build the runtime handle for a session, replaying its events
    /// to rebuild trackers. Evicts the least-recently-used idle session
    /// when the map is full.
    pub fn activate(&self, session_id: &str) -> Result<Arc<ActiveSession>> {
        if let Some(active) = self.active.lock().get(session_id).cloned() {
            active.touch();
            return Ok(active);
        }

        let session = self
            .store
            .get_session(session_id)?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_owned()))?;

        // Replay: for a fork, prime from the source event's ancestors first,
        // then overlay the fork's own history.
        let own_events = self.store.get_events(session_id)?;
        let mut replay = Vec::new();
        if let Some(root) = own_events.first() {
            if root.kind == EventKind::SessionFork {
                if let Some(source_event) = root.payload_str("sourceEventId") {
                    match self.store.get_ancestors(source_event) {
                        Ok(ancestors) => replay.extend(ancestors),
                        Err(e) => {
                            tracing::warn!(session_id, error = %e, "fork source replay unavailable")
                        }
                    }
                }
            }
        }
        replay.extend(own_events);

        let state = reconstruct::reconstruct(&replay);
        let active = Arc::new(ActiveSession::with_state(
            session_id,
            PathBuf::from(&session.working_directory),
            state.model.unwrap_or(session.model),
            Arc::new(state.subagents),
        ));
        {
            let mut ctx = active.context.lock();
            ctx.current_turn = state.current_turn;
            ctx.context_baseline = state.context_baseline;
        }

        let mut map = self.active.lock();
        if map.len() >= self.config.sessions.max_concurrent_sessions {
            self.evict_locked(&mut map)?;
        }
        map.insert(session_id.to_owned(), active.clone());
        drop(map);

        tracing::debug!(session_id, "session activated");
        Ok(active)
    }

    fn evict_locked(&self, map: &mut HashMap<String, Arc<ActiveSession>>) -> Result<()> {
        let victim = map
            .iter()
            .filter(|(_, active)| !active.is_processing())
            .max_by_key(|(_, active)| active.idle_for())
            .map(|(id, _)| id.clone());
        match victim {
            Some(id) => {
                tracing::debug!(session_id = %id, "evicting idle session");
                map.remove(&id);
                self.hub.cleanup(&id);
                Ok(())
            }
            None => Err(Error::Other(
                "active session limit reached and every session is processing".into(),
            )),
        }
    }

    /// Drop idle active sessions past the configured TTL.
    pub fn evict_idle(&self) {
        let ttl = std::time::Duration::from_secs(self.config.sessions.idle_ttl_secs);
        let mut map = self.active.lock();
        let stale: Vec<String> = map
            .iter()
            .filter(|(_, active)| !active.is_processing() && active.idle_for() > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            tracing::debug!(session_id = %id, "idle session evicted");
            map.remove(&id);
            self.hub.cleanup(&id);
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    // ── Prompting ─────────────────────────────────────────────────

    /// Submit a prompt. Rejects with `AlreadyProcessing` while another run
    /// is in flight for the session.
    pub fn prompt(&self, session_id: &str, prompt: &str) -> Result<RunHandle> {
        self.prompt_with(PromptInput {
            session_id: session_id.to_owned(),
            prompt: prompt.to_owned(),
            run_id: uuid::Uuid::new_v4().to_string(),
            attachments: None,
            skills: None,
        })
    }

    pub fn prompt_with(&self, input: PromptInput) -> Result<RunHandle> {
        let active = self.activate(&input.session_id)?;
        let permit = active
            .processing
            .clone()
            .try_acquire_owned()
            .map_err(|_| Error::AlreadyProcessing(input.session_id.clone()))?;

        let run_id = input.run_id.clone();
        let cancel = self.cancel_map.register(&input.session_id);
        let deps = self.deps();
        let cancel_map = self.cancel_map.clone();

        let span = tracing::info_span!(
            "turn",
            run_id = %run_id,
            session_id = %input.session_id,
        );
        let join = tokio::spawn(
            async move {
                let _permit = permit;
                let result = pipeline::run_prompt(&deps, &active, &input, &cancel).await;
                cancel_map.remove(&input.session_id);
                if let Err(e) = &result {
                    tracing::warn!(error = %e, "run failed");
                }
                result
            }
            .instrument(span),
        );

        Ok(RunHandle { run_id, join })
    }

    /// Abort a session's in-flight run (and cascade to its children).
    pub fn cancel(&self, session_id: &str) -> bool {
        self.cancel_map.cancel(session_id)
    }

    // ── Configuration ─────────────────────────────────────────────

    /// Switch the session's model. Refused while a run is processing.
    pub fn switch_model(&self, session_id: &str, new_model: &str) -> Result<()> {
        if let Some(active) = self.active.lock().get(session_id).cloned() {
            if active.is_processing() {
                return Err(Error::AlreadyProcessing(session_id.to_owned()));
            }
        }

        let session = self
            .store
            .get_session(session_id)?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_owned()))?;
        let previous = self
            .active
            .lock()
            .get(session_id)
            .map(|a| a.model())
            .unwrap_or(session.model);

        self.store.append(
            session_id,
            AppendRequest::new(
                EventKind::ConfigModelSwitch,
                json!({"previousModel": &previous, "newModel": new_model}),
            ),
        )?;
        self.store.update_latest_model(session_id, new_model)?;

        if let Some(active) = self.active.lock().get(session_id).cloned() {
            active.set_model(new_model);
            // Credentials are read-mostly; touch the lookup so a rotated
            // secret is picked up for the new provider/model pair.
            let _ = self
                .credentials
                .credential_for(self.provider.provider_id());
        }

        tracing::info!(session_id, %previous, new_model, "model switched");
        Ok(())
    }

    pub fn set_reasoning_level(&self, session_id: &str, level: Option<String>) -> Result<()> {
        let active = self.activate(session_id)?;
        active.set_reasoning_level(level);
        Ok(())
    }

    // ── Fork ──────────────────────────────────────────────────────

    /// Fork a new session from an event of an existing one.
    pub fn fork_session(
        &self,
        source_session_id: &str,
        source_event_id: &str,
        name: Option<&str>,
    ) -> Result<SessionRecord> {
        let (fork, _root) = self.store.fork(source_session_id, source_event_id, name)?;
        Ok(fork)
    }

    // ── Plan mode ─────────────────────────────────────────────────

    pub fn enter_plan_mode(
        &self,
        session_id: &str,
        skill_name: &str,
        blocked_tools: Vec<String>,
    ) -> Result<()> {
        let active = self.activate(session_id)?;
        let mode = plan::enter_plan_mode(&self.store, session_id, skill_name, blocked_tools)?;
        *active.plan_mode.lock() = Some(mode);
        Ok(())
    }

    pub fn exit_plan_mode(
        &self,
        session_id: &str,
        reason: &str,
        plan_path: Option<&str>,
    ) -> Result<()> {
        let active = self.activate(session_id)?;
        plan::exit_plan_mode(&self.store, session_id, reason, plan_path)?;
        *active.plan_mode.lock() = None;
        Ok(())
    }

    // ── Compaction ────────────────────────────────────────────────

    /// Compact the session's context into a summary boundary.
    pub async fn compact(&self, session_id: &str, reason: &str) -> Result<CompactionOutcome> {
        let active = self.activate(session_id)?;
        let run_id = uuid::Uuid::new_v4().to_string();
        let outcome = compaction::compact_session(
            &self.store,
            &self.provider,
            &self.hub,
            &active.subagents,
            session_id,
            &active.model(),
            reason,
            &run_id,
        )
        .await?;
        active.context.lock().context_baseline = outcome.compacted_tokens;
        Ok(outcome)
    }

    // ── End / shutdown ────────────────────────────────────────────

    /// Append `session.end`, run SessionEnd hooks, and release the runtime
    /// handle.
    pub async fn end_session(&self, session_id: &str, reason: &str) -> Result<()> {
        self.store.append(
            session_id,
            AppendRequest::new(EventKind::SessionEnd, json!({"reason": reason})),
        )?;

        let ctx = HookContext::for_session(session_id);
        let _ = self.hooks.execute(HookKind::SessionEnd, &ctx).await;

        self.active.lock().remove(session_id);
        self.cancel_map.remove(session_id);
        self.hub.cleanup(session_id);
        tracing::info!(session_id, reason, "session ended");
        Ok(())
    }

    /// Drain background hooks and drop all runtime state. Persisted
    /// sessions survive untouched.
    pub async fn shutdown(&self) {
        let drained = self
            .hooks
            .drain_background_hooks(self.config.hooks.drain_timeout_ms)
            .await;
        if !drained {
            tracing::warn!("background hooks did not drain before shutdown");
        }
        let sessions: Vec<String> = self.active.lock().keys().cloned().collect();
        for session_id in sessions {
            self.cancel_map.cancel(&session_id);
            self.hub.cleanup(&session_id);
        }
        self.active.lock().clear();
        tracing::info!("orchestrator shut down");
    }
}
