//! Hook execution engine.
//!
//! Blocking hooks of a kind run sequentially in priority order; the first
//! `block` short-circuits the chain. Background hooks run fire-and-forget
//! under tracked join handles so shutdown can drain them. All handler errors
//! and timeouts are fail-open.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::{AbortHandle, JoinHandle};

use crate::types::{
    HookAction, HookContext, HookDefinition, HookKind, HookMode,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reports
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Aggregated result of one `execute` call's blocking phase.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub kind: HookKind,
    /// `Block` if any hook blocked, `Modify` if any modified, else
    /// `Continue`.
    pub action: HookAction,
    pub reason: Option<String>,
    pub message: Option<String>,
    /// Merged modifications from all `modify` results, in execution order.
    pub modifications: serde_json::Map<String, Value>,
    /// Names of blocking hooks that ran (filters applied), in order.
    pub executed: Vec<String>,
    /// Names of background hooks launched.
    pub background_started: Vec<String>,
    pub duration_ms: u64,
}

impl ExecutionReport {
    fn empty(kind: HookKind) -> Self {
        Self {
            kind,
            action: HookAction::Continue,
            reason: None,
            message: None,
            modifications: serde_json::Map::new(),
            executed: Vec::new(),
            background_started: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn blocked(&self) -> bool {
        self.action == HookAction::Block
    }

    /// Whether anything ran that is worth persisting lifecycle events for.
    pub fn ran_blocking(&self) -> bool {
        !self.executed.is_empty()
    }

    pub fn result_str(&self) -> &'static str {
        match self.action {
            HookAction::Continue => "continue",
            HookAction::Modify => "modify",
            HookAction::Block => "block",
        }
    }
}

/// Completion notice for one background hook.
#[derive(Debug, Clone)]
pub struct BackgroundHookEvent {
    pub hook: String,
    pub kind: HookKind,
    pub error: Option<String>,
    pub duration_ms: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Registered {
    def: HookDefinition,
    /// Monotone registration counter; ties on priority keep this order.
    seq: u64,
}

pub struct HookEngine {
    hooks: RwLock<Vec<Registered>>,
    next_seq: Mutex<u64>,
    default_timeout_ms: u64,
    /// Join handles of in-flight background hooks, drained at shutdown.
    background: Mutex<Vec<JoinHandle<()>>>,
    background_tx: broadcast::Sender<BackgroundHookEvent>,
}

impl HookEngine {
    pub fn new(default_timeout_ms: u64) -> Self {
        let (background_tx, _) = broadcast::channel(64);
        Self {
            hooks: RwLock::new(Vec::new()),
            next_seq: Mutex::new(0),
            default_timeout_ms,
            background: Mutex::new(Vec::new()),
            background_tx,
        }
    }

    /// Register a hook. A hook with the same name replaces the previous
    /// registration. Flow-mutating kinds are forced to blocking mode on
    /// every registration, whatever the caller asked for.
    pub fn register(&self, mut def: HookDefinition) {
        if def.kind.forces_blocking() && def.mode != HookMode::Blocking {
            tracing::debug!(
                hook = %def.name,
                kind = %def.kind,
                "forcing blocking mode for flow-mutating hook kind"
            );
            def.mode = HookMode::Blocking;
        }

        let mut hooks = self.hooks.write();
        hooks.retain(|r| r.def.name != def.name);
        let seq = {
            let mut counter = self.next_seq.lock();
            *counter += 1;
            *counter
        };
        tracing::debug!(hook = %def.name, kind = %def.kind, priority = def.priority, "hook registered");
        hooks.push(Registered { def, seq });
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut hooks = self.hooks.write();
        let before = hooks.len();
        hooks.retain(|r| r.def.name != name);
        hooks.len() != before
    }

    /// All hooks of a kind, priority descending, stable on ties by
    /// registration order.
    pub fn get_hooks(&self, kind: HookKind) -> Vec<HookDefinition> {
        let hooks = self.hooks.read();
        let mut selected: Vec<(&Registered, &HookDefinition)> = hooks
            .iter()
            .filter(|r| r.def.kind == kind)
            .map(|r| (r, &r.def))
            .collect();
        selected.sort_by(|a, b| b.1.priority.cmp(&a.1.priority).then(a.0.seq.cmp(&b.0.seq)));
        selected.into_iter().map(|(_, def)| def.clone()).collect()
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.read().len()
    }

    /// Subscribe to background hook completion notices.
    pub fn background_events(&self) -> broadcast::Receiver<BackgroundHookEvent> {
        self.background_tx.subscribe()
    }

    // ── Execution ─────────────────────────────────────────────────

    /// Run all hooks of a kind against a context.
    ///
    /// Blocking hooks run sequentially here; background hooks are launched
    /// and tracked, and the call returns the blocking-phase result.
    pub async fn execute(&self, kind: HookKind, ctx: &HookContext) -> ExecutionReport {
        let hooks = self.get_hooks(kind);
        let mut report = ExecutionReport::empty(kind);
        if hooks.is_empty() {
            return report;
        }

        let started = Instant::now();
        let (blocking, background): (Vec<_>, Vec<_>) = hooks
            .into_iter()
            .partition(|h| h.mode == HookMode::Blocking);

        for hook in blocking {
            if let Some(filter) = &hook.filter {
                if !filter(ctx) {
                    tracing::trace!(hook = %hook.name, "hook filtered out");
                    continue;
                }
            }

            report.executed.push(hook.name.clone());
            let timeout = Duration::from_millis(hook.timeout_ms.unwrap_or(self.default_timeout_ms));

            let outcome = tokio::time::timeout(timeout, hook.handler.run(ctx)).await;
            match outcome {
                Ok(Ok(result)) => match result.action {
                    HookAction::Block => {
                        report.action = HookAction::Block;
                        report.reason = result.reason;
                        report.message = result.message;
                        report.duration_ms = started.elapsed().as_millis() as u64;
                        tracing::info!(
                            hook = %hook.name,
                            kind = %kind,
                            reason = report.reason.as_deref().unwrap_or(""),
                            "hook blocked"
                        );
                        self.launch_background(kind, background, ctx, &mut report);
                        return report;
                    }
                    HookAction::Modify => {
                        if report.action != HookAction::Block {
                            report.action = HookAction::Modify;
                        }
                        if let Some(mods) = result.modifications {
                            for (key, value) in mods {
                                report.modifications.insert(key, value);
                            }
                        }
                        if result.message.is_some() {
                            report.message = result.message;
                        }
                    }
                    HookAction::Continue => {
                        if result.message.is_some() {
                            report.message = result.message;
                        }
                    }
                },
                Ok(Err(e)) => {
                    // Fail-open: a throwing hook never changes agent flow.
                    tracing::warn!(hook = %hook.name, kind = %kind, error = %e, "hook failed, continuing");
                }
                Err(_) => {
                    tracing::warn!(
                        hook = %hook.name,
                        kind = %kind,
                        timeout_ms = timeout.as_millis() as u64,
                        "hook timed out, continuing"
                    );
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        self.launch_background(kind, background, ctx, &mut report);
        report
    }

    fn launch_background(
        &self,
        kind: HookKind,
        hooks: Vec<HookDefinition>,
        ctx: &HookContext,
        report: &mut ExecutionReport,
    ) {
        for hook in hooks {
            if let Some(filter) = &hook.filter {
                if !filter(ctx) {
                    continue;
                }
            }

            report.background_started.push(hook.name.clone());
            let name = hook.name.clone();
            let handler = hook.handler.clone();
            let timeout = Duration::from_millis(hook.timeout_ms.unwrap_or(self.default_timeout_ms));
            let ctx = ctx.clone();
            let tx = self.background_tx.clone();

            let handle = tokio::spawn(async move {
                let started = Instant::now();
                let outcome = tokio::time::timeout(timeout, handler.run(&ctx)).await;
                let error = match outcome {
                    Ok(Ok(_)) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(_) => Some(format!("timed out after {}ms", timeout.as_millis())),
                };
                if let Some(err) = &error {
                    // Tracked, not swallowed — but never affects agent flow.
                    tracing::warn!(hook = %name, error = %err, "background hook failed");
                }
                let _ = tx.send(BackgroundHookEvent {
                    hook: name,
                    kind,
                    error,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            });
            self.background.lock().push(handle);
        }
    }

    /// Await all in-flight background hooks, bounded by `timeout_ms`.
    /// Returns `true` when everything finished in time; stragglers are
    /// aborted.
    pub async fn drain_background_hooks(&self, timeout_ms: u64) -> bool {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.background.lock());
        if handles.is_empty() {
            return true;
        }

        tracing::debug!(count = handles.len(), timeout_ms, "draining background hooks");
        // Keep abort handles reachable after the join consumes the joins.
        let aborts: Vec<AbortHandle> = handles.iter().map(JoinHandle::abort_handle).collect();
        let all = futures_join_all(handles);
        match tokio::time::timeout(Duration::from_millis(timeout_ms), all).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    timeout_ms,
                    "background hook drain timed out, aborting stragglers"
                );
                for abort in aborts {
                    abort.abort();
                }
                false
            }
        }
    }
}

async fn futures_join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HookFn, HookHandler, HookResult};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine() -> HookEngine {
        HookEngine::new(1_000)
    }

    fn ctx() -> HookContext {
        HookContext::for_session("s1")
    }

    fn recording_hook(
        name: &str,
        kind: HookKind,
        log: Arc<Mutex<Vec<String>>>,
        result: HookResult,
    ) -> HookDefinition {
        let name_owned = name.to_owned();
        HookDefinition::new(
            name,
            kind,
            Arc::new(HookFn(move |_ctx: &HookContext| {
                log.lock().push(name_owned.clone());
                result.clone()
            })),
        )
    }

    #[tokio::test]
    async fn blocking_hooks_run_in_priority_order() {
        let engine = engine();
        let log = Arc::new(Mutex::new(Vec::new()));
        engine.register(
            recording_hook("low", HookKind::Stop, log.clone(), HookResult::proceed())
                .with_priority(1),
        );
        engine.register(
            recording_hook("high", HookKind::Stop, log.clone(), HookResult::proceed())
                .with_priority(10),
        );
        engine.register(
            recording_hook("mid", HookKind::Stop, log.clone(), HookResult::proceed())
                .with_priority(5),
        );

        let report = engine.execute(HookKind::Stop, &ctx()).await;
        assert_eq!(report.action, HookAction::Continue);
        assert_eq!(*log.lock(), vec!["high", "mid", "low"]);
        assert_eq!(report.executed, vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn ties_stable_by_registration_order() {
        let engine = engine();
        let log = Arc::new(Mutex::new(Vec::new()));
        engine.register(recording_hook("first", HookKind::Stop, log.clone(), HookResult::proceed()));
        engine.register(recording_hook("second", HookKind::Stop, log.clone(), HookResult::proceed()));

        engine.execute(HookKind::Stop, &ctx()).await;
        assert_eq!(*log.lock(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn block_short_circuits_later_hooks() {
        let engine = engine();
        let log = Arc::new(Mutex::new(Vec::new()));
        engine.register(
            recording_hook("deny", HookKind::PreToolUse, log.clone(), HookResult::block("policy"))
                .with_priority(10),
        );
        engine.register(
            recording_hook("later", HookKind::PreToolUse, log.clone(), HookResult::proceed())
                .with_priority(1),
        );

        let report = engine.execute(HookKind::PreToolUse, &ctx()).await;
        assert!(report.blocked());
        assert_eq!(report.reason.as_deref(), Some("policy"));
        assert_eq!(*log.lock(), vec!["deny"]);
    }

    #[tokio::test]
    async fn thrown_error_is_fail_open() {
        struct Exploding;
        #[async_trait::async_trait]
        impl HookHandler for Exploding {
            async fn run(
                &self,
                _ctx: &HookContext,
            ) -> strand_domain::error::Result<HookResult> {
                Err(strand_domain::error::Error::Other("boom".into()))
            }
        }

        let engine = engine();
        let log = Arc::new(Mutex::new(Vec::new()));
        engine.register(
            HookDefinition::new("exploder", HookKind::Stop, Arc::new(Exploding)).with_priority(10),
        );
        engine.register(recording_hook("after", HookKind::Stop, log.clone(), HookResult::proceed()));

        let report = engine.execute(HookKind::Stop, &ctx()).await;
        // Same outcome as if the exploding hook had returned `continue`.
        assert_eq!(report.action, HookAction::Continue);
        assert_eq!(*log.lock(), vec!["after"]);
    }

    #[tokio::test]
    async fn timed_out_hook_is_fail_open() {
        struct Sleeper;
        #[async_trait::async_trait]
        impl HookHandler for Sleeper {
            async fn run(
                &self,
                _ctx: &HookContext,
            ) -> strand_domain::error::Result<HookResult> {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(HookResult::block("too late"))
            }
        }

        let engine = engine();
        engine.register(
            HookDefinition::new("sleeper", HookKind::Stop, Arc::new(Sleeper))
                .with_timeout_ms(50),
        );

        let report = engine.execute(HookKind::Stop, &ctx()).await;
        assert_eq!(report.action, HookAction::Continue);
    }

    #[tokio::test]
    async fn modifications_accumulate_across_hooks() {
        let engine = engine();
        let mods1 = serde_json::json!({"a": 1}).as_object().unwrap().clone();
        let mods2 = serde_json::json!({"b": 2, "a": 3}).as_object().unwrap().clone();
        engine.register(
            HookDefinition::new(
                "m1",
                HookKind::UserPromptSubmit,
                Arc::new(HookFn(move |_: &HookContext| HookResult::modify(mods1.clone()))),
            )
            .with_priority(10),
        );
        engine.register(
            HookDefinition::new(
                "m2",
                HookKind::UserPromptSubmit,
                Arc::new(HookFn(move |_: &HookContext| HookResult::modify(mods2.clone()))),
            )
            .with_priority(5),
        );

        let report = engine.execute(HookKind::UserPromptSubmit, &ctx()).await;
        assert_eq!(report.action, HookAction::Modify);
        // Later hook's value wins for the shared key.
        assert_eq!(report.modifications["a"], 3);
        assert_eq!(report.modifications["b"], 2);
    }

    #[tokio::test]
    async fn filter_skips_hook() {
        let engine = engine();
        let log = Arc::new(Mutex::new(Vec::new()));
        engine.register(
            recording_hook("bash-only", HookKind::PreToolUse, log.clone(), HookResult::block("no"))
                .with_filter(Arc::new(|ctx: &HookContext| {
                    ctx.tool_name.as_deref() == Some("Bash")
                })),
        );

        let read_ctx = HookContext::for_session("s1").with_tool("t1", "Read", serde_json::json!({}));
        let report = engine.execute(HookKind::PreToolUse, &read_ctx).await;
        assert_eq!(report.action, HookAction::Continue);
        assert!(report.executed.is_empty());

        let bash_ctx = HookContext::for_session("s1").with_tool("t2", "Bash", serde_json::json!({}));
        let report = engine.execute(HookKind::PreToolUse, &bash_ctx).await;
        assert!(report.blocked());
    }

    #[tokio::test]
    async fn reregistration_replaces_by_name() {
        let engine = engine();
        let log = Arc::new(Mutex::new(Vec::new()));
        engine.register(recording_hook("h", HookKind::Stop, log.clone(), HookResult::block("v1")));
        engine.register(recording_hook("h", HookKind::Stop, log.clone(), HookResult::proceed()));

        assert_eq!(engine.hook_count(), 1);
        let report = engine.execute(HookKind::Stop, &ctx()).await;
        assert_eq!(report.action, HookAction::Continue);
    }

    #[tokio::test]
    async fn forced_blocking_applies_on_every_registration() {
        let engine = engine();
        engine.register(
            HookDefinition::new(
                "sneaky",
                HookKind::PreToolUse,
                Arc::new(HookFn(|_: &HookContext| HookResult::block("gotcha"))),
            )
            .background(),
        );

        let hooks = engine.get_hooks(HookKind::PreToolUse);
        assert_eq!(hooks[0].mode, HookMode::Blocking);

        // Replace it, again requesting background; still forced.
        engine.register(
            HookDefinition::new(
                "sneaky",
                HookKind::PreToolUse,
                Arc::new(HookFn(|_: &HookContext| HookResult::proceed())),
            )
            .background(),
        );
        assert_eq!(engine.get_hooks(HookKind::PreToolUse)[0].mode, HookMode::Blocking);
    }

    #[tokio::test]
    async fn background_hooks_run_and_drain() {
        let engine = engine();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        engine.register(
            HookDefinition::new(
                "bg",
                HookKind::PostToolUse,
                Arc::new(HookFn(move |_: &HookContext| {
                    c.fetch_add(1, Ordering::SeqCst);
                    HookResult::proceed()
                })),
            )
            .background(),
        );

        let mut events = engine.background_events();
        let report = engine.execute(HookKind::PostToolUse, &ctx()).await;
        assert_eq!(report.background_started, vec!["bg"]);
        assert!(report.executed.is_empty());

        assert!(engine.drain_background_hooks(1_000).await);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let notice = events.try_recv().unwrap();
        assert_eq!(notice.hook, "bg");
        assert!(notice.error.is_none());
    }

    #[tokio::test]
    async fn background_hook_error_is_tracked_not_propagated() {
        struct Failing;
        #[async_trait::async_trait]
        impl HookHandler for Failing {
            async fn run(
                &self,
                _ctx: &HookContext,
            ) -> strand_domain::error::Result<HookResult> {
                Err(strand_domain::error::Error::Other("bg boom".into()))
            }
        }

        let engine = engine();
        engine.register(
            HookDefinition::new("bg-fail", HookKind::SessionEnd, Arc::new(Failing)).background(),
        );

        let mut events = engine.background_events();
        let report = engine.execute(HookKind::SessionEnd, &ctx()).await;
        assert_eq!(report.action, HookAction::Continue);

        assert!(engine.drain_background_hooks(1_000).await);
        let notice = events.try_recv().unwrap();
        assert!(notice.error.as_deref().unwrap().contains("bg boom"));
    }

    #[tokio::test]
    async fn no_hooks_is_a_cheap_noop() {
        let engine = engine();
        let report = engine.execute(HookKind::Notification, &ctx()).await;
        assert_eq!(report.action, HookAction::Continue);
        assert!(!report.ran_blocking());
        assert!(engine.drain_background_hooks(10).await);
    }

    #[tokio::test]
    async fn background_launched_even_when_blocked() {
        let engine = engine();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        engine.register(
            HookDefinition::new(
                "blocker",
                HookKind::Stop,
                Arc::new(HookFn(|_: &HookContext| HookResult::block("stop"))),
            )
            .with_priority(10),
        );
        engine.register(
            HookDefinition::new(
                "bg",
                HookKind::Stop,
                Arc::new(HookFn(move |_: &HookContext| {
                    c.fetch_add(1, Ordering::SeqCst);
                    HookResult::proceed()
                })),
            )
            .background(),
        );

        let report = engine.execute(HookKind::Stop, &ctx()).await;
        assert!(report.blocked());
        assert_eq!(report.background_started, vec!["bg"]);
        engine.drain_background_hooks(1_000).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drain_timeout_aborts_stragglers() {
        struct Stuck(Arc<AtomicUsize>);
        #[async_trait::async_trait]
        impl HookHandler for Stuck {
            async fn run(
                &self,
                _ctx: &HookContext,
            ) -> strand_domain::error::Result<HookResult> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(HookResult::proceed())
            }
        }

        let engine = engine();
        let finished = Arc::new(AtomicUsize::new(0));
        engine.register(
            HookDefinition::new(
                "stuck",
                HookKind::SessionEnd,
                Arc::new(Stuck(finished.clone())),
            )
            .with_timeout_ms(120_000)
            .background(),
        );

        engine.execute(HookKind::SessionEnd, &ctx()).await;
        assert!(!engine.drain_background_hooks(50).await);
        // The straggler was aborted: nothing is left to drain and the hook
        // never ran to completion.
        assert!(engine.drain_background_hooks(50).await);
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }
}
