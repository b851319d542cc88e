//! Sub-agent tracking: spawned child sessions, waiter futures, completion
//! callbacks, and event-sourced reconstruction.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use strand_domain::error::{Error, Result};
use strand_domain::event::{Event, EventKind};
use strand_domain::tokens::TokenUsage;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status / records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubagentStatus {
    Spawning,
    Running,
    Paused,
    WaitingInput,
    Completed,
    Failed,
}

impl SubagentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubagentStatus::Spawning => "spawning",
            SubagentStatus::Running => "running",
            SubagentStatus::Paused => "paused",
            SubagentStatus::WaitingInput => "waiting_input",
            SubagentStatus::Completed => "completed",
            SubagentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "spawning" => Some(SubagentStatus::Spawning),
            "running" => Some(SubagentStatus::Running),
            "paused" => Some(SubagentStatus::Paused),
            "waiting_input" => Some(SubagentStatus::WaitingInput),
            "completed" => Some(SubagentStatus::Completed),
            "failed" => Some(SubagentStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SubagentStatus::Completed | SubagentStatus::Failed)
    }
}

/// One tracked child session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedSubagent {
    pub session_id: String,
    pub spawn_event_id: Option<String>,
    pub spawn_type: String,
    pub task: String,
    pub model: String,
    pub working_directory: String,
    pub status: SubagentStatus,
    pub current_turn: u32,
    pub token_usage: TokenUsage,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub result_summary: Option<String>,
    pub full_output: Option<String>,
    pub error: Option<String>,
    pub tmux_session_name: Option<String>,
    pub max_turns: u32,
    pub duration_ms: Option<u64>,
}

/// Terminal outcome delivered to waiters and pending-result consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentResult {
    pub session_id: String,
    pub success: bool,
    pub summary: String,
    pub output: Option<String>,
    pub error: Option<String>,
    pub total_turns: u32,
    pub token_usage: TokenUsage,
    pub duration_ms: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tracker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type Callback = Arc<dyn Fn(&SubagentResult) + Send + Sync>;

enum WaiterOutcome {
    Result(Box<SubagentResult>),
    Cleared,
}

#[derive(Default)]
struct TrackerInner {
    agents: HashMap<String, TrackedSubagent>,
    /// Terminal results kept for synchronous `wait_for` resolution.
    results: HashMap<String, SubagentResult>,
    /// Undelivered results, drained by `consume_pending_results`.
    pending: VecDeque<SubagentResult>,
    waiters: HashMap<String, Vec<oneshot::Sender<WaiterOutcome>>>,
    on_complete: HashMap<String, Vec<Callback>>,
    on_any: Vec<Callback>,
}

/// Tracks spawned child sessions for one parent.
#[derive(Default)]
pub struct SubagentTracker {
    inner: Mutex<TrackerInner>,
}

impl SubagentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Mutation ──────────────────────────────────────────────────

    /// Insert a newly spawned child with status `spawning`.
    pub fn spawn(&self, record: TrackedSubagent) {
        self.inner
            .lock()
            .agents
            .insert(record.session_id.clone(), record);
    }

    /// Update status / turn / usage for a tracked child.
    pub fn update_status(
        &self,
        session_id: &str,
        status: SubagentStatus,
        current_turn: u32,
        token_usage: Option<TokenUsage>,
    ) {
        let mut inner = self.inner.lock();
        if let Some(agent) = inner.agents.get_mut(session_id) {
            agent.status = status;
            agent.current_turn = current_turn;
            if let Some(usage) = token_usage {
                agent.token_usage = usage;
            }
        }
    }

    /// Mark a child completed: record the result, queue it for delivery,
    /// fire callbacks, and resolve waiters.
    #[allow(clippy::too_many_arguments)]
    pub fn complete(
        &self,
        session_id: &str,
        summary: &str,
        total_turns: u32,
        token_usage: TokenUsage,
        duration_ms: u64,
        full_output: Option<String>,
    ) {
        let result = SubagentResult {
            session_id: session_id.to_owned(),
            success: true,
            summary: summary.to_owned(),
            output: full_output,
            error: None,
            total_turns,
            token_usage,
            duration_ms,
        };
        self.finish(session_id, SubagentStatus::Completed, result);
    }

    /// Mark a child failed. Waiters resolve (not reject) with the failed
    /// result.
    pub fn fail(
        &self,
        session_id: &str,
        error: &str,
        failed_at_turn: Option<u32>,
        duration_ms: Option<u64>,
    ) {
        let result = SubagentResult {
            session_id: session_id.to_owned(),
            success: false,
            summary: format!("failed: {error}"),
            output: None,
            error: Some(error.to_owned()),
            total_turns: failed_at_turn.unwrap_or(0),
            token_usage: TokenUsage::default(),
            duration_ms: duration_ms.unwrap_or(0),
        };
        self.finish(session_id, SubagentStatus::Failed, result);
    }

    fn finish(&self, session_id: &str, status: SubagentStatus, result: SubagentResult) {
        let (waiters, callbacks) = {
            let mut inner = self.inner.lock();

            if let Some(agent) = inner.agents.get_mut(session_id) {
                agent.status = status;
                agent.ended_at = Some(Utc::now());
                agent.duration_ms = Some(result.duration_ms);
                agent.current_turn = result.total_turns;
                agent.token_usage = result.token_usage.clone();
                agent.result_summary = Some(result.summary.clone());
                agent.full_output = result.output.clone();
                agent.error = result.error.clone();
            }

            inner.results.insert(session_id.to_owned(), result.clone());
            inner.pending.push_back(result.clone());

            let waiters = inner.waiters.remove(session_id).unwrap_or_default();
            let mut callbacks: Vec<Callback> =
                inner.on_complete.remove(session_id).unwrap_or_default();
            callbacks.extend(inner.on_any.iter().cloned());
            (waiters, callbacks)
        };

        for waiter in waiters {
            let _ = waiter.send(WaiterOutcome::Result(Box::new(result.clone())));
        }
        for callback in callbacks {
            // Callback panics are logged, never propagated.
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(&result)
            }));
            if outcome.is_err() {
                tracing::warn!(session_id, "subagent completion callback panicked");
            }
        }
    }

    // ── Waiting ───────────────────────────────────────────────────

    /// Await the terminal result for one child. Resolves immediately from
    /// stored state when the child already finished; rejects on timeout.
    pub async fn wait_for(&self, session_id: &str, timeout: Duration) -> Result<SubagentResult> {
        let rx = {
            let mut inner = self.inner.lock();
            if let Some(result) = inner.results.get(session_id) {
                return Ok(result.clone());
            }
            let (tx, rx) = oneshot::channel();
            inner
                .waiters
                .entry(session_id.to_owned())
                .or_default()
                .push(tx);
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(WaiterOutcome::Result(result))) => Ok(*result),
            Ok(Ok(WaiterOutcome::Cleared)) => Err(Error::Cancelled("tracking-cleared".into())),
            Ok(Err(_)) => Err(Error::Other(format!(
                "waiter channel closed for subagent {session_id}"
            ))),
            Err(_) => Err(Error::Timeout(format!(
                "subagent {session_id} did not finish within {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// First-completed of the given children wins.
    pub async fn wait_for_any(
        &self,
        session_ids: &[String],
        timeout: Duration,
    ) -> Result<SubagentResult> {
        if session_ids.is_empty() {
            return Err(Error::Validation("wait_for_any needs at least one id".into()));
        }
        let futures: Vec<_> = session_ids
            .iter()
            .map(|sid| Box::pin(self.wait_for(sid, timeout)))
            .collect();
        let (result, _, _) = futures_util::future::select_all(futures).await;
        result
    }

    /// All children must finish; the timeout applies per child.
    pub async fn wait_for_all(
        &self,
        session_ids: &[String],
        timeout: Duration,
    ) -> Result<Vec<SubagentResult>> {
        let futures: Vec<_> = session_ids
            .iter()
            .map(|sid| self.wait_for(sid, timeout))
            .collect();
        let results = futures_util::future::join_all(futures).await;
        results.into_iter().collect()
    }

    // ── Callbacks ─────────────────────────────────────────────────

    pub fn on_complete(&self, session_id: &str, callback: Callback) {
        self.inner
            .lock()
            .on_complete
            .entry(session_id.to_owned())
            .or_default()
            .push(callback);
    }

    pub fn on_any_complete(&self, callback: Callback) {
        self.inner.lock().on_any.push(callback);
    }

    // ── Queries ───────────────────────────────────────────────────

    pub fn get(&self, session_id: &str) -> Option<TrackedSubagent> {
        self.inner.lock().agents.get(session_id).cloned()
    }

    pub fn list(&self) -> Vec<TrackedSubagent> {
        let inner = self.inner.lock();
        let mut agents: Vec<_> = inner.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        agents
    }

    pub fn active_count(&self) -> usize {
        self.inner
            .lock()
            .agents
            .values()
            .filter(|a| !a.status.is_terminal())
            .count()
    }

    /// Drain undelivered results (for auto-injection into the parent's
    /// next turn).
    pub fn consume_pending_results(&self) -> Vec<SubagentResult> {
        self.inner.lock().pending.drain(..).collect()
    }

    /// Empty the tracker. Outstanding waiters are rejected with
    /// `tracking-cleared`; pending results are preserved — they still have
    /// to be delivered.
    pub fn clear(&self) {
        let waiters: Vec<oneshot::Sender<WaiterOutcome>> = {
            let mut inner = self.inner.lock();
            inner.agents.clear();
            inner.results.clear();
            inner.on_complete.clear();
            inner.on_any.clear();
            inner.waiters.drain().flat_map(|(_, v)| v).collect()
        };
        for waiter in waiters {
            let _ = waiter.send(WaiterOutcome::Cleared);
        }
    }

    // ── Event-sourced reconstruction ──────────────────────────────

    /// Rebuild tracker state by replaying persisted events.
    ///
    /// `context.cleared` and `compact.boundary` reset the tracker — its
    /// state is tied to the pre-compaction context.
    pub fn from_events(events: &[Event]) -> Self {
        let tracker = Self::new();
        for event in events {
            match event.kind {
                EventKind::ContextCleared | EventKind::CompactBoundary => {
                    let mut inner = tracker.inner.lock();
                    *inner = TrackerInner::default();
                }
                EventKind::SubagentSpawned => {
                    let sid = event.payload_str("subagentSessionId").unwrap_or_default();
                    if sid.is_empty() {
                        continue;
                    }
                    tracker.spawn(TrackedSubagent {
                        session_id: sid.to_owned(),
                        spawn_event_id: Some(event.id.clone()),
                        spawn_type: event
                            .payload_str("spawnType")
                            .unwrap_or("subsession")
                            .to_owned(),
                        task: event.payload_str("task").unwrap_or_default().to_owned(),
                        model: event.payload_str("model").unwrap_or_default().to_owned(),
                        working_directory: event
                            .payload_str("workingDirectory")
                            .unwrap_or_default()
                            .to_owned(),
                        status: SubagentStatus::Spawning,
                        current_turn: 0,
                        token_usage: TokenUsage::default(),
                        started_at: event.timestamp,
                        ended_at: None,
                        result_summary: None,
                        full_output: None,
                        error: None,
                        tmux_session_name: event
                            .payload_str("tmuxSessionName")
                            .map(str::to_owned),
                        max_turns: event.payload_u64("maxTurns").unwrap_or(0) as u32,
                        duration_ms: None,
                    });
                }
                EventKind::SubagentStatusUpdate => {
                    let sid = event.payload_str("subagentSessionId").unwrap_or_default();
                    let status = event
                        .payload_str("status")
                        .and_then(SubagentStatus::parse)
                        .unwrap_or(SubagentStatus::Running);
                    let turn = event.payload_u64("currentTurn").unwrap_or(0) as u32;
                    let usage = event
                        .payload
                        .get("tokenUsage")
                        .cloned()
                        .and_then(|v| serde_json::from_value(v).ok());
                    tracker.update_status(sid, status, turn, usage);
                }
                EventKind::SubagentCompleted => {
                    let sid = event.payload_str("subagentSessionId").unwrap_or_default();
                    let usage = event
                        .payload
                        .get("totalTokenUsage")
                        .cloned()
                        .and_then(|v| serde_json::from_value(v).ok())
                        .unwrap_or_default();
                    tracker.complete(
                        sid,
                        event.payload_str("resultSummary").unwrap_or_default(),
                        event.payload_u64("totalTurns").unwrap_or(0) as u32,
                        usage,
                        event.payload_u64("duration").unwrap_or(0),
                        event.payload_str("fullOutput").map(str::to_owned),
                    );
                }
                EventKind::SubagentFailed => {
                    let sid = event.payload_str("subagentSessionId").unwrap_or_default();
                    tracker.fail(
                        sid,
                        event.payload_str("error").unwrap_or("unknown"),
                        None,
                        event.payload_u64("duration"),
                    );
                }
                _ => {}
            }
        }
        tracker
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(session_id: &str) -> TrackedSubagent {
        TrackedSubagent {
            session_id: session_id.to_owned(),
            spawn_event_id: None,
            spawn_type: "subsession".into(),
            task: "analyze".into(),
            model: "m1".into(),
            working_directory: "/w".into(),
            status: SubagentStatus::Spawning,
            current_turn: 0,
            token_usage: TokenUsage::default(),
            started_at: Utc::now(),
            ended_at: None,
            result_summary: None,
            full_output: None,
            error: None,
            tmux_session_name: None,
            max_turns: 25,
            duration_ms: None,
        }
    }

    #[tokio::test]
    async fn wait_resolves_on_complete() {
        let tracker = Arc::new(SubagentTracker::new());
        tracker.spawn(record("c1"));

        let waiter = tracker.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_for("c1", Duration::from_secs(5)).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        tracker.complete("c1", "done", 3, TokenUsage::default(), 150, Some("full".into()));

        let result = handle.await.unwrap().unwrap();
        assert!(result.success);
        assert_eq!(result.summary, "done");
        assert_eq!(result.total_turns, 3);
        assert_eq!(result.output.as_deref(), Some("full"));
    }

    #[tokio::test]
    async fn wait_on_already_terminal_resolves_immediately() {
        let tracker = SubagentTracker::new();
        tracker.spawn(record("c1"));
        tracker.complete("c1", "early", 1, TokenUsage::default(), 10, None);

        let result = tracker.wait_for("c1", Duration::from_millis(1)).await.unwrap();
        assert_eq!(result.summary, "early");
    }

    #[tokio::test]
    async fn failed_child_resolves_not_rejects() {
        let tracker = Arc::new(SubagentTracker::new());
        tracker.spawn(record("c1"));

        let waiter = tracker.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_for("c1", Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tracker.fail("c1", "provider quota", Some(2), Some(99));

        let result = handle.await.unwrap().unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("provider quota"));
        assert_eq!(result.total_turns, 2);
    }

    #[tokio::test]
    async fn wait_times_out() {
        let tracker = SubagentTracker::new();
        tracker.spawn(record("c1"));
        let err = tracker
            .wait_for("c1", Duration::from_millis(30))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "timeout");
    }

    #[tokio::test]
    async fn wait_for_any_first_wins() {
        let tracker = Arc::new(SubagentTracker::new());
        tracker.spawn(record("a"));
        tracker.spawn(record("b"));

        let waiter = tracker.clone();
        let handle = tokio::spawn(async move {
            waiter
                .wait_for_any(&["a".into(), "b".into()], Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tracker.complete("b", "b finished", 1, TokenUsage::default(), 5, None);

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.session_id, "b");
    }

    #[tokio::test]
    async fn wait_for_all_collects_everything() {
        let tracker = Arc::new(SubagentTracker::new());
        tracker.spawn(record("a"));
        tracker.spawn(record("b"));
        tracker.complete("a", "a done", 1, TokenUsage::default(), 5, None);
        tracker.complete("b", "b done", 2, TokenUsage::default(), 5, None);

        let results = tracker
            .wait_for_all(&["a".into(), "b".into()], Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn callbacks_fire_and_panics_are_contained() {
        let tracker = SubagentTracker::new();
        tracker.spawn(record("c1"));

        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        tracker.on_complete("c1", Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        tracker.on_any_complete(Arc::new(|_| panic!("callback bug")));
        let c = count.clone();
        tracker.on_any_complete(Arc::new(move |r| {
            assert!(r.success);
            c.fetch_add(10, Ordering::SeqCst);
        }));

        tracker.complete("c1", "done", 1, TokenUsage::default(), 1, None);
        assert_eq!(count.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn pending_results_drain_once() {
        let tracker = SubagentTracker::new();
        tracker.spawn(record("c1"));
        tracker.complete("c1", "done", 1, TokenUsage::default(), 1, None);

        let first = tracker.consume_pending_results();
        assert_eq!(first.len(), 1);
        assert!(tracker.consume_pending_results().is_empty());
    }

    #[tokio::test]
    async fn clear_rejects_waiters_but_preserves_pending() {
        let tracker = Arc::new(SubagentTracker::new());
        tracker.spawn(record("done-child"));
        tracker.complete("done-child", "done", 1, TokenUsage::default(), 1, None);
        tracker.spawn(record("slow-child"));

        let waiter = tracker.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_for("slow-child", Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        tracker.clear();

        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.code(), "cancelled");
        assert!(err.to_string().contains("tracking-cleared"));

        // The completed child's result still awaits delivery.
        let pending = tracker.consume_pending_results();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].session_id, "done-child");
        // But tracked agents are gone.
        assert!(tracker.get("done-child").is_none());
        assert!(tracker.get("slow-child").is_none());
    }

    #[test]
    fn reconstruction_matches_live_tracker() {
        use serde_json::json;

        let mk = |kind: EventKind, payload: serde_json::Value, seq: u64| Event {
            id: format!("e{seq}"),
            parent_id: None,
            session_id: "parent".into(),
            workspace_id: "ws".into(),
            sequence: seq,
            timestamp: Utc::now(),
            kind,
            payload,
            run_id: None,
        };

        let events = vec![
            mk(
                EventKind::SubagentSpawned,
                json!({
                    "subagentSessionId": "c1", "spawnType": "subsession",
                    "task": "analyze", "model": "m1",
                    "workingDirectory": "/w", "maxTurns": 10,
                }),
                1,
            ),
            mk(
                EventKind::SubagentStatusUpdate,
                json!({"subagentSessionId": "c1", "status": "running", "currentTurn": 2}),
                2,
            ),
            mk(
                EventKind::SubagentCompleted,
                json!({
                    "subagentSessionId": "c1", "resultSummary": "all good",
                    "totalTurns": 3, "totalTokenUsage": {"inputTokens": 5},
                    "duration": 777,
                }),
                3,
            ),
        ];

        let rebuilt = SubagentTracker::from_events(&events);
        let agent = rebuilt.get("c1").unwrap();
        assert_eq!(agent.status, SubagentStatus::Completed);
        assert_eq!(agent.current_turn, 3);
        assert_eq!(agent.result_summary.as_deref(), Some("all good"));
        assert_eq!(agent.duration_ms, Some(777));
        assert_eq!(agent.task, "analyze");

        // Live tracker with the same operations agrees on observable state.
        let live = SubagentTracker::new();
        let mut rec = record("c1");
        rec.max_turns = 10;
        live.spawn(rec);
        live.update_status("c1", SubagentStatus::Running, 2, None);
        live.complete(
            "c1",
            "all good",
            3,
            TokenUsage { input_tokens: 5, ..Default::default() },
            777,
            None,
        );
        let live_agent = live.get("c1").unwrap();
        assert_eq!(live_agent.status, agent.status);
        assert_eq!(live_agent.current_turn, agent.current_turn);
        assert_eq!(live_agent.result_summary, agent.result_summary);
        assert_eq!(live_agent.duration_ms, agent.duration_ms);
        assert_eq!(live_agent.token_usage, agent.token_usage);
    }

    #[test]
    fn compaction_resets_reconstruction() {
        use serde_json::json;
        let mk = |kind: EventKind, payload: serde_json::Value, seq: u64| Event {
            id: format!("e{seq}"),
            parent_id: None,
            session_id: "parent".into(),
            workspace_id: "ws".into(),
            sequence: seq,
            timestamp: Utc::now(),
            kind,
            payload,
            run_id: None,
        };

        let events = vec![
            mk(
                EventKind::SubagentSpawned,
                json!({"subagentSessionId": "old", "spawnType": "subsession", "task": "t", "model": "m", "workingDirectory": "/w", "maxTurns": 5}),
                1,
            ),
            mk(
                EventKind::CompactBoundary,
                json!({"originalTokens": 100, "compactedTokens": 10, "compressionRatio": 0.1, "reason": "auto", "summary": "s", "runId": "r"}),
                2,
            ),
            mk(
                EventKind::SubagentSpawned,
                json!({"subagentSessionId": "new", "spawnType": "subsession", "task": "t2", "model": "m", "workingDirectory": "/w", "maxTurns": 5}),
                3,
            ),
        ];

        let tracker = SubagentTracker::from_events(&events);
        assert!(tracker.get("old").is_none());
        assert!(tracker.get("new").is_some());
    }
}
