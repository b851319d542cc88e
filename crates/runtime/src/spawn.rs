//! Sub-agent spawn paths.
//!
//! A **subsession** is an in-process child: its own session row and turn
//! loop sharing this process's event store, with streaming events forwarded
//! to the parent's subscribers. A **tmux** child is a detached process
//! running the same binary against the shared database.

use std::path::PathBuf;
use std::time::Instant;

use chrono::Utc;
use serde_json::json;

use strand_domain::error::{Error, Result};
use strand_domain::event::EventKind;
use strand_domain::tokens::TokenUsage;
use strand_store::AppendRequest;

use crate::events::RuntimeEvent;
use crate::orchestrator::Orchestrator;
use crate::subagent::{SubagentStatus, TrackedSubagent};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnType {
    Subsession,
    Tmux,
}

impl SpawnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpawnType::Subsession => "subsession",
            SpawnType::Tmux => "tmux",
        }
    }
}

/// What to spawn. Unset fields inherit from the parent session.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub task: String,
    pub spawn_type: SpawnType,
    pub model: Option<String>,
    pub working_directory: Option<PathBuf>,
    pub max_turns: Option<u32>,
    /// Required for tmux spawns: the database the child process opens.
    pub db_path: Option<PathBuf>,
}

impl SpawnRequest {
    pub fn subsession(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            spawn_type: SpawnType::Subsession,
            model: None,
            working_directory: None,
            max_turns: None,
            db_path: None,
        }
    }

    pub fn tmux(task: impl Into<String>, db_path: PathBuf) -> Self {
        Self {
            task: task.into(),
            spawn_type: SpawnType::Tmux,
            model: None,
            working_directory: None,
            max_turns: None,
            db_path: Some(db_path),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Spawn handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl Orchestrator {
    /// Spawn a child session for a task. Returns the child session id;
    /// completion is observed through the parent's tracker
    /// (`wait_for` / callbacks / pending results).
    pub async fn spawn_subagent(
        &self,
        parent_session_id: &str,
        request: SpawnRequest,
    ) -> Result<String> {
        let parent = self.activate(parent_session_id)?;
        let model = request.model.clone().unwrap_or_else(|| parent.model());
        let working_directory = request
            .working_directory
            .clone()
            .unwrap_or_else(|| parent.working_directory.clone());
        let max_turns = request
            .max_turns
            .unwrap_or(self.config().subagents.default_max_turns);

        match request.spawn_type {
            SpawnType::Subsession => {
                self.spawn_subsession(parent_session_id, request, model, working_directory, max_turns)
                    .await
            }
            SpawnType::Tmux => {
                self.spawn_tmux(parent_session_id, request, model, working_directory, max_turns)
                    .await
            }
        }
    }

    async fn spawn_subsession(
        &self,
        parent_session_id: &str,
        request: SpawnRequest,
        model: String,
        working_directory: PathBuf,
        max_turns: u32,
    ) -> Result<String> {
        let parent = self.activate(parent_session_id)?;
        let wd_str = working_directory.display().to_string();

        let child = self.create_session(&wd_str, &model)?;
        self.store().update_session_spawn_info(
            &child.id,
            parent_session_id,
            SpawnType::Subsession.as_str(),
            &request.task,
        )?;

        let spawn_event = self.store().append(
            parent_session_id,
            AppendRequest::new(
                EventKind::SubagentSpawned,
                json!({
                    "subagentSessionId": &child.id,
                    "spawnType": SpawnType::Subsession.as_str(),
                    "task": &request.task,
                    "model": &model,
                    "workingDirectory": &wd_str,
                    "maxTurns": max_turns,
                }),
            ),
        )?;

        parent.subagents.spawn(TrackedSubagent {
            session_id: child.id.clone(),
            spawn_event_id: Some(spawn_event.id),
            spawn_type: SpawnType::Subsession.as_str().to_owned(),
            task: request.task.clone(),
            model: model.clone(),
            working_directory: wd_str,
            status: SubagentStatus::Spawning,
            current_turn: 0,
            token_usage: TokenUsage::default(),
            started_at: Utc::now(),
            ended_at: None,
            result_summary: None,
            full_output: None,
            error: None,
            tmux_session_name: None,
            max_turns,
            duration_ms: None,
        });

        self.hub().emit(RuntimeEvent::SubagentSpawned {
            session_id: parent_session_id.to_owned(),
            subagent_session_id: child.id.clone(),
            spawn_type: SpawnType::Subsession.as_str().to_owned(),
            task: request.task.clone(),
        });

        // Cancelling the parent cascades into the child.
        self.cancel_map.add_to_group(parent_session_id, &child.id);

        // Forward the child's streaming events to parent subscribers.
        {
            let mut child_rx = self.hub().subscribe(&child.id);
            let hub = self.hub().clone();
            let parent_id = parent_session_id.to_owned();
            tokio::spawn(async move {
                while let Ok(event) = child_rx.recv().await {
                    hub.emit_to(&parent_id, event);
                }
            });
        }

        let handle = self.prompt(&child.id, &request.task)?;
        parent
            .subagents
            .update_status(&child.id, SubagentStatus::Running, 1, None);
        self.store().append(
            parent_session_id,
            AppendRequest::new(
                EventKind::SubagentStatusUpdate,
                json!({
                    "subagentSessionId": &child.id,
                    "status": SubagentStatus::Running.as_str(),
                    "currentTurn": 1,
                }),
            ),
        )?;

        // Monitor: translate the child's run outcome into tracker state and
        // parent events. A child failure never crashes the parent.
        {
            let store = self.store().clone();
            let hub = self.hub().clone();
            let hooks = self.hooks().clone();
            let cancel_map = self.cancel_map.clone();
            let tracker = parent.subagents.clone();
            let parent_id = parent_session_id.to_owned();
            let child_id = child.id.clone();
            let started = Instant::now();

            tokio::spawn(async move {
                let outcome = handle.wait().await;
                let duration_ms = started.elapsed().as_millis() as u64;

                match outcome {
                    Ok(summary) if summary.blocked.is_none() && !summary.interrupted => {
                        let usage = store
                            .get_session(&child_id)
                            .ok()
                            .flatten()
                            .map(|s| TokenUsage {
                                input_tokens: s.total_input_tokens,
                                output_tokens: s.total_output_tokens,
                                cache_read_tokens: s.cache_read_tokens,
                                cache_creation_tokens: s.cache_creation_tokens,
                                ..Default::default()
                            })
                            .unwrap_or_default();
                        let result_summary = truncate_summary(&summary.final_text);

                        let append = store.append(
                            &parent_id,
                            AppendRequest::new(
                                EventKind::SubagentCompleted,
                                json!({
                                    "subagentSessionId": &child_id,
                                    "resultSummary": &result_summary,
                                    "fullOutput": &summary.final_text,
                                    "totalTurns": summary.turns,
                                    "totalTokenUsage": &usage,
                                    "duration": duration_ms,
                                }),
                            ),
                        );
                        if let Err(e) = append {
                            tracing::warn!(error = %e, "failed to persist subagent completion");
                        }
                        let _ = store.append(
                            &child_id,
                            AppendRequest::new(
                                EventKind::SessionEnd,
                                json!({"reason": "task completed"}),
                            ),
                        );

                        tracker.complete(
                            &child_id,
                            &result_summary,
                            summary.turns,
                            usage,
                            duration_ms,
                            Some(summary.final_text.clone()),
                        );
                        hub.emit_to(
                            &parent_id,
                            RuntimeEvent::SubagentCompleted {
                                session_id: parent_id.clone(),
                                subagent_session_id: child_id.clone(),
                                result_summary,
                            },
                        );
                    }
                    Ok(summary) => {
                        let error = summary
                            .blocked
                            .unwrap_or_else(|| "interrupted".to_owned());
                        record_subagent_failure(
                            &store, &hub, &tracker, &parent_id, &child_id, &error, true,
                            duration_ms,
                        );
                    }
                    Err(e) => {
                        record_subagent_failure(
                            &store,
                            &hub,
                            &tracker,
                            &parent_id,
                            &child_id,
                            &e.to_string(),
                            e.retryable(),
                            duration_ms,
                        );
                    }
                }

                let mut stop_ctx =
                    strand_hooks::HookContext::for_session(&parent_id);
                stop_ctx.extra = Some(json!({"subagentSessionId": &child_id}));
                let _ = hooks
                    .execute(strand_hooks::HookKind::SubagentStop, &stop_ctx)
                    .await;

                cancel_map.remove_from_group(&parent_id, &child_id);
            });
        }

        Ok(child.id)
    }

    async fn spawn_tmux(
        &self,
        parent_session_id: &str,
        request: SpawnRequest,
        model: String,
        working_directory: PathBuf,
        max_turns: u32,
    ) -> Result<String> {
        let parent = self.activate(parent_session_id)?;
        let db_path = request
            .db_path
            .clone()
            .ok_or_else(|| Error::Validation("tmux spawn requires db_path".into()))?;
        let wd_str = working_directory.display().to_string();

        // Pre-create the child session row in the shared database; the
        // detached process adopts it by parent lookup.
        let child = self.create_session(&wd_str, &model)?;
        self.store().update_session_spawn_info(
            &child.id,
            parent_session_id,
            SpawnType::Tmux.as_str(),
            &request.task,
        )?;

        let tmux_session_name = format!("strand-{}", &child.id[..8]);
        let argv = tmux_spawn_argv(
            &tmux_session_name,
            parent_session_id,
            &request.task,
            &db_path,
            &working_directory,
            &model,
            max_turns,
        );

        tokio::process::Command::new(&argv[0])
            .args(&argv[1..])
            .spawn()
            .map_err(|e| Error::Other(format!("spawning tmux subagent: {e}")))?;

        let spawn_event = self.store().append(
            parent_session_id,
            AppendRequest::new(
                EventKind::SubagentSpawned,
                json!({
                    "subagentSessionId": &child.id,
                    "spawnType": SpawnType::Tmux.as_str(),
                    "task": &request.task,
                    "model": &model,
                    "workingDirectory": &wd_str,
                    "tmuxSessionName": &tmux_session_name,
                    "maxTurns": max_turns,
                }),
            ),
        )?;

        parent.subagents.spawn(TrackedSubagent {
            session_id: child.id.clone(),
            spawn_event_id: Some(spawn_event.id),
            spawn_type: SpawnType::Tmux.as_str().to_owned(),
            task: request.task.clone(),
            model,
            working_directory: wd_str,
            status: SubagentStatus::Spawning,
            current_turn: 0,
            token_usage: TokenUsage::default(),
            started_at: Utc::now(),
            ended_at: None,
            result_summary: None,
            full_output: None,
            error: None,
            tmux_session_name: Some(tmux_session_name.clone()),
            max_turns,
            duration_ms: None,
        });

        self.hub().emit(RuntimeEvent::SubagentSpawned {
            session_id: parent_session_id.to_owned(),
            subagent_session_id: child.id.clone(),
            spawn_type: SpawnType::Tmux.as_str().to_owned(),
            task: request.task,
        });

        tracing::info!(
            parent_session_id,
            child_session_id = %child.id,
            tmux_session = %tmux_session_name,
            "tmux subagent spawned"
        );
        Ok(child.id)
    }
}

#[allow(clippy::too_many_arguments)]
fn record_subagent_failure(
    store: &strand_store::EventStore,
    hub: &crate::events::EventHub,
    tracker: &crate::subagent::SubagentTracker,
    parent_id: &str,
    child_id: &str,
    error: &str,
    recoverable: bool,
    duration_ms: u64,
) {
    let append = store.append(
        parent_id,
        AppendRequest::new(
            EventKind::SubagentFailed,
            json!({
                "subagentSessionId": child_id,
                "error": error,
                "recoverable": recoverable,
                "duration": duration_ms,
            }),
        ),
    );
    if let Err(e) = append {
        tracing::warn!(error = %e, "failed to persist subagent failure");
    }
    tracker.fail(child_id, error, None, Some(duration_ms));
    hub.emit_to(
        parent_id,
        RuntimeEvent::SubagentFailed {
            session_id: parent_id.to_owned(),
            subagent_session_id: child_id.to_owned(),
            error: error.to_owned(),
        },
    );
}

/// Build the detached-process command line for a tmux subagent.
pub fn tmux_spawn_argv(
    tmux_session_name: &str,
    parent_session_id: &str,
    task: &str,
    db_path: &std::path::Path,
    working_directory: &std::path::Path,
    model: &str,
    max_turns: u32,
) -> Vec<String> {
    let exe = std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "strandd".to_owned());
    vec![
        "tmux".to_owned(),
        "new-session".to_owned(),
        "-d".to_owned(),
        "-s".to_owned(),
        tmux_session_name.to_owned(),
        exe,
        format!("--parent-session-id={parent_session_id}"),
        format!("--spawn-task={task}"),
        format!("--db-path={}", db_path.display()),
        format!("--working-directory={}", working_directory.display()),
        format!("--model={model}"),
        format!("--max-turns={max_turns}"),
    ]
}

fn truncate_summary(text: &str) -> String {
    const MAX: usize = 200;
    if text.len() <= MAX {
        return text.to_owned();
    }
    let mut end = MAX;
    while !text.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tmux_argv_carries_all_flags() {
        let argv = tmux_spawn_argv(
            "strand-abc12345",
            "parent-1",
            "analyze the data",
            std::path::Path::new("/data/strand.db"),
            std::path::Path::new("/work"),
            "m1",
            25,
        );
        assert_eq!(argv[0], "tmux");
        assert_eq!(argv[1..5], ["new-session", "-d", "-s", "strand-abc12345"]);
        assert!(argv.contains(&"--parent-session-id=parent-1".to_owned()));
        assert!(argv.contains(&"--spawn-task=analyze the data".to_owned()));
        assert!(argv.contains(&"--db-path=/data/strand.db".to_owned()));
        assert!(argv.contains(&"--working-directory=/work".to_owned()));
        assert!(argv.contains(&"--model=m1".to_owned()));
        assert!(argv.contains(&"--max-turns=25".to_owned()));
    }

    #[test]
    fn summary_truncation_respects_utf8() {
        let long = "é".repeat(300);
        let summary = truncate_summary(&long);
        assert!(summary.ends_with("..."));
        assert!(summary.len() <= 203);
    }
}
