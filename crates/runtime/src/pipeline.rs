//! The turn pipeline — one prompt-to-completion cycle.
//!
//! Drives the provider stream, runs hooks at lifecycle points, executes
//! tools, and persists events at exactly the boundaries the event contract
//! requires. The pre-tool flush rule lives here: a turn's assistant message
//! is appended once, at the first tool execution start or at turn end,
//! never both.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::StreamExt;
use serde_json::{json, Value};

use strand_domain::config::CoreConfig;
use strand_domain::content::{ContentBlock, ToolCallStatus};
use strand_domain::error::{Error, Result};
use strand_domain::event::EventKind;
use strand_domain::provider::{CredentialLookup, Provider, ProviderRequest};
use strand_domain::stream::{BoxStream, ProviderEvent, StopReason};
use strand_domain::tokens::{resolve_cost, TokenRecord, TokenUsage};
use strand_domain::tool::{Message, ToolContext};
use strand_hooks::{ExecutionReport, HookContext, HookEngine, HookKind, HookMode};
use strand_store::{AppendRequest, EventStore};

use crate::active::ActiveSession;
use crate::cancel::RunCancel;
use crate::content::{
    build_content_blocks, build_interrupted_content_blocks, SequenceItem, ToolCallState,
};
use crate::events::{EventHub, RuntimeEvent};
use crate::registry::ToolRegistry;
use crate::subagent::SubagentResult;
use crate::transcript;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inputs / outputs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One prompt submission.
#[derive(Debug, Clone)]
pub struct PromptInput {
    pub session_id: String,
    pub prompt: String,
    /// Generated by the caller; stamped on every event of the run.
    pub run_id: String,
    pub attachments: Option<Vec<String>>,
    pub skills: Option<Vec<String>>,
}

/// What a finished run reports back.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    /// Text of the final assistant turn.
    pub final_text: String,
    pub turns: u32,
    /// Set when a blocking hook stopped the run.
    pub blocked: Option<String>,
    pub interrupted: bool,
}

/// Everything the pipeline needs, owned by the orchestrator.
pub(crate) struct PipelineDeps {
    pub store: Arc<EventStore>,
    pub provider: Arc<dyn Provider>,
    pub tools: Arc<ToolRegistry>,
    pub hooks: Arc<HookEngine>,
    pub credentials: Arc<dyn CredentialLookup>,
    pub hub: Arc<EventHub>,
    pub config: Arc<CoreConfig>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-run state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct TurnState {
    session_turn: u32,
    started: Instant,
    thinking: String,
    thinking_signature: Option<String>,
    sequence: Vec<SequenceItem>,
    tool_calls: HashMap<String, ToolCallState>,
    tool_order: Vec<String>,
    flushed: bool,
    ended: bool,
    response_usage: Option<TokenUsage>,
    response_cost: Option<f64>,
}

impl TurnState {
    fn new(session_turn: u32) -> Self {
        Self {
            session_turn,
            started: Instant::now(),
            thinking: String::new(),
            thinking_signature: None,
            sequence: Vec::new(),
            tool_calls: HashMap::new(),
            tool_order: Vec::new(),
            flushed: false,
            ended: false,
            response_usage: None,
            response_cost: None,
        }
    }

    fn text(&self) -> String {
        self.sequence
            .iter()
            .filter_map(|item| match item {
                SequenceItem::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    fn has_thinking(&self) -> bool {
        !self.thinking.is_empty()
            || self
                .sequence
                .iter()
                .any(|item| matches!(item, SequenceItem::Thinking(_)))
    }

    fn register_intent(&mut self, call_id: &str, name: &str, arguments: Value) {
        if !self.tool_calls.contains_key(call_id) {
            self.tool_calls
                .insert(call_id.to_owned(), ToolCallState::pending(call_id, name, arguments));
            self.tool_order.push(call_id.to_owned());
            self.sequence.push(SequenceItem::ToolRef(call_id.to_owned()));
        }
    }
}

struct RunState {
    base_turn: u32,
    turns_completed: u32,
    final_text: String,
    last_stop: StopReason,
    turn: Option<TurnState>,
}

enum StreamOutcome {
    Finished,
    Interrupted,
    Blocked(String),
    RetryTransient(String),
}

enum EventOutcome {
    Continue,
    Blocked(String),
    Interrupted,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// run_prompt — entry point
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) async fn run_prompt(
    deps: &PipelineDeps,
    active: &ActiveSession,
    input: &PromptInput,
    cancel: &RunCancel,
) -> Result<RunSummary> {
    let session_id = input.session_id.as_str();
    let run_id = input.run_id.as_str();
    active.set_interrupted(false);
    active.set_current_run_id(Some(run_id.to_owned()));

    // SessionStart hooks fire only when the session has no history beyond
    // its lifecycle root.
    let history = deps.store.get_events(session_id)?;
    if history.iter().all(|e| e.kind.is_session_kind()) {
        let ctx = hook_ctx(session_id, run_id);
        let report =
            run_hooks_persisted(deps, session_id, run_id, HookKind::SessionStart, &ctx, None)
                .await?;
        if report.blocked() {
            return Ok(finish_blocked(deps, active, run_id, report));
        }
    }

    let mut prompt = input.prompt.clone();
    {
        let mut ctx = hook_ctx(session_id, run_id);
        ctx.prompt = Some(prompt.clone());
        let report =
            run_hooks_persisted(deps, session_id, run_id, HookKind::UserPromptSubmit, &ctx, None)
                .await?;
        if report.blocked() {
            return Ok(finish_blocked(deps, active, run_id, report));
        }
        // A modify hook may rewrite the prompt before it is persisted.
        if let Some(rewritten) = report.modifications.get("prompt").and_then(Value::as_str) {
            prompt = rewritten.to_owned();
        }
    }

    // Auto-compaction keeps the window healthy before the turn begins.
    let baseline = { active.context.lock().context_baseline };
    if baseline > deps.config.compaction.trigger_tokens {
        let compacted = crate::compaction::compact_session(
            &deps.store,
            &deps.provider,
            &deps.hub,
            &active.subagents,
            session_id,
            &active.model(),
            "auto",
            run_id,
        )
        .await;
        match compacted {
            Ok(outcome) => {
                active.context.lock().context_baseline = outcome.compacted_tokens;
            }
            Err(e) => {
                tracing::warn!(session_id, error = %e, "auto-compaction failed, continuing with full history");
            }
        }
    }

    // Completed subagent results ride along with this prompt.
    let mut pending_results = Some(active.subagents.consume_pending_results());

    let user_turn = { active.context.lock().next_turn() };
    let mut user_payload = json!({"content": prompt, "turn": user_turn});
    if let Some(attachments) = &input.attachments {
        user_payload["attachments"] = json!(attachments);
    }
    if let Some(skills) = &input.skills {
        user_payload["skills"] = json!(skills);
    }
    deps.store.append(
        session_id,
        AppendRequest::new(EventKind::MessageUser, user_payload).with_run(run_id),
    )?;

    let base_turn = { active.context.lock().current_turn };
    let mut run = RunState {
        base_turn,
        turns_completed: 0,
        final_text: String::new(),
        last_stop: StopReason::EndTurn,
        turn: None,
    };
    let mut retries = deps.config.provider.retry_budget;
    let backoff = Duration::from_millis(deps.config.provider.retry_backoff_ms);

    loop {
        let events = deps.store.get_events(session_id)?;
        let mut messages = transcript::events_to_messages(&events);
        if let Some(results) = pending_results.take() {
            if !results.is_empty() {
                messages.push(Message::system(format_subagent_results(&results)));
            }
        }

        let request = ProviderRequest {
            messages,
            model: active.model(),
            tools: deps.tools.definitions(),
            auth: deps.credentials.credential_for(deps.provider.provider_id()),
            cancelled: cancel.flag(),
            reasoning_level: active.reasoning_level(),
        };

        let stream = match deps.provider.stream(request).await {
            Ok(stream) => stream,
            Err(e) if e.retryable() && retries > 0 => {
                retries -= 1;
                tracing::warn!(session_id, error = %e, retries_left = retries, "provider call failed, retrying");
                tokio::time::sleep(backoff).await;
                continue;
            }
            Err(e) => {
                persist_agent_error(deps, session_id, run_id, &e)?;
                emit_turn_end_error(deps, &run, session_id, run_id, &e.to_string());
                active.set_current_run_id(None);
                return Err(e);
            }
        };

        match consume_stream(deps, active, input, &mut run, stream, cancel).await? {
            StreamOutcome::Interrupted => {
                active.set_current_run_id(None);
                active.touch();
                return Ok(RunSummary {
                    run_id: run_id.to_owned(),
                    final_text: run.final_text,
                    turns: run.turns_completed,
                    blocked: None,
                    interrupted: true,
                });
            }
            StreamOutcome::Blocked(reason) => {
                emit_turn_end_error(deps, &run, session_id, run_id, &reason);
                active.set_current_run_id(None);
                active.touch();
                return Ok(RunSummary {
                    run_id: run_id.to_owned(),
                    final_text: run.final_text,
                    turns: run.turns_completed,
                    blocked: Some(reason),
                    interrupted: false,
                });
            }
            StreamOutcome::RetryTransient(message) => {
                if retries > 0 {
                    retries -= 1;
                    tracing::warn!(session_id, %message, retries_left = retries, "transient provider error, retrying");
                    tokio::time::sleep(backoff).await;
                    continue;
                }
                let err = Error::ProviderTransient {
                    provider: deps.provider.provider_id().to_owned(),
                    message,
                };
                persist_agent_error(deps, session_id, run_id, &err)?;
                emit_turn_end_error(deps, &run, session_id, run_id, &err.to_string());
                active.set_current_run_id(None);
                return Err(err);
            }
            StreamOutcome::Finished => {
                let more_tools = run.last_stop == StopReason::ToolUse;
                let within_budget =
                    run.turns_completed < deps.config.sessions.max_turns_per_prompt;
                if more_tools && within_budget {
                    // Tool results go back as the next model input.
                    continue;
                }
                if more_tools {
                    tracing::warn!(
                        session_id,
                        max_turns = deps.config.sessions.max_turns_per_prompt,
                        "turn budget exhausted with tools still requested"
                    );
                }
                break;
            }
        }
    }

    let stop_ctx = hook_ctx(session_id, run_id);
    let _ = run_hooks_persisted(deps, session_id, run_id, HookKind::Stop, &stop_ctx, None).await?;

    active.set_current_run_id(None);
    active.touch();
    Ok(RunSummary {
        run_id: run_id.to_owned(),
        final_text: run.final_text,
        turns: run.turns_completed,
        blocked: None,
        interrupted: false,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream consumption
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn consume_stream(
    deps: &PipelineDeps,
    active: &ActiveSession,
    input: &PromptInput,
    run: &mut RunState,
    mut stream: BoxStream<'static, Result<ProviderEvent>>,
    cancel: &RunCancel,
) -> Result<StreamOutcome> {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                interrupt_run(deps, active, run, &input.run_id)?;
                return Ok(StreamOutcome::Interrupted);
            }
            next = stream.next() => next,
        };

        let event = match next {
            None => break,
            Some(Ok(event)) => event,
            Some(Err(e)) if e.retryable() => {
                return Ok(StreamOutcome::RetryTransient(e.to_string()))
            }
            Some(Err(e)) => {
                persist_agent_error(deps, &input.session_id, &input.run_id, &e)?;
                return Err(e);
            }
        };

        match handle_event(deps, active, input, run, event, cancel).await {
            Ok(EventOutcome::Continue) => {}
            Ok(EventOutcome::Blocked(reason)) => return Ok(StreamOutcome::Blocked(reason)),
            Ok(EventOutcome::Interrupted) => return Ok(StreamOutcome::Interrupted),
            Err(e) if e.retryable() => return Ok(StreamOutcome::RetryTransient(e.to_string())),
            Err(e) => return Err(e),
        }
    }
    Ok(StreamOutcome::Finished)
}

async fn handle_event(
    deps: &PipelineDeps,
    active: &ActiveSession,
    input: &PromptInput,
    run: &mut RunState,
    event: ProviderEvent,
    cancel: &RunCancel,
) -> Result<EventOutcome> {
    let session_id = input.session_id.as_str();
    let run_id = input.run_id.as_str();

    match event {
        ProviderEvent::TurnStart { turn } => {
            // Providers number turns per call; after a tool-result loopback
            // the session counter is already ahead of `base + turn`.
            let current = { active.context.lock().current_turn };
            let session_turn = (run.base_turn + turn).max(current + 1);
            run.turn = Some(TurnState::new(session_turn));
            active.context.lock().current_turn = session_turn;
            deps.store.append(
                session_id,
                AppendRequest::new(
                    EventKind::StreamTurnStart,
                    json!({"turn": session_turn, "runId": run_id}),
                )
                .with_run(run_id),
            )?;
            deps.hub.emit(RuntimeEvent::TurnStart {
                session_id: session_id.to_owned(),
                turn: session_turn,
                run_id: run_id.to_owned(),
            });
        }

        ProviderEvent::TextDelta { text } => {
            let state = ensure_turn(deps, active, run, input)?;
            match state.sequence.last_mut() {
                Some(SequenceItem::Text(buffer)) => buffer.push_str(&text),
                _ => state.sequence.push(SequenceItem::Text(text)),
            }
        }

        ProviderEvent::ThinkingDelta { text, signature } => {
            let state = ensure_turn(deps, active, run, input)?;
            state.thinking.push_str(&text);
            if signature.is_some() {
                state.thinking_signature = signature;
            }
        }

        ProviderEvent::ToolUseBatch { calls } => {
            let state = ensure_turn(deps, active, run, input)?;
            for call in calls {
                state.register_intent(&call.call_id, &call.tool_name, call.arguments);
            }
        }

        ProviderEvent::ToolExecutionStart {
            tool_call_id,
            name,
            arguments,
        } => {
            {
                let state = ensure_turn(deps, active, run, input)?;
                state.register_intent(&tool_call_id, &name, arguments.clone());
                // A start may carry fuller arguments than the batch did.
                if let Some(call) = state.tool_calls.get_mut(&tool_call_id) {
                    call.arguments = arguments;
                }
            }
            return start_and_execute_tool(deps, active, input, run, &tool_call_id, cancel).await;
        }

        ProviderEvent::ToolExecutionUpdate {
            tool_call_id,
            chunk,
        } => {
            deps.hub.emit(RuntimeEvent::ToolOutput {
                session_id: session_id.to_owned(),
                tool_call_id,
                chunk,
            });
        }

        ProviderEvent::ToolExecutionEnd {
            tool_call_id,
            content,
            is_error,
            duration_ms,
        } => {
            let status = run
                .turn
                .as_ref()
                .and_then(|t| t.tool_calls.get(&tool_call_id))
                .map(|c| c.status);
            match status {
                // The registry already ran this call; the provider echo is
                // redundant.
                Some(ToolCallStatus::Completed) | Some(ToolCallStatus::Failed) => {}
                Some(ToolCallStatus::Running) => {
                    finish_tool(deps, active, input, run, &tool_call_id, content, is_error, duration_ms)
                        .await?;
                }
                Some(ToolCallStatus::Pending) => {
                    // Execution happened provider-side without a start
                    // event; record the call before its result.
                    flush_pre_tool(deps, active, run)?;
                    persist_tool_call(deps, active, input, run, &tool_call_id)?;
                    if let Some(state) = run.turn.as_mut() {
                        if let Some(call) = state.tool_calls.get_mut(&tool_call_id) {
                            call.status = ToolCallStatus::Running;
                            call.started_at = Some(Utc::now());
                        }
                    }
                    finish_tool(deps, active, input, run, &tool_call_id, content, is_error, duration_ms)
                        .await?;
                }
                None => {
                    tracing::warn!(session_id, %tool_call_id, "tool end for unknown call");
                }
            }
        }

        ProviderEvent::ResponseComplete { usage, cost } => {
            let baseline = { active.context.lock().context_baseline };
            let state = ensure_turn(deps, active, run, input)?;
            let record = TokenRecord::from_usage(
                &usage,
                deps.provider.provider_id(),
                baseline,
                state.session_turn,
                session_id,
            );
            state.response_usage = Some(usage.clone());
            state.response_cost = cost;
            active.context_manager.record(&record);
            active.context.lock().response_usage = Some(usage);
        }

        ProviderEvent::TurnEnd {
            turn: _,
            duration_ms,
            usage,
            cost,
            stop_reason,
        } => {
            return end_turn(deps, active, input, run, duration_ms, usage, cost, stop_reason, cancel)
                .await;
        }

        ProviderEvent::Error { message, retryable } => {
            if retryable {
                return Err(Error::ProviderTransient {
                    provider: deps.provider.provider_id().to_owned(),
                    message,
                });
            }
            let err = Error::ProviderTerminal {
                provider: deps.provider.provider_id().to_owned(),
                message,
            };
            persist_agent_error(deps, session_id, run_id, &err)?;
            return Err(err);
        }
    }

    Ok(EventOutcome::Continue)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn boundaries
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Start an implicit turn when a provider skips `turn_start`.
fn ensure_turn<'a>(
    deps: &PipelineDeps,
    active: &ActiveSession,
    run: &'a mut RunState,
    input: &PromptInput,
) -> Result<&'a mut TurnState> {
    let needs_new = run.turn.as_ref().map(|t| t.ended).unwrap_or(true);
    if needs_new {
        let current = { active.context.lock().current_turn };
        let session_turn = (run.base_turn + run.turns_completed + 1).max(current + 1);
        run.turn = Some(TurnState::new(session_turn));
        active.context.lock().current_turn = session_turn;
        deps.store.append(
            &input.session_id,
            AppendRequest::new(
                EventKind::StreamTurnStart,
                json!({"turn": session_turn, "runId": &input.run_id}),
            )
            .with_run(&input.run_id),
        )?;
        deps.hub.emit(RuntimeEvent::TurnStart {
            session_id: input.session_id.clone(),
            turn: session_turn,
            run_id: input.run_id.clone(),
        });
    }
    run.turn
        .as_mut()
        .ok_or_else(|| Error::Other("turn state missing after start".into()))
}

#[allow(clippy::too_many_arguments)]
async fn end_turn(
    deps: &PipelineDeps,
    active: &ActiveSession,
    input: &PromptInput,
    run: &mut RunState,
    duration_ms: u64,
    usage: TokenUsage,
    cost: Option<f64>,
    stop_reason: StopReason,
    cancel: &RunCancel,
) -> Result<EventOutcome> {
    let session_id = input.session_id.as_str();
    let run_id = input.run_id.as_str();

    // A duplicate turn_end is ignored (idempotent end).
    let already_ended = run.turn.as_ref().map(|t| t.ended).unwrap_or(true);
    if already_ended {
        tracing::debug!(session_id, "duplicate turn_end ignored");
        return Ok(EventOutcome::Continue);
    }

    // A model that stops for tools without execution events leaves pending
    // intents; run them now so their results can loop back.
    if stop_reason == StopReason::ToolUse {
        let pending: Vec<String> = run
            .turn
            .as_ref()
            .map(|t| {
                t.tool_order
                    .iter()
                    .filter(|id| {
                        t.tool_calls
                            .get(*id)
                            .map(|c| c.status == ToolCallStatus::Pending)
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        for call_id in pending {
            match start_and_execute_tool(deps, active, input, run, &call_id, cancel).await? {
                EventOutcome::Continue => {}
                other => return Ok(other),
            }
        }
    }

    let baseline = { active.context.lock().context_baseline };
    let state = run
        .turn
        .as_mut()
        .ok_or_else(|| Error::Other("turn state missing at turn end".into()))?;

    let final_usage = if usage == TokenUsage::default() {
        state.response_usage.clone().unwrap_or_default()
    } else {
        usage
    };
    let record = TokenRecord::from_usage(
        &final_usage,
        deps.provider.provider_id(),
        baseline,
        state.session_turn,
        session_id,
    );
    active.context_manager.record(&record);

    let local_estimate = deps
        .config
        .model_rates
        .get(&active.model())
        .map(|rates| rates.estimate_cost(&final_usage))
        .unwrap_or(0.0);
    let turn_cost = resolve_cost(cost.or(state.response_cost), local_estimate);

    // Emit the assistant message unless the pre-tool flush already did.
    if !state.flushed {
        if let Some(blocks) = build_content_blocks(
            &state.thinking,
            state.thinking_signature.as_deref(),
            &state.sequence,
            &state.tool_calls,
            false,
        ) {
            deps.store.append(
                session_id,
                AppendRequest::new(
                    EventKind::MessageAssistant,
                    json!({
                        "content": blocks,
                        "tokenUsage": &final_usage,
                        "tokenRecord": &record,
                        "turn": state.session_turn,
                        "model": active.model(),
                        "stopReason": stop_reason.as_str(),
                        "latency": duration_ms,
                        "hasThinking": state.has_thinking(),
                    }),
                )
                .with_run(run_id),
            )?;
        }
        state.flushed = true;
    }

    deps.store.append(
        session_id,
        AppendRequest::new(
            EventKind::StreamTurnEnd,
            json!({
                "turn": state.session_turn,
                "tokenUsage": &final_usage,
                "tokenRecord": &record,
                "cost": turn_cost,
                "runId": run_id,
            }),
        )
        .with_run(run_id),
    )?;
    deps.store
        .record_turn_stats(session_id, &record, &final_usage, turn_cost)?;

    state.ended = true;
    run.final_text = state.text();
    run.last_stop = stop_reason;
    run.turns_completed += 1;
    let session_turn = state.session_turn;
    active.context.lock().finish_turn(record);

    deps.hub.emit(RuntimeEvent::TurnEnd {
        session_id: session_id.to_owned(),
        turn: session_turn,
        run_id: run_id.to_owned(),
        error: None,
    });

    Ok(EventOutcome::Continue)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pre-tool flush
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Emit the turn's single assistant message before the first tool runs:
/// accumulated thinking, text, and the pending tool_use blocks.
fn flush_pre_tool(
    deps: &PipelineDeps,
    active: &ActiveSession,
    run: &mut RunState,
) -> Result<()> {
    let state = match run.turn.as_mut() {
        Some(state) if !state.flushed => state,
        _ => return Ok(()),
    };

    if let Some(blocks) = build_content_blocks(
        &state.thinking,
        state.thinking_signature.as_deref(),
        &state.sequence,
        &state.tool_calls,
        false,
    ) {
        let usage = state.response_usage.clone().unwrap_or_default();
        deps.store.append(
            &active.session_id,
            AppendRequest::new(
                EventKind::MessageAssistant,
                json!({
                    "content": blocks,
                    "tokenUsage": usage,
                    "turn": state.session_turn,
                    "model": active.model(),
                    "stopReason": StopReason::ToolUse.as_str(),
                    "latency": state.started.elapsed().as_millis() as u64,
                    "hasThinking": state.has_thinking(),
                }),
            )
            .with_run(active.current_run_id().unwrap_or_default()),
        )?;
    }
    state.flushed = true;
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool execution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Flush, run PreToolUse hooks, persist `tool.call`, and execute through
/// the registry when the tool is local. A hook block stops the turn before
/// anything is persisted for the call.
async fn start_and_execute_tool(
    deps: &PipelineDeps,
    active: &ActiveSession,
    input: &PromptInput,
    run: &mut RunState,
    call_id: &str,
    cancel: &RunCancel,
) -> Result<EventOutcome> {
    let session_id = input.session_id.as_str();
    let run_id = input.run_id.as_str();

    let (name, arguments) = match run
        .turn
        .as_ref()
        .and_then(|t| t.tool_calls.get(call_id))
    {
        Some(call) => (call.name.clone(), call.arguments.clone()),
        None => return Ok(EventOutcome::Continue),
    };

    flush_pre_tool(deps, active, run)?;

    let mut ctx = hook_ctx(session_id, run_id);
    ctx = ctx.with_tool(call_id, &name, arguments.clone());
    let report = run_hooks_persisted(
        deps,
        session_id,
        run_id,
        HookKind::PreToolUse,
        &ctx,
        Some((&name, call_id)),
    )
    .await?;
    if report.blocked() {
        let reason = report
            .reason
            .unwrap_or_else(|| format!("tool {name} blocked by hook"));
        tracing::info!(session_id, tool = %name, %reason, "tool execution blocked");
        return Ok(EventOutcome::Blocked(reason));
    }

    persist_tool_call(deps, active, input, run, call_id)?;
    if let Some(state) = run.turn.as_mut() {
        if let Some(call) = state.tool_calls.get_mut(call_id) {
            call.status = ToolCallStatus::Running;
            call.started_at = Some(Utc::now());
        }
    }
    deps.hub.emit(RuntimeEvent::ToolStart {
        session_id: session_id.to_owned(),
        tool_call_id: call_id.to_owned(),
        tool_name: name.clone(),
        run_id: run_id.to_owned(),
    });

    // Plan mode rejects listed tools without executing them; the model sees
    // an error result and can adjust.
    let plan_blocks = active
        .plan_mode
        .lock()
        .as_ref()
        .map(|plan| plan.blocks(&name))
        .unwrap_or(false);
    if plan_blocks {
        finish_tool(
            deps,
            active,
            input,
            run,
            call_id,
            format!("Tool '{name}' is unavailable while plan mode is active"),
            true,
            0,
        )
        .await?;
        return Ok(EventOutcome::Continue);
    }

    let tool = match deps.tools.get(&name) {
        Some(tool) => tool,
        // Provider-side execution: the result arrives as a stream event.
        None => return Ok(EventOutcome::Continue),
    };

    let tool_ctx = ToolContext {
        session_id: session_id.to_owned(),
        working_directory: active.working_directory.clone(),
        cancelled: cancel.flag(),
    };
    let started = Instant::now();
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            interrupt_run(deps, active, run, run_id)?;
            return Ok(EventOutcome::Interrupted);
        }
        outcome = tool.execute(arguments, &tool_ctx) => outcome,
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(result) => {
            finish_tool(deps, active, input, run, call_id, result.content, result.is_error, duration_ms)
                .await?;
        }
        Err(e) => {
            // Tool failures surface to the model, not to the caller.
            finish_tool(
                deps,
                active,
                input,
                run,
                call_id,
                format!("tool error: {e}"),
                true,
                duration_ms,
            )
            .await?;
        }
    }
    Ok(EventOutcome::Continue)
}

fn persist_tool_call(
    deps: &PipelineDeps,
    _active: &ActiveSession,
    input: &PromptInput,
    run: &mut RunState,
    call_id: &str,
) -> Result<()> {
    let state = match run.turn.as_ref() {
        Some(state) => state,
        None => return Ok(()),
    };
    let call = match state.tool_calls.get(call_id) {
        Some(call) => call,
        None => return Ok(()),
    };
    deps.store.append(
        &input.session_id,
        AppendRequest::new(
            EventKind::ToolCall,
            json!({
                "toolCallId": &call.id,
                "name": &call.name,
                "arguments": &call.arguments,
                "turn": state.session_turn,
                "runId": &input.run_id,
            }),
        )
        .with_run(&input.run_id),
    )?;
    Ok(())
}

/// Record a finished tool call: PostToolUse hooks, `tool.result`
/// persistence, and the streaming end event.
#[allow(clippy::too_many_arguments)]
async fn finish_tool(
    deps: &PipelineDeps,
    active: &ActiveSession,
    input: &PromptInput,
    run: &mut RunState,
    call_id: &str,
    content: String,
    is_error: bool,
    duration_ms: u64,
) -> Result<EventOutcome> {
    let session_id = input.session_id.as_str();
    let run_id = input.run_id.as_str();

    let (name, arguments) = {
        let state = match run.turn.as_mut() {
            Some(state) => state,
            None => return Ok(EventOutcome::Continue),
        };
        let call = match state.tool_calls.get_mut(call_id) {
            Some(call) => call,
            None => return Ok(EventOutcome::Continue),
        };
        call.status = if is_error {
            ToolCallStatus::Failed
        } else {
            ToolCallStatus::Completed
        };
        call.output = Some(content.clone());
        call.is_error = is_error;
        call.completed_at = Some(Utc::now());
        (call.name.clone(), call.arguments.clone())
    };

    let mut ctx = hook_ctx(session_id, run_id).with_tool(call_id, &name, arguments);
    ctx.tool_result = Some(content.clone());
    let _ = run_hooks_persisted(
        deps,
        session_id,
        run_id,
        HookKind::PostToolUse,
        &ctx,
        Some((&name, call_id)),
    )
    .await?;

    deps.store.append(
        session_id,
        AppendRequest::new(
            EventKind::ToolResult,
            json!({
                "toolCallId": call_id,
                "content": content,
                "isError": is_error,
                "truncated": false,
                "runId": run_id,
            }),
        )
        .with_run(run_id),
    )?;

    deps.hub.emit(RuntimeEvent::ToolEnd {
        session_id: session_id.to_owned(),
        tool_call_id: call_id.to_owned(),
        is_error,
        duration_ms,
    });

    active.touch();
    Ok(EventOutcome::Continue)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Interruption persistence
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Persist a faithful record of a cancelled turn: synthesized results for
/// unfinished tools, and (when not yet flushed) a `_meta`-annotated
/// assistant message.
fn interrupt_run(
    deps: &PipelineDeps,
    active: &ActiveSession,
    run: &mut RunState,
    run_id: &str,
) -> Result<()> {
    let session_id = active.session_id.as_str();

    if let Some(state) = run.turn.as_mut() {
        if !state.ended {
            // One builder call yields both halves of the faithful record:
            // the `_meta`-annotated blocks and the paired synthesized
            // results. Built unconditionally so the results are available
            // even when the pre-tool flush already emitted the blocks.
            let content = build_interrupted_content_blocks(
                &state.thinking,
                state.thinking_signature.as_deref(),
                &state.sequence,
                &state.tool_calls,
                false,
            );

            if let Some(content) = &content {
                for result in &content.tool_results {
                    if let ContentBlock::ToolResult {
                        tool_use_id,
                        content: output,
                        is_error,
                        meta,
                    } = result
                    {
                        // Calls that finished before the abort already have
                        // their result event from the normal path.
                        if meta.as_ref().and_then(|m| m.interrupted) != Some(true) {
                            continue;
                        }
                        deps.store.append(
                            session_id,
                            AppendRequest::new(
                                EventKind::ToolResult,
                                json!({
                                    "toolCallId": tool_use_id,
                                    "content": output,
                                    "isError": is_error,
                                    "truncated": false,
                                    "runId": run_id,
                                    "_meta": meta,
                                }),
                            )
                            .with_run(run_id),
                        )?;
                    }
                }
            }

            if !state.flushed {
                if let Some(content) = content {
                    let usage = state.response_usage.clone().unwrap_or_default();
                    deps.store.append(
                        session_id,
                        AppendRequest::new(
                            EventKind::MessageAssistant,
                            json!({
                                "content": content.blocks,
                                "tokenUsage": usage,
                                "turn": state.session_turn,
                                "model": active.model(),
                                "stopReason": StopReason::Aborted.as_str(),
                                "latency": state.started.elapsed().as_millis() as u64,
                                "hasThinking": state.has_thinking(),
                            }),
                        )
                        .with_run(run_id),
                    )?;
                }
                state.flushed = true;
            }
        }
    }

    deps.hub.emit(RuntimeEvent::TurnInterrupted {
        session_id: session_id.to_owned(),
        run_id: run_id.to_owned(),
    });
    active.set_interrupted(true);
    tracing::info!(session_id, run_id, "run interrupted");
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn hook_ctx(session_id: &str, run_id: &str) -> HookContext {
    let mut ctx = HookContext::for_session(session_id);
    ctx.run_id = Some(run_id.to_owned());
    ctx
}

/// Run hooks of a kind and persist `hook.triggered` / `hook.completed`
/// when any blocking hook actually ran.
async fn run_hooks_persisted(
    deps: &PipelineDeps,
    session_id: &str,
    run_id: &str,
    kind: HookKind,
    ctx: &HookContext,
    tool: Option<(&str, &str)>,
) -> Result<ExecutionReport> {
    let blocking_names: Vec<String> = deps
        .hooks
        .get_hooks(kind)
        .iter()
        .filter(|h| h.mode == HookMode::Blocking)
        .map(|h| h.name.clone())
        .collect();
    if !blocking_names.is_empty() {
        deps.hub.emit(RuntimeEvent::HookTriggered {
            session_id: session_id.to_owned(),
            hook_names: blocking_names,
            hook_event: kind.as_str().to_owned(),
        });
    }

    let report = deps.hooks.execute(kind, ctx).await;

    for hook in &report.background_started {
        deps.hub.emit(RuntimeEvent::HookBackgroundStarted {
            session_id: session_id.to_owned(),
            hook: hook.clone(),
        });
    }

    if report.ran_blocking() {
        let (tool_name, tool_call_id) = match tool {
            Some((name, id)) => (Some(name.to_owned()), Some(id.to_owned())),
            None => (None, None),
        };
        let mut triggered = json!({
            "hookNames": &report.executed,
            "hookEvent": kind.as_str(),
            "runId": run_id,
        });
        let mut completed = json!({
            "hookNames": &report.executed,
            "hookEvent": kind.as_str(),
            "result": report.result_str(),
            "duration": report.duration_ms,
            "runId": run_id,
        });
        if let Some(name) = &tool_name {
            triggered["toolName"] = json!(name);
            completed["toolName"] = json!(name);
        }
        if let Some(id) = &tool_call_id {
            triggered["toolCallId"] = json!(id);
            completed["toolCallId"] = json!(id);
        }
        if let Some(reason) = &report.reason {
            completed["reason"] = json!(reason);
        }

        deps.store.append(
            session_id,
            AppendRequest::new(EventKind::HookTriggered, triggered).with_run(run_id),
        )?;
        deps.store.append(
            session_id,
            AppendRequest::new(EventKind::HookCompleted, completed).with_run(run_id),
        )?;

        deps.hub.emit(RuntimeEvent::HookCompleted {
            session_id: session_id.to_owned(),
            hook_names: report.executed.clone(),
            hook_event: kind.as_str().to_owned(),
            result: report.result_str().to_owned(),
            duration_ms: report.duration_ms,
            reason: report.reason.clone(),
        });
    }

    Ok(report)
}

fn persist_agent_error(
    deps: &PipelineDeps,
    session_id: &str,
    run_id: &str,
    error: &Error,
) -> Result<()> {
    deps.store.append(
        session_id,
        AppendRequest::new(
            EventKind::ErrorAgent,
            json!({
                "error": error.to_string(),
                "recoverable": error.retryable(),
            }),
        )
        .with_run(run_id),
    )?;
    Ok(())
}

fn emit_turn_end_error(
    deps: &PipelineDeps,
    run: &RunState,
    session_id: &str,
    run_id: &str,
    error: &str,
) {
    let turn = run
        .turn
        .as_ref()
        .map(|t| t.session_turn)
        .unwrap_or(run.base_turn + 1);
    deps.hub.emit(RuntimeEvent::TurnEnd {
        session_id: session_id.to_owned(),
        turn,
        run_id: run_id.to_owned(),
        error: Some(error.to_owned()),
    });
}

fn finish_blocked(
    deps: &PipelineDeps,
    active: &ActiveSession,
    run_id: &str,
    report: ExecutionReport,
) -> RunSummary {
    let reason = report
        .reason
        .unwrap_or_else(|| "blocked by hook".to_owned());
    deps.hub.emit(RuntimeEvent::TurnEnd {
        session_id: active.session_id.clone(),
        turn: active.context.lock().current_turn + 1,
        run_id: run_id.to_owned(),
        error: Some(reason.clone()),
    });
    active.set_current_run_id(None);
    RunSummary {
        run_id: run_id.to_owned(),
        final_text: String::new(),
        turns: 0,
        blocked: Some(reason),
        interrupted: false,
    }
}

fn format_subagent_results(results: &[SubagentResult]) -> String {
    let mut buf = String::from("Background task results:\n");
    for result in results {
        let status = if result.success { "completed" } else { "failed" };
        buf.push_str(&format!(
            "- task {} {status}: {}\n",
            result.session_id, result.summary
        ));
    }
    buf
}
