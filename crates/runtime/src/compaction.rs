//! Context compaction — collapse a session's conversation prefix into a
//! summary event so the context window stays healthy after many turns.
//!
//! Compaction never rewrites history: a `compact.boundary` event is
//! appended, and transcript assembly reads only events after the last
//! boundary. The subagent tracker is cleared afterwards — its state was
//! tied to the pre-compaction context.

use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::json;

use strand_domain::error::{Error, Result};
use strand_domain::event::{Event, EventKind};
use strand_domain::provider::{Provider, ProviderRequest};
use strand_domain::stream::ProviderEvent;
use strand_domain::tool::Message;
use strand_store::{AppendRequest, EventStore};

use crate::cancel::RunCancel;
use crate::events::{EventHub, RuntimeEvent};
use crate::subagent::SubagentTracker;
use crate::transcript;

/// Result of a successful compaction.
#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub summary: String,
    pub original_tokens: u64,
    pub compacted_tokens: u64,
    pub compression_ratio: f64,
    pub boundary_event: Event,
}

/// Run the full compaction flow for a session.
#[allow(clippy::too_many_arguments)]
pub async fn compact_session(
    store: &EventStore,
    provider: &Arc<dyn Provider>,
    hub: &EventHub,
    tracker: &SubagentTracker,
    session_id: &str,
    model: &str,
    reason: &str,
    run_id: &str,
) -> Result<CompactionOutcome> {
    // Announce start; this one is streaming-only, never persisted.
    hub.emit(RuntimeEvent::CompactionStarted {
        session_id: session_id.to_owned(),
        reason: reason.to_owned(),
    });

    let events = store.get_events(session_id)?;
    let start = transcript::compaction_boundary(&events);
    let active = &events[start..];

    let conversation = conversation_text(active);
    if conversation.is_empty() {
        return Err(Error::Validation(format!(
            "session {session_id} has nothing to compact"
        )));
    }

    let original_tokens = estimate_tokens(&conversation);
    let summary = generate_summary(provider, model, &conversation).await?;
    let compacted_tokens = estimate_tokens(&summary);
    let compression_ratio = if original_tokens == 0 {
        0.0
    } else {
        compacted_tokens as f64 / original_tokens as f64
    };

    let boundary_event = store.append(
        session_id,
        AppendRequest::new(
            EventKind::CompactBoundary,
            json!({
                "originalTokens": original_tokens,
                "compactedTokens": compacted_tokens,
                "compressionRatio": compression_ratio,
                "reason": reason,
                "summary": &summary,
                "runId": run_id,
            }),
        )
        .with_run(run_id),
    )?;

    // Tracked subagents referenced pre-compaction context.
    tracker.clear();

    hub.emit(RuntimeEvent::Compaction {
        session_id: session_id.to_owned(),
        original_tokens,
        compacted_tokens,
    });

    tracing::info!(
        session_id,
        original_tokens,
        compacted_tokens,
        compression_ratio,
        "session compacted"
    );

    Ok(CompactionOutcome {
        summary,
        original_tokens,
        compacted_tokens,
        compression_ratio,
        boundary_event,
    })
}

/// Ask the model for a summary of the conversation (non-tool call).
pub async fn generate_summary(
    provider: &Arc<dyn Provider>,
    model: &str,
    conversation: &str,
) -> Result<String> {
    let prompt = format!(
        "Summarize the following conversation history into a concise summary \
         that preserves:\n\
         1. The current goal or plan being worked on\n\
         2. Key decisions made\n\
         3. Open questions or threads\n\
         4. Important facts learned about the user or context\n\
         5. Tool state (running processes, pending work)\n\n\
         Be concise but preserve all actionable context. Write in present \
         tense. Omit greetings. Focus on substance.\n\n\
         CONVERSATION:\n{conversation}"
    );

    let cancel = RunCancel::new();
    let request = ProviderRequest {
        messages: vec![Message::user(prompt)],
        model: model.to_owned(),
        tools: Vec::new(),
        auth: None,
        cancelled: cancel.flag(),
        reasoning_level: None,
    };

    let mut stream = provider.stream(request).await?;
    let mut summary = String::new();
    while let Some(event) = stream.next().await {
        match event? {
            ProviderEvent::TextDelta { text } => summary.push_str(&text),
            ProviderEvent::Error { message, retryable } => {
                let provider_id = provider.provider_id().to_owned();
                return Err(if retryable {
                    Error::ProviderTransient {
                        provider: provider_id,
                        message,
                    }
                } else {
                    Error::ProviderTerminal {
                        provider: provider_id,
                        message,
                    }
                });
            }
            _ => {}
        }
    }

    Ok(summary.trim().to_owned())
}

/// Flatten events into role-labeled text for the summarizer prompt.
fn conversation_text(events: &[Event]) -> String {
    let mut buf = String::new();
    for message in transcript::events_to_messages(events) {
        let label = match message.role {
            strand_domain::tool::Role::System => "System",
            strand_domain::tool::Role::User => "User",
            strand_domain::tool::Role::Assistant => "Assistant",
            strand_domain::tool::Role::Tool => "Tool",
        };
        let text = message.content.text();
        if text.is_empty() {
            continue;
        }
        buf.push_str(label);
        buf.push_str(": ");
        // Long tool output gets clipped to keep the summarizer prompt sane.
        if text.len() > 2000 {
            buf.push_str(&text[..1000]);
            buf.push_str(" [...] ");
        } else {
            buf.push_str(&text);
        }
        buf.push('\n');
    }
    buf
}

/// Rough 4-chars-per-token estimate, used only for compaction accounting.
fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedProvider;
    use strand_domain::config::StorageConfig;
    use strand_store::Database;

    fn seeded_store() -> (EventStore, String) {
        let store = EventStore::new(
            Database::open_in_memory().unwrap(),
            "ws1",
            StorageConfig::default(),
        );
        let session = store.create_session("/w", "m1").unwrap();
        store
            .append(
                &session.id,
                AppendRequest::new(
                    EventKind::SessionStart,
                    json!({"workingDirectory": "/w", "model": "m1"}),
                ),
            )
            .unwrap();
        for i in 0..3 {
            store
                .append(
                    &session.id,
                    AppendRequest::new(
                        EventKind::MessageUser,
                        json!({"content": format!("message number {i}"), "turn": i + 1}),
                    ),
                )
                .unwrap();
        }
        (store, session.id)
    }

    #[tokio::test]
    async fn compaction_appends_boundary_and_clears_tracker() {
        let (store, sid) = seeded_store();
        let provider: Arc<dyn Provider> = Arc::new(ScriptedProvider::text_replies(vec![
            "goal: testing compaction",
        ]));
        let hub = EventHub::new();
        let tracker = SubagentTracker::new();

        let outcome = compact_session(&store, &provider, &hub, &tracker, &sid, "m1", "auto", "r1")
            .await
            .unwrap();

        assert_eq!(outcome.summary, "goal: testing compaction");
        assert!(outcome.original_tokens > 0);
        assert!(outcome.compression_ratio > 0.0);
        assert_eq!(outcome.boundary_event.kind, EventKind::CompactBoundary);

        // Transcript now starts at the boundary.
        let events = store.get_events(&sid).unwrap();
        let messages = transcript::events_to_messages(&events);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].content.text().contains("testing compaction"));
    }

    #[tokio::test]
    async fn empty_session_refuses_compaction() {
        let store = EventStore::new(
            Database::open_in_memory().unwrap(),
            "ws1",
            StorageConfig::default(),
        );
        let session = store.create_session("/w", "m1").unwrap();
        store
            .append(
                &session.id,
                AppendRequest::new(
                    EventKind::SessionStart,
                    json!({"workingDirectory": "/w", "model": "m1"}),
                ),
            )
            .unwrap();

        let provider: Arc<dyn Provider> =
            Arc::new(ScriptedProvider::text_replies(vec!["unused"]));
        let hub = EventHub::new();
        let tracker = SubagentTracker::new();

        let err = compact_session(&store, &provider, &hub, &tracker, &session.id, "m1", "auto", "r")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
