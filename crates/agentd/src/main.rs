//! `strandd` — detached agent session runner.
//!
//! Invoked by the tmux spawn path with `--parent-session-id` and
//! `--spawn-task` against the shared database, or standalone for a one-off
//! task. Exit codes: 0 success, 1 fatal error, 2 invalid arguments, 130
//! cancelled.

mod cli;
mod provider;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use strand_domain::config::CoreConfig;
use strand_runtime::Orchestrator;
use strand_store::{Database, EventStore, SessionFilter, SessionRecord};

use cli::Cli;

const EXIT_CANCELLED: u8 = 130;

fn main() -> ExitCode {
    // Clap exits with status 2 on invalid arguments before we get here.
    let cli = Cli::parse();
    init_tracing();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("strandd: starting runtime: {e}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("strandd: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,strand_runtime=debug")),
        )
        .json()
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let task = match &cli.spawn_task {
        Some(task) if !task.is_empty() => task.clone(),
        _ => {
            eprintln!("strandd: --spawn-task is required");
            return Ok(ExitCode::from(2));
        }
    };

    let db = Database::open(&cli.db_path)
        .with_context(|| format!("opening database {}", cli.db_path.display()))?;
    let store = Arc::new(EventStore::new(
        db,
        "local",
        strand_domain::config::StorageConfig::default(),
    ));
    let provider = provider::from_env().context("resolving provider")?;

    let mut config = CoreConfig::default();
    if let Some(max_turns) = cli.max_turns {
        config.sessions.max_turns_per_prompt = max_turns;
    }

    let orchestrator = Arc::new(
        Orchestrator::builder(store.clone(), provider)
            .config(Arc::new(config))
            .build(),
    );

    let session = resolve_session(&orchestrator, &cli)?;
    tracing::info!(session_id = %session.id, "child session ready");

    if cli.reasoning.is_some() {
        orchestrator.set_reasoning_level(&session.id, cli.reasoning.clone())?;
    }

    let handle = orchestrator.prompt(&session.id, &task)?;
    let session_id = session.id.clone();

    let summary = tokio::select! {
        outcome = handle.wait() => outcome?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(session_id = %session_id, "cancellation requested");
            orchestrator.cancel(&session_id);
            orchestrator.end_session(&session_id, "cancelled").await?;
            orchestrator.shutdown().await;
            return Ok(ExitCode::from(EXIT_CANCELLED));
        }
    };

    if summary.interrupted {
        orchestrator.end_session(&session_id, "interrupted").await?;
        orchestrator.shutdown().await;
        return Ok(ExitCode::from(EXIT_CANCELLED));
    }
    if let Some(reason) = &summary.blocked {
        eprintln!("strandd: run blocked: {reason}");
        orchestrator.end_session(&session_id, "blocked").await?;
        orchestrator.shutdown().await;
        return Ok(ExitCode::from(1));
    }

    println!("{}", summary.final_text);
    orchestrator.end_session(&session_id, "task completed").await?;
    orchestrator.shutdown().await;
    Ok(ExitCode::SUCCESS)
}

/// Adopt the session row the parent pre-created for this spawn, or create
/// a fresh one when running standalone.
fn resolve_session(
    orchestrator: &Orchestrator,
    cli: &Cli,
) -> anyhow::Result<SessionRecord> {
    if let Some(parent_id) = &cli.parent_session_id {
        let filter = SessionFilter {
            parent_session_id: Some(parent_id.clone()),
            spawn_type: Some("tmux".to_owned()),
            active_only: true,
        };
        let (candidates, _) = orchestrator.store().list_sessions(&filter, 16, 0)?;
        // The adoptable row is the newest one with no conversation yet.
        for candidate in candidates {
            let events = orchestrator.store().get_events(&candidate.id)?;
            if events.iter().all(|e| e.kind.is_session_kind()) {
                return Ok(candidate);
            }
        }
        tracing::warn!(
            parent_session_id = %parent_id,
            "no adoptable spawned session found; creating one"
        );
    }

    let wd = cli.working_directory.display().to_string();
    let session = orchestrator.create_session(&wd, &cli.model)?;
    if let Some(parent_id) = &cli.parent_session_id {
        orchestrator.store().update_session_spawn_info(
            &session.id,
            parent_id,
            "tmux",
            cli.spawn_task.as_deref().unwrap_or_default(),
        )?;
    }
    Ok(session)
}
