//! Command-line surface for the detached subagent process.

use std::path::PathBuf;

use clap::Parser;

/// Detached agent session runner.
///
/// Spawned by a parent session (`tmux` spawn path) or invoked standalone
/// against a database.
#[derive(Debug, Parser)]
#[command(name = "strandd", version, about)]
pub struct Cli {
    /// Session id of the spawning parent; the child adopts the session row
    /// the parent pre-created.
    #[arg(long)]
    pub parent_session_id: Option<String>,

    /// The task prompt to run.
    #[arg(long)]
    pub spawn_task: Option<String>,

    /// SQLite database shared with the parent process.
    #[arg(long)]
    pub db_path: PathBuf,

    /// Working directory for the session.
    #[arg(long, default_value = ".")]
    pub working_directory: PathBuf,

    /// Model identifier.
    #[arg(long, default_value = "default")]
    pub model: String,

    /// Hard cap on model turns for the run.
    #[arg(long)]
    pub max_turns: Option<u32>,

    /// Reasoning-effort hint passed to the provider.
    #[arg(long)]
    pub reasoning: Option<String>,
}
