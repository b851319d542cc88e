//! Filesystem hook discovery.
//!
//! User hooks live at `<project>/.agent/hooks/` and
//! `~/.config/strand/hooks/`. The filename maps to a kind
//! (`pre-tool-use.sh` → `PreToolUse`); an optional numeric prefix sets
//! priority (`10-pre-tool-use.sh`). Shell scripts run as subprocesses and
//! report their decision as JSON on stdout.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;

use strand_domain::error::{Error, Result};

use crate::types::{HookContext, HookDefinition, HookHandler, HookKind, HookResult};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Discovery
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Scan the project and user hook directories for shell hooks.
pub fn discover_hooks(project_dir: &Path) -> Vec<HookDefinition> {
    let mut dirs = vec![project_dir.join(".agent").join("hooks")];
    if let Some(config_dir) = dirs::config_dir() {
        dirs.push(config_dir.join("strand").join("hooks"));
    }

    let mut hooks = Vec::new();
    for dir in dirs {
        hooks.extend(scan_dir(&dir));
    }
    hooks
}

fn scan_dir(dir: &Path) -> Vec<HookDefinition> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut hooks = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("sh") {
            continue;
        }
        let stem = match path.file_stem().and_then(|s| s.to_str()) {
            Some(s) => s.to_owned(),
            None => continue,
        };

        let (priority, key) = split_priority_prefix(&stem);
        let kind = match kind_for_filename(key) {
            Some(kind) => kind,
            None => {
                tracing::debug!(path = %path.display(), "skipping hook file with unknown kind");
                continue;
            }
        };

        tracing::info!(path = %path.display(), kind = %kind, priority, "discovered shell hook");
        hooks.push(
            HookDefinition::new(stem.clone(), kind, Arc::new(ShellHook { path: path.clone() }))
                .with_priority(priority),
        );
    }
    hooks
}

/// `"10-pre-tool-use"` → `(10, "pre-tool-use")`; no prefix → priority 0.
fn split_priority_prefix(stem: &str) -> (i32, &str) {
    if let Some((prefix, rest)) = stem.split_once('-') {
        if let Ok(priority) = prefix.parse::<i32>() {
            return (priority, rest);
        }
    }
    (0, stem)
}

/// Fixed filename → kind table.
fn kind_for_filename(name: &str) -> Option<HookKind> {
    match name {
        "pre-tool-use" => Some(HookKind::PreToolUse),
        "post-tool-use" => Some(HookKind::PostToolUse),
        "stop" => Some(HookKind::Stop),
        "subagent-stop" => Some(HookKind::SubagentStop),
        "session-start" => Some(HookKind::SessionStart),
        "session-end" => Some(HookKind::SessionEnd),
        "user-prompt-submit" => Some(HookKind::UserPromptSubmit),
        "pre-compact" => Some(HookKind::PreCompact),
        "notification" => Some(HookKind::Notification),
        _ => None,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shell hook handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A hook implemented as a shell script.
///
/// The script receives `HOOK_CONTEXT` (JSON), `HOOK_TYPE`, and
/// `HOOK_SESSION_ID` in its environment, and prints its decision as JSON on
/// stdout. Non-JSON output falls back to `{action: continue}` with stdout
/// attached as the message.
pub struct ShellHook {
    pub path: PathBuf,
}

#[async_trait::async_trait]
impl HookHandler for ShellHook {
    async fn run(&self, ctx: &HookContext) -> Result<HookResult> {
        let context_json = serde_json::to_string(ctx)?;

        let output = Command::new("sh")
            .arg(&self.path)
            .env("HOOK_CONTEXT", &context_json)
            .env(
                "HOOK_TYPE",
                hook_type_for_path(&self.path).unwrap_or_default(),
            )
            .env("HOOK_SESSION_ID", &ctx.session_id)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Hook {
                hook: self.path.display().to_string(),
                message: format!("spawning: {e}"),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Hook {
                hook: self.path.display().to_string(),
                message: format!("exited with {}: {}", output.status, stderr.trim()),
            });
        }

        match serde_json::from_str::<HookResult>(&stdout) {
            Ok(result) => Ok(result),
            Err(_) => {
                let mut result = HookResult::proceed();
                if !stdout.is_empty() {
                    result.message = Some(stdout);
                }
                Ok(result)
            }
        }
    }
}

fn hook_type_for_path(path: &Path) -> Option<&'static str> {
    let stem = path.file_stem()?.to_str()?;
    let (_, key) = split_priority_prefix(stem);
    Some(kind_for_filename(key)?.as_str())
}

// Run a shell hook with a timeout (standalone helper for callers outside
// the engine).
pub async fn run_shell_hook(
    path: &Path,
    ctx: &HookContext,
    timeout: Duration,
) -> Result<HookResult> {
    let hook = ShellHook {
        path: path.to_path_buf(),
    };
    tokio::time::timeout(timeout, hook.run(ctx))
        .await
        .map_err(|_| Error::Timeout(format!("shell hook {}", path.display())))?
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_kind_table() {
        assert_eq!(kind_for_filename("pre-tool-use"), Some(HookKind::PreToolUse));
        assert_eq!(kind_for_filename("session-start"), Some(HookKind::SessionStart));
        assert_eq!(kind_for_filename("pre-compact"), Some(HookKind::PreCompact));
        assert_eq!(kind_for_filename("made-up"), None);
    }

    #[test]
    fn priority_prefix_parsing() {
        assert_eq!(split_priority_prefix("10-pre-tool-use"), (10, "pre-tool-use"));
        assert_eq!(split_priority_prefix("pre-tool-use"), (0, "pre-tool-use"));
        // "pre" is not numeric, so the whole stem is the key.
        assert_eq!(split_priority_prefix("stop"), (0, "stop"));
    }

    #[test]
    fn scan_picks_up_sh_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let hooks_dir = dir.path().join(".agent").join("hooks");
        std::fs::create_dir_all(&hooks_dir).unwrap();
        std::fs::write(hooks_dir.join("5-pre-tool-use.sh"), "echo '{}'").unwrap();
        std::fs::write(hooks_dir.join("session-start.sh"), "true").unwrap();
        std::fs::write(hooks_dir.join("notes.txt"), "not a hook").unwrap();
        std::fs::write(hooks_dir.join("unknown-kind.sh"), "true").unwrap();

        let hooks = scan_dir(&hooks_dir);
        assert_eq!(hooks.len(), 2);
        let pre = hooks.iter().find(|h| h.kind == HookKind::PreToolUse).unwrap();
        assert_eq!(pre.priority, 5);
        assert!(hooks.iter().any(|h| h.kind == HookKind::SessionStart));
    }

    #[tokio::test]
    async fn shell_hook_parses_json_decision() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("pre-tool-use.sh");
        std::fs::write(
            &script,
            "echo '{\"action\": \"block\", \"reason\": \"scripted policy\"}'",
        )
        .unwrap();

        let ctx = HookContext::for_session("s1");
        let result = run_shell_hook(&script, &ctx, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.action, crate::types::HookAction::Block);
        assert_eq!(result.reason.as_deref(), Some("scripted policy"));
    }

    #[tokio::test]
    async fn shell_hook_falls_back_to_continue_with_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("stop.sh");
        std::fs::write(&script, "echo 'all done here'").unwrap();

        let ctx = HookContext::for_session("s1");
        let result = run_shell_hook(&script, &ctx, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.action, crate::types::HookAction::Continue);
        assert_eq!(result.message.as_deref(), Some("all done here"));
    }

    #[tokio::test]
    async fn shell_hook_sees_env_vars() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("session-start.sh");
        std::fs::write(&script, "echo \"$HOOK_TYPE:$HOOK_SESSION_ID\"").unwrap();

        let ctx = HookContext::for_session("sess-42");
        let result = run_shell_hook(&script, &ctx, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.message.as_deref(), Some("SessionStart:sess-42"));
    }

    #[tokio::test]
    async fn failing_script_surfaces_hook_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("stop.sh");
        std::fs::write(&script, "echo 'broken' >&2; exit 3").unwrap();

        let ctx = HookContext::for_session("s1");
        let err = run_shell_hook(&script, &ctx, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "hook_failure");
    }
}
