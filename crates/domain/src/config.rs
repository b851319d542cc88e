//! Core runtime configuration.
//!
//! Constructed by the embedding server and passed to constructors once at
//! startup; nothing here is re-read at runtime.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::tokens::ModelRates;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sub-configs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bound on the active-session map; least-recently-used idle sessions
    /// are evicted past this.
    pub max_concurrent_sessions: usize,
    /// Idle seconds before an active session is eligible for eviction.
    pub idle_ttl_secs: u64,
    /// Hard cap on model turns within one prompt invocation.
    pub max_turns_per_prompt: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 32,
            idle_ttl_secs: 1800,
            max_turns_per_prompt: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    /// Per-hook timeout when the definition does not set one.
    pub default_timeout_ms: u64,
    /// Budget for draining background hooks at shutdown.
    pub drain_timeout_ms: u64,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 10_000,
            drain_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Bounded retry attempts for transient provider errors within one run.
    pub retry_budget: u32,
    /// Backoff between retries in milliseconds.
    pub retry_backoff_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            retry_budget: 2,
            retry_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Payload `content` fields above this byte count are spilled to the
    /// blob store.
    pub blob_threshold_bytes: usize,
    /// Above this byte count the inline copy is replaced by a truncated
    /// preview referencing the blob.
    pub preview_threshold_bytes: usize,
    /// Preview length kept inline.
    pub preview_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            blob_threshold_bytes: 2 * 1024,
            preview_threshold_bytes: 10 * 1024,
            preview_bytes: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Context-window tokens above which auto-compaction triggers.
    pub trigger_tokens: u64,
    /// Turns to keep verbatim after the boundary.
    pub keep_last_turns: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            trigger_tokens: 150_000,
            keep_last_turns: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubagentConfig {
    /// Default turn cap for spawned children.
    pub default_max_turns: u32,
    /// Default wait timeout for `wait_for` in milliseconds.
    pub wait_timeout_ms: u64,
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self {
            default_max_turns: 25,
            wait_timeout_ms: 600_000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CoreConfig
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub sessions: SessionConfig,
    pub hooks: HookConfig,
    pub provider: ProviderConfig,
    pub storage: StorageConfig,
    pub compaction: CompactionConfig,
    pub subagents: SubagentConfig,
    /// Per-model USD rate table used when the provider does not report cost.
    pub model_rates: HashMap<String, ModelRates>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl CoreConfig {
    /// Sanity-check the configuration. Errors make startup fail; warnings
    /// are logged.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.sessions.max_concurrent_sessions == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "sessions.max_concurrent_sessions must be at least 1".into(),
            });
        }
        if self.sessions.max_turns_per_prompt == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "sessions.max_turns_per_prompt must be at least 1".into(),
            });
        }
        if self.storage.preview_threshold_bytes < self.storage.blob_threshold_bytes {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "storage.preview_threshold_bytes must be >= blob_threshold_bytes".into(),
            });
        }
        if self.hooks.default_timeout_ms < 100 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "hooks.default_timeout_ms under 100ms will time most hooks out".into(),
            });
        }
        if self.model_rates.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "model_rates is empty; costs fall back to zero estimates".into(),
            });
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_with_only_rate_warning() {
        let config = CoreConfig::default();
        let issues = config.validate();
        assert!(issues
            .iter()
            .all(|i| i.severity == ConfigSeverity::Warning));
    }

    #[test]
    fn zero_session_cap_is_an_error() {
        let mut config = CoreConfig::default();
        config.sessions.max_concurrent_sessions = 0;
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error));
    }

    #[test]
    fn inverted_storage_thresholds_rejected() {
        let mut config = CoreConfig::default();
        config.storage.preview_threshold_bytes = 100;
        config.storage.blob_threshold_bytes = 2048;
        assert!(config
            .validate()
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error));
    }

    #[test]
    fn config_deserializes_from_partial_json() {
        let config: CoreConfig =
            serde_json::from_str(r#"{"sessions": {"max_concurrent_sessions": 4}}"#).unwrap();
        assert_eq!(config.sessions.max_concurrent_sessions, 4);
        // Unspecified sections keep their defaults.
        assert_eq!(config.hooks.default_timeout_ms, 10_000);
    }
}
