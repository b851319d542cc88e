/// Shared error type used across all strand crates.
///
/// Every variant maps to one of the error categories callers dispatch on
/// (validation, not-found, concurrency, provider, hook, tool, storage,
/// cancellation). RPC handlers translate `code()`/`category()`/`retryable()`
/// into their wire format.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("validation: {0}")]
    Validation(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("event not found: {0}")]
    EventNotFound(String),

    #[error("parent event {parent_id} does not belong to session {session_id}")]
    ParentMismatch {
        session_id: String,
        parent_id: String,
    },

    #[error("invalid event kind: {0}")]
    InvalidKind(String),

    #[error("session {0} is already processing a prompt")]
    AlreadyProcessing(String),

    /// Rate limits, 5xx responses, connection timeouts. Retryable.
    #[error("provider {provider}: {message}")]
    ProviderTransient { provider: String, message: String },

    /// Auth failures, invalid model, permission errors. Not retryable.
    #[error("provider {provider}: {message}")]
    ProviderTerminal { provider: String, message: String },

    #[error("hook {hook}: {message}")]
    Hook { hook: String, message: String },

    #[error("tool {tool}: {message}")]
    Tool { tool: String, message: String },

    #[error("storage: {0}")]
    Storage(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

/// Coarse error category, stable across variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    NotFound,
    Concurrency,
    ProviderTransient,
    ProviderTerminal,
    Hook,
    Tool,
    Storage,
    Timeout,
    Cancellation,
    Internal,
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Validation(_) | Error::InvalidKind(_) | Error::Config(_) => {
                ErrorCategory::Validation
            }
            Error::SessionNotFound(_) | Error::EventNotFound(_) => ErrorCategory::NotFound,
            Error::ParentMismatch { .. } | Error::AlreadyProcessing(_) => {
                ErrorCategory::Concurrency
            }
            Error::ProviderTransient { .. } => ErrorCategory::ProviderTransient,
            Error::ProviderTerminal { .. } => ErrorCategory::ProviderTerminal,
            Error::Hook { .. } => ErrorCategory::Hook,
            Error::Tool { .. } => ErrorCategory::Tool,
            Error::Storage(_) | Error::Io(_) | Error::Json(_) => ErrorCategory::Storage,
            Error::Timeout(_) => ErrorCategory::Timeout,
            Error::Cancelled(_) => ErrorCategory::Cancellation,
            Error::Other(_) => ErrorCategory::Internal,
        }
    }

    /// Stable machine-readable code for wire formats.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Validation(_) => "validation",
            Error::SessionNotFound(_) => "session_not_found",
            Error::EventNotFound(_) => "event_not_found",
            Error::ParentMismatch { .. } => "parent_mismatch",
            Error::InvalidKind(_) => "invalid_kind",
            Error::AlreadyProcessing(_) => "already_processing",
            Error::ProviderTransient { .. } => "provider_transient",
            Error::ProviderTerminal { .. } => "provider_terminal",
            Error::Hook { .. } => "hook_failure",
            Error::Tool { .. } => "tool_failure",
            Error::Storage(_) => "storage",
            Error::Timeout(_) => "timeout",
            Error::Cancelled(_) => "cancelled",
            Error::Config(_) => "config",
            Error::Other(_) => "internal",
        }
    }

    /// Whether a caller may retry the failed operation as-is.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Error::ProviderTransient { .. } | Error::Storage(_) | Error::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
