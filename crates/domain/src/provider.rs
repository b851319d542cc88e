//! The provider seam — the single function-shaped contract the core
//! consumes from language-model integrations.
//!
//! HTTP clients, SDK adapters, and mocks all satisfy this trait; the core
//! never sees a wire format.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::error::Result;
use crate::stream::{BoxStream, ProviderEvent};
use crate::tool::{Message, ToolDefinition};

/// One prompt invocation's worth of provider input.
#[derive(Clone)]
pub struct ProviderRequest {
    pub messages: Vec<Message>,
    pub model: String,
    pub tools: Vec<ToolDefinition>,
    /// Opaque credential handle resolved through [`CredentialLookup`].
    pub auth: Option<String>,
    /// Observed by the provider at its next yield point when set.
    pub cancelled: Arc<AtomicBool>,
    /// Optional reasoning-effort hint (`"low"` | `"medium"` | `"high"`).
    pub reasoning_level: Option<String>,
}

/// Trait every provider adapter must implement.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Open an ordered, cancellable stream of provider events for a request.
    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> Result<BoxStream<'static, Result<ProviderEvent>>>;

    /// Identifier used in token records and error messages.
    fn provider_id(&self) -> &str;
}

/// Read-mostly credential source. Reloaded on model switch.
pub trait CredentialLookup: Send + Sync {
    /// Resolve the credential for a provider id, if configured.
    fn credential_for(&self, provider_id: &str) -> Option<String>;
}

/// A lookup with no credentials; suits local/mock providers.
pub struct NoCredentials;

impl CredentialLookup for NoCredentials {
    fn credential_for(&self, _provider_id: &str) -> Option<String> {
        None
    }
}
