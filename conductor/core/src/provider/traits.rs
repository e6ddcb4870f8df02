//! Provider Client Trait
//!
//! Uniform capability wrapper around one external model endpoint. The worker
//! pool only ever talks to providers through [`ProviderClient`]; concrete
//! variants live in [`super::http`] and [`super::scripted`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::task::Payload;

// ============================================================================
// Identity
// ============================================================================

/// Identifier of a configured provider (e.g. `claude`, `grok`)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(pub String);

impl ProviderId {
    /// Create a provider ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProviderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ProviderId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Output
// ============================================================================

/// Token usage reported by a provider
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens
    pub input_tokens: u32,
    /// Completion tokens
    pub output_tokens: u32,
}

/// Successful provider response
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Generated text
    pub text: String,
    /// Model that produced the text
    pub model: String,
    /// Token usage, when the provider reports it
    pub usage: Usage,
}

impl ProviderResponse {
    /// Create a response without usage data
    pub fn new(text: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: model.into(),
            usage: Usage::default(),
        }
    }

    /// Set usage
    #[must_use]
    pub fn with_usage(mut self, input_tokens: u32, output_tokens: u32) -> Self {
        self.usage = Usage {
            input_tokens,
            output_tokens,
        };
        self
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Coarse classification that drives retry and diagnostics
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Temporarily unavailable; worth one retry
    Transient,
    /// The request itself is wrong; retrying cannot help
    Permanent,
    /// Credentials rejected; the provider is misconfigured
    AuthFailure,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
            Self::AuthFailure => write!(f, "auth_failure"),
        }
    }
}

/// Why a provider invocation failed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    /// No response within the per-call timeout
    Timeout,
    /// Provider asked us to slow down
    RateLimited,
    /// 5xx-equivalent failure on the provider side
    ServerError,
    /// Connection could not be established or was dropped
    Transport,
    /// Provider rejected the request as malformed
    InvalidRequest,
    /// Provider answered with something we could not interpret
    MalformedResponse,
    /// Credentials missing or rejected
    Unauthorized,
    /// Provider skipped because its circuit breaker is open
    CircuitOpen,
}

impl FailureReason {
    /// Error class for this reason
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout
            | Self::RateLimited
            | Self::ServerError
            | Self::Transport
            | Self::CircuitOpen => ErrorClass::Transient,
            Self::InvalidRequest | Self::MalformedResponse => ErrorClass::Permanent,
            Self::Unauthorized => ErrorClass::AuthFailure,
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Timeout => "Timeout",
            Self::RateLimited => "RateLimited",
            Self::ServerError => "ServerError",
            Self::Transport => "Transport",
            Self::InvalidRequest => "InvalidRequest",
            Self::MalformedResponse => "MalformedResponse",
            Self::Unauthorized => "Unauthorized",
            Self::CircuitOpen => "CircuitOpen",
        };
        f.write_str(s)
    }
}

/// Failed provider invocation
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{reason}: {message}")]
pub struct ProviderError {
    /// Why it failed
    pub reason: FailureReason,
    /// Provider-specific detail
    pub message: String,
}

impl ProviderError {
    /// Create an error
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    /// Per-call timeout elapsed
    #[must_use]
    pub fn timeout(after: Duration) -> Self {
        Self::new(
            FailureReason::Timeout,
            format!("no response within {}ms", after.as_millis()),
        )
    }

    /// Error class
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        self.reason.class()
    }

    /// Whether a retry may help
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

// ============================================================================
// Provider Client Trait
// ============================================================================

/// One external model endpoint
///
/// Implementations must be cheap to share (`Arc<dyn ProviderClient>`) and
/// safe to invoke concurrently.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Registry identifier
    fn id(&self) -> &ProviderId;

    /// Model name used for requests
    fn model(&self) -> &str;

    /// Short label for the endpoint kind (`anthropic`, `openai`, `echo`)
    fn kind(&self) -> &'static str;

    /// Execute one request
    ///
    /// `timeout` is the per-call budget. Callers enforce it as well, so an
    /// implementation that overruns is cut off and reported as a timeout.
    async fn invoke(
        &self,
        payload: &Payload,
        timeout: Duration,
    ) -> Result<ProviderResponse, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_classes() {
        assert_eq!(FailureReason::Timeout.class(), ErrorClass::Transient);
        assert_eq!(FailureReason::RateLimited.class(), ErrorClass::Transient);
        assert_eq!(FailureReason::ServerError.class(), ErrorClass::Transient);
        assert_eq!(FailureReason::Transport.class(), ErrorClass::Transient);
        assert_eq!(FailureReason::InvalidRequest.class(), ErrorClass::Permanent);
        assert_eq!(
            FailureReason::MalformedResponse.class(),
            ErrorClass::Permanent
        );
        assert_eq!(FailureReason::Unauthorized.class(), ErrorClass::AuthFailure);
    }

    #[test]
    fn test_provider_error_display() {
        let err = ProviderError::timeout(Duration::from_millis(1500));
        assert!(err.is_transient());
        assert_eq!(err.to_string(), "Timeout: no response within 1500ms");
    }

    #[test]
    fn test_provider_id_serializes_as_string() {
        let id = ProviderId::from("grok");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"grok\"");
    }
}
