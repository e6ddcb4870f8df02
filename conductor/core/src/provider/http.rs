//! HTTP Provider Clients
//!
//! Remote model endpoints reached over HTTPS with `reqwest`.
//!
//! # Supported APIs
//!
//! - Anthropic Messages API: `POST {base}/v1/messages`
//! - OpenAI-compatible Chat Completions: `POST {base}/chat/completions`
//!   (OpenAI itself, xAI Grok, and anything else speaking that dialect)
//!
//! Responses are requested non-streaming; the orchestrator needs the full
//! text before it can aggregate.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};

use super::traits::{
    FailureReason, ProviderClient, ProviderError, ProviderId, ProviderResponse, Usage,
};
use crate::task::Payload;

/// Default Anthropic API base
pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
/// Default OpenAI API base
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
/// Default xAI API base
pub const XAI_BASE_URL: &str = "https://api.x.ai/v1";

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 2000;
const DEFAULT_TEMPERATURE: f64 = 0.3;

/// Wire dialect and credentials of a remote endpoint
#[derive(Clone)]
pub enum ProviderEndpoint {
    /// Anthropic Messages API
    Anthropic {
        /// API base URL
        base_url: String,
        /// `x-api-key` value
        api_key: String,
        /// Model name
        model: String,
    },
    /// OpenAI Chat Completions dialect
    OpenAiCompatible {
        /// API base URL
        base_url: String,
        /// Bearer token
        api_key: String,
        /// Model name
        model: String,
    },
}

impl std::fmt::Debug for ProviderEndpoint {
    // Keys stay out of logs
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anthropic {
                base_url, model, ..
            } => f
                .debug_struct("Anthropic")
                .field("base_url", base_url)
                .field("model", model)
                .finish_non_exhaustive(),
            Self::OpenAiCompatible {
                base_url, model, ..
            } => f
                .debug_struct("OpenAiCompatible")
                .field("base_url", base_url)
                .field("model", model)
                .finish_non_exhaustive(),
        }
    }
}

impl ProviderEndpoint {
    /// Model name
    #[must_use]
    pub fn model(&self) -> &str {
        match self {
            Self::Anthropic { model, .. } | Self::OpenAiCompatible { model, .. } => model,
        }
    }

    fn url(&self) -> String {
        match self {
            Self::Anthropic { base_url, .. } => {
                format!("{}/v1/messages", base_url.trim_end_matches('/'))
            }
            Self::OpenAiCompatible { base_url, .. } => {
                format!("{}/chat/completions", base_url.trim_end_matches('/'))
            }
        }
    }

    fn body(&self, payload: &Payload) -> Value {
        match self {
            Self::Anthropic { model, .. } => anthropic_body(model, payload),
            Self::OpenAiCompatible { model, .. } => openai_body(model, payload),
        }
    }

    fn parse(&self, body: &Value) -> Result<ProviderResponse, ProviderError> {
        match self {
            Self::Anthropic { model, .. } => parse_anthropic(model, body),
            Self::OpenAiCompatible { model, .. } => parse_openai(model, body),
        }
    }
}

/// Provider backed by a remote HTTP endpoint
#[derive(Clone)]
pub struct HttpProvider {
    id: ProviderId,
    endpoint: ProviderEndpoint,
    http_client: reqwest::Client,
    request_timeout: Option<Duration>,
}

impl HttpProvider {
    /// Create a provider for an endpoint
    pub fn new(id: impl Into<ProviderId>, endpoint: ProviderEndpoint) -> Self {
        Self {
            id: id.into(),
            endpoint,
            http_client: reqwest::Client::new(),
            request_timeout: None,
        }
    }

    /// Cap every request at `timeout`, even when the caller allows more
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Endpoint configuration
    #[must_use]
    pub fn endpoint(&self) -> &ProviderEndpoint {
        &self.endpoint
    }
}

#[async_trait]
impl ProviderClient for HttpProvider {
    fn id(&self) -> &ProviderId {
        &self.id
    }

    fn model(&self) -> &str {
        self.endpoint.model()
    }

    fn kind(&self) -> &'static str {
        match self.endpoint {
            ProviderEndpoint::Anthropic { .. } => "anthropic",
            ProviderEndpoint::OpenAiCompatible { .. } => "openai",
        }
    }

    async fn invoke(
        &self,
        payload: &Payload,
        timeout: Duration,
    ) -> Result<ProviderResponse, ProviderError> {
        let timeout = self.request_timeout.map_or(timeout, |cap| cap.min(timeout));
        let request = self
            .http_client
            .post(self.endpoint.url())
            .timeout(timeout)
            .json(&self.endpoint.body(payload));

        let request = match &self.endpoint {
            ProviderEndpoint::Anthropic { api_key, .. } => request
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION),
            ProviderEndpoint::OpenAiCompatible { api_key, .. } => request.bearer_auth(api_key),
        };

        let response = request.send().await.map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let body: Value = response.json().await.map_err(classify_transport_error)?;
        self.endpoint.parse(&body)
    }
}

// ============================================================================
// Request / Response Mapping
// ============================================================================

fn anthropic_body(model: &str, payload: &Payload) -> Value {
    let mut body = json!({
        "model": model,
        "max_tokens": payload.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "temperature": DEFAULT_TEMPERATURE,
        "messages": [
            { "role": "user", "content": payload.render_user_message() }
        ],
    });
    if let Some(ref system) = payload.system {
        body["system"] = json!(system);
    }
    body
}

fn openai_body(model: &str, payload: &Payload) -> Value {
    let mut messages = Vec::new();
    if let Some(ref system) = payload.system {
        messages.push(json!({ "role": "system", "content": system }));
    }
    messages.push(json!({ "role": "user", "content": payload.render_user_message() }));

    json!({
        "model": model,
        "max_tokens": payload.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "temperature": DEFAULT_TEMPERATURE,
        "messages": messages,
    })
}

fn token_count(value: &Value, key: &str) -> u32 {
    value
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0)
}

fn parse_anthropic(model: &str, body: &Value) -> Result<ProviderResponse, ProviderError> {
    let blocks = body
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("missing content array"))?;

    let text: String = blocks
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|b| b.get("text").and_then(Value::as_str))
        .collect();

    let usage = body.get("usage").map_or_else(Usage::default, |u| Usage {
        input_tokens: token_count(u, "input_tokens"),
        output_tokens: token_count(u, "output_tokens"),
    });

    Ok(ProviderResponse {
        text,
        model: body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(model)
            .to_string(),
        usage,
    })
}

fn parse_openai(model: &str, body: &Value) -> Result<ProviderResponse, ProviderError> {
    let text = body
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("missing choices[0].message.content"))?;

    let usage = body.get("usage").map_or_else(Usage::default, |u| Usage {
        input_tokens: token_count(u, "prompt_tokens"),
        output_tokens: token_count(u, "completion_tokens"),
    });

    Ok(ProviderResponse {
        text: text.to_string(),
        model: body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(model)
            .to_string(),
        usage,
    })
}

fn malformed(what: &str) -> ProviderError {
    ProviderError::new(FailureReason::MalformedResponse, what)
}

// ============================================================================
// Error Classification
// ============================================================================

/// Map an unsuccessful HTTP status to a provider error
#[must_use]
pub fn classify_status(status: StatusCode, body: &str) -> ProviderError {
    let reason = match status.as_u16() {
        401 | 403 => FailureReason::Unauthorized,
        408 => FailureReason::Timeout,
        429 => FailureReason::RateLimited,
        500..=599 => FailureReason::ServerError,
        _ => FailureReason::InvalidRequest,
    };

    let mut detail = body.trim().to_string();
    if detail.len() > 200 {
        let mut cut = 200;
        while !detail.is_char_boundary(cut) {
            cut -= 1;
        }
        detail.truncate(cut);
    }
    ProviderError::new(reason, format!("HTTP {status}: {detail}"))
}

fn classify_transport_error(err: reqwest::Error) -> ProviderError {
    let reason = if err.is_timeout() {
        FailureReason::Timeout
    } else if err.is_decode() {
        FailureReason::MalformedResponse
    } else {
        FailureReason::Transport
    };
    ProviderError::new(reason, err.to_string())
}
