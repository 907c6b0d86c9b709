//! Provider contract and the concrete provider variants.
//!
//! The router only ever talks to `dyn Provider`. Every variant here
//! (OpenAI-compatible endpoints, Anthropic, the scripted in-process provider)
//! implements the same trait and is never inspected by type.

mod anthropic;
mod mock;
mod openai;
pub(crate) mod sse;

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::config::{ProviderConfig, ProviderKind};
use crate::error::ProviderError;

pub use anthropic::AnthropicProvider;
pub use mock::{Scripted, ScriptedProvider};
pub use openai::OpenAiProvider;

/// Completion budget assumed for cost estimates when `max_tokens` is unset.
pub const DEFAULT_COMPLETION_TOKENS: u32 = 512;

/// Per-message framing overhead added to prompt token estimates.
const TOKENS_PER_MESSAGE: u32 = 4;

/// Lazy sequence of partial text chunks. Finite and not restartable.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// Role of a conversational message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A role-tagged chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Model parameters passed through to the provider untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

impl ModelConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Token usage reported for a generated response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// A complete generated response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub content: String,
    /// Model that actually served the request.
    pub model: String,
    /// Registered name of the provider that produced the response.
    pub provider: String,
    pub usage: TokenUsage,
}

/// Capability tags a provider can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    TextGeneration,
    FunctionCalling,
    Streaming,
    Vision,
    JsonMode,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::TextGeneration => "text-generation",
            Capability::FunctionCalling => "function-calling",
            Capability::Streaming => "streaming",
            Capability::Vision => "vision",
            Capability::JsonMode => "json-mode",
        }
    }

    /// Parse a kebab-case capability tag.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text-generation" => Some(Self::TextGeneration),
            "function-calling" => Some(Self::FunctionCalling),
            "streaming" => Some(Self::Streaming),
            "vision" => Some(Self::Vision),
            "json-mode" => Some(Self::JsonMode),
            _ => None,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rates used to estimate the cost of a request, in USD.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    /// Per 1000 prompt tokens.
    pub input_rate: f64,
    /// Per 1000 completion tokens.
    pub output_rate: f64,
    /// Flat fee per request.
    pub base_fee: f64,
}

impl Pricing {
    pub fn estimate(&self, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        self.base_fee
            + (prompt_tokens as f64 / 1000.0) * self.input_rate
            + (completion_tokens as f64 / 1000.0) * self.output_rate
    }
}

/// One token per four characters, rounded up.
pub fn approximate_tokens(text: &str) -> u32 {
    let chars = text.chars().count() as u32;
    chars.div_ceil(4)
}

/// Estimate prompt tokens for a message list using the given counter.
pub fn prompt_tokens(messages: &[Message], count: impl Fn(&str) -> u32) -> u32 {
    messages
        .iter()
        .map(|m| count(&m.content) + TOKENS_PER_MESSAGE)
        .sum()
}

/// A backend capable of generating or streaming a model response.
///
/// Implementations must be cheap to share behind an `Arc` and must not keep
/// per-request mutable state; health bookkeeping belongs to the router.
#[async_trait]
pub trait Provider: Send + Sync + fmt::Debug {
    /// Unique registry key.
    fn name(&self) -> &str;

    fn capabilities(&self) -> &[Capability];

    /// Model identifiers this provider can serve.
    fn models(&self) -> &[String];

    /// Estimated cost of serving this request, in USD. Must not do I/O.
    fn estimate_cost(&self, messages: &[Message], config: &ModelConfig) -> f64;

    fn count_tokens(&self, text: &str) -> u32 {
        approximate_tokens(text)
    }

    async fn generate(
        &self,
        messages: &[Message],
        config: &ModelConfig,
    ) -> Result<Response, ProviderError>;

    /// Open a stream of partial text chunks.
    ///
    /// An error returned here means no chunk was produced. Errors after the
    /// stream is open arrive as stream items.
    async fn stream(
        &self,
        messages: &[Message],
        config: &ModelConfig,
    ) -> Result<TextStream, ProviderError>;
}

/// Build a provider from its configuration entry.
pub fn build_provider(config: &ProviderConfig, client: &reqwest::Client) -> Arc<dyn Provider> {
    let timeout = Duration::from_secs(config.timeout_secs);
    match config.kind {
        ProviderKind::OpenAi => Arc::new(OpenAiProvider::new(config, client.clone(), timeout)),
        ProviderKind::Anthropic => {
            Arc::new(AnthropicProvider::new(config, client.clone(), timeout))
        }
        ProviderKind::Mock => Arc::new(ScriptedProvider::from_config(config)),
    }
}

/// Upper bound on a `retry-after` header value we are willing to honour.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(120);

/// Parse an HTTP `retry-after` header given in whole seconds.
pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let secs: u64 = headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()?;
    Some(Duration::from_secs(secs).min(MAX_RETRY_AFTER))
}

/// Map a non-success HTTP response to a [`ProviderError`].
///
/// `throttle_statuses` lists the status codes that mean "rate limited" for
/// this vendor.
pub(crate) async fn error_from_response(
    provider: &str,
    response: reqwest::Response,
    throttle_statuses: &[u16],
) -> ProviderError {
    let status = response.status().as_u16();
    let retry_after = parse_retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();

    tracing::warn!(
        provider = %provider,
        status = status,
        body = %body,
        "Provider returned error"
    );

    if throttle_statuses.contains(&status) {
        ProviderError::RateLimited {
            message: format!("{} returned {}", provider, status),
            retry_after,
        }
    } else {
        ProviderError::Api {
            status,
            message: body,
        }
    }
}
