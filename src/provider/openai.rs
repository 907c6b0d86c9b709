//! OpenAI-compatible chat completions provider.
//!
//! Works against any endpoint that speaks `/chat/completions`, including
//! local model servers exposing the same API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header;
use serde::{Deserialize, Serialize};

use super::sse::{self, Extracted};
use super::{
    error_from_response, prompt_tokens, Capability, Message, ModelConfig, Pricing, Provider,
    Response, TextStream, TokenUsage, DEFAULT_COMPLETION_TOKENS,
};
use crate::config::{ApiKey, ProviderConfig};
use crate::error::ProviderError;

/// OpenAI treats only 429 as throttling.
const THROTTLE_STATUSES: &[u16] = &[429];

#[derive(Debug)]
pub struct OpenAiProvider {
    name: String,
    url: String,
    api_key: Option<ApiKey>,
    models: Vec<String>,
    capabilities: Vec<Capability>,
    pricing: Pricing,
    client: reqwest::Client,
    timeout: Duration,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop: &'a [String],
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Deserialize, Default)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiProvider {
    pub fn new(config: &ProviderConfig, client: reqwest::Client, timeout: Duration) -> Self {
        Self {
            name: config.name.clone(),
            url: config.url.clone(),
            api_key: config.api_key.clone(),
            models: config.models.clone(),
            capabilities: config.capabilities.clone(),
            pricing: config.pricing(),
            client,
            timeout,
        }
    }

    async fn send(
        &self,
        messages: &[Message],
        config: &ModelConfig,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/chat/completions", self.url.trim_end_matches('/'));
        let body = ChatRequest {
            model: &config.model,
            messages,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            top_p: config.top_p,
            stop: &config.stop,
            stream,
        };

        let mut request = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&body);
        // Streams stay open for as long as the model keeps talking.
        if !stream {
            request = request.timeout(self.timeout);
        }
        if let Some(api_key) = &self.api_key {
            request = request.header(
                header::AUTHORIZATION,
                format!("Bearer {}", api_key.expose_secret()),
            );
        }

        let response = request.send().await.map_err(|e| {
            tracing::error!(error = %e, provider = %self.name, "Failed to reach provider");
            ProviderError::from(e)
        })?;

        if !response.status().is_success() {
            return Err(error_from_response(&self.name, response, THROTTLE_STATUSES).await);
        }
        Ok(response)
    }
}

/// Pull the delta text out of one streaming chunk.
fn extract_delta(data: &str) -> Result<Extracted, ProviderError> {
    if data.trim() == "[DONE]" {
        return Ok(Extracted::Done);
    }
    let chunk: StreamChunk = serde_json::from_str(data)
        .map_err(|e| ProviderError::InvalidResponse(format!("bad stream chunk: {}", e)))?;
    let text: String = chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.content)
        .collect();
    if text.is_empty() {
        Ok(Extracted::Skip)
    } else {
        Ok(Extracted::Text(text))
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    fn models(&self) -> &[String] {
        &self.models
    }

    fn estimate_cost(&self, messages: &[Message], config: &ModelConfig) -> f64 {
        let prompt = prompt_tokens(messages, |t| self.count_tokens(t));
        let completion = config.max_tokens.unwrap_or(DEFAULT_COMPLETION_TOKENS);
        self.pricing.estimate(prompt, completion)
    }

    async fn generate(
        &self,
        messages: &[Message],
        config: &ModelConfig,
    ) -> Result<Response, ProviderError> {
        let response = self.send(messages, config, false).await?;
        let body: ChatResponse = response.json().await.map_err(|e| {
            ProviderError::InvalidResponse(format!("{}: {}", self.name, e))
        })?;

        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                ProviderError::InvalidResponse(format!("{}: response had no content", self.name))
            })?;

        let usage = match body.usage {
            Some(u) => TokenUsage::new(u.prompt_tokens, u.completion_tokens),
            None => TokenUsage::new(
                prompt_tokens(messages, |t| self.count_tokens(t)),
                self.count_tokens(&content),
            ),
        };

        Ok(Response {
            content,
            model: body.model.unwrap_or_else(|| config.model.clone()),
            provider: self.name.clone(),
            usage,
        })
    }

    async fn stream(
        &self,
        messages: &[Message],
        config: &ModelConfig,
    ) -> Result<TextStream, ProviderError> {
        let response = self.send(messages, config, true).await?;
        Ok(sse::text_stream(response.bytes_stream(), extract_delta))
    }
}
