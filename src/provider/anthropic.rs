//! Anthropic Messages API provider.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header;
use serde::{Deserialize, Serialize};

use super::sse::{self, Extracted};
use super::{
    error_from_response, prompt_tokens, Capability, Message, ModelConfig, Pricing, Provider,
    Response, Role, TextStream, TokenUsage, DEFAULT_COMPLETION_TOKENS,
};
use crate::config::{ApiKey, ProviderConfig};
use crate::error::ProviderError;

const API_VERSION: &str = "2023-06-01";

/// 529 is Anthropic's "overloaded" status; treated like 429.
const THROTTLE_STATUSES: &[u16] = &[429, 529];

#[derive(Debug)]
pub struct AnthropicProvider {
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
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop_sequences: &'a [String],
    stream: bool,
}

#[derive(Serialize, Debug, PartialEq)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    model: Option<String>,
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    error: Option<StreamError>,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct StreamError {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

/// Split system messages out of the conversation.
///
/// The Messages API takes the system prompt as a separate field and only
/// accepts `user` and `assistant` turns; tool output is sent as a user turn.
fn split_system(messages: &[Message]) -> (Option<String>, Vec<WireMessage<'_>>) {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    let turns = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| WireMessage {
            role: match m.role {
                Role::Assistant => "assistant",
                _ => "user",
            },
            content: &m.content,
        })
        .collect();
    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    (system, turns)
}

fn extract_event(data: &str) -> Result<Extracted, ProviderError> {
    let event: StreamEvent = serde_json::from_str(data)
        .map_err(|e| ProviderError::InvalidResponse(format!("bad stream event: {}", e)))?;
    match event.kind.as_str() {
        "content_block_delta" => match event.delta.and_then(|d| d.text) {
            Some(text) if !text.is_empty() => Ok(Extracted::Text(text)),
            _ => Ok(Extracted::Skip),
        },
        "message_stop" => Ok(Extracted::Done),
        "error" => {
            let err = event.error.unwrap_or(StreamError {
                kind: String::new(),
                message: "unknown stream error".to_string(),
            });
            if err.kind == "overloaded_error" || err.kind == "rate_limit_error" {
                Err(ProviderError::rate_limited(err.message))
            } else {
                Err(ProviderError::Unavailable(err.message))
            }
        }
        _ => Ok(Extracted::Skip),
    }
}

impl AnthropicProvider {
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
        let url = format!("{}/messages", self.url.trim_end_matches('/'));
        let (system, turns) = split_system(messages);
        let body = MessagesRequest {
            model: &config.model,
            max_tokens: config.max_tokens.unwrap_or(DEFAULT_COMPLETION_TOKENS),
            system,
            messages: turns,
            temperature: config.temperature,
            top_p: config.top_p,
            stop_sequences: &config.stop,
            stream,
        };

        let mut request = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .header("anthropic-version", API_VERSION)
            .json(&body);
        if !stream {
            request = request.timeout(self.timeout);
        }
        if let Some(api_key) = &self.api_key {
            request = request.header("x-api-key", api_key.expose_secret());
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

#[async_trait]
impl Provider for AnthropicProvider {
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
        let body: MessagesResponse = response.json().await.map_err(|e| {
            ProviderError::InvalidResponse(format!("{}: {}", self.name, e))
        })?;

        let content: String = body
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text)
            .collect();
        if content.is_empty() {
            return Err(ProviderError::InvalidResponse(format!(
                "{}: response had no text content",
                self.name
            )));
        }

        let usage = match body.usage {
            Some(u) => TokenUsage::new(u.input_tokens, u.output_tokens),
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
        Ok(sse::text_stream(response.bytes_stream(), extract_event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_system_lifts_system_messages() {
        let messages = vec![
            Message::system("be brief"),
            Message::user("hi"),
            Message::assistant("hello"),
            Message::new(Role::Tool, "42"),
            Message::system("no emoji"),
        ];
        let (system, turns) = split_system(&messages);
        assert_eq!(system.as_deref(), Some("be brief\n\nno emoji"));
        assert_eq!(
            turns,
            vec![
                WireMessage {
                    role: "user",
                    content: "hi"
                },
                WireMessage {
                    role: "assistant",
                    content: "hello"
                },
                WireMessage {
                    role: "user",
                    content: "42"
                },
            ]
        );
    }

    #[test]
    fn test_split_system_without_system() {
        let messages = vec![Message::user("hi")];
        let (system, turns) = split_system(&messages);
        assert!(system.is_none());
        assert_eq!(turns.len(), 1);
    }

    #[test]
    fn test_extract_event() {
        assert_eq!(
            extract_event(r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hi"}}"#)
                .unwrap(),
            Extracted::Text("Hi".to_string())
        );
        assert_eq!(
            extract_event(r#"{"type":"message_start","message":{}}"#).unwrap(),
            Extracted::Skip
        );
        assert_eq!(
            extract_event(r#"{"type":"message_stop"}"#).unwrap(),
            Extracted::Done
        );

        let overloaded =
            extract_event(r#"{"type":"error","error":{"type":"overloaded_error","message":"busy"}}"#);
        assert!(overloaded.unwrap_err().is_rate_limit());

        let other = extract_event(r#"{"type":"error","error":{"type":"api_error","message":"x"}}"#);
        assert!(matches!(other, Err(ProviderError::Unavailable(_))));
    }
}
