//! Deterministic in-process provider.
//!
//! Replays a script of outcomes, one per call, repeating the last entry once
//! the script runs out. Used by the test suite and selectable as
//! `kind = "mock"` for offline runs of the CLI.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    prompt_tokens, Capability, Message, ModelConfig, Pricing, Provider, Response, TextStream,
    TokenUsage, DEFAULT_COMPLETION_TOKENS,
};
use crate::config::ProviderConfig;
use crate::error::ProviderError;

/// One scripted outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Scripted {
    Reply(String),
    Fail(String),
    RateLimit,
}

#[derive(Debug)]
pub struct ScriptedProvider {
    name: String,
    models: Vec<String>,
    capabilities: Vec<Capability>,
    pricing: Pricing,
    latency: Duration,
    script: Vec<Scripted>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    /// A text-generation provider that always answers `"response from <name>"`.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            script: vec![Scripted::Reply(format!("response from {}", name))],
            name,
            models: vec!["mock-model".to_string()],
            capabilities: vec![Capability::TextGeneration, Capability::Streaming],
            pricing: Pricing::default(),
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn from_config(config: &ProviderConfig) -> Self {
        let reply = config
            .reply
            .clone()
            .unwrap_or_else(|| format!("response from {}", config.name));
        Self {
            name: config.name.clone(),
            models: config.models.clone(),
            capabilities: config.capabilities.clone(),
            pricing: config.pricing(),
            latency: Duration::ZERO,
            script: vec![Scripted::Reply(reply)],
            calls: AtomicUsize::new(0),
        }
    }

    pub fn replying(self, text: impl Into<String>) -> Self {
        self.with_script(vec![Scripted::Reply(text.into())])
    }

    /// Every call fails with a generic provider error.
    pub fn failing(self) -> Self {
        let message = format!("{} is down", self.name);
        self.with_script(vec![Scripted::Fail(message)])
    }

    /// Every call is throttled.
    pub fn rate_limited(self) -> Self {
        self.with_script(vec![Scripted::RateLimit])
    }

    pub fn with_script(mut self, script: Vec<Scripted>) -> Self {
        self.script = script;
        self
    }

    /// Fixed estimated cost per request, in USD.
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.pricing = Pricing {
            input_rate: 0.0,
            output_rate: 0.0,
            base_fee: cost,
        };
        self
    }

    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities = capabilities.into_iter().collect();
        self
    }

    pub fn with_models(mut self, models: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }

    /// Simulated service time per call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Number of generate/stream calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn next_step(&self) -> Scripted {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.script
            .get(n)
            .or_else(|| self.script.last())
            .cloned()
            .unwrap_or_else(|| Scripted::Fail(format!("{} has an empty script", self.name)))
    }

    fn error_for(&self, step: Scripted) -> ProviderError {
        match step {
            Scripted::RateLimit => {
                ProviderError::rate_limited(format!("{} is throttling", self.name))
            }
            Scripted::Fail(message) => ProviderError::Api {
                status: 500,
                message,
            },
            Scripted::Reply(_) => ProviderError::InvalidResponse("unexpected reply".to_string()),
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
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
        match self.next_step().await {
            Scripted::Reply(content) => Ok(Response {
                usage: TokenUsage::new(
                    prompt_tokens(messages, |t| self.count_tokens(t)),
                    self.count_tokens(&content),
                ),
                content,
                model: config.model.clone(),
                provider: self.name.clone(),
            }),
            step => Err(self.error_for(step)),
        }
    }

    async fn stream(
        &self,
        _messages: &[Message],
        _config: &ModelConfig,
    ) -> Result<TextStream, ProviderError> {
        match self.next_step().await {
            Scripted::Reply(content) => {
                let chunks: Vec<Result<String, ProviderError>> = content
                    .split_inclusive(' ')
                    .map(|c| Ok(c.to_string()))
                    .collect();
                Ok(Box::pin(tokio_stream::iter(chunks)))
            }
            step => Err(self.error_for(step)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_script_repeats_last_step() {
        let provider = ScriptedProvider::new("flaky").with_script(vec![
            Scripted::Fail("first".to_string()),
            Scripted::Reply("ok".to_string()),
        ]);
        let config = ModelConfig::new("m");

        assert!(provider.generate(&[], &config).await.is_err());
        assert_eq!(provider.generate(&[], &config).await.unwrap().content, "ok");
        assert_eq!(provider.generate(&[], &config).await.unwrap().content, "ok");
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_rate_limited_provider() {
        let provider = ScriptedProvider::new("busy").rate_limited();
        let err = provider
            .generate(&[Message::user("hi")], &ModelConfig::new("m"))
            .await
            .unwrap_err();
        assert!(err.is_rate_limit());
    }

    #[tokio::test]
    async fn test_stream_chunks_reassemble() {
        let provider = ScriptedProvider::new("talker").replying("one two three");
        let stream = provider.stream(&[], &ModelConfig::new("m")).await.unwrap();
        let chunks: Vec<String> = stream.map(|c| c.unwrap()).collect().await;
        assert_eq!(chunks, vec!["one ", "two ", "three"]);
    }

    #[test]
    fn test_fixed_cost() {
        let provider = ScriptedProvider::new("p").with_cost(0.03);
        let cost = provider.estimate_cost(&[Message::user("hello")], &ModelConfig::new("m"));
        assert!((cost - 0.03).abs() < 1e-12);
    }

    #[test]
    fn test_from_config_uses_reply() {
        let config = ProviderConfig {
            reply: Some("canned".to_string()),
            ..ProviderConfig::named("local", "")
        };
        let provider = ScriptedProvider::from_config(&config);
        assert_eq!(provider.name(), "local");
        assert_eq!(provider.script, vec![Scripted::Reply("canned".to_string())]);
    }
}
