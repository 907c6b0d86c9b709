//! Configuration parsing and validation for modelrelay.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::health::{
    HealthSettings, DEFAULT_COOLDOWN, DEFAULT_LATENCY_WINDOW, DEFAULT_TRIP_THRESHOLD,
};
use crate::policy::RoutingPolicy;
use crate::provider::{Capability, Pricing};
use crate::router::{Backoff, RouterSettings};

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub router: RouterConfig,
    /// Policy used when the caller does not name one.
    #[serde(default)]
    pub policy: RoutingPolicy,
    /// Named policies, selectable per request.
    #[serde(default)]
    pub policies: BTreeMap<String, RoutingPolicy>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Health tracking, backoff and deadline settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Consecutive errors beyond this open the circuit.
    pub trip_threshold: u32,
    /// Seconds before an open circuit is tried again. 0 means manual reset only.
    pub circuit_cooldown_secs: u64,
    /// Number of latency samples kept per provider.
    pub latency_window: usize,
    /// Deadline for a whole route call, retries and pauses included.
    /// Zero or absent means no deadline.
    pub request_timeout_secs: Option<f64>,
    pub backoff: Backoff,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            trip_threshold: DEFAULT_TRIP_THRESHOLD,
            circuit_cooldown_secs: DEFAULT_COOLDOWN.as_secs(),
            latency_window: DEFAULT_LATENCY_WINDOW,
            request_timeout_secs: None,
            backoff: Backoff::default(),
        }
    }
}

impl RouterConfig {
    pub fn settings(&self) -> RouterSettings {
        let cooldown = match self.circuit_cooldown_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        RouterSettings {
            health: HealthSettings {
                trip_threshold: self.trip_threshold,
                cooldown,
                latency_window: self.latency_window,
            },
            backoff: self.backoff.clone(),
            request_timeout: self
                .request_timeout_secs
                .filter(|s| *s > 0.0)
                .and_then(|s| Duration::try_from_secs_f64(s).ok()),
        }
    }
}

/// Placeholder printed wherever an API key would otherwise appear.
const REDACTED: &str = "<redacted>";

/// A provider credential. Never printed or serialised; read it with
/// [`ApiKey::expose_secret`] at the point it goes on the wire.
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(REDACTED)
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(REDACTED)
    }
}

impl Serialize for ApiKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED)
    }
}

impl<'de> Deserialize<'de> for ApiKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::from)
    }
}

impl From<String> for ApiKey {
    fn from(key: String) -> Self {
        Self(SecretString::from(key))
    }
}

impl From<&str> for ApiKey {
    fn from(key: &str) -> Self {
        Self::from(key.to_string())
    }
}

/// Where a provider's API key came from, reported by `modelrelay check`.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySource {
    /// Written into the config file as-is
    Literal,
    /// Built from `${VAR}` references
    EnvExpanded,
    /// Read from `MODELRELAY_<NAME>_API_KEY`; holds the variable name
    Convention(String),
    /// No key at all
    None,
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Literal => f.write_str("literal"),
            KeySource::EnvExpanded => f.write_str("expanded from environment"),
            KeySource::Convention(var) => write!(f, "from {}", var),
            KeySource::None => f.write_str("missing"),
        }
    }
}

/// Which wire protocol a provider speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Any OpenAI-compatible `/chat/completions` endpoint
    #[default]
    OpenAi,
    Anthropic,
    /// In-process scripted provider
    Mock,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Mock => "mock",
        }
    }

    fn needs_url(&self) -> bool {
        !matches!(self, ProviderKind::Mock)
    }
}

/// Provider configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Unique name; also the registry and health key
    pub name: String,
    #[serde(default)]
    pub kind: ProviderKind,
    /// Base URL (e.g., "https://api.openai.com/v1")
    #[serde(default)]
    pub url: String,
    pub api_key: Option<ApiKey>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<Capability>,
    /// USD per 1000 prompt tokens
    #[serde(default)]
    pub input_rate: f64,
    /// USD per 1000 completion tokens
    #[serde(default)]
    pub output_rate: f64,
    /// USD per request
    #[serde(default)]
    pub base_fee: f64,
    /// Position under the failover strategy; lower goes first.
    #[serde(default)]
    pub fallback_order: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Canned reply for `kind = "mock"`.
    pub reply: Option<String>,
}

fn default_capabilities() -> Vec<Capability> {
    vec![Capability::TextGeneration]
}

fn default_timeout_secs() -> u64 {
    60
}

impl ProviderConfig {
    /// A provider entry with every optional field at its default.
    pub fn named(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ProviderKind::default(),
            url: url.into(),
            api_key: None,
            models: Vec::new(),
            capabilities: default_capabilities(),
            input_rate: 0.0,
            output_rate: 0.0,
            base_fee: 0.0,
            fallback_order: 0,
            timeout_secs: default_timeout_secs(),
            reply: None,
        }
    }

    pub fn pricing(&self) -> Pricing {
        Pricing {
            input_rate: self.input_rate,
            output_rate: self.output_rate,
            base_fee: self.base_fee,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, without touching the environment.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::parse_str(&read_file(path.as_ref())?)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a named policy. `None` selects the default policy.
    pub fn policy(&self, name: Option<&str>) -> Option<&RoutingPolicy> {
        match name {
            None => Some(&self.policy),
            Some(name) => self.policies.get(name),
        }
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() {
            tracing::warn!("No providers configured - every route call will fail");
        }

        if self.router.latency_window == 0 {
            return Err(ConfigError::Validation(
                "router.latency_window must be at least 1".to_string(),
            ));
        }
        if let Some(secs) = self.router.request_timeout_secs {
            if !is_duration_secs(secs) {
                return Err(ConfigError::Validation(format!(
                    "router.request_timeout_secs must be a non-negative number of seconds, got {}",
                    secs
                )));
            }
        }

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if provider.name.is_empty() {
                return Err(ConfigError::Validation(
                    "Provider with empty name".to_string(),
                ));
            }
            if !seen.insert(provider.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate provider name '{}'",
                    provider.name
                )));
            }
            if provider.kind.needs_url() && provider.url.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Provider '{}' has empty URL",
                    provider.name
                )));
            }
            if provider.timeout_secs == 0 {
                return Err(ConfigError::Validation(format!(
                    "Provider '{}' has timeout_secs = 0",
                    provider.name
                )));
            }
            for (field, value) in [
                ("input_rate", provider.input_rate),
                ("output_rate", provider.output_rate),
                ("base_fee", provider.base_fee),
            ] {
                if value < 0.0 || value.is_nan() {
                    return Err(ConfigError::Validation(format!(
                        "Provider '{}' has negative {}",
                        provider.name, field
                    )));
                }
            }
        }

        let named = self.policies.iter().map(|(n, p)| (n.as_str(), p));
        for (name, policy) in std::iter::once(("default", &self.policy)).chain(named) {
            if policy.max_cost_threshold < 0.0 || policy.max_cost_threshold.is_nan() {
                return Err(ConfigError::Validation(format!(
                    "Policy '{}' has negative max_cost_threshold",
                    name
                )));
            }
            if !is_duration_secs(policy.max_latency_threshold_secs) {
                return Err(ConfigError::Validation(format!(
                    "Policy '{}' has out-of-range max_latency_threshold_secs {}",
                    name, policy.max_latency_threshold_secs
                )));
            }
        }

        Ok(())
    }
}

/// Finite, non-negative and small enough to become a [`Duration`].
fn is_duration_secs(secs: f64) -> bool {
    secs >= 0.0 && Duration::try_from_secs_f64(secs).is_ok()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("api_key of provider '{provider}' references '{var}': {message}")]
    EnvVar {
        var: String,
        provider: String,
        message: String,
    },
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })
}

/// Replace every `${VAR}` in `input` with `lookup(VAR)`.
///
/// A `$` not followed by `{` is kept as-is. An unterminated reference, an
/// empty name, or a variable `lookup` cannot resolve is an error.
fn expand_env_vars_with<F>(
    input: &str,
    provider_name: &str,
    lookup: F,
) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let env_error = |var: &str, message: &str| ConfigError::EnvVar {
        var: var.to_string(),
        provider: provider_name.to_string(),
        message: message.to_string(),
    };

    let mut expanded = String::with_capacity(input.len());
    let mut rest = input;
    while let Some((literal, reference)) = rest.split_once("${") {
        expanded.push_str(literal);
        let (var, tail) = reference
            .split_once('}')
            .ok_or_else(|| env_error("${", "unclosed reference"))?;
        if var.is_empty() {
            return Err(env_error(var, "empty variable name"));
        }
        let value = lookup(var).ok_or_else(|| env_error(var, "variable is not set"))?;
        expanded.push_str(&value);
        rest = tail;
    }
    expanded.push_str(rest);
    Ok(expanded)
}

/// Derive the convention-based env var name for a provider.
///
/// - "openai" -> "MODELRELAY_OPENAI_API_KEY"
/// - "local-llama" -> "MODELRELAY_LOCAL_LLAMA_API_KEY"
pub fn convention_env_var_name(provider_name: &str) -> String {
    let upper_snake = provider_name.to_uppercase().replace(['-', ' ', '.'], "_");
    format!("MODELRELAY_{}_API_KEY", upper_snake)
}

impl Config {
    /// Resolve every provider's API key in place.
    ///
    /// - `${VAR}` references are expanded through `lookup` (`EnvExpanded`)
    /// - other literal keys are kept (`Literal`)
    /// - absent keys fall back to the convention variable (`Convention`), or `None`
    pub fn resolve_api_keys_with<F>(
        &mut self,
        lookup: F,
    ) -> Result<Vec<(String, KeySource)>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut key_sources = Vec::with_capacity(self.providers.len());

        for provider in &mut self.providers {
            let source = match provider.api_key.take() {
                Some(key) if key.expose_secret().contains("${") => {
                    let expanded =
                        expand_env_vars_with(key.expose_secret(), &provider.name, &lookup)?;
                    provider.api_key = Some(ApiKey::from(expanded));
                    KeySource::EnvExpanded
                }
                Some(key) => {
                    provider.api_key = Some(key);
                    KeySource::Literal
                }
                None => {
                    let var_name = convention_env_var_name(&provider.name);
                    match lookup(&var_name) {
                        Some(value) => {
                            provider.api_key = Some(ApiKey::from(value));
                            KeySource::Convention(var_name)
                        }
                        None => KeySource::None,
                    }
                }
            };
            key_sources.push((provider.name.clone(), source));
        }

        Ok(key_sources)
    }

    /// Load configuration from a TOML file with environment variable expansion.
    ///
    /// Returns the config and per-provider key source information.
    pub fn from_file_with_env(
        path: impl AsRef<Path>,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        let mut config = Self::parse_str(&read_file(path.as_ref())?)?;
        let key_sources = config.resolve_api_keys_with(|name| std::env::var(name).ok())?;
        Ok((config, key_sources))
    }
}
