//! Integration tests for the full Config::from_file_with_env pipeline.
//!
//! These tests exercise the end-to-end flow: TOML file -> parse -> env var
//! expansion -> final Config with KeySource metadata -> Router.
//!
//! Each test uses unique env var names to avoid parallel test interference.

use std::io::Write;

use modelrelay::config::{Config, ConfigError, KeySource};
use modelrelay::{Message, ModelConfig, Router};
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp config");
    file.write_all(content.as_bytes())
        .expect("Failed to write temp config");
    file
}

fn source_for<'a>(sources: &'a [(String, KeySource)], name: &str) -> &'a KeySource {
    sources
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, s)| s)
        .unwrap_or_else(|| panic!("Key source for '{}' should exist", name))
}

/// `${VAR}` references in api_key are expanded from the environment.
#[test]
fn test_env_expansion_resolves_var() {
    let var_name = "MODELRELAY_TEST_E2E_EXPAND";
    unsafe { std::env::set_var(var_name, "sk-resolved") };

    let file = write_config(&format!(
        r#"
[[providers]]
name = "env-test"
url = "https://example.com/v1"
api_key = "${{{}}}"
"#,
        var_name
    ));

    let (config, key_sources) = Config::from_file_with_env(file.path()).unwrap();
    assert_eq!(
        config.providers[0].api_key.as_ref().unwrap().expose_secret(),
        "sk-resolved"
    );
    assert_eq!(*source_for(&key_sources, "env-test"), KeySource::EnvExpanded);

    unsafe { std::env::remove_var(var_name) };
}

/// Missing env vars produce errors naming both the variable and the provider.
#[test]
fn test_env_expansion_missing_var_errors() {
    let var_name = "MODELRELAY_TEST_E2E_DEFINITELY_MISSING";
    unsafe { std::env::remove_var(var_name) };

    let file = write_config(&format!(
        r#"
[[providers]]
name = "missing-test"
url = "https://example.com/v1"
api_key = "${{{}}}"
"#,
        var_name
    ));

    let err = Config::from_file_with_env(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::EnvVar { .. }));
    let message = err.to_string();
    assert!(message.contains(var_name), "{}", message);
    assert!(message.contains("missing-test"), "{}", message);
}

/// An absent api_key is discovered through MODELRELAY_<NAME>_API_KEY.
#[test]
fn test_env_convention_discovers_key() {
    let var_name = "MODELRELAY_CONV_PROVIDER_API_KEY";
    unsafe { std::env::set_var(var_name, "sk-convention") };

    let file = write_config(
        r#"
[[providers]]
name = "conv-provider"
url = "https://example.com/v1"
"#,
    );

    let (config, key_sources) = Config::from_file_with_env(file.path()).unwrap();
    assert_eq!(
        config.providers[0].api_key.as_ref().unwrap().expose_secret(),
        "sk-convention"
    );
    assert_eq!(
        *source_for(&key_sources, "conv-provider"),
        KeySource::Convention(var_name.to_string())
    );

    unsafe { std::env::remove_var(var_name) };
}

/// No api_key and no convention var yields KeySource::None.
#[test]
fn test_env_no_key_produces_none_source() {
    unsafe { std::env::remove_var("MODELRELAY_NOKEY_PROVIDER_API_KEY") };

    let file = write_config(
        r#"
[[providers]]
name = "nokey-provider"
url = "https://example.com/v1"
"#,
    );

    let (config, key_sources) = Config::from_file_with_env(file.path()).unwrap();
    assert!(config.providers[0].api_key.is_none());
    assert_eq!(*source_for(&key_sources, "nokey-provider"), KeySource::None);
}

/// A literal api_key passes through unchanged.
#[test]
fn test_env_literal_key_passthrough() {
    let file = write_config(
        r#"
[[providers]]
name = "literal-test"
url = "https://example.com/v1"
api_key = "sk-literal"
"#,
    );

    let (config, key_sources) = Config::from_file_with_env(file.path()).unwrap();
    assert_eq!(
        config.providers[0].api_key.as_ref().unwrap().expose_secret(),
        "sk-literal"
    );
    assert_eq!(*source_for(&key_sources, "literal-test"), KeySource::Literal);
}

#[test]
fn test_missing_file_is_io_error() {
    let err = Config::from_file_with_env("/nonexistent/modelrelay.toml").unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
    assert!(err.to_string().contains("/nonexistent/modelrelay.toml"));
}

/// A mock-only config file drives a working router end to end.
#[tokio::test]
async fn test_config_file_to_routed_response() {
    let file = write_config(
        r#"
[router]
trip_threshold = 2

[router.backoff]
base_ms = 0

[policy]
strategy = "failover"

[policies.local-first]
preferred_providers = ["offline"]

[[providers]]
name = "primary"
kind = "mock"
reply = "from primary"
fallback_order = 0

[[providers]]
name = "offline"
kind = "mock"
reply = "from offline"
fallback_order = 5
"#,
    );

    let (config, _) = Config::from_file_with_env(file.path()).unwrap();
    let router = Router::from_config(&config).unwrap();
    let messages = vec![Message::user("ping")];
    let model = ModelConfig::new("mock-model");

    let response = router
        .route(&messages, &model, config.policy(None).unwrap())
        .await
        .unwrap();
    assert_eq!(response.content, "from primary");

    let response = router
        .route(&messages, &model, config.policy(Some("local-first")).unwrap())
        .await
        .unwrap();
    assert_eq!(response.provider, "offline");
}
