//! Integration tests for circuit breaker routing behavior.
//!
//! Verifies that:
//! - Requests skip providers with open circuits
//! - An open circuit is tried again once the cooldown expires
//! - A failed trial re-opens the circuit, a successful one closes it
//! - Only one request at a time tests a half-open circuit
//! - Operator reset and re-registration bring a provider back immediately
//! - With automatic recovery disabled, a tripped provider stays out

use std::sync::Arc;
use std::time::Duration;

use modelrelay::health::HealthSettings;
use modelrelay::provider::{Scripted, ScriptedProvider};
use modelrelay::router::Backoff;
use modelrelay::{
    CircuitState, Error, Message, ModelConfig, Router, RouterSettings, RoutingPolicy, Strategy,
};

/// Small threshold so tests trip quickly: the third consecutive error opens.
const TRIP_THRESHOLD: u32 = 2;
const COOLDOWN: Duration = Duration::from_secs(30);

fn router(cooldown: Option<Duration>) -> Router {
    Router::new(RouterSettings {
        health: HealthSettings {
            trip_threshold: TRIP_THRESHOLD,
            cooldown,
            ..Default::default()
        },
        backoff: Backoff::none(),
        request_timeout: None,
    })
}

fn hello() -> Vec<Message> {
    vec![Message::user("hello")]
}

/// Failover policy with one attempt per provider, so each route call records
/// exactly one error against a failing primary.
fn failover() -> RoutingPolicy {
    RoutingPolicy::new(Strategy::Failover).with_retry_attempts(1)
}

async fn route_provider(router: &Router) -> String {
    router
        .route(&hello(), &ModelConfig::new("m"), &failover())
        .await
        .expect("route should succeed via the backup")
        .provider
}

/// Register a primary with `script` and an always-healthy backup.
fn setup(router: &Router, script: Vec<Scripted>) -> Arc<ScriptedProvider> {
    let primary = Arc::new(ScriptedProvider::new("primary").with_script(script));
    router.add_provider(primary.clone(), 0);
    router.add_provider(Arc::new(ScriptedProvider::new("backup")), 1);
    primary
}

fn fail(n: usize) -> Vec<Scripted> {
    vec![Scripted::Fail("upstream 500".to_string()); n]
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_skipped_until_cooldown() {
    let router = router(Some(COOLDOWN));
    let mut script = fail(3);
    script.push(Scripted::Reply("recovered".to_string()));
    let primary = setup(&router, script);

    for _ in 0..3 {
        assert_eq!(route_provider(&router).await, "backup");
    }
    assert_eq!(router.health().state("primary"), Some(CircuitState::Open));
    assert_eq!(primary.calls(), 3);

    // Still inside the cooldown: primary is skipped entirely.
    tokio::time::advance(COOLDOWN / 2).await;
    assert_eq!(route_provider(&router).await, "backup");
    assert_eq!(primary.calls(), 3);

    // Cooldown expired: the next request tries primary and succeeds.
    tokio::time::advance(COOLDOWN).await;
    assert_eq!(router.health().state("primary"), Some(CircuitState::HalfOpen));
    assert_eq!(route_provider(&router).await, "primary");
    assert_eq!(router.health().state("primary"), Some(CircuitState::Closed));
    assert_eq!(primary.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_failed_trial_reopens_circuit() {
    let router = router(Some(COOLDOWN));
    let primary = setup(&router, fail(1));

    for _ in 0..3 {
        route_provider(&router).await;
    }
    assert_eq!(router.health().state("primary"), Some(CircuitState::Open));

    tokio::time::advance(COOLDOWN).await;
    assert_eq!(route_provider(&router).await, "backup");
    assert_eq!(primary.calls(), 4);
    assert_eq!(router.health().state("primary"), Some(CircuitState::Open));

    // Fresh cooldown started at the failed trial.
    tokio::time::advance(COOLDOWN / 2).await;
    route_provider(&router).await;
    assert_eq!(primary.calls(), 4);

    let snapshot = router.health().snapshot("primary").unwrap();
    assert_eq!(snapshot.trip_count, 1);
    assert_eq!(snapshot.consecutive_errors, 4);
}

#[tokio::test(start_paused = true)]
async fn test_manual_recovery_only_when_cooldown_disabled() {
    let router = router(None);
    let primary = setup(&router, fail(1));

    for _ in 0..3 {
        route_provider(&router).await;
    }
    tokio::time::advance(Duration::from_secs(3600)).await;
    assert_eq!(router.health().state("primary"), Some(CircuitState::Open));
    route_provider(&router).await;
    assert_eq!(primary.calls(), 3);

    router.health().reset("primary");
    assert_eq!(router.health().state("primary"), Some(CircuitState::Closed));
    route_provider(&router).await;
    assert_eq!(primary.calls(), 4);
}

#[tokio::test]
async fn test_reregistration_resets_health() {
    let router = router(None);
    setup(&router, fail(1));
    for _ in 0..3 {
        route_provider(&router).await;
    }
    assert!(router.health().is_circuit_open("primary"));

    let replacement = Arc::new(ScriptedProvider::new("primary").replying("fresh"));
    router.add_provider(replacement.clone(), 0);

    assert_eq!(router.health().state("primary"), Some(CircuitState::Closed));
    assert_eq!(router.health().total_errors("primary"), Some(0));
    let response = router
        .route(&hello(), &ModelConfig::new("m"), &failover())
        .await
        .unwrap();
    assert_eq!(response.provider, "primary");
    assert_eq!(response.content, "fresh");
    assert_eq!(replacement.calls(), 1);
}

#[tokio::test]
async fn test_all_circuits_open_is_no_eligible() {
    let router = router(Some(COOLDOWN));
    setup(&router, fail(1));
    router.health().trip("primary");
    router.health().trip("backup");

    let err = router
        .route(&hello(), &ModelConfig::new("m"), &failover())
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::NoEligibleProvider(ref e) if e.circuit_open == 2),
        "unexpected: {:?}",
        err
    );
}

#[tokio::test]
async fn test_trip_not_retroactive_within_request() {
    // Five attempts against a failing provider trip it on the third, yet the
    // remaining attempts of the same request still run.
    let router = router(None);
    let primary = setup(&router, fail(1));

    let policy = RoutingPolicy::new(Strategy::Failover).with_retry_attempts(5);
    let response = router
        .route(&hello(), &ModelConfig::new("m"), &policy)
        .await
        .unwrap();

    assert_eq!(response.provider, "backup");
    assert_eq!(primary.calls(), 5);
    assert!(router.health().is_circuit_open("primary"));
}

#[tokio::test(start_paused = true)]
async fn test_half_open_admits_one_concurrent_trial() {
    let router = router(Some(COOLDOWN));
    let primary = Arc::new(
        ScriptedProvider::new("primary")
            .with_script(vec![
                Scripted::Fail("upstream 500".to_string()),
                Scripted::Fail("upstream 500".to_string()),
                Scripted::Fail("upstream 500".to_string()),
                Scripted::Reply("recovered".to_string()),
            ])
            .with_latency(Duration::from_millis(200)),
    );
    router.add_provider(primary.clone(), 0);
    router.add_provider(Arc::new(ScriptedProvider::new("backup")), 1);

    for _ in 0..3 {
        assert_eq!(route_provider(&router).await, "backup");
    }
    assert_eq!(router.health().state("primary"), Some(CircuitState::Open));
    assert_eq!(primary.calls(), 3);

    tokio::time::advance(COOLDOWN).await;
    let policy = RoutingPolicy::new(Strategy::Failover).with_retry_attempts(3);
    let model = ModelConfig::new("m");
    let messages = hello();
    let (first, second) = tokio::join!(
        router.route(&messages, &model, &policy),
        router.route(&messages, &model, &policy),
    );

    let mut served: Vec<String> = vec![first.unwrap().provider, second.unwrap().provider];
    served.sort();
    assert_eq!(served, vec!["backup", "primary"]);
    assert_eq!(primary.calls(), 4);
    assert_eq!(router.health().state("primary"), Some(CircuitState::Closed));
}

#[tokio::test(start_paused = true)]
async fn test_failed_trial_moves_straight_to_backup() {
    let router = router(Some(COOLDOWN));
    let primary = setup(&router, fail(1));
    for _ in 0..3 {
        route_provider(&router).await;
    }
    tokio::time::advance(COOLDOWN).await;

    // Three attempts allowed per provider, yet the trial gets only one.
    let policy = RoutingPolicy::new(Strategy::Failover).with_retry_attempts(3);
    let response = router
        .route(&hello(), &ModelConfig::new("m"), &policy)
        .await
        .unwrap();
    assert_eq!(response.provider, "backup");
    assert_eq!(primary.calls(), 4);
    assert_eq!(router.health().state("primary"), Some(CircuitState::Open));
}
