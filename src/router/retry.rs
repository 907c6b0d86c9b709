//! Retry and failover execution.
//!
//! This module encapsulates the attempt loop shared by `route` and
//! `route_stream`:
//! - Up to `retry_attempts` attempts per provider, with backoff between them
//! - Failover to the next candidate once a provider is exhausted (if enabled)
//! - Every outcome is recorded into the [`HealthTracker`]
//! - Exhaustion yields [`Error::AllProvidersFailed`] with one terminal error
//!   per attempted provider

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tokio::time::Instant;

use crate::error::{Error, ProviderError, ProviderFailure, Result};
use crate::health::{HealthTracker, TrialPermit};
use crate::policy::RoutingPolicy;
use crate::provider::Provider;

/// Exponential backoff between attempts against the same provider.
///
/// Delay for retry `n` (0-based) is `base * multiplier^n`, capped at `max`.
/// With jitter enabled the delay is drawn uniformly from `[delay/2, delay]`.
/// A rate-limit `retry_after` hint raises the delay, still subject to the cap.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Backoff {
    pub base_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_ms: 500,
            max_ms: 8_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl Backoff {
    /// No pause between attempts.
    pub fn none() -> Self {
        Self {
            base_ms: 0,
            max_ms: 0,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Fixed delay between attempts.
    pub fn fixed(delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            base_ms: ms,
            max_ms: ms,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Delay before retry number `retry` (0 = first retry).
    pub fn delay(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let cap = Duration::from_millis(self.max_ms);
        let exp = self.multiplier.max(1.0).powi(retry.min(32) as i32);
        let raw_ms = (self.base_ms as f64 * exp).min(self.max_ms as f64);
        let mut delay = Duration::from_millis(raw_ms as u64);

        if self.jitter && !delay.is_zero() {
            let lower = delay / 2;
            let spread = (delay - lower).as_millis() as u64;
            let extra = rand::thread_rng().gen_range(0..=spread);
            delay = lower + Duration::from_millis(extra);
        }

        if let Some(hint) = hint {
            delay = delay.max(hint);
        }
        delay.min(cap)
    }
}

/// A provider selected for this request, in attempt order.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub name: String,
    pub provider: Arc<dyn Provider>,
    pub fallback_order: u32,
    pub estimated_cost: f64,
    pub average_latency: Option<Duration>,
    /// Held while this request is the half-open trial.
    pub(crate) trial: Option<Arc<TrialPermit>>,
}

impl Candidate {
    /// Whether this request holds the provider's half-open trial slot.
    pub fn is_trial(&self) -> bool {
        self.trial.is_some()
    }
}

/// Run `attempt` against each candidate in order until one succeeds.
///
/// The closure receives the candidate and must return a future that owns what
/// it needs (typically a cloned `Arc<dyn Provider>`). Returns the value and
/// the name of the provider that produced it.
pub(crate) async fn execute_with_failover<T, F, Fut>(
    candidates: &[Candidate],
    policy: &RoutingPolicy,
    backoff: &Backoff,
    health: &HealthTracker,
    mut attempt: F,
) -> Result<(T, String)>
where
    F: FnMut(&Candidate) -> Fut,
    Fut: Future<Output = std::result::Result<T, ProviderError>>,
{
    let attempts_per_provider = policy.attempts_per_provider();
    let mut failures: Vec<ProviderFailure> = Vec::new();

    for candidate in candidates {
        let mut last_error: Option<ProviderError> = None;
        let mut attempts = 0;

        for n in 1..=attempts_per_provider {
            attempts = n;
            tracing::debug!(provider = %candidate.name, attempt = n, "Attempting provider");
            let started = Instant::now();

            match attempt(candidate).await {
                Ok(value) => {
                    let latency = started.elapsed();
                    health.record_success(&candidate.name, latency);
                    tracing::info!(
                        provider = %candidate.name,
                        attempt = n,
                        latency_ms = latency.as_millis() as u64,
                        "Provider succeeded"
                    );
                    return Ok((value, candidate.name.clone()));
                }
                Err(err) => {
                    health.record_error(&candidate.name, &err);
                    tracing::warn!(
                        provider = %candidate.name,
                        attempt = n,
                        max_attempts = attempts_per_provider,
                        error_type = err.error_type(),
                        error = %err,
                        "Provider attempt failed"
                    );

                    if candidate.is_trial() {
                        tracing::debug!(provider = %candidate.name, "Trial failed, not retrying");
                        last_error = Some(err);
                        break;
                    }

                    if n < attempts_per_provider {
                        let pause = backoff.delay(n - 1, err.retry_after());
                        if !pause.is_zero() {
                            tokio::time::sleep(pause).await;
                        }
                    }
                    last_error = Some(err);
                }
            }
        }

        if let Some(error) = last_error {
            failures.push(ProviderFailure {
                provider: candidate.name.clone(),
                attempts,
                error,
            });
        }

        if !policy.fallback_enabled {
            tracing::debug!(provider = %candidate.name, "Fallback disabled, not failing over");
            break;
        }
    }

    Err(Error::AllProvidersFailed { failures })
}
