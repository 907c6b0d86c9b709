//! Provider selection logic.
//!
//! Selection happens in three steps:
//! 1. eligibility filtering (circuit breaker, capabilities, cost ceiling)
//! 2. strategy-specific ordering
//! 3. preferred providers moved to the front

use std::cmp::Ordering;
use std::sync::Arc;

use rand::Rng;

use super::retry::Candidate;
use crate::error::Exclusions;
use crate::health::{Admission, HealthTracker};
use crate::policy::{RoutingPolicy, Strategy};
use crate::provider::{Message, ModelConfig, Provider};

/// Floor applied to latencies before inverting them into weights.
const MIN_WEIGHT_LATENCY_SECS: f64 = 0.001;

/// One entry in the router's registry.
#[derive(Debug, Clone)]
pub(crate) struct Registration {
    pub provider: Arc<dyn Provider>,
    pub fallback_order: u32,
}

impl Registration {
    pub fn name(&self) -> &str {
        self.provider.name()
    }
}

/// Whether a selection pass is about to dispatch a request or only report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Selection {
    /// Read-only; leaves trial slots and the round-robin cursor alone.
    Preview,
    /// Claims half-open trial slots for the candidates it returns.
    Dispatch,
}

/// Compute the eligible subset of `registrations`, in registration order.
///
/// Returns the exclusion counts when nothing survives.
pub(crate) fn eligible(
    registrations: &[Registration],
    health: &HealthTracker,
    messages: &[Message],
    config: &ModelConfig,
    policy: &RoutingPolicy,
    selection: Selection,
) -> Result<Vec<Candidate>, Exclusions> {
    let mut exclusions = Exclusions {
        registered: registrations.len(),
        ..Default::default()
    };
    let mut candidates = Vec::with_capacity(registrations.len());

    for reg in registrations {
        let name = reg.name();

        let admission = match selection {
            Selection::Dispatch => health.admit(name),
            Selection::Preview if health.is_circuit_open(name) => Admission::Rejected,
            Selection::Preview => Admission::Allowed,
        };
        let trial = match admission {
            Admission::Allowed => None,
            Admission::Trial(permit) => Some(Arc::new(permit)),
            Admission::Rejected => {
                tracing::debug!(provider = %name, "Excluded: circuit open");
                exclusions.circuit_open += 1;
                continue;
            }
        };

        let capabilities = reg.provider.capabilities();
        if !policy
            .required_capabilities
            .iter()
            .all(|c| capabilities.contains(c))
        {
            tracing::debug!(provider = %name, "Excluded: missing required capabilities");
            exclusions.missing_capabilities += 1;
            continue;
        }

        let cost = reg.provider.estimate_cost(messages, config);
        if cost > policy.max_cost_threshold {
            tracing::debug!(
                provider = %name,
                estimated_cost = cost,
                max_cost = policy.max_cost_threshold,
                "Excluded: over cost threshold"
            );
            exclusions.over_budget += 1;
            continue;
        }

        candidates.push(Candidate {
            name: name.to_string(),
            provider: reg.provider.clone(),
            fallback_order: reg.fallback_order,
            estimated_cost: cost,
            average_latency: health.average_latency(name),
            trial,
        });
    }

    if candidates.is_empty() {
        Err(exclusions)
    } else {
        Ok(candidates)
    }
}

/// Order eligible candidates according to `strategy`.
///
/// `cursor` is the round-robin position; `rng` drives load balancing.
pub(crate) fn order<R: Rng + ?Sized>(
    mut candidates: Vec<Candidate>,
    strategy: Strategy,
    cursor: usize,
    rng: &mut R,
) -> Vec<Candidate> {
    match strategy {
        Strategy::CostOptimized => {
            candidates.sort_by(|a, b| a.estimated_cost.total_cmp(&b.estimated_cost));
        }
        // `None < Some(_)`, so providers without history sort first.
        Strategy::LatencyOptimized => candidates.sort_by_key(|c| c.average_latency),
        Strategy::CapabilityBased => {}
        Strategy::RoundRobin => {
            if !candidates.is_empty() {
                let shift = cursor % candidates.len();
                candidates.rotate_left(shift);
            }
        }
        Strategy::Failover => candidates.sort_by_key(|c| c.fallback_order),
        Strategy::LoadBalanced => candidates = weighted_shuffle(candidates, rng),
    }
    candidates
}

/// Move preferred providers to the front, in the order they are listed.
pub(crate) fn apply_preferences(candidates: Vec<Candidate>, preferred: &[String]) -> Vec<Candidate> {
    if preferred.is_empty() {
        return candidates;
    }
    let mut rest = candidates;
    let mut front = Vec::with_capacity(rest.len());
    for name in preferred {
        if let Some(pos) = rest.iter().position(|c| &c.name == name) {
            front.push(rest.remove(pos));
        }
    }
    front.extend(rest);
    front
}

/// Selection weight: inverse of average latency in seconds.
///
/// Providers without samples get the mean weight of those with samples, or
/// 1.0 when nobody has history yet.
fn weights(candidates: &[Candidate]) -> Vec<f64> {
    let known: Vec<f64> = candidates
        .iter()
        .filter_map(|c| c.average_latency)
        .map(|l| 1.0 / l.as_secs_f64().max(MIN_WEIGHT_LATENCY_SECS))
        .collect();
    let fallback = if known.is_empty() {
        1.0
    } else {
        known.iter().sum::<f64>() / known.len() as f64
    };
    candidates
        .iter()
        .map(|c| match c.average_latency {
            Some(l) => 1.0 / l.as_secs_f64().max(MIN_WEIGHT_LATENCY_SECS),
            None => fallback,
        })
        .collect()
}

/// Weighted random permutation (Efraimidis-Spirakis).
///
/// Each item draws `ln(u) / w` with `u` uniform in (0, 1]; sorting by that key
/// descending yields a permutation where heavier items tend to come first.
fn weighted_shuffle<R: Rng + ?Sized>(candidates: Vec<Candidate>, rng: &mut R) -> Vec<Candidate> {
    let weights = weights(&candidates);
    let mut keyed: Vec<(f64, Candidate)> = candidates
        .into_iter()
        .zip(weights)
        .map(|(c, w)| {
            let u = 1.0 - rng.gen::<f64>();
            (u.ln() / w, c)
        })
        .collect();
    keyed.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
    keyed.into_iter().map(|(_, c)| c).collect()
}
