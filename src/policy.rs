//! Per-request routing policy.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::provider::Capability;

/// Selection and ordering algorithm applied to the eligible set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Ascending estimated cost.
    #[default]
    #[serde(alias = "cheapest", alias = "lowest_cost")]
    CostOptimized,
    /// Ascending average latency; providers without samples first.
    #[serde(alias = "fastest", alias = "lowest_latency")]
    LatencyOptimized,
    /// Registration order; filtering on capabilities is the point.
    CapabilityBased,
    /// Registration order rotated by a shared cursor.
    #[serde(alias = "round_robin")]
    RoundRobin,
    /// Ascending fallback order, ties by registration order.
    #[serde(alias = "priority")]
    Failover,
    /// Random permutation weighted by inverse latency.
    #[serde(alias = "random", alias = "load_balanced")]
    LoadBalanced,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::CostOptimized => "cost-optimized",
            Strategy::LatencyOptimized => "latency-optimized",
            Strategy::CapabilityBased => "capability-based",
            Strategy::RoundRobin => "round-robin",
            Strategy::Failover => "failover",
            Strategy::LoadBalanced => "load-balanced",
        }
    }

    /// Parse a strategy name, accepting the same aliases as the config file.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cost-optimized" | "cheapest" | "lowest_cost" => Some(Self::CostOptimized),
            "latency-optimized" | "fastest" | "lowest_latency" => Some(Self::LatencyOptimized),
            "capability-based" => Some(Self::CapabilityBased),
            "round-robin" | "round_robin" => Some(Self::RoundRobin),
            "failover" | "priority" => Some(Self::Failover),
            "load-balanced" | "random" | "load_balanced" => Some(Self::LoadBalanced),
            _ => None,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strategy and constraints for one request. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingPolicy {
    pub strategy: Strategy,
    /// Providers estimating above this cost (USD) are ineligible.
    pub max_cost_threshold: f64,
    /// Advisory only; never used to exclude a provider.
    pub max_latency_threshold_secs: f64,
    /// A provider must support every listed capability.
    pub required_capabilities: BTreeSet<Capability>,
    /// Moved to the front of the attempt order, in this order.
    pub preferred_providers: Vec<String>,
    pub fallback_enabled: bool,
    /// Attempts against a single provider before moving on.
    pub retry_attempts: u32,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            strategy: Strategy::CostOptimized,
            max_cost_threshold: 0.05,
            max_latency_threshold_secs: 10.0,
            required_capabilities: BTreeSet::new(),
            preferred_providers: Vec::new(),
            fallback_enabled: true,
            retry_attempts: 3,
        }
    }
}

impl RoutingPolicy {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_cost(mut self, threshold: f64) -> Self {
        self.max_cost_threshold = threshold;
        self
    }

    pub fn with_max_latency(mut self, threshold: Duration) -> Self {
        self.max_latency_threshold_secs = threshold.as_secs_f64();
        self
    }

    pub fn require(mut self, capability: Capability) -> Self {
        self.required_capabilities.insert(capability);
        self
    }

    pub fn prefer(mut self, provider: impl Into<String>) -> Self {
        self.preferred_providers.push(provider.into());
        self
    }

    pub fn with_fallback(mut self, enabled: bool) -> Self {
        self.fallback_enabled = enabled;
        self
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Advisory latency ceiling; `None` when the value is too large for a
    /// [`Duration`], which means no ceiling.
    pub fn max_latency(&self) -> Option<Duration> {
        Duration::try_from_secs_f64(self.max_latency_threshold_secs.max(0.0)).ok()
    }

    /// Attempts per provider; zero is treated as one.
    pub fn attempts_per_provider(&self) -> u32 {
        self.retry_attempts.max(1)
    }
}
