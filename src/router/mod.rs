//! Provider routing.
//!
//! This module handles picking providers for a request and driving the
//! attempts:
//! - Eligibility (circuit state, capabilities, cost ceiling)
//! - Strategy ordering and preferred providers
//! - Retry with backoff, then failover down the ordered list

mod retry;
mod selector;

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tracing::Instrument;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::health::{HealthSettings, HealthTracker};
use crate::policy::{RoutingPolicy, Strategy};
use crate::provider::{build_provider, Message, ModelConfig, Provider, Response, TextStream};

use retry::execute_with_failover;
use selector::{Registration, Selection};

pub use retry::{Backoff, Candidate};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Construction parameters for a [`Router`].
#[derive(Debug, Clone, Default)]
pub struct RouterSettings {
    pub health: HealthSettings,
    pub backoff: Backoff,
    /// Deadline for a whole `route` call. `None` means unbounded.
    pub request_timeout: Option<Duration>,
}

/// An open stream and the provider serving it.
pub struct RoutedStream {
    pub provider: String,
    pub stream: TextStream,
}

impl std::fmt::Debug for RoutedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutedStream")
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

/// Routes requests across registered providers.
pub struct Router {
    registry: RwLock<Vec<Registration>>,
    health: HealthTracker,
    backoff: Backoff,
    request_timeout: Option<Duration>,
    cursor: AtomicUsize,
}

impl Router {
    pub fn new(settings: RouterSettings) -> Self {
        Self {
            registry: RwLock::new(Vec::new()),
            health: HealthTracker::new(settings.health),
            backoff: settings.backoff,
            request_timeout: settings.request_timeout,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Build a router and register every provider in `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let router = Self::new(config.router.settings());
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        for provider_config in &config.providers {
            let provider = build_provider(provider_config, &client);
            router.add_provider(provider, provider_config.fallback_order);
        }

        if config.providers.is_empty() {
            tracing::warn!("Router built with no providers");
        }
        Ok(router)
    }

    /// Register a provider. A provider with the same name is replaced in
    /// place and its health history starts over.
    pub fn add_provider(&self, provider: Arc<dyn Provider>, fallback_order: u32) {
        let name = provider.name().to_string();
        let registration = Registration {
            provider,
            fallback_order,
        };

        {
            let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
            match registry.iter().position(|r| r.name() == name) {
                Some(pos) => {
                    registry[pos] = registration;
                    tracing::info!(provider = %name, fallback_order, "Replaced provider");
                }
                None => {
                    registry.push(registration);
                    tracing::info!(provider = %name, fallback_order, "Registered provider");
                }
            }
        }

        self.health.register(&name);
    }

    /// Unregister a provider. Returns whether it was present.
    pub fn remove_provider(&self, name: &str) -> bool {
        let removed = {
            let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
            let before = registry.len();
            registry.retain(|r| r.name() != name);
            registry.len() != before
        };
        if removed {
            self.health.remove(name);
            tracing::info!(provider = %name, "Removed provider");
        }
        removed
    }

    /// Registered provider names, in registration order.
    pub fn provider_names(&self) -> Vec<String> {
        self.snapshot().iter().map(|r| r.name().to_string()).collect()
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    fn snapshot(&self) -> Vec<Registration> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Eligible providers for this request, in the order the next `route`
    /// call would try them.
    ///
    /// Read-only: the round-robin cursor does not advance and no half-open
    /// trial slot is claimed.
    pub fn eligible_providers(
        &self,
        messages: &[Message],
        config: &ModelConfig,
        policy: &RoutingPolicy,
    ) -> Result<Vec<Candidate>> {
        self.select(messages, config, policy, Selection::Preview)
    }

    fn select(
        &self,
        messages: &[Message],
        config: &ModelConfig,
        policy: &RoutingPolicy,
        selection: Selection,
    ) -> Result<Vec<Candidate>> {
        let registrations = self.snapshot();
        let candidates = selector::eligible(
            &registrations,
            &self.health,
            messages,
            config,
            policy,
            selection,
        )
        .map_err(|exclusions| {
            tracing::warn!(%exclusions, "No eligible provider");
            Error::NoEligibleProvider(exclusions)
        })?;

        let cursor = match (policy.strategy, selection) {
            (Strategy::RoundRobin, Selection::Dispatch) => {
                self.cursor.fetch_add(1, Ordering::Relaxed)
            }
            (Strategy::RoundRobin, Selection::Preview) => self.cursor.load(Ordering::Relaxed),
            _ => 0,
        };
        let ordered = selector::order(candidates, policy.strategy, cursor, &mut rand::thread_rng());
        let ordered = selector::apply_preferences(ordered, &policy.preferred_providers);

        if let Some(max_latency) = policy.max_latency() {
            for candidate in &ordered {
                if let Some(avg) = candidate.average_latency.filter(|avg| *avg > max_latency) {
                    tracing::debug!(
                        provider = %candidate.name,
                        average_latency_ms = avg.as_millis() as u64,
                        max_latency_ms = max_latency.as_millis() as u64,
                        "Provider above latency threshold"
                    );
                }
            }
        }

        tracing::debug!(
            strategy = %policy.strategy,
            order = ?ordered.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            "Selected providers"
        );
        Ok(ordered)
    }

    /// Send `messages` to the best available provider, retrying and failing
    /// over as the policy allows.
    pub async fn route(
        &self,
        messages: &[Message],
        config: &ModelConfig,
        policy: &RoutingPolicy,
    ) -> Result<Response> {
        let span = tracing::info_span!(
            "route",
            request_id = %Uuid::new_v4(),
            strategy = %policy.strategy,
        );

        let routed = async {
            let candidates = self.select(messages, config, policy, Selection::Dispatch)?;
            let (mut response, provider) = execute_with_failover(
                &candidates,
                policy,
                &self.backoff,
                &self.health,
                |candidate| {
                    let provider = candidate.provider.clone();
                    async move { provider.generate(messages, config).await }
                },
            )
            .await?;
            response.provider = provider;
            Ok(response)
        };

        self.with_deadline(routed.instrument(span)).await
    }

    /// Like [`route`](Self::route), but opens a stream.
    ///
    /// Failover covers opening the stream only; errors after the first chunk
    /// surface as stream items.
    pub async fn route_stream(
        &self,
        messages: &[Message],
        config: &ModelConfig,
        policy: &RoutingPolicy,
    ) -> Result<RoutedStream> {
        let span = tracing::info_span!(
            "route_stream",
            request_id = %Uuid::new_v4(),
            strategy = %policy.strategy,
        );

        let routed = async {
            let candidates = self.select(messages, config, policy, Selection::Dispatch)?;
            let (stream, provider) = execute_with_failover(
                &candidates,
                policy,
                &self.backoff,
                &self.health,
                |candidate| {
                    let provider = candidate.provider.clone();
                    async move { provider.stream(messages, config).await }
                },
            )
            .await?;
            Ok(RoutedStream { provider, stream })
        };

        self.with_deadline(routed.instrument(span)).await
    }

    async fn with_deadline<T>(&self, routed: impl Future<Output = Result<T>>) -> Result<T> {
        match self.request_timeout {
            Some(limit) => tokio::time::timeout(limit, routed).await.map_err(|_| {
                tracing::warn!(timeout_ms = limit.as_millis() as u64, "Route deadline exceeded");
                Error::DeadlineExceeded(limit)
            })?,
            None => routed.await,
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(RouterSettings::default())
    }
}
