//! modelrelay - policy-driven routing across LLM providers
//!
//! This library provides provider selection, health tracking with a circuit
//! breaker, and retry/failover execution behind a single [`Router`].

pub mod config;
pub mod error;
pub mod health;
pub mod policy;
pub mod provider;
pub mod router;

pub use config::Config;
pub use error::{Error, ProviderError, Result};
pub use health::{CircuitState, HealthTracker};
pub use policy::{RoutingPolicy, Strategy};
pub use provider::{Capability, Message, ModelConfig, Provider, Response};
pub use router::{RoutedStream, Router, RouterSettings};
