//! Per-provider health tracking and circuit breaking.
//!
//! Each registered provider gets a [`HealthRecord`] holding a bounded window
//! of latency samples, error counters, and a breaker that moves through
//! Closed -> Open -> HalfOpen -> Closed:
//! - **Closed**: provider is eligible, consecutive errors are counted
//! - **Open**: provider is excluded until the cooldown expires
//! - **HalfOpen**: a single trial request is let through; its outcome decides
//!   whether the breaker closes or re-opens
//!
//! Records live in a [`DashMap`] so concurrent requests touching different
//! providers never contend on the same lock. The half-open trial slot is
//! handed out as a [`TrialPermit`] that frees the slot when dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use crate::error::ProviderError;

/// Consecutive errors tolerated before the breaker trips (trips on the next).
pub const DEFAULT_TRIP_THRESHOLD: u32 = 5;

/// How long an open breaker waits before letting traffic through again.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// Latency samples kept per provider.
pub const DEFAULT_LATENCY_WINDOW: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Tunables for the tracker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthSettings {
    /// Breaker trips once consecutive errors exceed this.
    pub trip_threshold: u32,
    /// `None` keeps a tripped breaker open until reset or re-registration.
    pub cooldown: Option<Duration>,
    pub latency_window: usize,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            trip_threshold: DEFAULT_TRIP_THRESHOLD,
            cooldown: Some(DEFAULT_COOLDOWN),
            latency_window: DEFAULT_LATENCY_WINDOW,
        }
    }
}

/// Details of the most recent error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastError {
    pub error_type: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Serialisable view of one provider's health.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_errors: u32,
    pub total_errors: u64,
    pub total_successes: u64,
    pub average_latency_ms: Option<f64>,
    pub latency_samples: usize,
    pub trip_count: u32,
    pub last_error: Option<LastError>,
}

pub(crate) struct HealthRecord {
    state: CircuitState,
    consecutive_errors: u32,
    total_errors: u64,
    total_successes: u64,
    latencies: VecDeque<Duration>,
    opened_at: Option<Instant>,
    last_error: Option<LastError>,
    trip_count: u32,
    /// Id of the outstanding half-open trial, if any.
    trial_in_flight: Option<u64>,
    trials_granted: u64,
}

impl HealthRecord {
    fn new(window: usize) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_errors: 0,
            total_errors: 0,
            total_successes: 0,
            latencies: VecDeque::with_capacity(window),
            opened_at: None,
            last_error: None,
            trip_count: 0,
            trial_in_flight: None,
            trials_granted: 0,
        }
    }

    /// Lazy Open -> HalfOpen transition once the cooldown has elapsed.
    fn refresh(&mut self, provider: &str, cooldown: Option<Duration>) {
        if self.state != CircuitState::Open {
            return;
        }
        let (Some(cooldown), Some(opened_at)) = (cooldown, self.opened_at) else {
            return;
        };
        if Instant::now().duration_since(opened_at) >= cooldown {
            self.state = CircuitState::HalfOpen;
            tracing::info!(
                provider = %provider,
                trip_count = self.trip_count,
                "circuit HALF-OPEN: cooldown expired"
            );
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.trial_in_flight = None;
    }

    /// Open, or half-open with the trial slot already taken.
    fn excludes(&self) -> bool {
        match self.state {
            CircuitState::Closed => false,
            CircuitState::Open => true,
            CircuitState::HalfOpen => self.trial_in_flight.is_some(),
        }
    }

    fn record_success(&mut self, provider: &str, latency: Duration, window: usize) {
        if self.latencies.len() >= window {
            self.latencies.pop_front();
        }
        if window > 0 {
            self.latencies.push_back(latency);
        }
        self.consecutive_errors = 0;
        self.total_successes += 1;

        if self.state != CircuitState::Closed {
            self.state = CircuitState::Closed;
            self.opened_at = None;
            self.trial_in_flight = None;
            tracing::info!(
                provider = %provider,
                trip_count = self.trip_count,
                "circuit CLOSED: request succeeded"
            );
        }
    }

    fn record_error(&mut self, provider: &str, error: &ProviderError, threshold: u32) {
        self.consecutive_errors += 1;
        self.total_errors += 1;
        self.last_error = Some(LastError {
            error_type: error.error_type().to_string(),
            message: error.to_string(),
            at: Utc::now(),
        });

        match self.state {
            CircuitState::HalfOpen => {
                self.open();
                tracing::warn!(
                    provider = %provider,
                    trip_count = self.trip_count,
                    "circuit REOPENED: request after cooldown failed"
                );
            }
            CircuitState::Closed if self.consecutive_errors > threshold => {
                self.open();
                self.trip_count += 1;
                tracing::warn!(
                    provider = %provider,
                    consecutive_errors = self.consecutive_errors,
                    last_error = ?self.last_error,
                    trip_count = self.trip_count,
                    "circuit OPENED: {} consecutive errors",
                    self.consecutive_errors,
                );
            }
            _ => {}
        }
    }

    fn average_latency(&self) -> Option<Duration> {
        if self.latencies.is_empty() {
            return None;
        }
        let total: Duration = self.latencies.iter().sum();
        Some(total / self.latencies.len() as u32)
    }

    fn snapshot(&self, name: &str) -> HealthSnapshot {
        HealthSnapshot {
            name: name.to_string(),
            state: self.state,
            consecutive_errors: self.consecutive_errors,
            total_errors: self.total_errors,
            total_successes: self.total_successes,
            average_latency_ms: self.average_latency().map(|d| d.as_secs_f64() * 1000.0),
            latency_samples: self.latencies.len(),
            trip_count: self.trip_count,
            last_error: self.last_error.clone(),
        }
    }
}

fn lock(record: &Mutex<HealthRecord>) -> MutexGuard<'_, HealthRecord> {
    record.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Outcome of asking whether a request may use a provider.
#[derive(Debug)]
pub enum Admission {
    /// Breaker closed.
    Allowed,
    /// Caller holds the single half-open trial slot.
    Trial(TrialPermit),
    /// Breaker open, or another request is already probing.
    Rejected,
}

/// The half-open trial slot for one provider.
///
/// Recording the trial's outcome settles the breaker; dropping the permit
/// without an outcome frees the slot for the next request.
pub struct TrialPermit {
    provider: String,
    id: u64,
    record: Arc<Mutex<HealthRecord>>,
}

impl TrialPermit {
    pub fn provider(&self) -> &str {
        &self.provider
    }
}

impl std::fmt::Debug for TrialPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrialPermit")
            .field("provider", &self.provider)
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for TrialPermit {
    fn drop(&mut self) {
        let mut record = lock(&self.record);
        if record.trial_in_flight == Some(self.id) {
            record.trial_in_flight = None;
            tracing::debug!(provider = %self.provider, "trial slot released unused");
        }
    }
}

/// Concurrent health tracker with one record per provider.
///
/// Owned by the router; providers never see it. Unknown provider names are
/// treated as healthy and updates to them are ignored.
pub struct HealthTracker {
    records: DashMap<String, Arc<Mutex<HealthRecord>>>,
    settings: HealthSettings,
}

impl HealthTracker {
    pub fn new(settings: HealthSettings) -> Self {
        Self {
            records: DashMap::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &HealthSettings {
        &self.settings
    }

    /// Create (or replace) the record for `name`, starting Closed with no history.
    pub fn register(&self, name: &str) {
        self.records.insert(
            name.to_string(),
            Arc::new(Mutex::new(HealthRecord::new(self.settings.latency_window))),
        );
    }

    pub fn remove(&self, name: &str) {
        self.records.remove(name);
    }

    /// Append a latency sample and clear the consecutive error count.
    pub fn record_success(&self, name: &str, latency: Duration) {
        if let Some(entry) = self.records.get(name) {
            lock(entry.value()).record_success(name, latency, self.settings.latency_window);
        }
    }

    /// Count an error; may trip the breaker.
    pub fn record_error(&self, name: &str, error: &ProviderError) {
        if let Some(entry) = self.records.get(name) {
            lock(entry.value()).record_error(name, error, self.settings.trip_threshold);
        }
    }

    /// Whether `name` is currently excluded by its breaker: open, or half-open
    /// while another request holds the trial slot.
    pub fn is_circuit_open(&self, name: &str) -> bool {
        self.records.get(name).is_some_and(|entry| {
            let mut record = lock(entry.value());
            record.refresh(name, self.settings.cooldown);
            record.excludes()
        })
    }

    /// Admit a request to `name`, claiming the trial slot if the breaker is
    /// half-open and the slot is free.
    pub fn admit(&self, name: &str) -> Admission {
        let Some(entry) = self.records.get(name) else {
            return Admission::Allowed;
        };
        let mut record = lock(entry.value());
        record.refresh(name, self.settings.cooldown);

        let state = record.state;
        match state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::HalfOpen if record.trial_in_flight.is_none() => {
                record.trials_granted += 1;
                let id = record.trials_granted;
                record.trial_in_flight = Some(id);
                tracing::info!(provider = %name, "circuit HALF-OPEN: trial permit granted");
                Admission::Trial(TrialPermit {
                    provider: name.to_string(),
                    id,
                    record: Arc::clone(entry.value()),
                })
            }
            _ => Admission::Rejected,
        }
    }

    pub fn state(&self, name: &str) -> Option<CircuitState> {
        self.records.get(name).map(|entry| {
            let mut record = lock(entry.value());
            record.refresh(name, self.settings.cooldown);
            record.state
        })
    }

    /// Mean of the recorded latency window, `None` without samples.
    pub fn average_latency(&self, name: &str) -> Option<Duration> {
        self.records
            .get(name)
            .and_then(|entry| lock(entry.value()).average_latency())
    }

    pub fn consecutive_errors(&self, name: &str) -> Option<u32> {
        self.records
            .get(name)
            .map(|entry| lock(entry.value()).consecutive_errors)
    }

    pub fn total_errors(&self, name: &str) -> Option<u64> {
        self.records
            .get(name)
            .map(|entry| lock(entry.value()).total_errors)
    }

    /// Operator override: close the breaker and clear consecutive errors.
    pub fn reset(&self, name: &str) {
        if let Some(entry) = self.records.get(name) {
            let mut record = lock(entry.value());
            record.state = CircuitState::Closed;
            record.opened_at = None;
            record.trial_in_flight = None;
            record.consecutive_errors = 0;
            tracing::info!(provider = %name, "circuit reset by operator");
        }
    }

    /// Operator override: force the breaker open.
    pub fn trip(&self, name: &str) {
        if let Some(entry) = self.records.get(name) {
            let mut record = lock(entry.value());
            record.open();
            record.trip_count += 1;
            tracing::warn!(provider = %name, "circuit OPENED by operator");
        }
    }

    pub fn snapshot(&self, name: &str) -> Option<HealthSnapshot> {
        self.records.get(name).map(|entry| {
            let mut record = lock(entry.value());
            record.refresh(name, self.settings.cooldown);
            record.snapshot(name)
        })
    }

    /// Snapshots for every tracked provider, sorted by name.
    pub fn snapshot_all(&self) -> Vec<HealthSnapshot> {
        let mut all: Vec<HealthSnapshot> = self
            .records
            .iter()
            .map(|entry| {
                let mut record = lock(entry.value());
                record.refresh(entry.key(), self.settings.cooldown);
                record.snapshot(entry.key())
            })
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(HealthSettings::default())
    }
}
