//! Per-provider circuit breakers for LLM calls.
//!
//! Standard CLOSED / OPEN / HALF_OPEN state machine that removes an
//! unhealthy provider from routing until its recovery window elapses.
//!
//! Breakers are keyed by the provider's literal name ("local", "claude",
//! "openai", "litellm"); there is no aliasing between lookup sites.

use kait_core::{now_ts, BreakerConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
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

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_attempts: u32,
    /// Monotonic instant of the last failure; None until the first failure.
    last_failure: Option<Instant>,
}

/// Serialised breaker state, for persistence and API responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub provider: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_attempts: u32,
    /// Seconds since the last failure at snapshot time, if any.
    pub last_failure_age_s: Option<f64>,
    pub failure_threshold: u32,
    pub recovery_timeout_s: f64,
    pub half_open_tests: u32,
}

/// State-machine circuit breaker for a single LLM provider.
pub struct CircuitBreaker {
    provider: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(provider: &str, config: BreakerConfig) -> Self {
        Self {
            provider: provider.to_string(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_attempts: 0,
                last_failure: None,
            }),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().unwrap().failure_count
    }

    /// Whether the circuit lets a request through right now.
    ///
    /// An OPEN circuit whose recovery window has elapsed transitions to
    /// HALF_OPEN and allows the request (the "probe"). HALF_OPEN allows up
    /// to `half_open_tests` concurrent probes.
    pub fn allow_request(&self) -> bool {
        if !self.config.enabled {
            return true;
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| t.elapsed().as_secs_f64())
                    .unwrap_or(f64::INFINITY);
                if elapsed >= self.config.recovery_timeout_s {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.half_open_attempts += 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_attempts < self.config.half_open_tests {
                    inner.half_open_attempts += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        if !self.config.enabled {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.half_open_tests {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        if !self.config.enabled {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            // Any failure in half-open immediately reopens the circuit.
            CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Open),
            CircuitState::Open => {}
        }
    }

    /// Force-reset to CLOSED.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.transition(&mut inner, CircuitState::Closed);
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().unwrap();
        BreakerSnapshot {
            provider: self.provider.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            half_open_attempts: inner.half_open_attempts,
            last_failure_age_s: inner.last_failure.map(|t| t.elapsed().as_secs_f64()),
            failure_threshold: self.config.failure_threshold,
            recovery_timeout_s: self.config.recovery_timeout_s,
            half_open_tests: self.config.half_open_tests,
        }
    }

    /// Transition to a new state. Must be called with the lock held.
    fn transition(&self, inner: &mut BreakerInner, new_state: CircuitState) {
        let old = inner.state;
        inner.state = new_state;
        match new_state {
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.success_count = 0;
                inner.half_open_attempts = 0;
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                inner.success_count = 0;
                inner.half_open_attempts = 0;
            }
        }
        tracing::debug!(
            "[{}] circuit {} -> {} (failures={})",
            self.provider,
            old.as_str(),
            new_state.as_str(),
            inner.failure_count
        );
    }

    /// Restore from a persisted snapshot.
    ///
    /// Monotonic timestamps don't survive restarts, so a persisted OPEN
    /// circuit gets a synthetic last-failure that makes its recovery window
    /// already elapsed: the next request probes instead of staying open
    /// indefinitely.
    fn restore(&self, snap: &BreakerSnapshot) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = snap.state;
        inner.failure_count = snap.failure_count;
        inner.success_count = snap.success_count;
        inner.half_open_attempts = snap.half_open_attempts;
        inner.last_failure = match snap.state {
            CircuitState::Open => Instant::now()
                .checked_sub(std::time::Duration::from_secs_f64(
                    self.config.recovery_timeout_s.max(0.0),
                ))
                .or(Some(Instant::now())),
            _ => None,
        };
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct PersistedState {
    saved_at: f64,
    breakers: HashMap<String, BreakerSnapshot>,
}

/// Thread-safe registry of per-provider circuit breakers.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, std::sync::Arc<CircuitBreaker>>>,
    state_path: Option<PathBuf>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig, state_path: Option<PathBuf>) -> Self {
        let registry = Self {
            config,
            breakers: Mutex::new(HashMap::new()),
            state_path,
        };
        if registry.config.enabled {
            registry.load_state();
        }
        registry
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Get or create the breaker for a provider.
    pub fn get(&self, provider: &str) -> std::sync::Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap();
        breakers
            .entry(provider.to_string())
            .or_insert_with(|| {
                std::sync::Arc::new(CircuitBreaker::new(provider, self.config.clone()))
            })
            .clone()
    }

    /// Serialised state of every registered breaker.
    pub fn status(&self) -> HashMap<String, BreakerSnapshot> {
        let breakers = self.breakers.lock().unwrap();
        breakers
            .iter()
            .map(|(name, cb)| (name.clone(), cb.snapshot()))
            .collect()
    }

    /// Persist breaker states to disk, atomically (tmp file + rename).
    pub fn save_state(&self) {
        let Some(path) = &self.state_path else {
            return;
        };
        let payload = PersistedState {
            saved_at: now_ts(),
            breakers: self.status(),
        };
        let Ok(json) = serde_json::to_string_pretty(&payload) else {
            return;
        };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let tmp = path.with_extension("json.tmp");
        if std::fs::write(&tmp, json).is_ok() {
            let _ = std::fs::rename(&tmp, path);
            tracing::debug!("Saved circuit breaker state ({} providers)", self.breakers.lock().unwrap().len());
        }
    }

    fn load_state(&self) {
        let Some(path) = &self.state_path else {
            return;
        };
        let Ok(raw) = std::fs::read_to_string(path) else {
            return;
        };
        let Ok(persisted) = serde_json::from_str::<PersistedState>(&raw) else {
            tracing::warn!("Ignoring malformed breaker state at {}", path.display());
            return;
        };
        for (provider, snap) in &persisted.breakers {
            let cb = self.get(provider);
            cb.restore(snap);
        }
        tracing::debug!("Loaded circuit breaker state ({} providers)", persisted.breakers.len());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
