//! Per-named-dependency circuit breaker with lazy OPEN→HALF_OPEN transition,
//! grounded on `dukat/core/errors.py`'s `CircuitBreaker`: the state isn't
//! advanced by a background timer, it's recomputed the moment a caller
//! checks it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, info};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls are refused without invoking the wrapped callable.
    Open,
    /// A single trial call is allowed through to test recovery.
    HalfOpen,
}

/// Optional hooks invoked synchronously on each corresponding transition.
/// Like progress callbacks, these must not block indefinitely; a panic or
/// long-running hook is the caller's responsibility to avoid.
#[derive(Default, Clone)]
pub struct BreakerCallbacks {
    pub on_open: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub on_close: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub on_half_open: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

/// Construction parameters for a named breaker.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, recovery_timeout: Duration::from_secs(30) }
    }
}

struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    last_success_time: Option<Instant>,
}

/// A single named circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    callbacks: BreakerCallbacks,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_callbacks(name, config, BreakerCallbacks::default())
    }

    pub fn with_callbacks(name: impl Into<String>, config: BreakerConfig, callbacks: BreakerCallbacks) -> Self {
        Self {
            name: name.into(),
            config,
            callbacks,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure_time: None,
                last_success_time: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, lazily transitioning OPEN→HALF_OPEN if `recovery_timeout`
    /// has elapsed since the last failure.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().unwrap();
        self.settle(&mut inner);
        inner.state
    }

    fn settle(&self, inner: &mut BreakerInner) {
        if inner.state == BreakerState::Open {
            if let Some(last_failure) = inner.last_failure_time {
                if last_failure.elapsed() >= self.config.recovery_timeout {
                    inner.state = BreakerState::HalfOpen;
                    debug!(breaker = %self.name, "transitioned to half-open after recovery timeout");
                    if let Some(cb) = &self.callbacks.on_half_open {
                        cb(&self.name);
                    }
                }
            }
        }
    }

    /// True iff a call should be refused with `CIRCUIT_OPEN` right now.
    pub fn is_open(&self) -> bool {
        self.state() == BreakerState::Open
    }

    /// Records a success: HALF_OPEN → CLOSED (resetting `failure_count`);
    /// CLOSED stays CLOSED and resets its streak.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.settle(&mut inner);

        inner.last_success_time = Some(Instant::now());
        inner.failure_count = 0;
        if inner.state != BreakerState::Closed {
            inner.state = BreakerState::Closed;
            info!(breaker = %self.name, "closed after successful trial call");
            if let Some(cb) = &self.callbacks.on_close {
                cb(&self.name);
            }
        }
    }

    /// Records a failure unless `excluded` is true (validation-style errors
    /// the design says must not count). CLOSED → OPEN at `failure_threshold`;
    /// HALF_OPEN → OPEN immediately.
    pub fn record_failure(&self, excluded: bool) {
        if excluded {
            return;
        }

        let mut inner = self.inner.lock().unwrap();
        self.settle(&mut inner);

        inner.last_failure_time = Some(Instant::now());

        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                info!(breaker = %self.name, "reopened after failed trial call");
                if let Some(cb) = &self.callbacks.on_open {
                    cb(&self.name);
                }
            }
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    info!(breaker = %self.name, failures = inner.failure_count, "opened after reaching failure threshold");
                    if let Some(cb) = &self.callbacks.on_open {
                        cb(&self.name);
                    }
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().unwrap().failure_count
    }
}

/// Shared registry mapping breaker name → instance, allowing a named breaker
/// to guard calls from both the Parallel Executor and caller-declared
/// external-dependency calls.
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    default_config: BreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: BreakerConfig) -> Self {
        Self { default_config, breakers: RwLock::new(HashMap::new()) }
    }

    /// Returns the named breaker, constructing it with the registry's default
    /// configuration the first time it is referenced.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().unwrap().get(name) {
            return Arc::clone(existing);
        }

        let mut breakers = self.breakers.write().unwrap();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.default_config.clone())))
            .clone()
    }

    /// Registers an explicitly configured breaker, overwriting any default
    /// that may have been lazily created for the same name.
    pub fn register(&self, breaker: CircuitBreaker) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(breaker);
        self.breakers.write().unwrap().insert(breaker.name().to_string(), Arc::clone(&breaker));
        breaker
    }

    /// State of every known breaker, for [`crate::executor::ParallelExecutor::metrics`].
    pub fn states(&self) -> HashMap<String, BreakerState> {
        self.breakers.read().unwrap().iter().map(|(name, b)| (name.clone(), b.state())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_at_threshold_and_not_before() {
        let breaker = CircuitBreaker::new("x", BreakerConfig { failure_threshold: 2, recovery_timeout: Duration::from_millis(50) });

        breaker.record_failure(false);
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.record_failure(false);
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn excluded_failures_do_not_count() {
        let breaker = CircuitBreaker::new("x", BreakerConfig { failure_threshold: 1, recovery_timeout: Duration::from_millis(50) });
        breaker.record_failure(true);
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn half_opens_after_recovery_timeout_then_closes_on_success() {
        let breaker = CircuitBreaker::new("x", BreakerConfig { failure_threshold: 1, recovery_timeout: Duration::from_millis(20) });
        breaker.record_failure(false);
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("x", BreakerConfig { failure_threshold: 1, recovery_timeout: Duration::from_millis(10) });
        breaker.record_failure(false);
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_failure(false);
        assert_eq!(breaker.state(), BreakerState::Open);
    }
}
