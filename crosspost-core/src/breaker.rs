use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::BreakerSection;
use crate::platform::Platform;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit breaker {name} is open")]
pub struct CircuitOpen {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding shared with the observability side.
    pub fn gauge(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

/// Consecutive-failure breaker. One instance guards every concurrent call
/// for a platform.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_limit: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_limit: u32, reset_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_limit: failure_limit.max(1),
            reset_timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                last_failure_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn from_section(name: impl Into<String>, section: &BreakerSection) -> Self {
        Self::new(name, section.failure_limit, section.reset_timeout())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_at: inner.last_failure_at,
        }
    }

    /// An open breaker whose cooldown has elapsed moves to half-open and
    /// admits one trial; further calls wait until that trial is recorded.
    pub fn allow(&self) -> bool {
        self.admit().is_some()
    }

    /// `Some(true)` when the admitted call is the half-open trial.
    fn admit(&self) -> Option<bool> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Some(false),
            CircuitState::HalfOpen if inner.trial_in_flight => None,
            CircuitState::HalfOpen => {
                inner.trial_in_flight = true;
                Some(true)
            }
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| at.elapsed() >= self.reset_timeout)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    info!(breaker = %self.name, "circuit half-open, admitting trial");
                    Some(true)
                } else {
                    None
                }
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());
        inner.trial_in_flight = false;
        match inner.state {
            CircuitState::Closed if inner.failure_count >= self.failure_limit => {
                inner.state = CircuitState::Open;
                warn!(breaker = %self.name, failures = inner.failure_count, "circuit opened");
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                warn!(breaker = %self.name, "half-open trial failed, circuit reopened");
            }
            _ => {}
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.trial_in_flight = false;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                info!(breaker = %self.name, "circuit closed");
            }
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::Open => {}
        }
    }

    /// Runs `call` unless the breaker is open. Every error returned by the
    /// call counts as a failure and is handed back unchanged.
    pub async fn execute<F, Fut, T, E>(&self, call: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpen>,
    {
        let Some(trial) = self.admit() else {
            return Err(E::from(CircuitOpen {
                name: self.name.clone(),
            }));
        };
        let _release = TrialRelease {
            breaker: self,
            armed: trial,
        };
        match call().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }
}

/// Frees the half-open slot when a trial is dropped before it reports.
struct TrialRelease<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialRelease<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.breaker.lock();
        if inner.state == CircuitState::HalfOpen && inner.trial_in_flight {
            inner.trial_in_flight = false;
            warn!(breaker = %self.breaker.name, "half-open trial abandoned");
        }
    }
}

/// One breaker per platform, created up front.
#[derive(Debug, Clone)]
pub struct BreakerRegistry {
    breakers: BTreeMap<Platform, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(section: &BreakerSection) -> Self {
        let breakers = Platform::ALL
            .iter()
            .map(|platform| {
                (
                    *platform,
                    Arc::new(CircuitBreaker::from_section(platform.as_str(), section)),
                )
            })
            .collect();
        Self { breakers }
    }

    pub fn get(&self, platform: Platform) -> Arc<CircuitBreaker> {
        match self.breakers.get(&platform) {
            Some(breaker) => Arc::clone(breaker),
            None => Arc::new(CircuitBreaker::from_section(
                platform.as_str(),
                &BreakerSection::default(),
            )),
        }
    }

    pub fn gauges(&self) -> BTreeMap<Platform, i64> {
        self.breakers
            .iter()
            .map(|(platform, breaker)| (*platform, breaker.state().gauge()))
            .collect()
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.values().map(|breaker| breaker.snapshot()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, PartialEq)]
    enum TestError {
        Open,
        Boom,
    }

    impl From<CircuitOpen> for TestError {
        fn from(_: CircuitOpen) -> Self {
            TestError::Open
        }
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_limit_and_short_circuits() {
        for limit in 1..=5u32 {
            let breaker = CircuitBreaker::new("medium", limit, Duration::from_secs(60));
            for _ in 0..limit {
                breaker.record_failure();
            }
            assert_eq!(breaker.state(), CircuitState::Open);

            let calls = AtomicUsize::new(0);
            let result: Result<(), TestError> = breaker
                .execute(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await;
            assert_eq!(result, Err(TestError::Open));
            assert_eq!(calls.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_single_trial_after_timeout() {
        let breaker = CircuitBreaker::new("devto", 2, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.allow());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(breaker.allow());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.allow());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_success_closes_and_resets() {
        let breaker = CircuitBreaker::new("linkedin", 3, Duration::from_secs(10));
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        let result: Result<u8, TestError> = breaker.execute(|| async { Ok(7) }).await;
        assert_eq!(result, Ok(7));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn success_while_closed_resets_consecutive_failures() {
        let breaker = CircuitBreaker::new("medium", 3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn execute_passes_errors_through() {
        let breaker = CircuitBreaker::new("medium", 3, Duration::from_secs(60));
        let result: Result<(), TestError> = breaker.execute(|| async { Err(TestError::Boom) }).await;
        assert_eq!(result, Err(TestError::Boom));
        assert_eq!(breaker.failure_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_trial_frees_the_half_open_slot() {
        let breaker = CircuitBreaker::new("devto", 1, Duration::from_secs(30));
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(31)).await;

        let stalled = tokio::time::timeout(
            Duration::from_secs(5),
            breaker.execute(|| std::future::pending::<Result<(), TestError>>()),
        )
        .await;
        assert!(stalled.is_err());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let result: Result<u8, TestError> = breaker.execute(|| async { Ok(1) }).await;
        assert_eq!(result, Ok(1));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn registry_exports_gauges() {
        let registry = BreakerRegistry::new(&BreakerSection::default());
        let medium = registry.get(Platform::Medium);
        for _ in 0..3 {
            medium.record_failure();
        }
        let gauges = registry.gauges();
        assert_eq!(gauges[&Platform::Medium], 1);
        assert_eq!(gauges[&Platform::DevTo], 0);
    }
}
