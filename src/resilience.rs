//! Retry with exponential backoff behind a per-dependency circuit breaker.
//!
//! Every call to the crawler, embedder, vector store and language model
//! goes through [`Resilience::call`]. Each dependency type has one
//! [`CircuitBreaker`], shared process-wide through a [`BreakerRegistry`]
//! that is built once at startup and handed to every service that needs it.
//!
//! # Breaker states
//!
//! | State | Behaviour |
//! |-------|-----------|
//! | Closed | Calls run. Consecutive retryable failures are counted; reaching `failure_threshold` opens the circuit. |
//! | Open | Calls fail immediately with `CircuitOpen` until `cooldown` has elapsed since opening. |
//! | Half-open | Exactly one trial call runs. Success closes the circuit, failure reopens it and restarts the cool-down. |
//!
//! # Retry policy
//!
//! Only retryable errors ([`RagError::is_retryable`]) are retried. The
//! delay after attempt `n` is `min(max_delay, initial_delay * multiplier^(n-1))`,
//! optionally jittered into `[delay/2, delay]`. The breaker is consulted
//! before every attempt, so a circuit that opens mid-retry stops the loop.
//!
//! Timing uses `tokio::time::Instant` so tests can drive the clock.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use rag_chat_core::error::{Dependency, RagError, Result};

use crate::config::ResilienceConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay after `attempt` (1-based) has failed.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay to sleep before the next attempt, jitter applied.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        if !self.jitter {
            return delay;
        }
        let full = delay.as_millis() as u64;
        if full < 2 {
            return delay;
        }
        Duration::from_millis(rand::thread_rng().gen_range(full / 2..=full))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Circuit breaker for one dependency type.
#[derive(Debug)]
pub struct CircuitBreaker {
    dependency: Dependency,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(dependency: Dependency, config: BreakerConfig) -> Self {
        Self {
            dependency,
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn dependency(&self) -> Dependency {
        self.dependency
    }

    /// Current state. An open circuit whose cool-down has elapsed reports
    /// `HalfOpen`; the transition itself happens on the next acquire.
    pub fn state(&self) -> BreakerState {
        let inner = self.lock();
        match inner.state {
            BreakerState::Open if self.cooldown_elapsed(&inner) => BreakerState::HalfOpen,
            state => state,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    fn cooldown_elapsed(&self, inner: &BreakerInner) -> bool {
        inner
            .opened_at
            .map_or(true, |at| at.elapsed() >= self.config.cooldown)
    }

    /// Ask to make one call. Fails with `CircuitOpen` while the circuit is
    /// open, or while another half-open trial is still in flight.
    pub fn try_acquire(&self) -> Result<Permit<'_>> {
        let mut inner = self.lock();
        let current = inner.state;
        let trial = match current {
            BreakerState::Closed => false,
            BreakerState::Open if self.cooldown_elapsed(&inner) => {
                inner.state = BreakerState::HalfOpen;
                info!(dependency = %self.dependency, "circuit half-open, admitting trial call");
                true
            }
            BreakerState::HalfOpen if !inner.trial_in_flight => true,
            BreakerState::Open | BreakerState::HalfOpen => {
                return Err(RagError::CircuitOpen {
                    dependency: self.dependency,
                })
            }
        };
        if trial {
            inner.trial_in_flight = true;
        }
        Ok(Permit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        if trial {
            inner.trial_in_flight = false;
        }
        inner.consecutive_failures = 0;
        if inner.state != BreakerState::Closed {
            inner.state = BreakerState::Closed;
            inner.opened_at = None;
            info!(dependency = %self.dependency, "circuit closed");
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        if trial {
            inner.trial_in_flight = false;
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            warn!(dependency = %self.dependency, "trial call failed, circuit reopened");
            return;
        }
        if inner.state == BreakerState::Closed
            && inner.consecutive_failures >= self.config.failure_threshold
        {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            warn!(
                dependency = %self.dependency,
                failures = inner.consecutive_failures,
                cooldown_secs = self.config.cooldown.as_secs(),
                "circuit opened"
            );
        }
    }

    fn on_release(&self, trial: bool) {
        if trial {
            self.lock().trial_in_flight = false;
        }
    }
}

/// Admission to make one call through a [`CircuitBreaker`].
///
/// Report the outcome with [`success`](Permit::success) or
/// [`failure`](Permit::failure). Dropping the permit unsettled (the call
/// was cancelled, or ended in an error that says nothing about the
/// dependency's health) frees a half-open trial slot without changing state.
#[derive(Debug)]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_release(self.trial);
        }
    }
}

fn slot(dependency: Dependency) -> usize {
    match dependency {
        Dependency::Crawler => 0,
        Dependency::Embedder => 1,
        Dependency::VectorStore => 2,
        Dependency::LanguageModel => 3,
    }
}

/// One breaker per dependency type, created up front.
#[derive(Debug)]
pub struct BreakerRegistry {
    breakers: [Arc<CircuitBreaker>; 4],
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: Dependency::ALL.map(|d| Arc::new(CircuitBreaker::new(d, config))),
        }
    }

    pub fn get(&self, dependency: Dependency) -> Arc<CircuitBreaker> {
        Arc::clone(&self.breakers[slot(dependency)])
    }

    /// `(dependency, state)` for every breaker, in [`Dependency::ALL`] order.
    pub fn states(&self) -> Vec<(Dependency, BreakerState)> {
        self.breakers
            .iter()
            .map(|b| (b.dependency(), b.state()))
            .collect()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

/// Retry policies plus the shared breaker registry.
#[derive(Debug, Clone)]
pub struct Resilience {
    breakers: Arc<BreakerRegistry>,
    policies: [RetryPolicy; 4],
}

impl Resilience {
    pub fn new(breakers: Arc<BreakerRegistry>) -> Self {
        Self {
            breakers,
            policies: [RetryPolicy::default(); 4],
        }
    }

    pub fn from_config(config: &ResilienceConfig) -> Self {
        let mut resilience = Self::new(Arc::new(BreakerRegistry::new(config.breaker_config())));
        for dependency in Dependency::ALL {
            resilience = resilience.with_policy(dependency, config.retry_policy(dependency));
        }
        resilience
    }

    pub fn with_policy(mut self, dependency: Dependency, policy: RetryPolicy) -> Self {
        self.policies[slot(dependency)] = policy;
        self
    }

    /// Same policy for every dependency.
    pub fn with_uniform_policy(mut self, policy: RetryPolicy) -> Self {
        self.policies = [policy; 4];
        self
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn policy(&self, dependency: Dependency) -> RetryPolicy {
        self.policies[slot(dependency)]
    }

    /// Run `op` under `dependency`'s breaker and retry policy.
    ///
    /// - Open circuit on the first attempt: `CircuitOpen`, `op` never runs.
    /// - Non-retryable error: returned as-is, no further attempts.
    /// - Attempts exhausted, or the circuit opened between attempts: the
    ///   last error wrapped in `RetriesExhausted`.
    pub async fn call<T, F, Fut>(&self, dependency: Dependency, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self.breakers.get(dependency);
        let policy = self.policy(dependency);
        let max_attempts = policy.max_attempts.max(1);
        let mut last_err: Option<RagError> = None;
        let mut attempt = 0u32;

        loop {
            let permit = match breaker.try_acquire() {
                Ok(permit) => permit,
                Err(open) => {
                    return Err(match last_err {
                        None => open,
                        Some(err) => {
                            warn!(%dependency, attempts = attempt, "circuit opened during retries");
                            RagError::RetriesExhausted {
                                dependency,
                                attempts: attempt,
                                source: Box::new(err),
                            }
                        }
                    });
                }
            };
            attempt += 1;

            match op().await {
                Ok(value) => {
                    permit.success();
                    return Ok(value);
                }
                Err(err) if !err.is_retryable() => {
                    drop(permit);
                    return Err(err);
                }
                Err(err) => {
                    permit.failure();
                    if attempt >= max_attempts {
                        warn!(%dependency, attempts = attempt, error = %err, "retries exhausted");
                        return Err(RagError::RetriesExhausted {
                            dependency,
                            attempts: attempt,
                            source: Box::new(err),
                        });
                    }
                    let delay = policy.backoff(attempt);
                    warn!(
                        %dependency,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "call failed, retrying"
                    );
                    last_err = Some(err);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
