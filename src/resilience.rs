//! Resilience wrapper: retry-with-backoff plus a per-dependency circuit
//! breaker. Every outbound call (mail send, calendar write, source fetch)
//! goes through these; the retry loop runs inside a breaker-guarded call so a
//! single logical operation can retry transient errors while the breaker
//! tracks aggregate health over time.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

/// Typed dependency failures. The retry predicate branches on the kind, never
/// on message strings.
#[derive(Debug, Error)]
pub enum DependencyError {
    /// 5xx/429-class or transport-level failure; worth retrying.
    #[error("retryable dependency failure: {0}")]
    Retryable(anyhow::Error),
    /// 4xx/auth-class failure; retrying cannot help.
    #[error("fatal dependency failure: {0}")]
    Fatal(anyhow::Error),
    /// The breaker is open; no call was attempted.
    #[error("circuit breaker '{dependency}' is open")]
    CircuitOpen { dependency: String },
    /// All retry attempts were consumed.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: anyhow::Error },
}

impl DependencyError {
    pub fn retryable(err: impl Into<anyhow::Error>) -> Self {
        DependencyError::Retryable(err.into())
    }

    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        DependencyError::Fatal(err.into())
    }
}

/// Retry configuration: delay for attempt n (0-indexed) is
/// min(base^n, ceiling) seconds.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base_secs: f64,
    pub max_backoff_secs: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            backoff_base_secs: 2.0,
            max_backoff_secs: 60.0,
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        let secs = self
            .backoff_base_secs
            .powi(attempt as i32)
            .min(self.max_backoff_secs);
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Runs `op` until it succeeds, fails fatally, or exhausts the policy's
/// attempts. Fatal errors abort immediately without consuming the remaining
/// attempts; recovery after at least one retry is logged.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    dependency: &str,
    mut op: F,
) -> Result<T, DependencyError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DependencyError>>,
{
    let mut last: Option<anyhow::Error> = None;
    for attempt in 0..policy.max_attempts {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(dependency, attempt, "dependency recovered after retry");
                }
                return Ok(value);
            }
            Err(DependencyError::Retryable(err)) => {
                warn!(dependency, attempt, %err, "retryable dependency failure");
                last = Some(err);
                if attempt + 1 < policy.max_attempts {
                    tokio::time::sleep(policy.delay(attempt)).await;
                }
            }
            Err(err) => return Err(err),
        }
    }
    Err(DependencyError::RetriesExhausted {
        attempts: policy.max_attempts,
        last: last.unwrap_or_else(|| anyhow::anyhow!("retry policy allows zero attempts")),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

/// CLOSED/OPEN/HALF_OPEN state machine guarding one named dependency.
/// In-memory only; one instance per dependency for the process lifetime.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    open_duration: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, open_duration: Duration) -> Self {
        CircuitBreaker {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            open_duration,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Administrative reset back to CLOSED with the counter cleared.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.last_failure = None;
    }

    /// Guards one logical call. While OPEN (and not yet cooled down) the op is
    /// never invoked; after the open duration elapses exactly one trial call
    /// is let through in HALF_OPEN.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, DependencyError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, DependencyError>>,
    {
        self.check_allow()?;
        match op().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(err)
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_allow(&self) -> Result<(), DependencyError> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let cooled = inner
                    .last_failure
                    .map(|at| at.elapsed() >= self.open_duration)
                    .unwrap_or(true);
                if cooled {
                    inner.state = BreakerState::HalfOpen;
                    info!(breaker = %self.name, "circuit breaker half-open; allowing trial call");
                    Ok(())
                } else {
                    Err(DependencyError::CircuitOpen {
                        dependency: self.name.clone(),
                    })
                }
            }
            // A trial call is already in flight; admit nothing else.
            BreakerState::HalfOpen => Err(DependencyError::CircuitOpen {
                dependency: self.name.clone(),
            }),
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        if inner.state != BreakerState::Closed {
            info!(breaker = %self.name, "circuit breaker closed");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        inner.last_failure = Some(Instant::now());
        match inner.state {
            BreakerState::HalfOpen => {
                warn!(breaker = %self.name, "trial call failed; circuit breaker re-opened");
                inner.state = BreakerState::Open;
            }
            _ => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        "failure threshold reached; circuit breaker opened"
                    );
                    inner.state = BreakerState::Open;
                }
            }
        }
    }
}
