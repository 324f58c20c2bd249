//! Circuit breaker and bounded exponential-backoff retry for upstream calls.
//!
//! The two compose: [`retry_with_backoff`] wraps a breaker-guarded call, so a
//! burst of transient failures is backed off AND counted towards opening the
//! breaker. Once the breaker is open its `ServiceUnavailable` error is not
//! retryable and surfaces immediately.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    last_failure: Option<Instant>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub cooldown_secs: f64,
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &BreakerConfig) -> Self {
        Self {
            name: name.into(),
            failure_threshold: config.failure_threshold.max(1),
            cooldown: config.cooldown,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure: None,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.failure_threshold,
            cooldown_secs: self.cooldown.as_secs_f64(),
        }
    }

    /// Run `f` through the breaker. While open (and cooling down) `f` is not
    /// invoked at all.
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admit()?;
        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    fn admit(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Open {
            return Ok(());
        }
        let cooled = inner
            .last_failure
            .map_or(true, |at| at.elapsed() >= self.cooldown);
        if cooled {
            inner.state = BreakerState::HalfOpen;
            info!(breaker = %self.name, "circuit breaker half-open, probing upstream");
            Ok(())
        } else {
            Err(Error::ServiceUnavailable(format!(
                "{} circuit open after {} consecutive failures",
                self.name, inner.failure_count
            )))
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen {
            info!(breaker = %self.name, "circuit breaker closed");
        }
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
    }

    fn record_failure(&self, err: &Error) {
        let mut inner = self.inner.lock();
        inner.last_failure = Some(Instant::now());
        match inner.state {
            BreakerState::HalfOpen => {
                inner.failure_count = 1;
                inner.state = BreakerState::Open;
                warn!(breaker = %self.name, error = %err, "half-open probe failed, circuit re-opened");
            }
            BreakerState::Closed | BreakerState::Open => {
                inner.failure_count = inner.failure_count.saturating_add(1);
                if inner.state == BreakerState::Closed && inner.failure_count >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                    warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        error = %err,
                        "circuit breaker opened"
                    );
                }
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(with = "crate::config::secs")]
    pub base_delay: Duration,
    #[serde(with = "crate::config::secs")]
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration, factor: f64) -> Self {
        Self { max_retries, base_delay, max_delay, factor }
    }

    /// Sleep before retry number `attempt + 1`: `min(base * factor^attempt, max)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.base_delay.as_secs_f64() * exp;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Retry retryable failures up to `policy.max_retries` times. The last error
/// is returned unchanged.
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay(attempt);
                attempt += 1;
                warn!(attempt, ?delay, error = %err, "upstream call failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Bound a single upstream call.
pub async fn with_timeout<T, Fut>(timeout: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(timeout)),
    }
}
