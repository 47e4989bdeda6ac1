//! Circuit Breaker & Watchdog primitives (§4.4)
//!
//! Retry/timeout/trip discipline wrapped around driver I/O calls.

use crate::error::{DlmError, Result};
use crate::logging::get_logger;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout: Duration,
    pub call_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(200),
        }
    }
}

struct Inner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: bool,
}

/// Tri-state circuit breaker guarding a single driver endpoint (§4.4).
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    logger: crate::logging::StructuredLogger,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
                half_open_in_flight: false,
            }),
            logger: get_logger("breaker"),
        }
    }

    /// Execute `f`, enforcing circuit state, per-call timeout, and retries
    /// with exponential backoff. Non-retryable errors abort the retry loop.
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.before_call().await?;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let call = tokio::time::timeout(self.config.call_timeout, f()).await;
            match call {
                Ok(Ok(value)) => {
                    self.on_success().await;
                    return Ok(value);
                }
                Ok(Err(err)) => {
                    if !err.is_retryable() || attempt > self.config.max_retries {
                        self.on_failure().await;
                        return Err(err);
                    }
                    self.logger.warn(&format!(
                        "{} call failed (attempt {attempt}), retrying: {err}",
                        self.name
                    ));
                    let delay = self.config.retry_base_delay * 2u32.pow(attempt - 1);
                    tokio::time::sleep(delay).await;
                }
                Err(_) => {
                    self.on_failure().await;
                    return Err(DlmError::timeout(format!("{} call timed out", self.name)));
                }
            }
        }
    }

    async fn before_call(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.reset_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_in_flight = true;
                    Ok(())
                } else {
                    Err(DlmError::circuit_open(format!(
                        "{} circuit open, retry after {:?}",
                        self.name,
                        self.config.reset_timeout - elapsed
                    )))
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_in_flight {
                    Err(DlmError::circuit_open(format!(
                        "{} circuit half-open, probe in flight",
                        self.name
                    )))
                } else {
                    inner.half_open_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    async fn on_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count = 0;
            }
            BreakerState::HalfOpen => {
                inner.success_count += 1;
                inner.half_open_in_flight = false;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    self.logger.info(&format!("{} circuit closed", self.name));
                }
            }
            BreakerState::Open => {}
        }
    }

    async fn on_failure(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    self.logger.warn(&format!("{} circuit opened", self.name));
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.success_count = 0;
                inner.half_open_in_flight = false;
                self.logger
                    .warn(&format!("{} circuit reopened from half-open", self.name));
            }
            BreakerState::Open => {}
        }
    }

    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.opened_at = None;
        inner.half_open_in_flight = false;
    }

    pub async fn is_open(&self) -> bool {
        matches!(self.inner.lock().await.state, BreakerState::Open)
    }
}

/// A kicked timer: `kick` reschedules the deadline; if not kicked within
/// `timeout` it fires `on_timeout` (§4.4 Watchdog).
pub struct Watchdog {
    timeout: Duration,
    last_kick: Arc<Mutex<Instant>>,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_kick: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub async fn kick(&self) {
        *self.last_kick.lock().await = Instant::now();
    }

    pub async fn expired(&self) -> bool {
        self.last_kick.lock().await.elapsed() >= self.timeout
    }

    /// Spawn a background loop that polls for expiry and invokes `on_timeout`
    /// once per expiry (it does not repeatedly fire until kicked again).
    pub fn spawn<F>(self: Arc<Self>, poll_interval: Duration, mut on_timeout: F) -> tokio::task::JoinHandle<()>
    where
        F: FnMut() + Send + 'static,
    {
        tokio::spawn(async move {
            let mut fired = false;
            loop {
                tokio::time::sleep(poll_interval).await;
                let expired = self.expired().await;
                if expired && !fired {
                    on_timeout();
                    fired = true;
                } else if !expired {
                    fired = false;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: 2,
                ..Default::default()
            },
        );
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            let _ = breaker
                .execute(|| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(DlmError::transport("boom"))
                    }
                })
                .await;
        }

        assert!(breaker.is_open().await);

        let calls_before = calls.load(Ordering::SeqCst);
        let result = breaker
            .execute(|| async { Ok::<_, DlmError>(()) })
            .await;
        assert!(matches!(result, Err(DlmError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), calls_before);
    }

    #[tokio::test]
    async fn test_non_retryable_error_aborts_immediately() {
        let breaker = CircuitBreaker::new("test", CircuitBreakerConfig::default());
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts2 = attempts.clone();
        let result = breaker
            .execute(move || {
                let attempts2 = attempts2.clone();
                async move {
                    attempts2.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(DlmError::validation("f", "bad"))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_watchdog_expires() {
        let wd = Watchdog::new(Duration::from_millis(20));
        assert!(!wd.expired().await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(wd.expired().await);
        wd.kick().await;
        assert!(!wd.expired().await);
    }
}
