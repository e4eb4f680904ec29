//! Bounded retry with a pluggable backoff.

use std::future::Future;
use std::time::Duration;

use crate::cancel::Cancellation;
use crate::error::{AppError, ErrorKind, Result};

/// Delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// Doubles after every failure, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    /// Delay after the given (1-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential { initial, max } => {
                let factor = 1u32 << attempt.saturating_sub(1).min(16);
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub attempt_timeout: Option<Duration>,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed(delay),
            attempt_timeout: None,
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Run `op` until it succeeds or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. The last error is returned on
    /// exhaustion. Cancellation is checked before every attempt and during
    /// every backoff, and surfaces as `Cancelled` immediately.
    pub async fn run<T, F, Fut>(&self, label: &str, cancel: &Cancellation, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_err = AppError::process(format!("{label}: no attempts made"));

        for attempt in 1..=attempts {
            cancel.check()?;

            let outcome = match self.attempt_timeout {
                Some(limit) => tokio::select! {
                    () = cancel.cancelled() => Err(AppError::cancelled()),
                    res = tokio::time::timeout(limit, op(attempt)) => res
                        .unwrap_or_else(|_| Err(AppError::timeout(label, limit.as_secs_f64()))),
                },
                None => tokio::select! {
                    () = cancel.cancelled() => Err(AppError::cancelled()),
                    res = op(attempt) => res,
                },
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.kind() == ErrorKind::Cancelled => return Err(e),
                Err(e) => {
                    log::warn!("{} attempt {}/{} failed: {}", label, attempt, attempts, e);
                    last_err = e;
                }
            }

            if attempt < attempts {
                cancel.sleep(self.backoff.delay(attempt)).await?;
            }
        }

        Err(last_err)
    }
}
