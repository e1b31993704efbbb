//! Retry classification and backoff.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::TransferConfig;
use crate::error::StoreError;

/// Whether an error may go away on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connection resets, timeouts, throttling, 5xx.
    Transient,
    /// Authorization, not-found, malformed requests, local I/O, other 4xx.
    Permanent,
}

/// Outcome of consulting the retry policy after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the given delay.
    RetryAfter(Duration),
    /// Give up.
    DoNotRetry,
}

/// Classify a store error.
pub fn classify(error: &StoreError) -> ErrorClass {
    match error {
        StoreError::Throttled { .. } | StoreError::Timeout { .. } => ErrorClass::Transient,
        StoreError::NetworkError { retryable, .. } => {
            if *retryable {
                ErrorClass::Transient
            } else {
                ErrorClass::Permanent
            }
        }
        StoreError::ServiceError { status, .. } => {
            if *status == 429 || *status >= 500 {
                ErrorClass::Transient
            } else {
                ErrorClass::Permanent
            }
        }
        StoreError::NotFound { .. }
        | StoreError::AccessDenied { .. }
        | StoreError::InvalidRequest { .. }
        | StoreError::IoError { .. }
        | StoreError::Other { .. } => ErrorClass::Permanent,
    }
}

/// Bounded exponential backoff over transient errors.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
}

impl RetryPolicy {
    /// Create a policy.
    ///
    /// # Arguments
    /// * `max_retries` - Retries allowed after the first attempt
    /// * `initial_backoff` - Delay before the first retry
    /// * `max_backoff` - Upper bound for any delay
    /// * `multiplier` - Growth factor, at least 1.0
    pub fn new(max_retries: u32, initial_backoff: Duration, max_backoff: Duration, multiplier: f64) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
            multiplier: if multiplier.is_finite() { multiplier.max(1.0) } else { 1.0 },
        }
    }

    /// Build the policy described by a transfer configuration.
    pub fn from_config(config: &TransferConfig) -> Self {
        Self::new(
            config.num_retry_attempts(),
            config.initial_backoff(),
            config.max_backoff(),
            config.backoff_multiplier(),
        )
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before retry number `retry` (1-based). Never decreases with `retry`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent: i32 = retry.saturating_sub(1).min(64) as i32;
        let scaled: f64 = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let capped: f64 = scaled.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Decide whether to retry after `attempts` failed attempts.
    ///
    /// # Arguments
    /// * `error` - Error from the latest attempt
    /// * `attempts` - Number of attempts made so far, including the failed one
    pub fn should_retry(&self, error: &StoreError, attempts: u32) -> RetryDecision {
        if classify(error) == ErrorClass::Permanent || attempts > self.max_retries {
            return RetryDecision::DoNotRetry;
        }
        RetryDecision::RetryAfter(self.backoff(attempts))
    }

    /// Run `op` until it succeeds, fails permanently, or exhausts retries.
    ///
    /// A backoff wait ends early when `cancel` fires; the last error is
    /// returned then, and the caller decides how to report the cancellation.
    ///
    /// # Returns
    /// The value and the number of attempts, or the last error and the
    /// number of attempts.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<(T, u32), (StoreError, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            match op().await {
                Ok(value) => return Ok((value, attempts)),
                Err(err) => match self.should_retry(&err, attempts) {
                    RetryDecision::RetryAfter(delay) => {
                        log::debug!("attempt {} failed ({}), retrying in {:?}", attempts, err, delay);
                        tokio::select! {
                            _ = cancel.cancelled() => return Err((err, attempts)),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    RetryDecision::DoNotRetry => return Err((err, attempts)),
                },
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&TransferConfig::default())
    }
}
