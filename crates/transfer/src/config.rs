//! Transfer engine configuration.
//!
//! `TransferConfig` is immutable and always valid: the only way to build one
//! is through `TransferConfigBuilder::build()` (or `Default`). The builder is
//! deserializable so embedders can load settings from their own config files.
//!
//! # Example
//!
//! ```ignore
//! let config = TransferConfig::builder()
//!     .with_multipart_threshold(16 * MIB)
//!     .with_max_concurrency(4)
//!     .build()?;
//! ```

use std::time::Duration;

use rusty_transfer_common::{
    DEFAULT_MAX_CONCURRENCY, DEFAULT_MAX_IO_QUEUE_SIZE, DEFAULT_MULTIPART_CHUNKSIZE,
    DEFAULT_MULTIPART_THRESHOLD, DEFAULT_NUM_RETRY_ATTEMPTS, MAX_PARTS,
};
use serde::Deserialize;

use crate::error::TransferError;

/// Validated transfer settings.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferConfig {
    multipart_threshold: u64,
    multipart_chunksize: u64,
    max_concurrency: usize,
    max_io_queue_size: usize,
    num_retry_attempts: u32,
    max_parts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    backoff_multiplier: f64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        let builder = TransferConfigBuilder::default();
        Self {
            multipart_threshold: builder.multipart_threshold,
            multipart_chunksize: builder.multipart_chunksize,
            max_concurrency: builder.max_concurrency,
            max_io_queue_size: builder.max_io_queue_size,
            num_retry_attempts: builder.num_retry_attempts,
            max_parts: builder.max_parts,
            initial_backoff: Duration::from_millis(builder.initial_backoff_ms),
            max_backoff: Duration::from_millis(builder.max_backoff_ms),
            backoff_multiplier: builder.backoff_multiplier,
        }
    }
}

impl TransferConfig {
    /// Start building a configuration from defaults.
    pub fn builder() -> TransferConfigBuilder {
        TransferConfigBuilder::default()
    }

    /// Size in bytes above which multipart is used.
    pub fn multipart_threshold(&self) -> u64 {
        self.multipart_threshold
    }

    /// Target part size in bytes.
    pub fn multipart_chunksize(&self) -> u64 {
        self.multipart_chunksize
    }

    /// Maximum part jobs executing at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Maximum part jobs accepted but not yet started.
    pub fn max_io_queue_size(&self) -> usize {
        self.max_io_queue_size
    }

    /// Retries allowed after the first attempt of a request.
    pub fn num_retry_attempts(&self) -> u32 {
        self.num_retry_attempts
    }

    /// Maximum number of parts in one multipart plan.
    pub fn max_parts(&self) -> u32 {
        self.max_parts
    }

    pub fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }
}

/// Unvalidated transfer settings.
///
/// Every field has a default, so a partial document deserializes cleanly.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TransferConfigBuilder {
    /// Bytes above which multipart is chosen.
    pub multipart_threshold: u64,
    /// Target part size.
    pub multipart_chunksize: u64,
    /// Max simultaneous in-flight part requests.
    pub max_concurrency: usize,
    /// Max parts buffered ahead of dispatch.
    pub max_io_queue_size: usize,
    /// Retries per request after the first attempt.
    pub num_retry_attempts: u32,
    /// Part cap, at most `MAX_PARTS`.
    pub max_parts: u32,
    /// Initial backoff delay in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
    /// Backoff multiplier (exponential backoff).
    pub backoff_multiplier: f64,
}

impl Default for TransferConfigBuilder {
    fn default() -> Self {
        Self {
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            multipart_chunksize: DEFAULT_MULTIPART_CHUNKSIZE,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_io_queue_size: DEFAULT_MAX_IO_QUEUE_SIZE,
            num_retry_attempts: DEFAULT_NUM_RETRY_ATTEMPTS,
            max_parts: MAX_PARTS,
            initial_backoff_ms: 100,
            max_backoff_ms: 20_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl TransferConfigBuilder {
    pub fn with_multipart_threshold(mut self, bytes: u64) -> Self {
        self.multipart_threshold = bytes;
        self
    }

    pub fn with_multipart_chunksize(mut self, bytes: u64) -> Self {
        self.multipart_chunksize = bytes;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_max_io_queue_size(mut self, max_io_queue_size: usize) -> Self {
        self.max_io_queue_size = max_io_queue_size;
        self
    }

    pub fn with_num_retry_attempts(mut self, attempts: u32) -> Self {
        self.num_retry_attempts = attempts;
        self
    }

    pub fn with_max_parts(mut self, max_parts: u32) -> Self {
        self.max_parts = max_parts;
        self
    }

    /// Set the backoff curve.
    ///
    /// # Arguments
    /// * `initial` - Delay before the first retry
    /// * `max` - Upper bound for any delay
    /// * `multiplier` - Growth factor between consecutive retries
    pub fn with_backoff(mut self, initial: Duration, max: Duration, multiplier: f64) -> Self {
        self.initial_backoff_ms = initial.as_millis() as u64;
        self.max_backoff_ms = max.as_millis() as u64;
        self.backoff_multiplier = multiplier;
        self
    }

    /// Validate and freeze the settings.
    pub fn build(self) -> Result<TransferConfig, TransferError> {
        fn invalid(message: String) -> TransferError {
            TransferError::InvalidConfig { message }
        }

        if self.multipart_threshold == 0 {
            return Err(invalid("multipart_threshold must be positive".into()));
        }
        if self.multipart_chunksize == 0 {
            return Err(invalid("multipart_chunksize must be positive".into()));
        }
        if self.max_concurrency == 0 {
            return Err(invalid("max_concurrency must be positive".into()));
        }
        if self.max_io_queue_size == 0 {
            return Err(invalid("max_io_queue_size must be positive".into()));
        }
        if self.max_parts == 0 || self.max_parts > MAX_PARTS {
            return Err(invalid(format!(
                "max_parts must be between 1 and {}, got {}",
                MAX_PARTS, self.max_parts
            )));
        }
        if !(self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0) {
            return Err(invalid(format!(
                "backoff_multiplier must be a finite value >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(invalid(format!(
                "max_backoff_ms ({}) is smaller than initial_backoff_ms ({})",
                self.max_backoff_ms, self.initial_backoff_ms
            )));
        }

        if self.multipart_threshold < self.multipart_chunksize {
            log::warn!(
                "multipart_threshold ({}) is below multipart_chunksize ({}); \
                 small multipart objects will be sent as a single part",
                self.multipart_threshold,
                self.multipart_chunksize
            );
        }

        Ok(TransferConfig {
            multipart_threshold: self.multipart_threshold,
            multipart_chunksize: self.multipart_chunksize,
            max_concurrency: self.max_concurrency,
            max_io_queue_size: self.max_io_queue_size,
            num_retry_attempts: self.num_retry_attempts,
            max_parts: self.max_parts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            backoff_multiplier: self.backoff_multiplier,
        })
    }
}
