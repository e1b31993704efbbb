//! Engine-owned progress accumulation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rusty_transfer_common::ProgressCallback;

use crate::types::TransferProgress;

const TOTAL_UNKNOWN: u64 = u64::MAX;

/// Thread-safe byte counter for one transfer.
///
/// Workers call `report` once per successful part, so bytes from failed
/// attempts are never counted.
pub struct ProgressAggregator {
    transferred: AtomicU64,
    total: AtomicU64,
    callback: Option<Arc<dyn ProgressCallback>>,
}

impl ProgressAggregator {
    /// Create an aggregator.
    ///
    /// # Arguments
    /// * `callback` - Optional user callback invoked on every report
    pub fn new(callback: Option<Arc<dyn ProgressCallback>>) -> Self {
        Self {
            transferred: AtomicU64::new(0),
            total: AtomicU64::new(TOTAL_UNKNOWN),
            callback,
        }
    }

    /// Record `delta` transferred bytes and notify the callback.
    ///
    /// The callback runs on the calling worker.
    pub fn report(&self, delta: u64) {
        self.transferred.fetch_add(delta, Ordering::AcqRel);
        if let Some(ref cb) = self.callback {
            cb.on_progress(delta);
        }
    }

    /// Record the object's total size once it is known.
    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Release);
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> TransferProgress {
        let total: u64 = self.total.load(Ordering::Acquire);
        TransferProgress {
            bytes_transferred: self.transferred(),
            total_bytes: (total != TOTAL_UNKNOWN).then_some(total),
        }
    }
}

impl std::fmt::Debug for ProgressAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressAggregator")
            .field("progress", &self.snapshot())
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}
