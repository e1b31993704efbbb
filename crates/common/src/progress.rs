//! Byte-count progress callback trait and implementations.

use std::sync::Arc;

/// Progress callback invoked with the number of bytes just transferred.
///
/// Implementations are called from arbitrary worker tasks, possibly
/// concurrently for different parts of the same transfer. A callback
/// that blocks stalls only the worker that invoked it.
pub trait ProgressCallback: Send + Sync {
    /// Called after a byte range has been transferred.
    ///
    /// # Arguments
    /// * `bytes` - Number of bytes transferred since the previous call
    fn on_progress(&self, bytes: u64);
}

impl<P: ProgressCallback + ?Sized> ProgressCallback for Arc<P> {
    fn on_progress(&self, bytes: u64) {
        (**self).on_progress(bytes)
    }
}

/// A no-op progress callback.
pub struct NoOpProgress;

impl ProgressCallback for NoOpProgress {
    fn on_progress(&self, _bytes: u64) {}
}

/// A progress callback that wraps a closure.
pub struct FnProgress<F> {
    callback: F,
}

impl<F> FnProgress<F>
where
    F: Fn(u64) + Send + Sync,
{
    /// Create a new closure-based progress callback.
    ///
    /// # Arguments
    /// * `callback` - Closure that receives each byte delta
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> ProgressCallback for FnProgress<F>
where
    F: Fn(u64) + Send + Sync,
{
    fn on_progress(&self, bytes: u64) {
        (self.callback)(bytes)
    }
}

/// Create a progress callback from a closure.
///
/// # Arguments
/// * `f` - Closure that receives each byte delta
///
/// # Returns
/// A `FnProgress` wrapper implementing `ProgressCallback`.
pub fn progress_fn<F>(f: F) -> FnProgress<F>
where
    F: Fn(u64) + Send + Sync,
{
    FnProgress::new(f)
}
