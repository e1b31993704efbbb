//! Error types for transfer operations.

use thiserror::Error;

/// Errors returned by a `StoreClient` or by local byte sources and sinks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Object not found in the store.
    #[error("Object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    /// Access denied.
    #[error("Access denied to {bucket}/{key}: {message}")]
    AccessDenied {
        bucket: String,
        key: String,
        message: String,
    },

    /// The store asked the client to slow down.
    #[error("Request throttled: {message}")]
    Throttled { message: String },

    /// The request timed out.
    #[error("Request timed out: {message}")]
    Timeout { message: String },

    /// Network error.
    #[error("Network error: {message}")]
    NetworkError { message: String, retryable: bool },

    /// The store rejected the request with an HTTP status.
    #[error("Service error ({status}): {message}")]
    ServiceError {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// The request was malformed.
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// Local I/O error.
    #[error("I/O error for {path}: {message}")]
    IoError { path: String, message: String },

    /// Other error.
    #[error("{message}")]
    Other { message: String },
}

impl StoreError {
    /// Build an `IoError` from a path description and an I/O error.
    ///
    /// # Arguments
    /// * `path` - Description of the file or buffer involved
    /// * `err` - The underlying I/O error
    pub fn io(path: impl Into<String>, err: std::io::Error) -> Self {
        StoreError::IoError {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        crate::retry::classify(self) == crate::retry::ErrorClass::Transient
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::IoError {
            path: String::new(),
            message: err.to_string(),
        }
    }
}

/// Terminal error of a transfer, as surfaced by `TransferFuture::wait`.
#[derive(Error, Debug, Clone)]
pub enum TransferError {
    /// Configuration failed validation.
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// The request cannot be planned (e.g. object too large).
    #[error("Invalid transfer request: {message}")]
    InvalidRequest { message: String },

    /// Local I/O failure outside of a part (size discovery, finalize).
    #[error("I/O error for {path}: {message}")]
    Io { path: String, message: String },

    /// The object size could not be discovered.
    #[error("Failed to determine object size: {source}")]
    SizeDiscovery { source: StoreError },

    /// The multipart session could not be created.
    #[error("Failed to initiate multipart session: {source}")]
    Initiate { source: StoreError },

    /// A part failed terminally.
    #[error("Part {index} failed after {attempts} attempt(s): {source}")]
    PartFailed {
        index: u32,
        attempts: u32,
        source: StoreError,
    },

    /// A single-request transfer failed terminally.
    #[error("Request failed after {attempts} attempt(s): {source}")]
    RequestFailed { attempts: u32, source: StoreError },

    /// The store rejected the completion of a multipart session.
    #[error("Failed to complete multipart session: {source}")]
    Complete { source: StoreError },

    /// The transfer was cancelled.
    #[error("Transfer cancelled")]
    Cancelled,

    /// The transfer failed and the remote session could not be aborted.
    ///
    /// `primary` is the original cause. The abort failure is a secondary
    /// diagnostic: the session `upload_id` is left dangling on the store.
    #[error("{primary} (abort of multipart session {upload_id} also failed: {abort_error})")]
    AbortFailed {
        primary: Box<TransferError>,
        upload_id: String,
        abort_error: StoreError,
    },

    /// Job submitted to a closed pool scope.
    #[error("Worker pool closed")]
    PoolClosed,

    /// The manager no longer accepts transfers.
    #[error("Transfer manager has been shut down")]
    ShutDown,

    /// The engine broke one of its own invariants (e.g. a driver task panicked).
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl TransferError {
    /// The originating error, looking through an abort failure.
    pub fn primary(&self) -> &TransferError {
        match self {
            TransferError::AbortFailed { primary, .. } => primary.primary(),
            other => other,
        }
    }

    /// The abort failure attached to this error, if any.
    pub fn abort_error(&self) -> Option<&StoreError> {
        match self {
            TransferError::AbortFailed { abort_error, .. } => Some(abort_error),
            _ => None,
        }
    }

    /// Index of the part that caused the failure, if a part did.
    pub fn part_index(&self) -> Option<u32> {
        match self.primary() {
            TransferError::PartFailed { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// Whether the primary cause is cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.primary(), TransferError::Cancelled)
    }

    /// The store error at the root of this failure, if any.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self.primary() {
            TransferError::SizeDiscovery { source }
            | TransferError::Initiate { source }
            | TransferError::PartFailed { source, .. }
            | TransferError::RequestFailed { source, .. }
            | TransferError::Complete { source } => Some(source),
            _ => None,
        }
    }
}
