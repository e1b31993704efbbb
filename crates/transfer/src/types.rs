//! Shared data structures for transfer operations.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use rusty_transfer_common::ProgressCallback;
use serde::{Deserialize, Serialize};

use crate::io::{RangedReader, RangedWriter};

/// A remote object: bucket plus key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectLocation {
    /// Bucket name.
    pub bucket: String,
    /// Object key.
    pub key: String,
}

impl ObjectLocation {
    /// Create a new object location.
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Create a new range. `end` must not be smaller than `start`.
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "invalid byte range {}..{}", start, end);
        Self { start, end }
    }

    /// Number of bytes covered by the range.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// True if the range covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Render as an HTTP `Range` header value (`bytes=first-last`, inclusive).
    ///
    /// Returns `None` for an empty range, which HTTP cannot express.
    pub fn to_http_header(&self) -> Option<String> {
        if self.is_empty() {
            None
        } else {
            Some(format!("bytes={}-{}", self.start, self.end - 1))
        }
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Extra attributes passed through to object-creating requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectAttributes {
    /// Content type of the created object.
    pub content_type: Option<String>,
    /// User metadata of the created object.
    pub metadata: HashMap<String, String>,
}

impl ObjectAttributes {
    /// Set the content type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Add a user metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// True if no attribute is set.
    pub fn is_empty(&self) -> bool {
        self.content_type.is_none() && self.metadata.is_empty()
    }
}

/// Kind of transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Upload,
    Download,
    Copy,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Upload => write!(f, "upload"),
            Operation::Download => write!(f, "download"),
            Operation::Copy => write!(f, "copy"),
        }
    }
}

/// Source and destination of a transfer.
#[derive(Clone)]
pub enum TransferKind {
    /// Local bytes to a remote object.
    Upload {
        source: Arc<dyn RangedReader>,
        destination: ObjectLocation,
    },
    /// Remote object to local bytes.
    Download {
        source: ObjectLocation,
        destination: Arc<dyn RangedWriter>,
    },
    /// Remote object to remote object, server side.
    Copy {
        source: ObjectLocation,
        destination: ObjectLocation,
    },
}

impl fmt::Debug for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferKind::Upload {
                source,
                destination,
            } => f
                .debug_struct("Upload")
                .field("source", &source.describe())
                .field("destination", destination)
                .finish(),
            TransferKind::Download {
                source,
                destination,
            } => f
                .debug_struct("Download")
                .field("source", source)
                .field("destination", &destination.describe())
                .finish(),
            TransferKind::Copy {
                source,
                destination,
            } => f
                .debug_struct("Copy")
                .field("source", source)
                .field("destination", destination)
                .finish(),
        }
    }
}

/// A request submitted to the `TransferManager`.
///
/// Immutable once submitted.
#[derive(Clone)]
pub struct TransferRequest {
    kind: TransferKind,
    size: Option<u64>,
    attributes: ObjectAttributes,
    progress: Option<Arc<dyn ProgressCallback>>,
}

impl TransferRequest {
    /// Upload bytes from `source` to `destination`.
    ///
    /// The size is taken from `source` unless set with `with_size`.
    pub fn upload(source: Arc<dyn RangedReader>, destination: ObjectLocation) -> Self {
        Self::new(TransferKind::Upload {
            source,
            destination,
        })
    }

    /// Download `source` into `destination`.
    ///
    /// The size is discovered with a HEAD request unless set with `with_size`.
    pub fn download(source: ObjectLocation, destination: Arc<dyn RangedWriter>) -> Self {
        Self::new(TransferKind::Download {
            source,
            destination,
        })
    }

    /// Copy `source` to `destination` on the store.
    pub fn copy(source: ObjectLocation, destination: ObjectLocation) -> Self {
        Self::new(TransferKind::Copy {
            source,
            destination,
        })
    }

    fn new(kind: TransferKind) -> Self {
        Self {
            kind,
            size: None,
            attributes: ObjectAttributes::default(),
            progress: None,
        }
    }

    /// Set the known object size, skipping discovery.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Set attributes for the created object.
    pub fn with_attributes(mut self, attributes: ObjectAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// Set a progress callback.
    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn operation(&self) -> Operation {
        match self.kind {
            TransferKind::Upload { .. } => Operation::Upload,
            TransferKind::Download { .. } => Operation::Download,
            TransferKind::Copy { .. } => Operation::Copy,
        }
    }

    pub fn kind(&self) -> &TransferKind {
        &self.kind
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn attributes(&self) -> &ObjectAttributes {
        &self.attributes
    }

    pub fn progress(&self) -> Option<&Arc<dyn ProgressCallback>> {
        self.progress.as_ref()
    }

    /// Human-readable destination, for logs and outcomes.
    pub fn destination(&self) -> OutcomeDestination {
        match &self.kind {
            TransferKind::Upload { destination, .. } | TransferKind::Copy { destination, .. } => {
                OutcomeDestination::Remote(destination.clone())
            }
            TransferKind::Download { destination, .. } => {
                OutcomeDestination::Local(destination.describe())
            }
        }
    }
}

impl fmt::Debug for TransferRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferRequest")
            .field("kind", &self.kind)
            .field("size", &self.size)
            .field("attributes", &self.attributes)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Where a finished transfer put its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeDestination {
    Remote(ObjectLocation),
    Local(String),
}

/// Successful result of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Operation performed.
    pub operation: Operation,
    /// Destination descriptor.
    pub destination: OutcomeDestination,
    /// Entity tag returned by the store for single-request uploads and copies.
    pub e_tag: Option<String>,
    /// Total bytes transferred.
    pub bytes_transferred: u64,
    /// Number of parts (1 for a single-request transfer).
    pub part_count: u32,
}

/// Snapshot of a transfer's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferProgress {
    /// Bytes transferred so far.
    pub bytes_transferred: u64,
    /// Total bytes, once the size is known.
    pub total_bytes: Option<u64>,
}
