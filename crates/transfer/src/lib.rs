//! Managed transfer engine for object storage.
//!
//! Moves objects between local byte sources and a remote store, choosing
//! between one request and a multipart transfer by size. Multipart
//! transfers run their parts on a shared, bounded worker pool with
//! per-part retries, and surface progress and the terminal result through
//! a `TransferFuture`.
//!
//! - **Upload** - `RangedReader` to remote object
//! - **Download** - remote object to `RangedWriter`
//! - **Copy** - remote object to remote object, server side
//!
//! The store itself is abstract: anything implementing `StoreClient` can
//! back the engine. `rusty-transfer-s3` provides an S3 implementation.
//!
//! # Example
//!
//! ```ignore
//! let manager = TransferManager::new(client, TransferConfig::default());
//! let source = Arc::new(FileSource::open("/data/archive.tar")?);
//! let future = manager.submit(TransferRequest::upload(
//!     source,
//!     ObjectLocation::new("my-bucket", "archive.tar"),
//! ))?;
//! let outcome = future.wait().await?;
//! ```

pub mod config;
mod coordinator;
mod error;
mod future;
pub mod io;
mod manager;
pub mod planner;
pub mod pool;
mod progress;
pub mod retry;
pub mod session;
mod traits;
mod types;

pub use config::{TransferConfig, TransferConfigBuilder};
pub use error::{StoreError, TransferError};
pub use future::{TransferFuture, TransferResult, TransferState};
pub use io::{FileSink, FileSource, MemorySink, MemorySource, RangedReader, RangedWriter};
pub use manager::TransferManager;
pub use planner::{plan, MultipartPlan, PartSpec, Plan, PlanKind};
pub use pool::{PoolMetrics, PoolScope, QueueSlot, WorkerPool};
pub use progress::ProgressAggregator;
pub use retry::{classify, ErrorClass, RetryDecision, RetryPolicy};
pub use session::{MultipartSession, PartRecord, PartState, PartTable, SessionError, SessionState};
pub use traits::{CompletedPart, ObjectInfo, SessionToken, StoreClient};
pub use types::{
    ByteRange, ObjectAttributes, ObjectLocation, Operation, OutcomeDestination, TransferKind,
    TransferOutcome, TransferProgress, TransferRequest,
};

pub use rusty_transfer_common::{progress_fn, FnProgress, NoOpProgress, ProgressCallback};
