//! Part dispatch and multipart session coordination.
//!
//! # Architecture
//!
//! ```text
//!                     ┌──────────┐  reserve (blocks when queue full) ┌────────────┐
//!  parts (in order) ─►│  feeder  │──────────────────────────────────►│ WorkerPool │
//!                     └──────────┘                                   └─────┬──────┘
//!                          │ read-ahead (uploads)                          │ run_part
//!                          ▼                                               ▼
//!                     RangedReader                     StoreClient + RetryPolicy
//!                                                                          │
//!  coordinator ◄────────────── PartEvent (Started/Retrying/Completed/...) ─┘
//!   (owns PartTable / MultipartSession)
//! ```
//!
//! Workers never touch the part table. They report events and the
//! coordinator applies them, so part and session state have one owner.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{StoreError, TransferError};
use crate::future::TransferHandle;
use crate::io::{RangedReader, RangedWriter};
use crate::planner::{MultipartPlan, PartSpec};
use crate::pool::{PoolScope, QueueSlot, WorkerPool};
use crate::progress::ProgressAggregator;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::session::{MultipartSession, PartTable, SessionState};
use crate::traits::{SessionToken, StoreClient};
use crate::types::{ByteRange, ObjectAttributes, ObjectLocation};

/// Everything a running transfer needs from its manager.
#[derive(Clone)]
pub(crate) struct TransferContext {
    pub client: Arc<dyn StoreClient>,
    pub pool: Arc<WorkerPool>,
    pub retry: RetryPolicy,
    pub handle: TransferHandle,
}

impl TransferContext {
    fn cancel_token(&self) -> &CancellationToken {
        self.handle.cancel_token()
    }

    fn progress(&self) -> &Arc<ProgressAggregator> {
        self.handle.progress()
    }
}

// ============================================================================
// Part operations
// ============================================================================

/// The request performed for each part of a plan.
#[async_trait]
trait PartOperation: Send + Sync + 'static {
    /// Data produced by the feeder before the part is queued.
    type Payload: Send + Sync + 'static;

    /// Acquire the part's payload. Errors fail the part without retry.
    async fn prepare(&self, part: &PartSpec) -> Result<Self::Payload, StoreError>;

    /// One attempt at the part. Returns the entity tag, if the store issues one.
    async fn execute(&self, part: &PartSpec, payload: &Self::Payload) -> Result<Option<String>, StoreError>;
}

async fn read_source(source: &dyn RangedReader, range: ByteRange) -> Result<Bytes, StoreError> {
    let data: Bytes = source
        .read_range(range)
        .await
        .map_err(|e| StoreError::io(source.describe(), e))?;
    if data.len() as u64 != range.len() {
        return Err(StoreError::IoError {
            path: source.describe(),
            message: format!("read {} bytes for range {}, expected {}", data.len(), range, range.len()),
        });
    }
    Ok(data)
}

async fn fetch_range(
    client: &dyn StoreClient,
    source: &ObjectLocation,
    range: ByteRange,
) -> Result<Bytes, StoreError> {
    let data: Bytes = client.get_object(source, range).await?;
    if data.len() as u64 != range.len() {
        // Truncated body; the connection most likely dropped mid-stream.
        return Err(StoreError::NetworkError {
            message: format!(
                "received {} bytes for range {} of {}, expected {}",
                data.len(),
                range,
                source,
                range.len()
            ),
            retryable: true,
        });
    }
    Ok(data)
}

struct UploadPart {
    client: Arc<dyn StoreClient>,
    session: SessionToken,
    source: Arc<dyn RangedReader>,
}

#[async_trait]
impl PartOperation for UploadPart {
    type Payload = Bytes;

    async fn prepare(&self, part: &PartSpec) -> Result<Bytes, StoreError> {
        read_source(self.source.as_ref(), part.range).await
    }

    async fn execute(&self, part: &PartSpec, payload: &Bytes) -> Result<Option<String>, StoreError> {
        self.client
            .upload_part(&self.session, part.index, payload.clone())
            .await
            .map(Some)
    }
}

struct CopyPart {
    client: Arc<dyn StoreClient>,
    session: SessionToken,
    source: ObjectLocation,
}

#[async_trait]
impl PartOperation for CopyPart {
    type Payload = ();

    async fn prepare(&self, _part: &PartSpec) -> Result<(), StoreError> {
        Ok(())
    }

    async fn execute(&self, part: &PartSpec, _payload: &()) -> Result<Option<String>, StoreError> {
        self.client
            .upload_part_copy(&self.session, part.index, &self.source, part.range)
            .await
            .map(Some)
    }
}

/// Ranged GET written at the part's offset. Serves single and multipart downloads.
struct DownloadRange {
    client: Arc<dyn StoreClient>,
    source: ObjectLocation,
    destination: Arc<dyn RangedWriter>,
}

#[async_trait]
impl PartOperation for DownloadRange {
    type Payload = ();

    async fn prepare(&self, _part: &PartSpec) -> Result<(), StoreError> {
        Ok(())
    }

    async fn execute(&self, part: &PartSpec, _payload: &()) -> Result<Option<String>, StoreError> {
        let data: Bytes = fetch_range(self.client.as_ref(), &self.source, part.range).await?;
        self.destination
            .write_at(part.range.start, data)
            .await
            .map_err(|e| StoreError::io(self.destination.describe(), e))?;
        Ok(None)
    }
}

struct PutObject {
    client: Arc<dyn StoreClient>,
    source: Arc<dyn RangedReader>,
    destination: ObjectLocation,
    attributes: ObjectAttributes,
}

#[async_trait]
impl PartOperation for PutObject {
    type Payload = Bytes;

    async fn prepare(&self, part: &PartSpec) -> Result<Bytes, StoreError> {
        read_source(self.source.as_ref(), part.range).await
    }

    async fn execute(&self, _part: &PartSpec, payload: &Bytes) -> Result<Option<String>, StoreError> {
        self.client
            .put_object(&self.destination, payload.clone(), &self.attributes)
            .await
            .map(Some)
    }
}

struct CopyObject {
    client: Arc<dyn StoreClient>,
    source: ObjectLocation,
    destination: ObjectLocation,
    attributes: ObjectAttributes,
}

#[async_trait]
impl PartOperation for CopyObject {
    type Payload = ();

    async fn prepare(&self, _part: &PartSpec) -> Result<(), StoreError> {
        Ok(())
    }

    async fn execute(&self, _part: &PartSpec, _payload: &()) -> Result<Option<String>, StoreError> {
        self.client
            .copy_object(&self.source, &self.destination, &self.attributes)
            .await
            .map(Some)
    }
}

// ============================================================================
// Dispatch
// ============================================================================

#[derive(Debug)]
enum PartEvent {
    /// An attempt is about to call the store.
    Started { index: u32 },
    /// An attempt failed and another one is scheduled.
    Retrying {
        index: u32,
        attempts: u32,
        delay: Duration,
        error: StoreError,
    },
    Completed { index: u32, e_tag: Option<String> },
    /// The part failed terminally.
    Failed {
        index: u32,
        attempts: u32,
        error: StoreError,
    },
    /// The scope closed before the part started.
    Skipped { index: u32 },
    /// The scope closed while the part waited to retry.
    Abandoned { index: u32, attempts: u32 },
}

const UNREPORTED: &str = "part job ended without reporting a result";

/// Terminal-event reporter for one part job.
///
/// Sends exactly one terminal event per part. If the job is dropped without
/// reporting one (it panicked, or the pool dropped it unstarted), `Drop`
/// reports for it. A terminal failure closes the scope before the event is
/// sent, so no queued part of this transfer starts after it.
struct PartReport {
    index: u32,
    attempts: u32,
    scope: CancellationToken,
    events: mpsc::UnboundedSender<PartEvent>,
    finished: bool,
}

impl PartReport {
    fn new(index: u32, scope: CancellationToken, events: mpsc::UnboundedSender<PartEvent>) -> Self {
        Self {
            index,
            attempts: 0,
            scope,
            events,
            finished: false,
        }
    }

    fn send(&self, event: PartEvent) {
        let _ = self.events.send(event);
    }

    fn finish(&mut self, event: PartEvent) {
        self.finished = true;
        if matches!(event, PartEvent::Failed { .. }) {
            self.scope.cancel();
        }
        self.send(event);
    }
}

impl Drop for PartReport {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let event: PartEvent = if self.attempts == 0 {
            PartEvent::Skipped { index: self.index }
        } else {
            self.scope.cancel();
            PartEvent::Failed {
                index: self.index,
                attempts: self.attempts,
                error: StoreError::Other {
                    message: UNREPORTED.into(),
                },
            }
        };
        self.send(event);
    }
}

/// One queued part: retry loop around `PartOperation::execute`.
async fn run_part<O: PartOperation>(
    op: Arc<O>,
    part: PartSpec,
    payload: O::Payload,
    retry: RetryPolicy,
    progress: Arc<ProgressAggregator>,
    mut report: PartReport,
) {
    let index: u32 = part.index;

    loop {
        if report.scope.is_cancelled() {
            let event: PartEvent = if report.attempts == 0 {
                PartEvent::Skipped { index }
            } else {
                PartEvent::Abandoned {
                    index,
                    attempts: report.attempts,
                }
            };
            report.finish(event);
            return;
        }

        report.attempts += 1;
        report.send(PartEvent::Started { index });

        let error: StoreError = match op.execute(&part, &payload).await {
            Ok(e_tag) => {
                progress.report(part.range.len());
                report.finish(PartEvent::Completed { index, e_tag });
                return;
            }
            Err(error) => error,
        };

        match retry.should_retry(&error, report.attempts) {
            RetryDecision::RetryAfter(delay) => {
                report.send(PartEvent::Retrying {
                    index,
                    attempts: report.attempts,
                    delay,
                    error,
                });
                tokio::select! {
                    _ = report.scope.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            RetryDecision::DoNotRetry => {
                let attempts: u32 = report.attempts;
                report.finish(PartEvent::Failed {
                    index,
                    attempts,
                    error,
                });
                return;
            }
        }
    }
}

/// Walk `parts` in order, submitting one job per part.
///
/// A queue slot is reserved before the part is prepared, so a prepared
/// payload always has a place in the queue. Stops at the first closed
/// scope or failed prepare.
async fn feed_parts<O: PartOperation>(
    op: Arc<O>,
    parts: Vec<PartSpec>,
    scope: PoolScope,
    retry: RetryPolicy,
    progress: Arc<ProgressAggregator>,
    events: mpsc::UnboundedSender<PartEvent>,
) {
    for part in parts {
        let slot: QueueSlot = match scope.reserve().await {
            Ok(slot) => slot,
            Err(_) => {
                log::debug!("part {} not submitted: scope closed", part.index);
                break;
            }
        };

        let payload: O::Payload = match op.prepare(&part).await {
            Ok(payload) => payload,
            Err(error) => {
                let _ = events.send(PartEvent::Started { index: part.index });
                let _ = events.send(PartEvent::Failed {
                    index: part.index,
                    attempts: 1,
                    error,
                });
                break;
            }
        };

        let report: PartReport = PartReport::new(part.index, scope.token().clone(), events.clone());
        slot.submit(run_part(
            op.clone(),
            part,
            payload,
            retry.clone(),
            progress.clone(),
            report,
        ));
    }
}

/// Run every part in `table` through the pool and apply the results.
///
/// # Returns
/// `Ok(())` once every part completed. Otherwise the first terminal part
/// failure, or `TransferError::Cancelled` if the transfer was cancelled
/// first. Returns only after every accepted job has finished.
async fn dispatch<O: PartOperation>(
    ctx: &TransferContext,
    op: Arc<O>,
    table: &mut PartTable,
) -> Result<(), TransferError> {
    let cancel: &CancellationToken = ctx.cancel_token();
    let scope: PoolScope = ctx.pool.scope(cancel.child_token());
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<PartEvent>();

    let parts: Vec<PartSpec> = table
        .iter()
        .map(|r| PartSpec {
            index: r.index,
            range: r.range,
        })
        .collect();
    tokio::spawn(feed_parts(
        op,
        parts,
        scope.clone(),
        ctx.retry.clone(),
        ctx.progress().clone(),
        events_tx,
    ));

    let id: u64 = ctx.handle.id();
    let mut failure: Option<TransferError> = None;

    while let Some(event) = events_rx.recv().await {
        let applied = match event {
            PartEvent::Started { index } => table.start(index),
            PartEvent::Retrying {
                index,
                attempts,
                delay,
                error,
            } => {
                log::debug!(
                    "transfer {}: part {} attempt {} failed ({}), retrying in {:?}",
                    id,
                    index,
                    attempts,
                    error,
                    delay
                );
                table.fail(index).and_then(|_| table.requeue(index))
            }
            PartEvent::Completed { index, e_tag } => {
                log::debug!("transfer {}: part {} completed", id, index);
                table.complete(index, e_tag)
            }
            PartEvent::Failed {
                index,
                attempts,
                error,
            } => {
                log::debug!(
                    "transfer {}: part {} failed after {} attempt(s): {}",
                    id,
                    index,
                    attempts,
                    error
                );
                if failure.is_none() && !cancel.is_cancelled() {
                    failure = Some(TransferError::PartFailed {
                        index,
                        attempts,
                        source: error,
                    });
                    scope.close();
                }
                table.fail(index)
            }
            PartEvent::Skipped { index } => {
                log::debug!("transfer {}: part {} skipped", id, index);
                Ok(())
            }
            PartEvent::Abandoned { index, attempts } => {
                log::debug!(
                    "transfer {}: part {} abandoned after {} attempt(s)",
                    id,
                    index,
                    attempts
                );
                Ok(())
            }
        };
        if let Err(err) = applied {
            log::warn!("transfer {}: {}", id, err);
        }
    }
    scope.close();

    if let Some(err) = failure {
        return Err(err);
    }
    if cancel.is_cancelled() {
        return Err(TransferError::Cancelled);
    }
    match table.first_incomplete() {
        None => Ok(()),
        Some(record) => Err(TransferError::PartFailed {
            index: record.index,
            attempts: record.attempts,
            source: StoreError::Other {
                message: UNREPORTED.into(),
            },
        }),
    }
}

/// Dispatch a one-part table and map part failures to request failures.
///
/// # Returns
/// The entity tag of the single request, if any.
async fn dispatch_single<O: PartOperation>(
    ctx: &TransferContext,
    op: O,
    range: ByteRange,
) -> Result<Option<String>, TransferError> {
    let mut table: PartTable = PartTable::new(&[PartSpec { index: 1, range }]);
    match dispatch(ctx, Arc::new(op), &mut table).await {
        Ok(()) => Ok(table.get(1).and_then(|r| r.e_tag.clone())),
        Err(TransferError::PartFailed {
            attempts, source, ..
        }) => Err(TransferError::RequestFailed { attempts, source }),
        Err(err) => Err(err),
    }
}

// ============================================================================
// Single-request transfers
// ============================================================================

pub(crate) async fn put_single(
    ctx: &TransferContext,
    source: Arc<dyn RangedReader>,
    destination: &ObjectLocation,
    attributes: &ObjectAttributes,
    range: ByteRange,
) -> Result<Option<String>, TransferError> {
    let op = PutObject {
        client: ctx.client.clone(),
        source,
        destination: destination.clone(),
        attributes: attributes.clone(),
    };
    dispatch_single(ctx, op, range).await
}

pub(crate) async fn copy_single(
    ctx: &TransferContext,
    source: &ObjectLocation,
    destination: &ObjectLocation,
    attributes: &ObjectAttributes,
    range: ByteRange,
) -> Result<Option<String>, TransferError> {
    let op = CopyObject {
        client: ctx.client.clone(),
        source: source.clone(),
        destination: destination.clone(),
        attributes: attributes.clone(),
    };
    dispatch_single(ctx, op, range).await
}

pub(crate) async fn download_single(
    ctx: &TransferContext,
    source: &ObjectLocation,
    destination: Arc<dyn RangedWriter>,
    range: ByteRange,
) -> Result<(), TransferError> {
    let op = DownloadRange {
        client: ctx.client.clone(),
        source: source.clone(),
        destination,
    };
    dispatch_single(ctx, op, range).await.map(|_| ())
}

// ============================================================================
// Multipart transfers
// ============================================================================

/// Download every part of `plan` into `destination`.
///
/// No remote session is involved; the caller finalizes or discards the writer.
pub(crate) async fn download_multipart(
    ctx: &TransferContext,
    source: &ObjectLocation,
    destination: Arc<dyn RangedWriter>,
    plan: &MultipartPlan,
) -> Result<(), TransferError> {
    let op = DownloadRange {
        client: ctx.client.clone(),
        source: source.clone(),
        destination,
    };
    let mut table: PartTable = PartTable::new(plan.parts());
    dispatch(ctx, Arc::new(op), &mut table).await
}

pub(crate) async fn upload_multipart(
    ctx: &TransferContext,
    source: Arc<dyn RangedReader>,
    destination: &ObjectLocation,
    attributes: &ObjectAttributes,
    plan: &MultipartPlan,
) -> Result<(), TransferError> {
    let client: Arc<dyn StoreClient> = ctx.client.clone();
    run_session(ctx, destination, attributes, plan, move |session| UploadPart {
        client,
        session,
        source,
    })
    .await
}

pub(crate) async fn copy_multipart(
    ctx: &TransferContext,
    source: &ObjectLocation,
    destination: &ObjectLocation,
    attributes: &ObjectAttributes,
    plan: &MultipartPlan,
) -> Result<(), TransferError> {
    let client: Arc<dyn StoreClient> = ctx.client.clone();
    let source: ObjectLocation = source.clone();
    run_session(ctx, destination, attributes, plan, move |session| CopyPart {
        client,
        session,
        source,
    })
    .await
}

/// Initiate a multipart session, run its parts, then complete or abort it.
async fn run_session<O, F>(
    ctx: &TransferContext,
    destination: &ObjectLocation,
    attributes: &ObjectAttributes,
    plan: &MultipartPlan,
    make_op: F,
) -> Result<(), TransferError>
where
    O: PartOperation,
    F: FnOnce(SessionToken) -> O,
{
    if ctx.cancel_token().is_cancelled() {
        return Err(TransferError::Cancelled);
    }

    let mut session: MultipartSession = MultipartSession::new(plan.parts());
    ctx.handle.set_session_state(SessionState::Initiating);

    let client: &dyn StoreClient = ctx.client.as_ref();
    let cancel: &CancellationToken = ctx.cancel_token();
    let upload_id: String = match ctx
        .retry
        .run(cancel, || client.create_multipart_upload(destination, attributes))
        .await
    {
        Ok((upload_id, _)) => upload_id,
        Err(_) if cancel.is_cancelled() => return Err(TransferError::Cancelled),
        Err((source, _)) => return Err(TransferError::Initiate { source }),
    };

    let token: SessionToken = SessionToken {
        upload_id: upload_id.clone(),
        destination: destination.clone(),
    };
    session.activate(token.clone()).map_err(internal)?;
    ctx.handle.set_upload_id(&upload_id);
    ctx.handle.set_session_state(SessionState::Active);
    log::debug!(
        "transfer {}: multipart session {} started for {} ({} parts)",
        ctx.handle.id(),
        upload_id,
        destination,
        plan.part_count()
    );

    let op: Arc<O> = Arc::new(make_op(token.clone()));
    if let Err(primary) = dispatch(ctx, op, session.parts_mut()).await {
        return Err(abort_session(ctx, &mut session, &token, primary).await);
    }
    // Cancellation that arrived after the last part still wins over completion.
    if cancel.is_cancelled() {
        return Err(abort_session(ctx, &mut session, &token, TransferError::Cancelled).await);
    }

    let parts = session.begin_completing().map_err(internal)?;
    ctx.handle.set_session_state(SessionState::Completing);

    let completed = ctx
        .retry
        .run(cancel, || client.complete_multipart_upload(&token, &parts))
        .await;
    match completed {
        Ok(_) => {
            session.mark_completed().map_err(internal)?;
            ctx.handle.set_session_state(SessionState::Completed);
            Ok(())
        }
        Err(_) if cancel.is_cancelled() => {
            Err(abort_session(ctx, &mut session, &token, TransferError::Cancelled).await)
        }
        Err((source, _)) => {
            let primary = TransferError::Complete { source };
            Err(abort_session(ctx, &mut session, &token, primary).await)
        }
    }
}

/// Abort the session once and fold any abort failure into `primary`.
async fn abort_session(
    ctx: &TransferContext,
    session: &mut MultipartSession,
    token: &SessionToken,
    primary: TransferError,
) -> TransferError {
    if let Err(err) = session.begin_aborting() {
        log::warn!("transfer {}: {}", ctx.handle.id(), err);
        return primary;
    }
    ctx.handle.set_session_state(SessionState::Aborting);

    let aborted: Result<(), StoreError> = ctx.client.abort_multipart_upload(token).await;

    if let Err(err) = session.mark_aborted() {
        log::warn!("transfer {}: {}", ctx.handle.id(), err);
    }
    ctx.handle.set_session_state(SessionState::Aborted);

    match aborted {
        Ok(()) => primary,
        Err(abort_error) => {
            log::error!(
                "transfer {}: failed to abort multipart session {} for {}; parts may remain on the store: {}",
                ctx.handle.id(),
                token.upload_id,
                token.destination,
                abort_error
            );
            TransferError::AbortFailed {
                primary: Box::new(primary),
                upload_id: token.upload_id.clone(),
                abort_error,
            }
        }
    }
}

fn internal(err: crate::session::SessionError) -> TransferError {
    TransferError::Internal {
        message: err.to_string(),
    }
}
