//! Entry point: accepts transfer requests and drives each to completion.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::config::TransferConfig;
use crate::coordinator::{self, TransferContext};
use crate::error::TransferError;
use crate::future::{TransferFuture, TransferHandle, TransferResult};
use crate::io::RangedWriter;
use crate::planner::{self, Plan};
use crate::pool::{PoolMetrics, WorkerPool};
use crate::progress::ProgressAggregator;
use crate::retry::RetryPolicy;
use crate::traits::StoreClient;
use crate::types::{ObjectLocation, Operation, TransferKind, TransferOutcome, TransferRequest};

/// Runs uploads, downloads, and copies against one store.
///
/// All transfers share one worker pool, so `max_concurrency` and
/// `max_io_queue_size` bound the manager as a whole.
pub struct TransferManager {
    client: Arc<dyn StoreClient>,
    config: Arc<TransferConfig>,
    pool: Arc<WorkerPool>,
    retry: RetryPolicy,
    next_id: AtomicU64,
    transfers: Mutex<Vec<TransferFuture>>,
    shut_down: AtomicBool,
}

impl TransferManager {
    /// Create a manager and spawn its worker pool.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Arguments
    /// * `client` - Store backend
    /// * `config` - Validated transfer settings
    pub fn new(client: Arc<dyn StoreClient>, config: TransferConfig) -> Self {
        let pool: Arc<WorkerPool> = Arc::new(WorkerPool::from_config(&config));
        let retry: RetryPolicy = RetryPolicy::from_config(&config);
        Self {
            client,
            config: Arc::new(config),
            pool,
            retry,
            next_id: AtomicU64::new(1),
            transfers: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn pool_metrics(&self) -> PoolMetrics {
        self.pool.metrics()
    }

    /// Start a transfer.
    ///
    /// Returns immediately; the transfer runs in the background.
    ///
    /// # Returns
    /// A future observing the transfer, or `TransferError::ShutDown` after
    /// `shutdown` was called.
    pub fn submit(&self, request: TransferRequest) -> Result<TransferFuture, TransferError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(TransferError::ShutDown);
        }

        let id: u64 = self.next_id.fetch_add(1, Ordering::Relaxed);
        let progress: Arc<ProgressAggregator> =
            Arc::new(ProgressAggregator::new(request.progress().cloned()));
        let (handle, future) = TransferHandle::new(id, request.operation(), progress);

        let ctx: TransferContext = TransferContext {
            client: self.client.clone(),
            pool: self.pool.clone(),
            retry: self.retry.clone(),
            handle,
        };
        let config: Arc<TransferConfig> = self.config.clone();
        tokio::spawn(async move {
            let result: TransferResult =
                match AssertUnwindSafe(drive(&ctx, &config, request)).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(TransferError::Internal {
                        message: format!("transfer {} driver panicked", ctx.handle.id()),
                    }),
                };
            ctx.handle.finish(result);
        });

        if let Ok(mut transfers) = self.transfers.lock() {
            transfers.retain(|f| !f.is_done());
            transfers.push(future.clone());
        }
        Ok(future)
    }

    /// Stop accepting transfers and wait for the outstanding ones.
    ///
    /// # Arguments
    /// * `cancel` - Cancel outstanding transfers instead of letting them finish
    pub async fn shutdown(&self, cancel: bool) {
        self.shut_down.store(true, Ordering::Release);

        let outstanding: Vec<TransferFuture> = match self.transfers.lock() {
            Ok(mut transfers) => std::mem::take(&mut *transfers),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        log::info!(
            "shutting down transfer manager: {} outstanding transfer(s), cancel={}",
            outstanding.len(),
            cancel
        );

        if cancel {
            for future in &outstanding {
                future.cancel();
            }
        }
        for future in &outstanding {
            let _ = future.wait().await;
        }
        self.pool.close();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

/// Resolve, plan, and execute one request.
async fn drive(ctx: &TransferContext, config: &TransferConfig, request: TransferRequest) -> TransferResult {
    ctx.handle.set_running();
    log::info!("transfer {}: starting {:?}", ctx.handle.id(), request.kind());

    let result: TransferResult = match request.kind() {
        TransferKind::Download { destination, .. } => {
            let destination: Arc<dyn RangedWriter> = destination.clone();
            let result: TransferResult = execute(ctx, config, &request).await;
            settle_download(destination.as_ref(), result).await
        }
        _ => execute(ctx, config, &request).await,
    };

    match &result {
        Ok(outcome) => log::info!(
            "transfer {}: {} of {} bytes to {:?} succeeded ({} part(s))",
            ctx.handle.id(),
            outcome.operation,
            outcome.bytes_transferred,
            outcome.destination,
            outcome.part_count
        ),
        Err(err) if err.is_cancelled() => log::info!("transfer {}: cancelled", ctx.handle.id()),
        Err(err) => log::info!("transfer {}: failed: {}", ctx.handle.id(), err),
    }
    result
}

/// Finalize the writer after a successful download, discard it otherwise.
async fn settle_download(destination: &dyn RangedWriter, result: TransferResult) -> TransferResult {
    match result {
        Ok(outcome) => match destination.finalize().await {
            Ok(()) => Ok(outcome),
            Err(e) => {
                if let Err(discard_err) = destination.discard().await {
                    log::warn!("failed to discard {}: {}", destination.describe(), discard_err);
                }
                Err(TransferError::Io {
                    path: destination.describe(),
                    message: e.to_string(),
                })
            }
        },
        Err(err) => {
            if let Err(discard_err) = destination.discard().await {
                log::warn!("failed to discard {}: {}", destination.describe(), discard_err);
            }
            Err(err)
        }
    }
}

async fn execute(ctx: &TransferContext, config: &TransferConfig, request: &TransferRequest) -> TransferResult {
    if ctx.handle.cancel_token().is_cancelled() {
        return Err(TransferError::Cancelled);
    }

    let operation: Operation = request.operation();
    let size: u64 = resolve_size(ctx, request).await?;
    ctx.handle.set_size(size);

    let plan: Plan = planner::plan(size, operation, config)?;
    ctx.handle.set_plan(plan.kind(), plan.part_count());
    log::debug!(
        "transfer {}: {} bytes planned as {:?} with {} part(s)",
        ctx.handle.id(),
        size,
        plan.kind(),
        plan.part_count()
    );

    let attributes = request.attributes();
    let e_tag: Option<String> = match (request.kind(), &plan) {
        (TransferKind::Upload { source, destination }, Plan::Single { range }) => {
            coordinator::put_single(ctx, source.clone(), destination, attributes, *range).await?
        }
        (TransferKind::Upload { source, destination }, Plan::Multipart(parts)) => {
            coordinator::upload_multipart(ctx, source.clone(), destination, attributes, parts).await?;
            None
        }
        (TransferKind::Download { source, destination }, Plan::Single { range }) => {
            coordinator::download_single(ctx, source, destination.clone(), *range).await?;
            None
        }
        (TransferKind::Download { source, destination }, Plan::Multipart(parts)) => {
            coordinator::download_multipart(ctx, source, destination.clone(), parts).await?;
            None
        }
        (TransferKind::Copy { source, destination }, Plan::Single { range }) => {
            coordinator::copy_single(ctx, source, destination, attributes, *range).await?
        }
        (TransferKind::Copy { source, destination }, Plan::Multipart(parts)) => {
            coordinator::copy_multipart(ctx, source, destination, attributes, parts).await?;
            None
        }
    };

    Ok(TransferOutcome {
        operation,
        destination: request.destination(),
        e_tag,
        bytes_transferred: ctx.handle.progress().transferred(),
        part_count: plan.part_count(),
    })
}

/// Size from the request, the upload source, or a HEAD on the remote source.
async fn resolve_size(ctx: &TransferContext, request: &TransferRequest) -> Result<u64, TransferError> {
    if let Some(size) = request.size() {
        return Ok(size);
    }
    match request.kind() {
        TransferKind::Upload { source, .. } => source.len().await.map_err(|e| TransferError::Io {
            path: source.describe(),
            message: e.to_string(),
        }),
        TransferKind::Download { source, .. } | TransferKind::Copy { source, .. } => {
            head_size(ctx, source).await
        }
    }
}

async fn head_size(ctx: &TransferContext, source: &ObjectLocation) -> Result<u64, TransferError> {
    let client: &dyn StoreClient = ctx.client.as_ref();
    let cancel: &CancellationToken = ctx.handle.cancel_token();
    match ctx.retry.run(cancel, || client.head_object(source)).await {
        Ok((info, _)) => Ok(info.size),
        Err(_) if cancel.is_cancelled() => Err(TransferError::Cancelled),
        Err((source, _)) => Err(TransferError::SizeDiscovery { source }),
    }
}
