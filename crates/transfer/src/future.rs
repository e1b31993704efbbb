//! Caller-facing transfer handle.
//!
//! The engine keeps the only `TransferHandle` for a transfer and drives it
//! to a terminal state; callers hold any number of `TransferFuture` clones
//! observing the same shared state.

use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::TransferError;
use crate::planner::PlanKind;
use crate::progress::ProgressAggregator;
use crate::session::SessionState;
use crate::types::{Operation, TransferOutcome, TransferProgress};

/// Result delivered to every waiter.
pub type TransferResult = Result<TransferOutcome, TransferError>;

/// Lifecycle of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Succeeded | TransferState::Failed | TransferState::Cancelled
        )
    }
}

#[derive(Debug, Default)]
struct FutureMeta {
    size: Option<u64>,
    plan_kind: Option<PlanKind>,
    part_count: Option<u32>,
    upload_id: Option<String>,
    session_state: Option<SessionState>,
}

#[derive(Debug)]
struct FutureShared {
    id: u64,
    operation: Operation,
    state: watch::Sender<TransferState>,
    result: OnceLock<TransferResult>,
    cancel: CancellationToken,
    progress: Arc<ProgressAggregator>,
    meta: Mutex<FutureMeta>,
}

/// Observer handle returned by `TransferManager::submit`.
///
/// Cheap to clone. All clones see the same state and the same result.
#[derive(Debug, Clone)]
pub struct TransferFuture {
    shared: Arc<FutureShared>,
}

impl TransferFuture {
    /// Identifier assigned by the manager, unique per manager.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn operation(&self) -> Operation {
        self.shared.operation
    }

    pub fn state(&self) -> TransferState {
        *self.shared.state.borrow()
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn progress(&self) -> TransferProgress {
        self.shared.progress.snapshot()
    }

    /// Object size, once known.
    pub fn size(&self) -> Option<u64> {
        self.meta(|m| m.size)
    }

    /// Strategy chosen by the planner, once planned.
    pub fn plan_kind(&self) -> Option<PlanKind> {
        self.meta(|m| m.plan_kind)
    }

    /// Number of parts, once planned.
    pub fn part_count(&self) -> Option<u32> {
        self.meta(|m| m.part_count)
    }

    /// Upload id of the multipart session, once the store issued one.
    pub fn upload_id(&self) -> Option<String> {
        self.meta(|m| m.upload_id.clone())
    }

    /// State of the multipart session, if one was started.
    pub fn session_state(&self) -> Option<SessionState> {
        self.meta(|m| m.session_state)
    }

    fn meta<T>(&self, f: impl FnOnce(&FutureMeta) -> T) -> T {
        match self.shared.meta.lock() {
            Ok(meta) => f(&meta),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    /// Request cancellation.
    ///
    /// Cooperative: queued parts are skipped and no new parts are submitted,
    /// but requests already sent run to completion. Has no effect once the
    /// transfer reached a terminal state.
    pub fn cancel(&self) {
        if !self.is_done() {
            self.shared.cancel.cancel();
        }
    }

    /// Whether cancellation was requested.
    pub fn is_cancel_requested(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Terminal result, if the transfer has finished.
    pub fn try_result(&self) -> Option<TransferResult> {
        if !self.is_done() {
            return None;
        }
        self.shared.result.get().cloned()
    }

    /// Wait for the transfer to finish.
    ///
    /// # Returns
    /// The outcome, or the terminal error. A cancelled transfer returns
    /// `TransferError::Cancelled` (wrapped in `AbortFailed` if the session
    /// abort also failed).
    pub async fn wait(&self) -> TransferResult {
        let mut rx: watch::Receiver<TransferState> = self.shared.state.subscribe();
        // The sender lives in `shared`, which `self` keeps alive.
        let _ = rx.wait_for(|state| state.is_terminal()).await;
        match self.shared.result.get() {
            Some(result) => result.clone(),
            None => Err(TransferError::Internal {
                message: "transfer reached a terminal state without a result".into(),
            }),
        }
    }

    /// Block the current thread until the transfer finishes.
    ///
    /// Must not be called from within an async context.
    pub fn wait_blocking(&self) -> TransferResult {
        futures::executor::block_on(self.wait())
    }
}

/// Mutating side of a transfer, held by the engine.
#[derive(Debug, Clone)]
pub(crate) struct TransferHandle {
    shared: Arc<FutureShared>,
}

impl TransferHandle {
    /// New `Pending` transfer and its first observer.
    pub(crate) fn new(
        id: u64,
        operation: Operation,
        progress: Arc<ProgressAggregator>,
    ) -> (TransferHandle, TransferFuture) {
        let (state, _) = watch::channel(TransferState::Pending);
        let shared: Arc<FutureShared> = Arc::new(FutureShared {
            id,
            operation,
            state,
            result: OnceLock::new(),
            cancel: CancellationToken::new(),
            progress,
            meta: Mutex::new(FutureMeta::default()),
        });
        (
            TransferHandle {
                shared: shared.clone(),
            },
            TransferFuture { shared },
        )
    }

    pub(crate) fn id(&self) -> u64 {
        self.shared.id
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.shared.cancel
    }

    pub(crate) fn progress(&self) -> &Arc<ProgressAggregator> {
        &self.shared.progress
    }

    /// `Pending → Running`.
    pub(crate) fn set_running(&self) {
        self.shared.state.send_if_modified(|state| {
            if *state == TransferState::Pending {
                *state = TransferState::Running;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn set_size(&self, size: u64) {
        self.shared.progress.set_total(size);
        self.update_meta(|m| m.size = Some(size));
    }

    pub(crate) fn set_plan(&self, kind: PlanKind, part_count: u32) {
        self.update_meta(|m| {
            m.plan_kind = Some(kind);
            m.part_count = Some(part_count);
        });
    }

    pub(crate) fn set_session_state(&self, state: SessionState) {
        self.update_meta(|m| m.session_state = Some(state));
    }

    pub(crate) fn set_upload_id(&self, upload_id: &str) {
        self.update_meta(|m| m.upload_id = Some(upload_id.to_string()));
    }

    fn update_meta(&self, f: impl FnOnce(&mut FutureMeta)) {
        match self.shared.meta.lock() {
            Ok(mut meta) => f(&mut meta),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Publish the terminal result. Only the first call has any effect.
    pub(crate) fn finish(&self, result: TransferResult) {
        let terminal: TransferState = match &result {
            Ok(_) => TransferState::Succeeded,
            Err(err) if err.is_cancelled() => TransferState::Cancelled,
            Err(_) => TransferState::Failed,
        };
        if self.shared.result.set(result).is_err() {
            return;
        }
        self.shared.state.send_replace(terminal);
    }
}
