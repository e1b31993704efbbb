//! Integration tests for uploads: single request and multipart sessions.

mod common;

use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use common::{config, location, payload, transient, Call, MockStore};
use rusty_transfer::{
    progress_fn, ByteRange, CompletedPart, FileSource, MemorySource, ObjectAttributes, ObjectInfo,
    ObjectLocation, PlanKind, RangedReader, SessionState, SessionToken, StoreClient, StoreError,
    TransferConfig, TransferError, TransferManager, TransferRequest, TransferState,
};

const MIB: u64 = 1024 * 1024;

fn manager(store: &Arc<MockStore>, config: TransferConfig) -> TransferManager {
    TransferManager::new(store.clone(), config)
}

fn upload(data: &[u8], key: &str) -> TransferRequest {
    TransferRequest::upload(Arc::new(MemorySource::new(data.to_vec())), location(key))
}

#[tokio::test]
async fn test_small_object_uses_single_put() {
    let store: Arc<MockStore> = Arc::new(MockStore::new());
    let manager = manager(&store, TransferConfig::default());
    let data: Vec<u8> = payload(4_000_000);

    let future = manager.submit(upload(&data, "small.bin")).unwrap();
    let outcome = future.wait().await.unwrap();

    assert_eq!(outcome.part_count, 1);
    assert_eq!(outcome.bytes_transferred, 4_000_000);
    assert!(outcome.e_tag.is_some());
    assert_eq!(future.plan_kind(), Some(PlanKind::Single));
    assert_eq!(future.session_state(), None);
    assert_eq!(store.count(|c| matches!(c, Call::PutObject { .. })), 1);
    assert_eq!(store.count(|c| matches!(c, Call::CreateMultipartUpload { .. })), 0);
    assert_eq!(store.object(&location("small.bin")).unwrap(), Bytes::from(data));
}

#[tokio::test]
async fn test_fifteen_megabytes_in_three_parts() {
    let store: Arc<MockStore> = Arc::new(MockStore::new());
    let cfg: TransferConfig = config(8 * MIB, 5 * MIB, 4, 8, 2);
    let manager = manager(&store, cfg);
    let data: Vec<u8> = payload(15_000_000);

    let future = manager.submit(upload(&data, "large.bin")).unwrap();
    let outcome = future.wait().await.unwrap();

    assert_eq!(outcome.part_count, 3);
    assert_eq!(outcome.bytes_transferred, 15_000_000);
    assert_eq!(future.state(), TransferState::Succeeded);
    assert_eq!(future.session_state(), Some(SessionState::Completed));
    assert_eq!(future.upload_id().as_deref(), Some("upload-1"));
    assert_eq!(store.upload_part_calls(), 3);
    assert_eq!(store.object(&location("large.bin")).unwrap(), Bytes::from(data));
    assert_eq!(store.open_uploads(), 0);
}

#[tokio::test]
async fn test_transient_part_failure_is_retried_and_progress_is_exact() {
    let store: Arc<MockStore> = Arc::new(MockStore::new());
    let failures: Arc<AtomicU32> = Arc::new(AtomicU32::new(0));
    let f = failures.clone();
    store.set_fault(move |call| match call {
        Call::UploadPart { part_number: 2, .. } if f.fetch_add(1, Ordering::SeqCst) < 3 => {
            Some(transient())
        }
        _ => None,
    });

    let reported: Arc<AtomicU64> = Arc::new(AtomicU64::new(0));
    let r = reported.clone();
    let manager = manager(&store, config(100, 100, 2, 4, 3));
    let data: Vec<u8> = payload(450);
    let request = upload(&data, "retry.bin").with_progress(Arc::new(progress_fn(move |n: u64| {
        r.fetch_add(n, Ordering::SeqCst);
    })));

    let future = manager.submit(request).unwrap();
    future.wait().await.unwrap();

    // 5 parts; part 2 failed on every allowed retry but the last.
    assert_eq!(
        store.count(|c| matches!(c, Call::UploadPart { part_number: 2, .. })),
        4
    );
    assert_eq!(store.upload_part_calls(), 8);
    assert_eq!(reported.load(Ordering::SeqCst), 450);
    assert_eq!(future.progress().bytes_transferred, 450);
    assert_eq!(future.progress().total_bytes, Some(450));
    assert_eq!(store.object(&location("retry.bin")).unwrap(), Bytes::from(data));
}

#[tokio::test]
async fn test_retry_exhaustion_aborts_once() {
    let store: Arc<MockStore> = Arc::new(MockStore::new());
    store.set_fault(|call| match call {
        Call::UploadPart { part_number: 2, .. } => Some(transient()),
        _ => None,
    });
    let manager = manager(&store, config(100, 100, 1, 2, 2));
    let data: Vec<u8> = payload(500);

    let future = manager.submit(upload(&data, "exhausted.bin")).unwrap();
    let err: TransferError = future.wait().await.unwrap_err();

    match &err {
        TransferError::PartFailed {
            index,
            attempts,
            source,
        } => {
            assert_eq!(*index, 2);
            assert_eq!(*attempts, 3);
            assert_eq!(*source, transient());
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(future.state(), TransferState::Failed);
    assert_eq!(future.session_state(), Some(SessionState::Aborted));
    assert_eq!(store.abort_calls(), 1);
    assert_eq!(store.complete_calls(), 0);
    assert_eq!(store.open_uploads(), 0);
    assert!(store.object(&location("exhausted.bin")).is_none());

    // No part request follows the abort.
    let calls: Vec<Call> = store.calls();
    let abort_at: usize = calls
        .iter()
        .position(|c| matches!(c, Call::AbortMultipartUpload { .. }))
        .unwrap();
    assert!(calls[abort_at + 1..].iter().all(|c| !c.is_part_call()));
}

#[tokio::test]
async fn test_permanent_part_error_is_not_retried() {
    let store: Arc<MockStore> = Arc::new(MockStore::new());
    store.set_fault(|call| match call {
        Call::UploadPart { part_number: 1, .. } => Some(StoreError::AccessDenied {
            bucket: "test-bucket".into(),
            key: "denied.bin".into(),
            message: "no write access".into(),
        }),
        _ => None,
    });
    let manager = manager(&store, config(100, 100, 1, 1, 5));

    let future = manager.submit(upload(&payload(300), "denied.bin")).unwrap();
    let err: TransferError = future.wait().await.unwrap_err();

    assert_eq!(err.part_index(), Some(1));
    assert!(matches!(err, TransferError::PartFailed { attempts: 1, .. }));
    assert!(matches!(err.store_error(), Some(StoreError::AccessDenied { .. })));
    assert_eq!(
        store.count(|c| matches!(c, Call::UploadPart { part_number: 1, .. })),
        1
    );
    assert_eq!(store.abort_calls(), 1);
}

#[tokio::test]
async fn test_abort_failure_keeps_primary_error() {
    let store: Arc<MockStore> = Arc::new(MockStore::new());
    store.set_fault(|call| match call {
        Call::UploadPart { part_number: 3, .. } => Some(StoreError::ServiceError {
            status: 400,
            code: Some("InvalidArgument".into()),
            message: "bad part".into(),
        }),
        Call::AbortMultipartUpload { .. } => Some(StoreError::AccessDenied {
            bucket: "test-bucket".into(),
            key: "leak.bin".into(),
            message: "abort not allowed".into(),
        }),
        _ => None,
    });
    let manager = manager(&store, config(100, 100, 1, 1, 0));

    let future = manager.submit(upload(&payload(400), "leak.bin")).unwrap();
    let err: TransferError = future.wait().await.unwrap_err();

    match &err {
        TransferError::AbortFailed { upload_id, .. } => assert_eq!(upload_id, "upload-1"),
        other => panic!("expected AbortFailed, got {:?}", other),
    }
    assert!(matches!(err.primary(), TransferError::PartFailed { index: 3, .. }));
    assert!(matches!(err.abort_error(), Some(StoreError::AccessDenied { .. })));
    assert_eq!(future.state(), TransferState::Failed);
    assert_eq!(future.session_state(), Some(SessionState::Aborted));
    assert_eq!(store.abort_calls(), 1);
}

#[tokio::test]
async fn test_initiate_failure_does_not_abort() {
    let store: Arc<MockStore> = Arc::new(MockStore::new());
    store.set_fault(|call| match call {
        Call::CreateMultipartUpload { .. } => Some(StoreError::AccessDenied {
            bucket: "test-bucket".into(),
            key: "k".into(),
            message: "denied".into(),
        }),
        _ => None,
    });
    let manager = manager(&store, config(100, 100, 1, 1, 3));

    let future = manager.submit(upload(&payload(250), "k")).unwrap();
    let err: TransferError = future.wait().await.unwrap_err();

    assert!(matches!(err, TransferError::Initiate { .. }));
    assert_eq!(store.upload_part_calls(), 0);
    assert_eq!(store.abort_calls(), 0);
    assert_eq!(future.upload_id(), None);
}

#[tokio::test]
async fn test_complete_failure_aborts_session() {
    let store: Arc<MockStore> = Arc::new(MockStore::new());
    store.set_fault(|call| match call {
        Call::CompleteMultipartUpload { .. } => Some(StoreError::ServiceError {
            status: 400,
            code: Some("EntityTooSmall".into()),
            message: "part too small".into(),
        }),
        _ => None,
    });
    let manager = manager(&store, config(100, 100, 2, 2, 3));

    let future = manager.submit(upload(&payload(250), "commit.bin")).unwrap();
    let err: TransferError = future.wait().await.unwrap_err();

    assert!(matches!(err, TransferError::Complete { .. }));
    assert_eq!(store.complete_calls(), 1);
    assert_eq!(store.abort_calls(), 1);
    assert_eq!(future.session_state(), Some(SessionState::Aborted));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_completion_lists_parts_in_order() {
    let store: Arc<MockStore> = Arc::new(MockStore::new());
    // Earlier parts finish later.
    store.set_latency(|call| match call {
        Call::UploadPart { part_number, .. } => Duration::from_millis(10 * (5 - *part_number as u64)),
        _ => Duration::ZERO,
    });
    let manager = manager(&store, config(100, 100, 4, 4, 0));
    let data: Vec<u8> = payload(400);

    manager
        .submit(upload(&data, "ordered.bin"))
        .unwrap()
        .wait()
        .await
        .unwrap();

    let completes: Vec<Vec<u32>> = store
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::CompleteMultipartUpload { part_numbers, .. } => Some(part_numbers),
            _ => None,
        })
        .collect();
    assert_eq!(completes, vec![vec![1, 2, 3, 4]]);
    assert_eq!(store.object(&location("ordered.bin")).unwrap(), Bytes::from(data));
}

/// Source whose reads fail past a given offset.
struct FailingSource {
    inner: MemorySource,
    fail_from: u64,
}

#[async_trait]
impl RangedReader for FailingSource {
    fn describe(&self) -> String {
        "failing-source".into()
    }

    async fn len(&self) -> io::Result<u64> {
        self.inner.len().await
    }

    async fn read_range(&self, range: ByteRange) -> io::Result<Bytes> {
        if range.start >= self.fail_from {
            return Err(io::Error::new(io::ErrorKind::Other, "disk read failed"));
        }
        self.inner.read_range(range).await
    }
}

#[tokio::test]
async fn test_source_read_error_fails_part_without_retry() {
    let store: Arc<MockStore> = Arc::new(MockStore::new());
    let manager = manager(&store, config(100, 100, 1, 1, 5));
    let source = FailingSource {
        inner: MemorySource::new(payload(300)),
        fail_from: 100,
    };

    let future = manager
        .submit(TransferRequest::upload(Arc::new(source), location("broken.bin")))
        .unwrap();
    let err: TransferError = future.wait().await.unwrap_err();

    assert_eq!(err.part_index(), Some(2));
    assert!(matches!(
        err.store_error(),
        Some(StoreError::IoError { path, .. }) if path == "failing-source"
    ));
    assert_eq!(
        store.count(|c| matches!(c, Call::UploadPart { part_number: 2, .. })),
        0
    );
    assert_eq!(store.abort_calls(), 1);
}

#[tokio::test]
async fn test_empty_object_is_single_put() {
    let store: Arc<MockStore> = Arc::new(MockStore::new());
    let manager = manager(&store, config(100, 100, 1, 1, 0));

    let future = manager.submit(upload(&[], "empty.bin")).unwrap();
    let outcome = future.wait().await.unwrap();

    assert_eq!(outcome.part_count, 1);
    assert_eq!(outcome.bytes_transferred, 0);
    assert_eq!(future.plan_kind(), Some(PlanKind::Single));
    assert_eq!(
        store.calls(),
        vec![Call::PutObject {
            destination: location("empty.bin"),
            len: 0
        }]
    );
}

#[tokio::test]
async fn test_single_put_failure_reports_request_failed() {
    let store: Arc<MockStore> = Arc::new(MockStore::new());
    store.set_fault(|call| match call {
        Call::PutObject { .. } => Some(StoreError::Throttled {
            message: "slow down".into(),
        }),
        _ => None,
    });
    let manager = manager(&store, config(100, 100, 1, 1, 2));

    let err: TransferError = manager
        .submit(upload(&payload(50), "throttled.bin"))
        .unwrap()
        .wait()
        .await
        .unwrap_err();

    assert!(matches!(err, TransferError::RequestFailed { attempts: 3, .. }));
    assert_eq!(err.part_index(), None);
    assert_eq!(store.count(|c| matches!(c, Call::PutObject { .. })), 3);
}

#[tokio::test]
async fn test_upload_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("source.bin");
    let data: Vec<u8> = payload(1_000);
    std::fs::write(&path, &data).unwrap();

    let store: Arc<MockStore> = Arc::new(MockStore::new());
    let manager = manager(&store, config(256, 256, 3, 3, 0));
    let destination: ObjectLocation = location("from-file.bin");

    let source = Arc::new(FileSource::open(&path).unwrap());
    let outcome = manager
        .submit(TransferRequest::upload(source, destination.clone()))
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(outcome.part_count, 4);
    assert_eq!(store.object(&destination).unwrap(), Bytes::from(data));
}

#[tokio::test]
async fn test_explicit_size_skips_source_length() {
    let store: Arc<MockStore> = Arc::new(MockStore::new());
    let manager = manager(&store, config(100, 100, 1, 1, 0));
    let data: Vec<u8> = payload(200);

    // Only the first 150 bytes are sent.
    let request = upload(&data, "prefix.bin").with_size(150);
    let outcome = manager.submit(request).unwrap().wait().await.unwrap();

    assert_eq!(outcome.part_count, 2);
    assert_eq!(
        store.object(&location("prefix.bin")).unwrap(),
        Bytes::copy_from_slice(&data[..150])
    );
}

#[tokio::test]
async fn test_too_large_object_is_rejected_before_any_request() {
    let store: Arc<MockStore> = Arc::new(MockStore::new());
    let cfg: TransferConfig = TransferConfig::builder().with_max_parts(1).build().unwrap();
    let manager = manager(&store, cfg);

    // Size is declared, not read; the planner rejects it first.
    let request = upload(&[], "huge.bin").with_size(6 * 1024 * MIB);
    let err: TransferError = manager.submit(request).unwrap().wait().await.unwrap_err();

    assert!(matches!(err, TransferError::InvalidRequest { .. }));
    assert!(store.calls().is_empty());
}

/// Delegates to `MockStore` but panics when uploading one part.
struct PanickingStore {
    inner: Arc<MockStore>,
    panic_on_part: u32,
}

#[async_trait]
impl StoreClient for PanickingStore {
    async fn head_object(&self, location: &ObjectLocation) -> Result<ObjectInfo, StoreError> {
        self.inner.head_object(location).await
    }

    async fn put_object(
        &self,
        destination: &ObjectLocation,
        data: Bytes,
        attributes: &ObjectAttributes,
    ) -> Result<String, StoreError> {
        self.inner.put_object(destination, data, attributes).await
    }

    async fn get_object(&self, source: &ObjectLocation, range: ByteRange) -> Result<Bytes, StoreError> {
        self.inner.get_object(source, range).await
    }

    async fn copy_object(
        &self,
        source: &ObjectLocation,
        destination: &ObjectLocation,
        attributes: &ObjectAttributes,
    ) -> Result<String, StoreError> {
        self.inner.copy_object(source, destination, attributes).await
    }

    async fn create_multipart_upload(
        &self,
        destination: &ObjectLocation,
        attributes: &ObjectAttributes,
    ) -> Result<String, StoreError> {
        self.inner.create_multipart_upload(destination, attributes).await
    }

    async fn upload_part(
        &self,
        session: &SessionToken,
        part_number: u32,
        data: Bytes,
    ) -> Result<String, StoreError> {
        if part_number == self.panic_on_part {
            panic!("store client bug on part {}", part_number);
        }
        self.inner.upload_part(session, part_number, data).await
    }

    async fn upload_part_copy(
        &self,
        session: &SessionToken,
        part_number: u32,
        source: &ObjectLocation,
        range: ByteRange,
    ) -> Result<String, StoreError> {
        self.inner.upload_part_copy(session, part_number, source, range).await
    }

    async fn complete_multipart_upload(
        &self,
        session: &SessionToken,
        parts: &[CompletedPart],
    ) -> Result<(), StoreError> {
        self.inner.complete_multipart_upload(session, parts).await
    }

    async fn abort_multipart_upload(&self, session: &SessionToken) -> Result<(), StoreError> {
        self.inner.abort_multipart_upload(session).await
    }
}

#[tokio::test]
async fn test_panicking_part_stops_dispatch() {
    let store: Arc<MockStore> = Arc::new(MockStore::new());
    let client: Arc<PanickingStore> = Arc::new(PanickingStore {
        inner: store.clone(),
        panic_on_part: 1,
    });
    let manager = TransferManager::new(client, config(100, 100, 1, 2, 0));

    let future = manager.submit(upload(&payload(2_000), "panic.bin")).unwrap();
    let err: TransferError = future.wait().await.unwrap_err();

    match &err {
        TransferError::PartFailed { index, attempts, .. } => {
            assert_eq!(*index, 1);
            assert_eq!(*attempts, 1);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(future.state(), TransferState::Failed);
    // Part 1 never reached the store, and nothing was sent after it.
    assert_eq!(store.upload_part_calls(), 0);
    assert_eq!(store.abort_calls(), 1);
    assert_eq!(store.complete_calls(), 0);
    assert_eq!(manager.pool_metrics().panicked, 1);
}

#[tokio::test]
async fn test_cancel_during_initiate_backoff() {
    let store: Arc<MockStore> = Arc::new(MockStore::new());
    store.set_fault(|call| match call {
        Call::CreateMultipartUpload { .. } => Some(transient()),
        _ => None,
    });
    let cfg = TransferConfig::builder()
        .with_multipart_threshold(100)
        .with_multipart_chunksize(100)
        .with_num_retry_attempts(5)
        .with_backoff(Duration::from_secs(5), Duration::from_secs(5), 1.0)
        .build()
        .unwrap();
    let manager = manager(&store, cfg);

    let future = manager.submit(upload(&payload(300), "initiate.bin")).unwrap();
    while store.count(|c| matches!(c, Call::CreateMultipartUpload { .. })) == 0 {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    future.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), future.wait())
        .await
        .expect("cancellation should interrupt the initiate backoff");
    assert!(matches!(result, Err(TransferError::Cancelled)));
    assert_eq!(store.count(|c| matches!(c, Call::CreateMultipartUpload { .. })), 1);
    assert_eq!(store.count(|c| c.is_part_call()), 0);
    assert_eq!(store.abort_calls(), 0);
}
