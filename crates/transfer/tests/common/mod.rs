//! Shared helpers for transfer integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rusty_transfer::{
    ByteRange, CompletedPart, ObjectAttributes, ObjectInfo, ObjectLocation, SessionToken,
    StoreClient, StoreError, TransferConfig,
};

/// A store request as seen by `MockStore`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    HeadObject { location: ObjectLocation },
    PutObject { destination: ObjectLocation, len: u64 },
    GetObject { source: ObjectLocation, range: ByteRange },
    CopyObject { source: ObjectLocation, destination: ObjectLocation },
    CreateMultipartUpload { destination: ObjectLocation },
    UploadPart { upload_id: String, part_number: u32 },
    UploadPartCopy { upload_id: String, part_number: u32, range: ByteRange },
    CompleteMultipartUpload { upload_id: String, part_numbers: Vec<u32> },
    AbortMultipartUpload { upload_id: String },
}

impl Call {
    /// Calls that carry part data and run on pool workers.
    pub fn is_part_call(&self) -> bool {
        matches!(
            self,
            Call::UploadPart { .. } | Call::UploadPartCopy { .. } | Call::GetObject { .. }
        )
    }
}

type FaultFn = dyn Fn(&Call) -> Option<StoreError> + Send + Sync;
type LatencyFn = dyn Fn(&Call) -> Duration + Send + Sync;

struct PendingUpload {
    destination: ObjectLocation,
    parts: BTreeMap<u32, Bytes>,
}

/// In-memory `StoreClient` with call recording and fault injection.
#[derive(Default)]
pub struct MockStore {
    objects: Mutex<HashMap<ObjectLocation, Bytes>>,
    uploads: Mutex<HashMap<String, PendingUpload>>,
    next_upload_id: AtomicU64,
    calls: Mutex<Vec<Call>>,
    fault: Mutex<Option<Arc<FaultFn>>>,
    latency: Mutex<Option<Arc<LatencyFn>>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_object(&self, location: &ObjectLocation, data: impl Into<Bytes>) {
        self.objects
            .lock()
            .unwrap()
            .insert(location.clone(), data.into());
    }

    pub fn object(&self, location: &ObjectLocation) -> Option<Bytes> {
        self.objects.lock().unwrap().get(location).cloned()
    }

    /// Fail every call for which `fault` returns an error.
    pub fn set_fault<F>(&self, fault: F)
    where
        F: Fn(&Call) -> Option<StoreError> + Send + Sync + 'static,
    {
        *self.fault.lock().unwrap() = Some(Arc::new(fault));
    }

    /// Delay every call by the duration `latency` returns.
    pub fn set_latency<F>(&self, latency: F)
    where
        F: Fn(&Call) -> Duration + Send + Sync + 'static,
    {
        *self.latency.lock().unwrap() = Some(Arc::new(latency));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    pub fn upload_part_calls(&self) -> usize {
        self.count(|c| matches!(c, Call::UploadPart { .. }))
    }

    pub fn abort_calls(&self) -> usize {
        self.count(|c| matches!(c, Call::AbortMultipartUpload { .. }))
    }

    pub fn complete_calls(&self) -> usize {
        self.count(|c| matches!(c, Call::CompleteMultipartUpload { .. }))
    }

    /// Highest number of part calls observed running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Multipart sessions neither completed nor aborted.
    pub fn open_uploads(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }

    /// Record `call`, apply latency, and return the injected fault, if any.
    async fn enter(&self, call: Call) -> Result<Option<InFlight<'_>>, StoreError> {
        self.calls.lock().unwrap().push(call.clone());

        let guard: Option<InFlight<'_>> = if call.is_part_call() {
            let now: usize = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            Some(InFlight(&self.in_flight))
        } else {
            None
        };

        let latency: Option<Arc<LatencyFn>> = self.latency.lock().unwrap().clone();
        if let Some(latency) = latency {
            let delay: Duration = latency(&call);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        let fault: Option<Arc<FaultFn>> = self.fault.lock().unwrap().clone();
        if let Some(err) = fault.and_then(|f| f(&call)) {
            return Err(err);
        }
        Ok(guard)
    }

    fn read(&self, location: &ObjectLocation) -> Result<Bytes, StoreError> {
        self.object(location).ok_or_else(|| StoreError::NotFound {
            bucket: location.bucket.clone(),
            key: location.key.clone(),
        })
    }

    fn slice(data: &Bytes, range: ByteRange) -> Result<Bytes, StoreError> {
        if range.end > data.len() as u64 {
            return Err(StoreError::ServiceError {
                status: 416,
                code: Some("InvalidRange".into()),
                message: format!("range {} beyond {} bytes", range, data.len()),
            });
        }
        Ok(data.slice(range.start as usize..range.end as usize))
    }

    fn e_tag(data: &[u8]) -> String {
        format!("etag-{}-{}", data.len(), data.iter().map(|b| *b as u64).sum::<u64>())
    }
}

#[async_trait]
impl StoreClient for MockStore {
    async fn head_object(&self, location: &ObjectLocation) -> Result<ObjectInfo, StoreError> {
        let _guard = self
            .enter(Call::HeadObject {
                location: location.clone(),
            })
            .await?;
        let data: Bytes = self.read(location)?;
        Ok(ObjectInfo {
            size: data.len() as u64,
            e_tag: Some(Self::e_tag(&data)),
        })
    }

    async fn put_object(
        &self,
        destination: &ObjectLocation,
        data: Bytes,
        _attributes: &ObjectAttributes,
    ) -> Result<String, StoreError> {
        let _guard = self
            .enter(Call::PutObject {
                destination: destination.clone(),
                len: data.len() as u64,
            })
            .await?;
        let e_tag: String = Self::e_tag(&data);
        self.insert_object(destination, data);
        Ok(e_tag)
    }

    async fn get_object(&self, source: &ObjectLocation, range: ByteRange) -> Result<Bytes, StoreError> {
        let _guard = self
            .enter(Call::GetObject {
                source: source.clone(),
                range,
            })
            .await?;
        let data: Bytes = self.read(source)?;
        Self::slice(&data, range)
    }

    async fn copy_object(
        &self,
        source: &ObjectLocation,
        destination: &ObjectLocation,
        _attributes: &ObjectAttributes,
    ) -> Result<String, StoreError> {
        let _guard = self
            .enter(Call::CopyObject {
                source: source.clone(),
                destination: destination.clone(),
            })
            .await?;
        let data: Bytes = self.read(source)?;
        let e_tag: String = Self::e_tag(&data);
        self.insert_object(destination, data);
        Ok(e_tag)
    }

    async fn create_multipart_upload(
        &self,
        destination: &ObjectLocation,
        _attributes: &ObjectAttributes,
    ) -> Result<String, StoreError> {
        let _guard = self
            .enter(Call::CreateMultipartUpload {
                destination: destination.clone(),
            })
            .await?;
        let upload_id: String = format!("upload-{}", self.next_upload_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.uploads.lock().unwrap().insert(
            upload_id.clone(),
            PendingUpload {
                destination: destination.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        session: &SessionToken,
        part_number: u32,
        data: Bytes,
    ) -> Result<String, StoreError> {
        let _guard = self
            .enter(Call::UploadPart {
                upload_id: session.upload_id.clone(),
                part_number,
            })
            .await?;
        let e_tag: String = Self::e_tag(&data);
        let mut uploads = self.uploads.lock().unwrap();
        let upload = uploads
            .get_mut(&session.upload_id)
            .ok_or_else(|| StoreError::ServiceError {
                status: 404,
                code: Some("NoSuchUpload".into()),
                message: session.upload_id.clone(),
            })?;
        upload.parts.insert(part_number, data);
        Ok(e_tag)
    }

    async fn upload_part_copy(
        &self,
        session: &SessionToken,
        part_number: u32,
        source: &ObjectLocation,
        range: ByteRange,
    ) -> Result<String, StoreError> {
        let _guard = self
            .enter(Call::UploadPartCopy {
                upload_id: session.upload_id.clone(),
                part_number,
                range,
            })
            .await?;
        let data: Bytes = Self::slice(&self.read(source)?, range)?;
        let e_tag: String = Self::e_tag(&data);
        let mut uploads = self.uploads.lock().unwrap();
        let upload = uploads
            .get_mut(&session.upload_id)
            .ok_or_else(|| StoreError::ServiceError {
                status: 404,
                code: Some("NoSuchUpload".into()),
                message: session.upload_id.clone(),
            })?;
        upload.parts.insert(part_number, data);
        Ok(e_tag)
    }

    async fn complete_multipart_upload(
        &self,
        session: &SessionToken,
        parts: &[CompletedPart],
    ) -> Result<(), StoreError> {
        let _guard = self
            .enter(Call::CompleteMultipartUpload {
                upload_id: session.upload_id.clone(),
                part_numbers: parts.iter().map(|p| p.part_number).collect(),
            })
            .await?;
        let upload: PendingUpload = self
            .uploads
            .lock()
            .unwrap()
            .remove(&session.upload_id)
            .ok_or_else(|| StoreError::ServiceError {
                status: 404,
                code: Some("NoSuchUpload".into()),
                message: session.upload_id.clone(),
            })?;

        let mut assembled: Vec<u8> = Vec::new();
        for part in parts {
            let data: &Bytes = upload.parts.get(&part.part_number).ok_or_else(|| StoreError::ServiceError {
                status: 400,
                code: Some("InvalidPart".into()),
                message: format!("part {} was never uploaded", part.part_number),
            })?;
            if Self::e_tag(data) != part.e_tag {
                return Err(StoreError::ServiceError {
                    status: 400,
                    code: Some("InvalidPart".into()),
                    message: format!("entity tag mismatch for part {}", part.part_number),
                });
            }
            assembled.extend_from_slice(data);
        }
        self.insert_object(&upload.destination, assembled);
        Ok(())
    }

    async fn abort_multipart_upload(&self, session: &SessionToken) -> Result<(), StoreError> {
        let _guard = self
            .enter(Call::AbortMultipartUpload {
                upload_id: session.upload_id.clone(),
            })
            .await?;
        self.uploads.lock().unwrap().remove(&session.upload_id);
        Ok(())
    }
}

/// Deterministic, non-repeating-looking test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub fn transient() -> StoreError {
    StoreError::NetworkError {
        message: "connection reset by peer".into(),
        retryable: true,
    }
}

/// Small-part configuration with millisecond backoff.
pub fn config(threshold: u64, chunksize: u64, concurrency: usize, queue: usize, retries: u32) -> TransferConfig {
    TransferConfig::builder()
        .with_multipart_threshold(threshold)
        .with_multipart_chunksize(chunksize)
        .with_max_concurrency(concurrency)
        .with_max_io_queue_size(queue)
        .with_num_retry_attempts(retries)
        .with_backoff(Duration::from_millis(1), Duration::from_millis(4), 2.0)
        .build()
        .unwrap()
}

pub fn location(key: &str) -> ObjectLocation {
    ObjectLocation::new("test-bucket", key)
}
