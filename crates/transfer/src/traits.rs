//! Store client interface consumed by the transfer engine.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StoreError;
use crate::types::{ByteRange, ObjectAttributes, ObjectLocation};

/// Information about a remote object from a HEAD request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Object size in bytes.
    pub size: u64,
    /// Entity tag, if the store returned one.
    pub e_tag: Option<String>,
}

/// Handle on a remote multipart session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    /// Opaque upload identifier issued by the store.
    pub upload_id: String,
    /// Object the session will create.
    pub destination: ObjectLocation,
}

/// A finished part, as listed in the completion request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    /// One-based part number.
    pub part_number: u32,
    /// Entity tag returned when the part was stored.
    pub e_tag: String,
}

/// Low-level object store operations - implemented by each backend.
///
/// The engine never signs requests or speaks HTTP itself; everything goes
/// through this trait. Implementations must be safe to call concurrently.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Size and entity tag of an object.
    async fn head_object(&self, location: &ObjectLocation) -> Result<ObjectInfo, StoreError>;

    /// Upload a whole object in one request. Returns the entity tag.
    async fn put_object(
        &self,
        destination: &ObjectLocation,
        data: Bytes,
        attributes: &ObjectAttributes,
    ) -> Result<String, StoreError>;

    /// Read `range` of an object.
    async fn get_object(&self, source: &ObjectLocation, range: ByteRange) -> Result<Bytes, StoreError>;

    /// Copy a whole object on the store side. Returns the entity tag.
    async fn copy_object(
        &self,
        source: &ObjectLocation,
        destination: &ObjectLocation,
        attributes: &ObjectAttributes,
    ) -> Result<String, StoreError>;

    /// Start a multipart session. Returns the upload id.
    async fn create_multipart_upload(
        &self,
        destination: &ObjectLocation,
        attributes: &ObjectAttributes,
    ) -> Result<String, StoreError>;

    /// Upload one part. Returns the part's entity tag.
    async fn upload_part(
        &self,
        session: &SessionToken,
        part_number: u32,
        data: Bytes,
    ) -> Result<String, StoreError>;

    /// Copy `range` of `source` as one part. Returns the part's entity tag.
    async fn upload_part_copy(
        &self,
        session: &SessionToken,
        part_number: u32,
        source: &ObjectLocation,
        range: ByteRange,
    ) -> Result<String, StoreError>;

    /// Commit a multipart session. `parts` is sorted by ascending part number.
    async fn complete_multipart_upload(
        &self,
        session: &SessionToken,
        parts: &[CompletedPart],
    ) -> Result<(), StoreError>;

    /// Discard a multipart session and every part stored for it.
    async fn abort_multipart_upload(&self, session: &SessionToken) -> Result<(), StoreError>;
}
