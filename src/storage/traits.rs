//! Storage adapter trait
//!
//! The minimal multipart contract the upload engine drives. Backends own
//! durability and encryption at rest; the engine only sequences calls.

use async_trait::async_trait;

use crate::error::StorageError;

use super::types::{CompletedObject, MultipartHandle, PartReference};

/// Multipart-capable object storage backend
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Open a multipart upload for `object_key`.
    async fn initiate_multipart(
        &self,
        object_key: &str,
        content_type: &str,
    ) -> Result<MultipartHandle, StorageError>;

    /// Upload one part. Re-uploading a part number replaces the earlier part.
    ///
    /// # Arguments
    /// * `handle` - Handle from `initiate_multipart`
    /// * `part_number` - Part number (starts from 1)
    /// * `data` - Part bytes
    async fn upload_part(
        &self,
        handle: &MultipartHandle,
        part_number: u32,
        data: &[u8],
    ) -> Result<PartReference, StorageError>;

    /// Assemble the given parts, in order, into the final object.
    async fn complete_multipart(
        &self,
        handle: &MultipartHandle,
        parts: &[PartReference],
    ) -> Result<CompletedObject, StorageError>;

    /// Size and etag of a stored object, or `None` if nothing is stored
    /// under `object_key`.
    async fn stat_object(&self, object_key: &str) -> Result<Option<CompletedObject>, StorageError>;

    /// Discard all uploaded parts and the upload handle.
    ///
    /// Aborting an unknown or already-aborted upload succeeds.
    async fn abort_multipart(&self, handle: &MultipartHandle) -> Result<(), StorageError>;
}
