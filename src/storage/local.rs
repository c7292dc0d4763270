//! Local filesystem storage
//!
//! Parts are staged under `<root>/.multipart/<upload_id>/` and concatenated
//! into `<root>/<object_key>` on completion.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::StorageError;

use super::traits::StorageAdapter;
use super::types::{CompletedObject, MultipartHandle, PartReference};

const STAGING_DIR: &str = ".multipart";

/// Filesystem-backed multipart storage
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn upload_dir(&self, upload_id: &str) -> PathBuf {
        self.root.join(STAGING_DIR).join(upload_id)
    }

    fn part_path(&self, upload_id: &str, part_number: u32) -> PathBuf {
        self.upload_dir(upload_id).join(format!("{:05}.part", part_number))
    }

    /// Resolve an object key below the root, rejecting traversal
    pub fn object_path(&self, object_key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(object_key);
        let is_clean = !object_key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
            && !object_key.starts_with(STAGING_DIR);

        if !is_clean {
            return Err(StorageError::InvalidKey(object_key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    async fn ensure_upload(&self, handle: &MultipartHandle) -> Result<PathBuf, StorageError> {
        let dir = self.upload_dir(&handle.upload_id);
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => Ok(dir),
            _ => Err(StorageError::UploadNotFound(handle.upload_id.clone())),
        }
    }
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[async_trait]
impl StorageAdapter for LocalStorage {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn initiate_multipart(
        &self,
        object_key: &str,
        _content_type: &str,
    ) -> Result<MultipartHandle, StorageError> {
        self.object_path(object_key)?;

        let upload_id = Uuid::new_v4().to_string();
        tokio::fs::create_dir_all(self.upload_dir(&upload_id)).await?;

        Ok(MultipartHandle {
            object_key: object_key.to_string(),
            upload_id,
        })
    }

    async fn upload_part(
        &self,
        handle: &MultipartHandle,
        part_number: u32,
        data: &[u8],
    ) -> Result<PartReference, StorageError> {
        let dir = self.ensure_upload(handle).await?;

        // Write to a unique temp file and rename, so concurrent uploads of
        // the same part number never interleave bytes.
        let tmp = dir.join(format!("{:05}.{}.tmp", part_number, Uuid::new_v4()));
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, self.part_path(&handle.upload_id, part_number)).await?;

        Ok(PartReference {
            part_number,
            etag: sha256_hex(data),
        })
    }

    async fn complete_multipart(
        &self,
        handle: &MultipartHandle,
        parts: &[PartReference],
    ) -> Result<CompletedObject, StorageError> {
        let dir = self.ensure_upload(handle).await?;
        let target = self.object_path(&handle.object_key)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let staging = dir.join(format!("assembled.{}.tmp", Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&staging).await?;
        let mut etag_hasher = Sha256::new();
        let mut size = 0u64;

        for part in parts {
            let path = self.part_path(&handle.upload_id, part.part_number);
            let data = match tokio::fs::read(&path).await {
                Ok(data) => data,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(StorageError::PartRejected {
                        part_number: part.part_number,
                        reason: "part was never uploaded".to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            };

            if sha256_hex(&data) != part.etag {
                return Err(StorageError::PartRejected {
                    part_number: part.part_number,
                    reason: "etag does not match stored content".to_string(),
                });
            }

            file.write_all(&data).await?;
            etag_hasher.update(part.etag.as_bytes());
            size += data.len() as u64;
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&staging, &target).await?;
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            tracing::warn!(upload_id = %handle.upload_id, error = %e, "Failed to remove staged parts");
        }

        Ok(CompletedObject {
            object_key: handle.object_key.clone(),
            etag: format!("{}-{}", hex::encode(etag_hasher.finalize()), parts.len()),
            size,
        })
    }

    async fn stat_object(&self, object_key: &str) -> Result<Option<CompletedObject>, StorageError> {
        let path = self.object_path(object_key)?;
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        Ok(Some(CompletedObject {
            object_key: object_key.to_string(),
            etag: sha256_hex(&data),
            size: data.len() as u64,
        }))
    }

    async fn abort_multipart(&self, handle: &MultipartHandle) -> Result<(), StorageError> {
        match tokio::fs::remove_dir_all(self.upload_dir(&handle.upload_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_multipart_assembles_parts_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path());

        let handle = storage
            .initiate_multipart("objects/u1/report.txt", "text/plain")
            .await
            .unwrap();

        // Upload out of order
        let second = storage.upload_part(&handle, 2, b"World!").await.unwrap();
        let first = storage.upload_part(&handle, 1, b"Hello, ").await.unwrap();

        let completed = storage
            .complete_multipart(&handle, &[first, second])
            .await
            .unwrap();

        assert_eq!(completed.size, 13);
        assert!(completed.etag.ends_with("-2"));

        let stored = tokio::fs::read(temp_dir.path().join("objects/u1/report.txt"))
            .await
            .unwrap();
        assert_eq!(stored, b"Hello, World!");
        assert!(!storage.upload_dir(&handle.upload_id).exists());
    }

    #[tokio::test]
    async fn test_reupload_replaces_part() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path());
        let handle = storage.initiate_multipart("a.bin", "").await.unwrap();

        storage.upload_part(&handle, 1, b"old").await.unwrap();
        let replaced = storage.upload_part(&handle, 1, b"new").await.unwrap();

        let completed = storage.complete_multipart(&handle, &[replaced]).await.unwrap();
        assert_eq!(completed.size, 3);
        assert_eq!(tokio::fs::read(temp_dir.path().join("a.bin")).await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_complete_with_missing_part_fails() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path());
        let handle = storage.initiate_multipart("a.bin", "").await.unwrap();

        let first = storage.upload_part(&handle, 1, b"data").await.unwrap();
        let ghost = PartReference {
            part_number: 2,
            etag: "feed".to_string(),
        };

        let result = storage.complete_multipart(&handle, &[first, ghost]).await;
        assert!(matches!(result, Err(StorageError::PartRejected { part_number: 2, .. })));
    }

    #[tokio::test]
    async fn test_stat_object_after_completion() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path());
        assert!(storage.stat_object("a.bin").await.unwrap().is_none());

        let handle = storage.initiate_multipart("a.bin", "").await.unwrap();
        let part = storage.upload_part(&handle, 1, b"data").await.unwrap();
        storage.complete_multipart(&handle, &[part]).await.unwrap();

        let stat = storage.stat_object("a.bin").await.unwrap().unwrap();
        assert_eq!(stat.size, 4);
        assert_eq!(stat.object_key, "a.bin");

        // The upload itself is gone once completed
        let again = storage.complete_multipart(&handle, &[]).await;
        assert!(matches!(again, Err(StorageError::UploadNotFound(_))));
    }

    #[tokio::test]
    async fn test_abort_discards_parts_and_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path());
        let handle = storage.initiate_multipart("a.bin", "").await.unwrap();
        storage.upload_part(&handle, 1, b"data").await.unwrap();

        storage.abort_multipart(&handle).await.unwrap();
        assert!(!storage.upload_dir(&handle.upload_id).exists());
        storage.abort_multipart(&handle).await.unwrap();

        let result = storage.upload_part(&handle, 1, b"late").await;
        assert!(matches!(result, Err(StorageError::UploadNotFound(_))));
    }

    #[test]
    fn test_object_path_rejects_traversal() {
        let storage = LocalStorage::new("/srv/depot");
        assert!(storage.object_path("objects/u1/file.pdf").is_ok());
        assert!(storage.object_path("../etc/passwd").is_err());
        assert!(storage.object_path("/etc/passwd").is_err());
        assert!(storage.object_path(".multipart/x").is_err());
        assert!(storage.object_path("").is_err());
    }
}
