//! S3-compatible storage client
//!
//! Wraps the AWS SDK multipart API for S3-compatible storage access.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::DisplayErrorContext,
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart},
    Client,
};

use crate::config::S3Config;
use crate::error::StorageError;

use super::traits::StorageAdapter;
use super::types::{CompletedObject, MultipartHandle, PartReference};

/// S3-compatible multipart storage
#[derive(Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
}

impl S3Storage {
    /// Create a new S3 client from configuration
    pub async fn new(config: &S3Config) -> Result<Self, StorageError> {
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "depot",
        );

        let region = config
            .region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());

        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint)
            .region(Region::new(region))
            .credentials_provider(credentials)
            .force_path_style(true) // Required for MinIO and other S3-compatible services
            .build();

        let client = Client::from_conf(s3_config);

        // Test connection by checking if bucket exists
        let bucket = config.bucket.clone();
        match client.head_bucket().bucket(&bucket).send().await {
            Ok(_) => {
                tracing::info!("Connected to S3 bucket: {}", bucket);
            }
            Err(e) => {
                tracing::warn!(
                    "Could not verify bucket {}: {}. Will attempt operations anyway.",
                    bucket,
                    DisplayErrorContext(&e)
                );
            }
        }

        Ok(Self { client, bucket })
    }

    /// Get the bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

/// Map an SDK failure onto the storage error taxonomy
fn classify(operation: &str, upload_id: &str, message: String) -> StorageError {
    if message.contains("NoSuchUpload") {
        StorageError::UploadNotFound(upload_id.to_string())
    } else if message.contains("NoSuchBucket") {
        StorageError::BucketNotFound(message)
    } else if message.contains("InvalidPart")
        || message.contains("EntityTooSmall")
        || message.contains("InvalidArgument")
    {
        StorageError::MultipartFailed(format!("{}: {}", operation, message))
    } else {
        StorageError::SdkError(format!("Failed to {}: {}", operation, message))
    }
}

#[async_trait]
impl StorageAdapter for S3Storage {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn initiate_multipart(
        &self,
        object_key: &str,
        content_type: &str,
    ) -> Result<MultipartHandle, StorageError> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(object_key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| classify("create multipart upload", "", DisplayErrorContext(&e).to_string()))?;

        let upload_id = output
            .upload_id()
            .ok_or_else(|| StorageError::SdkError("No upload ID returned from S3".to_string()))?;

        Ok(MultipartHandle {
            object_key: object_key.to_string(),
            upload_id: upload_id.to_string(),
        })
    }

    async fn upload_part(
        &self,
        handle: &MultipartHandle,
        part_number: u32,
        data: &[u8],
    ) -> Result<PartReference, StorageError> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&handle.object_key)
            .upload_id(&handle.upload_id)
            .part_number(part_number as i32)
            .content_length(data.len() as i64)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|e| classify("upload part", &handle.upload_id, DisplayErrorContext(&e).to_string()))?;

        let etag = output
            .e_tag()
            .ok_or_else(|| StorageError::SdkError("No ETag returned for uploaded part".to_string()))?;

        Ok(PartReference {
            part_number,
            etag: etag.to_string(),
        })
    }

    async fn complete_multipart(
        &self,
        handle: &MultipartHandle,
        parts: &[PartReference],
    ) -> Result<CompletedObject, StorageError> {
        let completed_parts: Vec<CompletedPart> = parts
            .iter()
            .map(|part| {
                CompletedPart::builder()
                    .e_tag(&part.etag)
                    .part_number(part.part_number as i32)
                    .build()
            })
            .collect();

        let multipart_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        let output = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&handle.object_key)
            .upload_id(&handle.upload_id)
            .multipart_upload(multipart_upload)
            .send()
            .await
            .map_err(|e| {
                classify("complete multipart upload", &handle.upload_id, DisplayErrorContext(&e).to_string())
            })?;

        // The completion response carries no size, so ask for it
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&handle.object_key)
            .send()
            .await
            .map_err(|e| classify("head object", &handle.upload_id, DisplayErrorContext(&e).to_string()))?;

        let etag = output
            .e_tag()
            .or_else(|| head.e_tag())
            .unwrap_or_default()
            .to_string();

        Ok(CompletedObject {
            object_key: handle.object_key.clone(),
            etag,
            size: head.content_length().unwrap_or(0).max(0) as u64,
        })
    }

    async fn stat_object(&self, object_key: &str) -> Result<Option<CompletedObject>, StorageError> {
        let head = match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await
        {
            Ok(head) => head,
            Err(e) => {
                let message = DisplayErrorContext(&e).to_string();
                if message.contains("NotFound") || message.contains("NoSuchKey") {
                    return Ok(None);
                }
                return Err(classify("head object", object_key, message));
            }
        };

        Ok(Some(CompletedObject {
            object_key: object_key.to_string(),
            etag: head.e_tag().unwrap_or_default().to_string(),
            size: head.content_length().unwrap_or(0).max(0) as u64,
        }))
    }

    async fn abort_multipart(&self, handle: &MultipartHandle) -> Result<(), StorageError> {
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&handle.object_key)
            .upload_id(&handle.upload_id)
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => match classify("abort multipart upload", &handle.upload_id, DisplayErrorContext(&e).to_string()) {
                StorageError::UploadNotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }
}
