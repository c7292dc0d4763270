//! Storage module for multipart-capable object backends
//!
//! Supports S3-compatible services (MinIO, Cloudflare R2, Backblaze B2,
//! AWS S3) and a local filesystem backend.

mod local;
mod retry;
mod s3_client;
mod traits;
mod types;

pub use local::LocalStorage;
pub use retry::RetryPolicy;
pub use s3_client::S3Storage;
pub use traits::StorageAdapter;
pub use types::*;
