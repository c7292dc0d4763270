//! Storage types

use serde::{Deserialize, Serialize};

/// Backend handle for an open multipart upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartHandle {
    /// Key the completed object will be stored under
    pub object_key: String,
    /// Backend-assigned upload id
    pub upload_id: String,
}

/// Backend receipt for one uploaded part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartReference {
    /// 1-based part number
    pub part_number: u32,
    /// Opaque tag returned by the backend
    pub etag: String,
}

/// An object produced by completing a multipart upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedObject {
    pub object_key: String,
    pub etag: String,
    pub size: u64,
}
