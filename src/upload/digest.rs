//! Chunk integrity verification
//!
//! Digests are hex SHA-256. Clients may send them upper-case or with a
//! `sha256:` prefix.

use sha2::{Digest, Sha256};

use super::types::UploadError;

/// Compute SHA-256 hash of data
pub fn compute_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Canonical form of a client-supplied digest
pub fn normalize_digest(claimed: &str) -> String {
    let trimmed = claimed.trim();
    let bare = trimmed
        .strip_prefix("sha256:")
        .or_else(|| trimmed.strip_prefix("SHA256:"))
        .unwrap_or(trimmed);
    bare.to_ascii_lowercase()
}

/// Recompute the digest of chunk `index` and compare it to the claim.
///
/// Returns the canonical digest on success.
pub fn verify_chunk(index: u64, data: &[u8], claimed: &str) -> Result<String, UploadError> {
    let claimed = normalize_digest(claimed);
    let actual = compute_digest(data);

    if actual != claimed {
        return Err(UploadError::ChunkIntegrityError {
            index,
            claimed,
            actual,
        });
    }
    Ok(actual)
}
