//! Resume support: which chunks a session still needs

use super::types::{MissingChunk, UploadSession};

/// Indices in `[0, total_chunks)` that have not been accepted, ascending
pub fn missing_indices(session: &UploadSession) -> Vec<u64> {
    (0..session.total_chunks)
        .filter(|i| !session.chunks.contains_key(i))
        .collect()
}

/// Missing chunks with the byte range each one must cover
pub fn compute_missing(session: &UploadSession) -> Vec<MissingChunk> {
    missing_indices(session)
        .into_iter()
        .map(|index| {
            let start = index * session.chunk_size;
            let expected_size = session.expected_chunk_size(index);
            MissingChunk {
                chunk_index: index,
                start,
                end: start + expected_size,
                expected_size,
            }
        })
        .collect()
}
