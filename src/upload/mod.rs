//! Chunked, resumable uploads
//!
//! Protocol Flow:
//! 1. Client initiates with file name and size; quota is checked and a
//!    backend multipart upload is opened
//! 2. Client sends chunks in any order, each with its SHA-256 digest
//! 3. After a disconnect the client asks which chunks are still missing
//! 4. Client finalizes; the parts are assembled, charged to quota and
//!    registered as an object

pub mod digest;
pub mod finalize;
pub mod resume;
pub mod session;
pub mod store;
pub mod types;

pub use digest::{compute_digest, normalize_digest, verify_chunk};
pub use finalize::FinalizationCoordinator;
pub use resume::{compute_missing, missing_indices};
pub use session::{object_key, SessionManager};
pub use store::{MemorySessionStore, SessionStore};
pub use types::*;
