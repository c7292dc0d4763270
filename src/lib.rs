//! Depot Server Library
//!
//! Resumable chunked uploads into multipart-capable object storage, with a
//! per-user soft quota. The server binary is in main.rs.
//!
//! # Modules
//!
//! - `upload`: Session lifecycle, chunk acceptance, resume and finalize
//! - `quota`: Admission control and reconciliation against stored objects
//! - `storage`: Multipart backends (S3-compatible and local filesystem)
//! - `db`: SQLite session store, quota ledger and object registry

pub mod config;
pub mod db;
pub mod error;
pub mod quota;
pub mod routes;
pub mod state;
pub mod storage;
pub mod upload;

#[cfg(test)]
mod test_support;
