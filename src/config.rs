//! Configuration management for Depot Server

use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::storage::RetryPolicy;
use crate::upload::{
    COMPLETED_RETENTION_SECS, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MAX_FILE_SIZE, MAX_PARTS,
    SESSION_EXPIRY_HOURS,
};

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub upload: UploadConfig,
    pub quota: QuotaConfig,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root directory for the local backend
    pub local_path: String,
    pub s3: Option<S3Config>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Local,
    S3,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    pub provider: StorageProvider,
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    Minio,
    R2,
    S3,
    B2,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub session_store: SessionStoreKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStoreKind {
    Sqlite,
    Memory,
}

/// Chunked upload limits and session lifetimes
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    pub default_chunk_size: u64,
    pub max_chunk_size: u64,
    pub max_file_size: u64,
    pub max_parts: u64,
    pub session_ttl_hours: i64,
    /// How long a completed session keeps its finalize result (0 = delete at once)
    pub completed_retention_secs: i64,
    pub sweep_interval_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            max_chunk_size: MAX_CHUNK_SIZE,
            max_file_size: MAX_FILE_SIZE,
            max_parts: MAX_PARTS,
            session_ttl_hours: SESSION_EXPIRY_HOURS,
            completed_retention_secs: COMPLETED_RETENTION_SECS,
            sweep_interval_secs: 300,
        }
    }
}

impl UploadConfig {
    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.session_ttl_hours)
    }

    pub fn completed_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.completed_retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Soft quota admission settings
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    pub default_limit_bytes: u64,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
    pub drift_threshold_bytes: u64,
    pub reconcile_interval_secs: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_limit_bytes: 10 * 1024 * 1024 * 1024,
            cache_ttl_secs: 30,
            cache_capacity: 10_000,
            drift_threshold_bytes: 1024 * 1024,
            reconcile_interval_secs: 3600,
        }
    }
}

/// Storage backend retry and timeout budget
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub call_timeout_secs: u64,
    pub finalize_budget_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            call_timeout_secs: 60,
            finalize_budget_secs: 300,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
        }
    }

    pub fn finalize_budget(&self) -> Duration {
        Duration::from_secs(self.finalize_budget_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            storage: StorageConfig {
                backend: StorageBackend::Local,
                local_path: "./data".to_string(),
                s3: None,
            },
            database: DatabaseConfig {
                url: "sqlite:./depot.db".to_string(),
                session_store: SessionStoreKind::Sqlite,
            },
            upload: UploadConfig::default(),
            quota: QuotaConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let backend = match env::var("STORAGE_BACKEND")
            .unwrap_or_else(|_| "local".to_string())
            .as_str()
        {
            "local" => StorageBackend::Local,
            "s3" => StorageBackend::S3,
            other => {
                return Err(ConfigError::Invalid {
                    var: "STORAGE_BACKEND",
                    value: other.to_string(),
                })
            }
        };

        let s3 = if backend == StorageBackend::S3 {
            Some(S3Config {
                provider: match env::var("S3_PROVIDER").unwrap_or_else(|_| "minio".to_string()).as_str() {
                    "r2" => StorageProvider::R2,
                    "s3" => StorageProvider::S3,
                    "b2" => StorageProvider::B2,
                    _ => StorageProvider::Minio,
                },
                endpoint: required("S3_ENDPOINT")?,
                bucket: required("S3_BUCKET")?,
                access_key: required("S3_ACCESS_KEY")?,
                secret_key: required("S3_SECRET_KEY")?,
                region: env::var("S3_REGION").ok(),
            })
        } else {
            None
        };

        let session_store = match env::var("SESSION_STORE")
            .unwrap_or_else(|_| "sqlite".to_string())
            .as_str()
        {
            "sqlite" => SessionStoreKind::Sqlite,
            "memory" => SessionStoreKind::Memory,
            other => {
                return Err(ConfigError::Invalid {
                    var: "SESSION_STORE",
                    value: other.to_string(),
                })
            }
        };

        let upload = UploadConfig {
            default_chunk_size: parsed("UPLOAD_DEFAULT_CHUNK_SIZE", defaults.upload.default_chunk_size)?,
            max_chunk_size: parsed("UPLOAD_MAX_CHUNK_SIZE", defaults.upload.max_chunk_size)?,
            max_file_size: parsed("UPLOAD_MAX_FILE_SIZE", defaults.upload.max_file_size)?,
            max_parts: parsed("UPLOAD_MAX_PARTS", defaults.upload.max_parts)?,
            session_ttl_hours: parsed("UPLOAD_SESSION_TTL_HOURS", defaults.upload.session_ttl_hours)?,
            completed_retention_secs: parsed(
                "UPLOAD_COMPLETED_RETENTION_SECS",
                defaults.upload.completed_retention_secs,
            )?,
            sweep_interval_secs: parsed("UPLOAD_SWEEP_INTERVAL_SECS", defaults.upload.sweep_interval_secs)?,
        };

        let quota = QuotaConfig {
            default_limit_bytes: parsed("QUOTA_DEFAULT_LIMIT_BYTES", defaults.quota.default_limit_bytes)?,
            cache_ttl_secs: parsed("QUOTA_CACHE_TTL_SECS", defaults.quota.cache_ttl_secs)?,
            cache_capacity: parsed("QUOTA_CACHE_CAPACITY", defaults.quota.cache_capacity)?,
            drift_threshold_bytes: parsed(
                "QUOTA_DRIFT_THRESHOLD_BYTES",
                defaults.quota.drift_threshold_bytes,
            )?,
            reconcile_interval_secs: parsed(
                "QUOTA_RECONCILE_INTERVAL_SECS",
                defaults.quota.reconcile_interval_secs,
            )?,
        };

        let retry = RetryConfig {
            attempts: parsed("STORAGE_RETRY_ATTEMPTS", defaults.retry.attempts)?,
            base_delay_ms: parsed("STORAGE_RETRY_BASE_MS", defaults.retry.base_delay_ms)?,
            max_delay_ms: parsed("STORAGE_RETRY_MAX_MS", defaults.retry.max_delay_ms)?,
            call_timeout_secs: parsed("STORAGE_CALL_TIMEOUT_SECS", defaults.retry.call_timeout_secs)?,
            finalize_budget_secs: parsed("FINALIZE_BUDGET_SECS", defaults.retry.finalize_budget_secs)?,
        };

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: parsed("SERVER_PORT", defaults.server.port)?,
            },
            storage: StorageConfig {
                backend,
                local_path: env::var("LOCAL_STORAGE_PATH")
                    .unwrap_or_else(|_| defaults.storage.local_path.clone()),
                s3,
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or_else(|_| defaults.database.url.clone()),
                session_store,
            },
            upload,
            quota,
            retry,
        })
    }
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    env::var(var).map_err(|_| ConfigError::Missing(var))
}

fn parsed<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
        Err(_) => Ok(default),
    }
}
