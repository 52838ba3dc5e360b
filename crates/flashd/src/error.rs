use std::path::PathBuf;
use thiserror::Error;

use crate::db::DatabaseError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Device '{identity}' is not connected")]
    DeviceNotFound { identity: String },

    #[error("Device '{identity}' already has an active job '{job_id}'")]
    Conflict { identity: String, job_id: String },

    #[error("Job '{job_id}' not found")]
    JobNotFound { job_id: String },

    #[error("Failed to read firmware '{path}': {source}")]
    Firmware {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Metrics error: {0}")]
    Store(#[from] MetricsError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Hotplug error: {0}")]
    Hotplug(#[from] HotplugError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Scheduler is shutting down")]
    Shutdown,
}

impl From<DatabaseError> for EngineError {
    fn from(e: DatabaseError) -> Self {
        EngineError::Store(MetricsError::Database(e))
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Invalid port pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Failed to store record for job '{job_id}': {source}")]
    StoreWriteFailed {
        job_id: String,
        #[source]
        source: DatabaseError,
    },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid value for '{field}': {value}")]
    Parse { field: &'static str, value: String },
}

impl MetricsError {
    /// Duplicate job ids are permanent; everything else may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            MetricsError::StoreWriteFailed {
                source: DatabaseError::Duplicate { .. },
                ..
            }
        )
    }
}

#[derive(Error, Debug)]
pub enum HotplugError {
    #[error("Failed to enumerate serial ports: {0}")]
    Enumerate(#[from] serialport::Error),

    #[error("Failed to watch '{path}': {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("Invalid port pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, EngineError>;
