use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum CsdmError {
    #[error("product not found on remote archive: {0}")]
    ProductNotFound(String),

    #[error("unsupported job type: {0}")]
    UnsupportedJobType(String),

    #[error("decoder failed: {0}")]
    DecodeFailure(String),

    #[error("transfer failed for {path}: {message}")]
    TransferFailure { path: String, message: String },

    #[error("space budget exceeded: need {needed} bytes, {available} available")]
    QuotaExceeded { needed: u64, available: u64 },

    #[error("invalid job request: {0}")]
    InvalidRequest(String),

    #[error("invalid date: {0}")]
    InvalidDate(String),

    #[error("invalid filter criteria: {0}")]
    InvalidFilter(String),

    #[error("remote archive request failed: {0}")]
    ArchiveHttp(String),

    #[error("remote archive session failed: {0}")]
    ArchiveSession(String),

    #[error("remote archive returned status {status}: {message}")]
    ArchiveStatus { status: u16, message: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job {job_id} is {status}; its store can only be rewritten once it has completed")]
    JobBusy { job_id: String, status: String },

    #[error("required tool not found: {0}")]
    MissingTool(String),
}

impl From<rusqlite::Error> for CsdmError {
    fn from(err: rusqlite::Error) -> Self {
        CsdmError::Storage(err.to_string())
    }
}
