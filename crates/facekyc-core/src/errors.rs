use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use facekyc_config::ConfigError;
use serde::Serialize;
use thiserror::Error;

use crate::faces::store::ContentId;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid user id '{user}': {message}")]
    InvalidUser { user: String, message: String },

    #[error("embedding failed validation: {0}")]
    InvalidEmbedding(String),

    #[error("embedding dimension mismatch: expected {expected} values, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("similarity threshold {0} is outside [0, 1]")]
    InvalidThreshold(f64),

    #[error("user {user} already exists")]
    UserAlreadyExists { user: String },

    #[error("user {user} not found")]
    UserNotFound { user: String },

    #[error("content {cid} not found in content store")]
    ContentNotFound { cid: ContentId },

    #[error("failed to decrypt embedding: {0}")]
    Decryption(String),

    #[error("embedding encryption error: {0}")]
    Encryption(String),

    #[error("content store unavailable: {0}")]
    StorageUnavailable(String),

    #[error("content store {operation} timed out after {}ms", .after.as_millis())]
    StorageTimeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("failed to read user registry {path}: {source}")]
    RegistryRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write user registry {path}: {source}")]
    RegistryWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("user registry {path} is invalid: {message}")]
    InvalidRegistry { path: PathBuf, message: String },

    #[error("user registry task failed: {0}")]
    RegistryTask(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("secret key is missing or empty")]
    MissingKey,

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Failure classes callers branch on instead of matching message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    AlreadyExists,
    NotFound,
    Crypto,
    Storage,
    Configuration,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Crypto => "crypto",
            ErrorKind::Storage => "storage",
            ErrorKind::Configuration => "configuration",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::InvalidUser { .. } => ErrorKind::Validation,
            AppError::InvalidEmbedding(_) => ErrorKind::Validation,
            AppError::DimensionMismatch { .. } => ErrorKind::Validation,
            AppError::InvalidThreshold(_) => ErrorKind::Validation,
            AppError::UserAlreadyExists { .. } => ErrorKind::AlreadyExists,
            AppError::UserNotFound { .. } => ErrorKind::NotFound,
            AppError::ContentNotFound { .. } => ErrorKind::NotFound,
            AppError::Decryption(_) => ErrorKind::Crypto,
            AppError::Encryption(_) => ErrorKind::Crypto,
            AppError::StorageUnavailable(_) => ErrorKind::Storage,
            AppError::StorageTimeout { .. } => ErrorKind::Storage,
            AppError::RegistryRead { .. } => ErrorKind::Storage,
            AppError::RegistryWrite { .. } => ErrorKind::Storage,
            AppError::InvalidRegistry { .. } => ErrorKind::Storage,
            AppError::RegistryTask(_) => ErrorKind::Storage,
            AppError::Serialization(_) => ErrorKind::Storage,
            AppError::MissingKey => ErrorKind::Configuration,
            AppError::Config(_) => ErrorKind::Configuration,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, AppError::StorageTimeout { .. })
    }

    pub fn human_message(&self) -> String {
        self.to_string()
    }
}

pub type AppResult<T> = Result<T, AppError>;

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}
