use thiserror::Error;

use crate::recording::CaptureError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("record already exists: {0}")]
    Duplicate(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("gateway error: {0}")]
    Gateway(String),

    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("navigation is locked while a recording session is active")]
    NavigationLocked,

    #[error("background task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
