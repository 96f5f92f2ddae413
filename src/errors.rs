use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Subprocess failed: {0}")]
    SubprocessFailure(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl AppError {
    pub fn not_found(kind: &str, id: &str) -> Self {
        Self::NotFound(format!("{} '{}'", kind, id))
    }

    pub fn file_system(path: &std::path::Path, err: impl std::fmt::Display) -> Self {
        Self::FileSystem(format!("{}: {}", path.display(), err))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
