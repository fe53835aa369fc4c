use thiserror::Error;

/// Failures surfaced by the store and the modules layered on top of it.
///
/// None of these are fatal to the process: callers log them and drop the
/// single data point that could not be recorded.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),

    #[error("invalid import document: {0}")]
    InvalidImport(&'static str),
}

pub type Result<T> = std::result::Result<T, TrackerError>;
