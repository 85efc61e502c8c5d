use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("CONNECTIVITY: {0}")]
    Connectivity(String),
    #[error("VALIDATION: {0}")]
    Validation(String),
    #[error("UNAVAILABLE: {0}")]
    Unavailable(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("REPLAY_FAILED: {0}")]
    Replay(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    /// True for failures that mean "the backing store could not be reached",
    /// as opposed to failures of the request itself.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        if is_connectivity_failure(&value) {
            Self::Connectivity(value.to_string())
        } else {
            Self::Internal(value.to_string())
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

fn is_connectivity_failure(error: &rusqlite::Error) -> bool {
    use rusqlite::ErrorCode;
    match error {
        rusqlite::Error::SqliteFailure(failure, _) => matches!(
            failure.code,
            ErrorCode::CannotOpen
                | ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::SystemIoFailure
                | ErrorCode::NotADatabase
        ),
        _ => false,
    }
}

pub type AppResult<T> = Result<T, AppError>;
