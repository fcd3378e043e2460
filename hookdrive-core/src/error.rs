use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("chunk upload failed: {0}")]
    Upload(String),

    #[error("chunk download failed: {0}")]
    Download(String),

    #[error("no healthy endpoint available")]
    NoHealthyEndpoint,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("manifest conflict: {0}")]
    Conflict(String),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl DriveError {
    /// Collapses chunk transfer failures into a plain I/O failure, which is all
    /// the protocol front-ends know how to report.
    pub fn into_io_failure(self) -> Self {
        match self {
            DriveError::Upload(message) | DriveError::Download(message) => {
                DriveError::Io(std::io::Error::other(message))
            }
            DriveError::NoHealthyEndpoint => {
                DriveError::Io(std::io::Error::other("no healthy endpoint available"))
            }
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, DriveError>;
