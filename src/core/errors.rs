use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("scan root '{0}' does not exist")]
    RootNotFound(String),
    #[error("scan root '{0}' is not a directory")]
    NotADirectory(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("background task failed: {0}")]
    TaskJoin(String),
    #[error("other error: {0}")]
    Other(String),
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::TaskJoin(err.to_string())
    }
}
