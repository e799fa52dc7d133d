use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("response body timed out: {0}")]
    Timeout(String),

    #[error("node client is shutting down, call rejected")]
    Shutdown,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("fork inconsistency: {0}")]
    ForkInconsistency(String),

    #[error("impossible chain state: {0}")]
    ImpossibleState(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<serde_json::Error> for IndexerError {
    fn from(err: serde_json::Error) -> Self {
        IndexerError::Decode(err.to_string())
    }
}

impl From<sqlx::Error> for IndexerError {
    fn from(err: sqlx::Error) -> Self {
        IndexerError::Store(err.to_string())
    }
}

impl From<reqwest::Error> for IndexerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            IndexerError::Timeout(err.to_string())
        } else {
            IndexerError::Transport(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, IndexerError>;
