//! Error types for queuelite.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Rejected before any state was touched (e.g. priority out of range).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A message id was not present in the directory the operation expected.
    #[error("message not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
