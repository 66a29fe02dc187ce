use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Remote path not found: {path} ({reason})")]
    NotFound { path: String, reason: String },

    #[error("Cannot ascend {requested} level(s) from depth {depth}")]
    InvalidAscend { requested: usize, depth: usize },

    #[error("No session became available within {0:?}")]
    ResourceUnavailable(Duration),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transfer task failed: {0}")]
    Task(String),
}

impl Error {
    pub fn not_found(path: impl Into<String>, reason: impl ToString) -> Self {
        Error::NotFound {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Library result type alias
pub type Result<T> = std::result::Result<T, Error>;
