//! Daemon error type.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NavError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Hardware error: {0}")]
    Hardware(#[from] yantra_io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, NavError>;
