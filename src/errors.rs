use std::io;

use thiserror::Error;

/// Every failure the core reports back over stdout. The `Display` text is
/// what lands in `{success: false, error}` replies.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    /// Non-success status from the image API.
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Crypto error: {0}")]
    Crypto(String),
    /// Missing game, record, directory or command.
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Config error: {0}")]
    Config(String),
    /// Helper or game process could not be started or tracked.
    #[error("Process error: {0}")]
    Process(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
