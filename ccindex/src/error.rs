//! Error types for CCIndex operations.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Corrupt input: {0}")]
    CorruptInput(String),

    #[error("Parquet {path} is missing required column {column}")]
    SchemaMismatch { path: PathBuf, column: String },

    #[error("Resource exhaustion: {0}")]
    ResourceExhaustion(String),

    #[error("Another pipeline process appears to be alive: {0}")]
    Contention(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Stage failed: {0}")]
    Stage(String),
}

impl Error {
    /// True when retrying the same unit of work may succeed (network and
    /// other transient I/O failures).
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(_) => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
