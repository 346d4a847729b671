//! Runner error type.

use regimelab_core::{ConfigError, EngineError, FeedError};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("unsupported config format for {path} (expected .toml or .json)")]
    UnsupportedFormat { path: PathBuf },

    #[error("failed to parse {format} config: {message}")]
    Parse { format: &'static str, message: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error("invalid parameter grid: {reason}")]
    Grid { reason: String },

    #[error("sweep candidate {candidate}: {source}")]
    Candidate {
        candidate: String,
        #[source]
        source: Box<RunnerError>,
    },

    #[error("sweep cancelled")]
    Cancelled,

    #[error("no live session for symbol '{0}'")]
    UnknownSymbol(String),

    #[error("live session for '{0}' already exists")]
    DuplicateSymbol(String),

    #[error("live session for '{0}' is poisoned by an earlier panic")]
    SessionPoisoned(String),
}
