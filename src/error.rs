use std::path::PathBuf;

use thiserror::Error;

use crate::source::Compression;

/// Error type produced by user callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Invalid dispatcher setup, detected before any row is read.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot call on_data without parse")]
    HandlerWithoutParser,
    #[error("invalid number of workers: {0}")]
    InvalidWorkers(usize),
}

/// A source could not be opened or its decoder could not be initialized.
#[derive(Debug, Error)]
pub enum SourceOpenError {
    #[error("could not open file '{path}': {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not request '{url}': {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{codec} failed for '{origin}': {reason}")]
    Decompress {
        origin: String,
        codec: Compression,
        reason: &'static str,
    },
    #[error("could not read from '{origin}': {source}")]
    Io {
        origin: String,
        #[source]
        source: std::io::Error,
    },
}

/// Which step of row processing produced a [`RowError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowStage {
    Read,
    PreParse,
    Parse,
    Handler,
}

/// A failure scoped to one row. Delivered to the `on_error` callback, never
/// returned from [`Dispatcher::run`](crate::Dispatcher::run).
#[derive(Debug, Error)]
pub enum RowError {
    #[error("could not read line #{line}: {source}")]
    Read {
        line: u64,
        #[source]
        source: csv_async::Error,
    },
    #[error("on_row error: line {line}: {source}")]
    PreParse {
        line: u64,
        #[source]
        source: BoxError,
    },
    #[error("parse error: line {line}: {source}")]
    Parse {
        line: u64,
        #[source]
        source: BoxError,
    },
    #[error("on_data error: line {line}: {source}")]
    Handler {
        line: u64,
        #[source]
        source: BoxError,
    },
}

impl RowError {
    /// 1-based ordinal of the row, in read order.
    pub fn line(&self) -> u64 {
        match self {
            RowError::Read { line, .. }
            | RowError::PreParse { line, .. }
            | RowError::Parse { line, .. }
            | RowError::Handler { line, .. } => *line,
        }
    }

    pub fn stage(&self) -> RowStage {
        match self {
            RowError::Read { .. } => RowStage::Read,
            RowError::PreParse { .. } => RowStage::PreParse,
            RowError::Parse { .. } => RowStage::Parse,
            RowError::Handler { .. } => RowStage::Handler,
        }
    }
}

/// Error type returned by this crate when not using `anyhow`.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Open(#[from] SourceOpenError),
    #[error("Missing required header: {0}")]
    MissingHeader(String),
    #[error(transparent)]
    Csv(#[from] csv_async::Error),
}

pub type DispatchResult<T> = std::result::Result<T, DispatchError>;
