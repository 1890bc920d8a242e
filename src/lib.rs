//! Streaming CSV row dispatch with bounded concurrency.
//!
//! - Sources: local files, HTTP(S) bodies, or any `AsyncRead`; gzip/zstd and
//!   non-UTF-8 charsets are decoded transparently.
//! - Records are read one at a time, in document order, by a single loop.
//! - Each record is handed to a worker that runs the optional `on_row` hook,
//!   `parse` function and `on_data` handler; at most `workers` rows are in
//!   flight at once.
//! - Per-row failures are routed to `on_error` tagged with the row ordinal and
//!   never abort the run.
//!
//! Data shape:
//! - `Record { line, fields }` (access with `get(idx) -> Option<&str>` or `record[idx]`)
//! - `RunSummary { rows_read, read_errors, failed_rows, cancelled }`
#![cfg_attr(docsrs, feature(doc_cfg))]
//
mod callbacks;
mod codec;
mod dispatch;
mod error;
mod source;
mod tokenizer;
mod worker;

pub use crate::callbacks::{Callbacks, DataHandler, ErrorHandler, ParseFn, RowHook};
pub use crate::dispatch::{Dispatcher, RunSummary};
pub use crate::error::{
    BoxError, ConfigError, DispatchError, DispatchResult, RowError, RowStage, SourceOpenError,
};
pub use crate::source::{
    Compression, FileSource, HttpSource, Location, ReaderSource, Source, SourceMeta, SourceStream,
};
pub use crate::tokenizer::{Headers, Record, TokenizerConfig};

pub use tokio_util::sync::CancellationToken;
