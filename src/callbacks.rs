use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::error::{BoxError, ConfigError, RowError};
use crate::tokenizer::Record;

pub type RowHook = Arc<dyn Fn(&Record) -> Result<(), BoxError> + Send + Sync>;
pub type ParseFn<T> = Arc<dyn Fn(&Record) -> Result<T, BoxError> + Send + Sync>;
pub type DataHandler<T> = Arc<dyn Fn(T) -> Result<(), BoxError> + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(RowError) + Send + Sync>;

/// The pluggable steps applied to every row. All slots are optional.
///
/// With more than one worker every callback may run concurrently on several
/// threads, so shared state behind them needs its own synchronization.
pub struct Callbacks<T> {
    pub(crate) on_row: Option<RowHook>,
    pub(crate) parse: Option<ParseFn<T>>,
    pub(crate) on_data: Option<DataHandler<T>>,
    pub(crate) on_error: Option<ErrorHandler>,
}

impl<T> Callbacks<T> {
    pub fn new() -> Self {
        Self {
            on_row: None,
            parse: None,
            on_data: None,
            on_error: None,
        }
    }

    /// Inspect the raw row before parsing. An error skips the row.
    pub fn on_row<F, E>(mut self, f: F) -> Self
    where
        F: Fn(&Record) -> Result<(), E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        let hook: RowHook = Arc::new(move |record: &Record| f(record).map_err(Into::into));
        self.on_row = Some(hook);
        self
    }

    /// Turn a raw row into the caller's data type.
    pub fn parse<F, E>(mut self, f: F) -> Self
    where
        F: Fn(&Record) -> Result<T, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        let parse: ParseFn<T> = Arc::new(move |record: &Record| f(record).map_err(Into::into));
        self.parse = Some(parse);
        self
    }

    /// Accept a parsed row. Requires [`parse`](Self::parse).
    pub fn on_data<F, E>(mut self, f: F) -> Self
    where
        F: Fn(T) -> Result<(), E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        let handler: DataHandler<T> = Arc::new(move |data: T| f(data).map_err(Into::into));
        self.on_data = Some(handler);
        self
    }

    /// Receive every per-row failure. Without it, row errors are dropped.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(RowError) + Send + Sync + 'static,
    {
        let handler: ErrorHandler = Arc::new(f);
        self.on_error = Some(handler);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.on_data.is_some() && self.parse.is_none() {
            return Err(ConfigError::HandlerWithoutParser);
        }
        Ok(())
    }

    pub(crate) fn report(&self, err: RowError) {
        match &self.on_error {
            Some(on_error) => on_error(err),
            None => trace!(line = err.line(), stage = ?err.stage(), "row error dropped"),
        }
    }
}

impl<T> Default for Callbacks<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Callbacks<T> {
    fn clone(&self) -> Self {
        Self {
            on_row: self.on_row.clone(),
            parse: self.parse.clone(),
            on_data: self.on_data.clone(),
            on_error: self.on_error.clone(),
        }
    }
}

impl<T> fmt::Debug for Callbacks<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_row", &self.on_row.is_some())
            .field("parse", &self.parse.is_some())
            .field("on_data", &self.on_data.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}
