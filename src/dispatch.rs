use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::callbacks::Callbacks;
use crate::error::{ConfigError, DispatchResult, RowError, SourceOpenError};
use crate::source::{Source, SourceMeta};
use crate::tokenizer::{Headers, Tokenizer, TokenizerConfig};
use crate::worker::process_row;

/// What a completed run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Records handed to a worker.
    pub rows_read: u64,
    /// Records the tokenizer could not produce.
    pub read_errors: u64,
    /// Dispatched rows whose hook, parser or handler failed (or panicked).
    pub failed_rows: u64,
    /// The loop stopped because the cancellation token fired.
    pub cancelled: bool,
}

/// Streams records from a source and fans them out to a bounded set of workers.
///
/// Reads are strictly sequential and in document order. Each record is then
/// processed on its own blocking task: `on_row`, then `parse`, then `on_data`.
/// Processing order across workers is not guaranteed when `workers > 1`.
///
/// ```no_run
/// use csv_dispatch::{Callbacks, Dispatcher, FileSource, Record};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn demo() -> anyhow::Result<()> {
/// let mut dispatcher = Dispatcher::open(FileSource::new("places.csv.gz")).await?;
/// let headers = dispatcher.read_headers().await?;
/// let name = headers.require(&["name"])?[0];
///
/// let dispatcher = dispatcher.with_callbacks(
///     Callbacks::new()
///         .parse(move |r: &Record| Ok::<_, std::convert::Infallible>(r[name].to_string()))
///         .on_data(|name: String| {
///             println!("{name}");
///             Ok::<_, std::convert::Infallible>(())
///         })
///         .on_error(|err| eprintln!("{err}")),
/// );
/// let summary = dispatcher.run(&CancellationToken::new(), 4).await?;
/// println!("{} rows", summary.rows_read);
/// # Ok(())
/// # }
/// ```
pub struct Dispatcher<'a, T> {
    tokenizer: Tokenizer<'a>,
    callbacks: Callbacks<T>,
}

impl<'a, T: 'static> Dispatcher<'a, T> {
    /// Open `source` with the default tokenizer settings.
    pub async fn open<S: Source<'a>>(source: S) -> Result<Self, SourceOpenError> {
        Self::open_with(source, TokenizerConfig::default()).await
    }

    pub async fn open_with<S: Source<'a>>(
        source: S,
        config: TokenizerConfig,
    ) -> Result<Self, SourceOpenError> {
        let stream = source.open().await?;
        Ok(Self {
            tokenizer: Tokenizer::new(stream, &config),
            callbacks: Callbacks::new(),
        })
    }

    pub fn with_callbacks(mut self, callbacks: Callbacks<T>) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn callbacks_mut(&mut self) -> &mut Callbacks<T> {
        &mut self.callbacks
    }

    pub fn meta(&self) -> &SourceMeta {
        self.tokenizer.meta()
    }

    /// Consume the first record as column names. Call before [`run`](Self::run);
    /// header rows do not take a row ordinal.
    pub async fn read_headers(&mut self) -> DispatchResult<Headers> {
        self.tokenizer.read_headers().await
    }

    /// Read every record and process it with up to `workers` rows in flight.
    ///
    /// Returns once the stream is exhausted (or `cancel` fires) and every
    /// dispatched row has finished. The source is closed on every path. Row
    /// failures go to `on_error` only; the only error returned here is an
    /// invalid configuration, in which case nothing is read.
    pub async fn run(
        self,
        cancel: &CancellationToken,
        workers: usize,
    ) -> Result<RunSummary, ConfigError> {
        let Self {
            mut tokenizer,
            callbacks,
        } = self;

        callbacks.validate()?;
        if workers < 1 || workers > Semaphore::MAX_PERMITS {
            return Err(ConfigError::InvalidWorkers(workers));
        }

        // It is safe to reuse records with 1 worker.
        tokenizer.restrict_reuse(workers == 1);

        let origin = tokenizer.meta().origin.clone();
        debug!(%origin, workers, "dispatch started");

        let callbacks = Arc::new(callbacks);
        let slots = Arc::new(Semaphore::new(workers));
        let mut in_flight: JoinSet<bool> = JoinSet::new();
        let mut summary = RunSummary::default();
        let mut line: u64 = 0;

        loop {
            let acquired = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    summary.cancelled = true;
                    break;
                }
                permit = Arc::clone(&slots).acquire_owned() => permit,
            };
            // The semaphore is never closed.
            let Ok(permit) = acquired else { break };

            while let Some(done) = in_flight.try_join_next() {
                tally(&mut summary, done);
            }

            line += 1;
            match tokenizer.read(line).await {
                Ok(Some(record)) => {
                    summary.rows_read += 1;
                    let callbacks = Arc::clone(&callbacks);
                    in_flight.spawn_blocking(move || {
                        let ok = process_row(&callbacks, record);
                        drop(permit);
                        ok
                    });
                }
                Ok(None) => {
                    trace!(line, "end of stream");
                    break;
                }
                Err(source) => {
                    drop(permit);
                    summary.read_errors += 1;
                    callbacks.report(RowError::Read { line, source });
                }
            }
        }

        while let Some(done) = in_flight.join_next().await {
            tally(&mut summary, done);
        }
        drop(tokenizer);

        info!(
            %origin,
            rows_read = summary.rows_read,
            read_errors = summary.read_errors,
            failed_rows = summary.failed_rows,
            cancelled = summary.cancelled,
            "dispatch finished"
        );
        Ok(summary)
    }
}

fn tally(summary: &mut RunSummary, done: Result<bool, JoinError>) {
    match done {
        Ok(true) => {}
        Ok(false) => summary.failed_rows += 1,
        Err(err) => {
            error!(error = %err, "row worker panicked");
            summary.failed_rows += 1;
        }
    }
}
