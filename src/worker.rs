use tracing::trace;

use crate::callbacks::Callbacks;
use crate::error::RowError;
use crate::tokenizer::Record;

/// Run one row through the configured steps, reporting the first failure.
///
/// Returns `false` if the row failed. The record is consumed so that its
/// buffer is released before the caller gives up its worker slot.
pub(crate) fn process_row<T>(callbacks: &Callbacks<T>, record: Record) -> bool {
    match run_steps(callbacks, record) {
        Ok(()) => true,
        Err(err) => {
            trace!(line = err.line(), stage = ?err.stage(), "row failed");
            callbacks.report(err);
            false
        }
    }
}

fn run_steps<T>(callbacks: &Callbacks<T>, record: Record) -> Result<(), RowError> {
    let line = record.line();

    if let Some(on_row) = &callbacks.on_row {
        on_row(&record).map_err(|source| RowError::PreParse { line, source })?;
    }

    // Raw rows only; a handler without a parser is rejected before the run.
    let Some(parse) = &callbacks.parse else {
        return Ok(());
    };
    let data = parse(&record).map_err(|source| RowError::Parse { line, source })?;
    drop(record);

    if let Some(on_data) = &callbacks.on_data {
        on_data(data).map_err(|source| RowError::Handler { line, source })?;
    }
    Ok(())
}
