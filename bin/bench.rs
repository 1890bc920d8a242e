use clap::{Arg, ArgAction, Command};
use crc32fast::Hasher as Crc32;
use csv_dispatch::{
    BoxError, Callbacks, CancellationToken, Dispatcher, Location, Record, RowError,
    TokenizerConfig,
};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Log to stderr so stdout only carries the result line.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

/// CRC32 over all fields separated by '\x1f' (unit separator).
fn row_crc(row: &Record) -> u32 {
    let mut crc = Crc32::new();
    for (fi, field) in row.iter().enumerate() {
        if fi > 0 {
            crc.update(&[0x1f]);
        }
        crc.update(field.as_bytes());
    }
    crc.finalize()
}

/// Caps a run at the first `limit` row ordinals.
///
/// The reader can be a few rows ahead of the workers, so the token alone would
/// let rows past the limit through. Those rows are read but not handled.
#[derive(Clone)]
struct RowLimit {
    limit: Option<u64>,
    cancel: CancellationToken,
}

impl RowLimit {
    fn admit(&self, line: u64) -> bool {
        let Some(limit) = self.limit else {
            return true;
        };
        if line >= limit {
            self.cancel.cancel();
        }
        line <= limit
    }
}

/// Running totals shared by all workers.
#[derive(Default)]
struct Tally {
    handled: AtomicU64,
    digest: AtomicU32,
}

fn bench_callbacks(verify: bool, gate: RowLimit, tally: Arc<Tally>) -> Callbacks<Option<u32>> {
    Callbacks::new()
        .parse(move |row: &Record| {
            if !gate.admit(row.line()) {
                return Ok::<_, BoxError>(None);
            }
            Ok(Some(if verify { row_crc(row) } else { 0 }))
        })
        .on_data(move |crc: Option<u32>| {
            if let Some(crc) = crc {
                // rows finish out of order, so combine with XOR
                tally.digest.fetch_xor(crc, Ordering::Relaxed);
                tally.handled.fetch_add(1, Ordering::Relaxed);
            }
            Ok::<_, BoxError>(())
        })
        .on_error(|err: RowError| warn!(line = err.line(), stage = ?err.stage(), error = %err, "row failed"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = Command::new("bench")
        .about("Dispatch every row of a CSV file or URL to parallel workers")
        .arg(Arg::new("source").long("source").help("File path or http(s) URL").required(true))
        .arg(Arg::new("workers").long("workers").value_parser(clap::value_parser!(usize)))
        .arg(Arg::new("skip-header").long("skip-header").help("Treat the first row as column names").action(ArgAction::SetTrue))
        .arg(Arg::new("required").long("required").help("Column that must exist (implies --skip-header)").action(ArgAction::Append))
        .arg(Arg::new("verify").long("verify").help("Compute a CRC32 over all fields of every row").action(ArgAction::SetTrue))
        .arg(Arg::new("limit").long("limit").help("Handle at most the first N rows, then stop reading").value_parser(clap::value_parser!(u64)))
        .arg(Arg::new("delimiter").long("delimiter").default_value(","))
        .arg(Arg::new("log-level").long("log-level").default_value("info"))
        .get_matches();

    init_logging(matches.get_one::<String>("log-level").map_or("info", String::as_str));

    let source = matches
        .get_one::<String>("source")
        .map(String::as_str)
        .unwrap_or_default();
    let workers = matches
        .get_one::<usize>("workers")
        .copied()
        .unwrap_or_else(num_cpus::get);
    let delimiter = matches
        .get_one::<String>("delimiter")
        .and_then(|d| d.bytes().next())
        .unwrap_or(b',');
    let required: Vec<&str> = matches
        .get_many::<String>("required")
        .map(|vals| vals.map(String::as_str).collect())
        .unwrap_or_default();
    let verify = matches.get_flag("verify");
    let limit = matches.get_one::<u64>("limit").copied();

    let start = Instant::now();
    let config = TokenizerConfig::default().delimiter(delimiter);
    let mut dispatcher = Dispatcher::open_with(Location::parse(source), config).await?;

    if matches.get_flag("skip-header") || !required.is_empty() {
        let headers = dispatcher.read_headers().await?;
        headers.require(&required)?;
        info!(headers = ?headers.names(), "read headers");
    }

    let cancel = CancellationToken::new();
    let tally = Arc::new(Tally::default());
    let gate = RowLimit {
        limit,
        cancel: cancel.clone(),
    };
    let dispatcher = dispatcher.with_callbacks(bench_callbacks(verify, gate, Arc::clone(&tally)));
    let summary = dispatcher.run(&cancel, workers).await?;

    let elapsed = start.elapsed().as_secs_f64();
    let rows = tally.handled.load(Ordering::Relaxed);
    let rps = (rows as f64) / elapsed;
    let crc = if verify {
        format!(" crc=0x{:08x}", tally.digest.load(Ordering::Relaxed))
    } else {
        String::new()
    };
    println!(
        "source={} workers={} rows={} read_errors={} failed={}{}\nelapsed={:.1}s rows/sec={:.0}",
        source, workers, rows, summary.read_errors, summary.failed_rows, crc, elapsed, rps
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use csv_dispatch::ReaderSource;

    async fn run_limited(workers: usize, limit: Option<u64>) -> anyhow::Result<u64> {
        let input: String = (1..=500).map(|i| format!("{i},v{i}\n")).collect();
        let cancel = CancellationToken::new();
        let tally = Arc::new(Tally::default());
        let gate = RowLimit {
            limit,
            cancel: cancel.clone(),
        };
        let dispatcher = Dispatcher::open(ReaderSource::new(input.as_bytes()))
            .await?
            .with_callbacks(bench_callbacks(true, gate, Arc::clone(&tally)));
        let summary = dispatcher.run(&cancel, workers).await?;
        if limit.is_none() {
            assert!(!summary.cancelled);
        }
        let handled = tally.handled.load(Ordering::Relaxed);
        Ok(handled)
    }

    #[tokio::test]
    async fn limit_is_exact_with_several_workers() -> anyhow::Result<()> {
        assert_eq!(run_limited(8, Some(10)).await?, 10);
        assert_eq!(run_limited(1, Some(10)).await?, 10);
        assert_eq!(run_limited(4, None).await?, 500);
        Ok(())
    }

    #[test]
    fn admit_cancels_at_the_limit() {
        let gate = RowLimit {
            limit: Some(3),
            cancel: CancellationToken::new(),
        };
        assert!(gate.admit(2));
        assert!(!gate.cancel.is_cancelled());
        assert!(gate.admit(3));
        assert!(gate.cancel.is_cancelled());
        assert!(!gate.admit(4));
    }
}
