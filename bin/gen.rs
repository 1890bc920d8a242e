use async_compression::tokio::write::GzipEncoder;
use clap::{Arg, ArgAction, Command};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};

type Sink = Box<dyn AsyncWrite + Unpin + Send>;

/// Stdout when no path is given; gzip when the path ends in `.gz`.
async fn open_sink(path: Option<&Path>) -> std::io::Result<Sink> {
    let Some(path) = path else {
        return Ok(Box::new(tokio::io::stdout()));
    };
    let file = tokio::fs::File::create(path).await?;
    let gz = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"));
    if gz {
        Ok(Box::new(GzipEncoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = Command::new("gen")
        .about("Write a deterministic CSV (id,name,v1..) to stdout or a file")
        .arg(
            Arg::new("rows")
                .long("rows")
                .value_parser(clap::value_parser!(u64))
                .required(true),
        )
        .arg(
            Arg::new("with_header")
                .long("with-header")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("cols")
                .long("cols")
                .value_parser(clap::value_parser!(usize))
                .default_value("3"),
        )
        .arg(Arg::new("delim").long("delim").default_value(","))
        .arg(
            Arg::new("out")
                .long("out")
                .help("Output path; gzip-compressed when it ends in .gz")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .get_matches();

    let rows = matches.get_one::<u64>("rows").copied().unwrap_or_default();
    let cols = matches.get_one::<usize>("cols").copied().unwrap_or(3).max(2);
    let delim = matches
        .get_one::<String>("delim")
        .map(String::as_str)
        .unwrap_or(",");
    let with_header = matches.get_flag("with_header");

    let sink = open_sink(matches.get_one::<PathBuf>("out").map(PathBuf::as_path)).await?;
    let mut out = BufWriter::with_capacity(1 << 20, sink);

    if with_header {
        let mut line = format!("id{delim}name");
        for c in 2..cols {
            line.push_str(&format!("{delim}v{c}"));
        }
        line.push('\n');
        out.write_all(line.as_bytes()).await?;
    }

    // Very simple deterministic data: id, name, v2, ...
    let mut line = String::new();
    for i in 1..=rows {
        line.clear();
        line.push_str(&format!("{i}{delim}n{i}"));
        for c in 2..cols {
            line.push_str(&format!("{delim}v{c}_{i}"));
        }
        line.push('\n');
        out.write_all(line.as_bytes()).await?;
    }

    // shutdown also finishes the gzip trailer
    out.shutdown().await?;
    Ok(())
}
