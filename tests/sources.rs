use std::sync::{Arc, Mutex};

use async_compression::tokio::write::{GzipEncoder, ZstdEncoder};
use csv_dispatch::{
    BoxError, Callbacks, CancellationToken, Compression, Dispatcher, FileSource, HttpSource,
    Location, ReaderSource, Record, Source, SourceMeta, SourceOpenError,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const ROWS: &str = "1,one\n2,two\n3,three\n";

async fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut enc = GzipEncoder::new(Vec::new());
    enc.write_all(data).await?;
    enc.shutdown().await?;
    Ok(enc.into_inner())
}

async fn zstd(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut enc = ZstdEncoder::new(Vec::new());
    enc.write_all(data).await?;
    enc.shutdown().await?;
    Ok(enc.into_inner())
}

/// Collect every raw row the dispatcher sees, in read order.
async fn collect<'a, S: Source<'a>>(source: S) -> anyhow::Result<Vec<Vec<String>>> {
    let rows = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&rows);
    let dispatcher: Dispatcher<'a, ()> = Dispatcher::open(source).await?.with_callbacks(
        Callbacks::new().on_row(move |row: &Record| {
            sink.lock().unwrap().push(row.to_vec());
            Ok::<_, BoxError>(())
        }),
    );
    dispatcher.run(&CancellationToken::new(), 1).await?;
    let rows = rows.lock().unwrap().clone();
    Ok(rows)
}

fn expected() -> Vec<Vec<String>> {
    [["1", "one"], ["2", "two"], ["3", "three"]]
        .iter()
        .map(|r| r.iter().map(|s| s.to_string()).collect())
        .collect()
}

#[tokio::test]
async fn reads_plain_and_compressed_files() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let plain = dir.path().join("rows.csv");
    let gz = dir.path().join("rows.CSV.GZ");
    let zst = dir.path().join("rows.csv.zst");
    std::fs::write(&plain, ROWS)?;
    std::fs::write(&gz, gzip(ROWS.as_bytes()).await?)?;
    std::fs::write(&zst, zstd(ROWS.as_bytes()).await?)?;

    assert_eq!(collect(FileSource::new(&plain)).await?, expected());
    assert_eq!(collect(FileSource::new(&gz)).await?, expected());
    assert_eq!(collect(FileSource::new(&zst)).await?, expected());
    assert_eq!(
        collect(Location::parse(gz.to_str().unwrap())).await?,
        expected()
    );
    Ok(())
}

#[tokio::test]
async fn concatenated_gzip_members_are_read_through() -> anyhow::Result<()> {
    let mut bytes = gzip(b"1,one\n").await?;
    bytes.extend(gzip(b"2,two\n3,three\n").await?);
    let source = ReaderSource::new(bytes.as_slice()).with_meta(SourceMeta {
        content_type: "application/gzip".into(),
        ..Default::default()
    });
    assert_eq!(collect(source).await?, expected());
    Ok(())
}

#[tokio::test]
async fn file_open_failures_are_fatal() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;

    let missing = dir.path().join("missing.csv");
    let err = FileSource::new(&missing).open().await.unwrap_err();
    assert!(matches!(err, SourceOpenError::File { ref path, .. } if path == &missing));

    let fake = dir.path().join("fake.csv.gz");
    std::fs::write(&fake, ROWS)?;
    let err = Dispatcher::<()>::open(FileSource::new(&fake))
        .await
        .err()
        .expect("plain text is not gzip");
    assert!(matches!(
        err,
        SourceOpenError::Decompress {
            codec: Compression::Gzip,
            ..
        }
    ));
    Ok(())
}

#[tokio::test]
async fn transcodes_declared_charset() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("latin1.csv");
    std::fs::write(&path, b"1,caf\xe9\n")?;

    let rows = collect(FileSource::new(&path).with_charset(encoding_rs::WINDOWS_1252)).await?;
    assert_eq!(rows, [vec!["1".to_string(), "café".to_string()]]);
    Ok(())
}

#[tokio::test]
async fn invalid_utf8_is_a_row_read_error() -> anyhow::Result<()> {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    let dispatcher: Dispatcher<'_, ()> =
        Dispatcher::open(ReaderSource::new(&b"1,ok\n2,caf\xe9\n3,ok\n"[..]))
            .await?
            .with_callbacks(Callbacks::new().on_error(move |err| {
                sink.lock().unwrap().push(err.line());
            }));
    let summary = dispatcher.run(&CancellationToken::new(), 2).await?;

    assert_eq!(*errors.lock().unwrap(), [2]);
    assert_eq!(summary.rows_read, 2);
    assert_eq!(summary.read_errors, 1);
    Ok(())
}

/// Serve one canned HTTP/1.1 response on a loopback port.
async fn serve_once(status: &'static str, content_type: &'static str, body: Vec<u8>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            request.extend_from_slice(&buf[..n]);
        }
        let head = format!(
            "HTTP/1.1 {status}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
            body.len()
        );
        socket.write_all(head.as_bytes()).await.unwrap();
        socket.write_all(&body).await.unwrap();
        socket.shutdown().await.unwrap();
    });
    format!("http://{addr}/rows.csv")
}

fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

#[tokio::test]
async fn reads_http_bodies() -> anyhow::Result<()> {
    let url = serve_once("200 OK", "text/csv", ROWS.as_bytes().to_vec()).await;
    assert_eq!(collect(HttpSource::with_client(url, client())).await?, expected());

    let body = gzip(ROWS.as_bytes()).await?;
    let url = serve_once("200 OK", "application/x-gzip", body).await;
    let stream = HttpSource::with_client(url, client()).open().await?;
    assert_eq!(stream.compression(), Compression::Gzip);
    drop(stream);

    let body = gzip(ROWS.as_bytes()).await?;
    let url = serve_once("200 OK", "application/gzip", body).await;
    assert_eq!(collect(HttpSource::with_client(url, client())).await?, expected());
    Ok(())
}

#[tokio::test]
async fn http_charset_comes_from_content_type() -> anyhow::Result<()> {
    let url = serve_once("200 OK", "text/csv; charset=iso-8859-1", b"1,caf\xe9\n".to_vec()).await;
    let rows = collect(HttpSource::with_client(url, client())).await?;
    assert_eq!(rows, [vec!["1".to_string(), "café".to_string()]]);
    Ok(())
}

#[tokio::test]
async fn http_error_status_is_fatal() -> anyhow::Result<()> {
    let url = serve_once("404 Not Found", "text/plain", b"nope".to_vec()).await;
    let err = HttpSource::with_client(url.clone(), client())
        .open()
        .await
        .unwrap_err();
    assert!(matches!(err, SourceOpenError::Http { url: ref u, .. } if *u == url));
    Ok(())
}
