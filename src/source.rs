//! Byte sources: local files, HTTP(S) bodies and caller-supplied readers,
//! with transparent gzip/zstd decompression and UTF-8 transcoding.

use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use futures::TryStreamExt;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, ReadBuf};
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::codec::Utf8Transcoder;
use crate::error::SourceOpenError;

/// Size of the read buffer placed under every stream (1 MiB).
const READ_BUFFER: usize = 1 << 20;

/// Something that can be opened into a byte stream for the dispatcher.
pub trait Source<'a> {
    fn open(self) -> impl Future<Output = Result<SourceStream<'a>, SourceOpenError>> + Send;
}

#[derive(Debug, Clone)]
pub struct SourceMeta {
    /// Path or URL, used in errors and logs.
    pub origin: String,
    /// e.g. "application/gzip" or "text/csv"
    pub content_type: String,
    /// e.g. "gzip", "zstd", or empty
    pub content_encoding: String,
    /// just the key/filename (used for extension fallback)
    pub name_hint: String,
    /// Which character encoding to expect (defaults to UTF-8)
    pub charset: &'static encoding_rs::Encoding,
}

impl Default for SourceMeta {
    fn default() -> Self {
        Self {
            origin: String::new(),
            content_type: String::new(),
            content_encoding: String::new(),
            name_hint: String::new(),
            charset: encoding_rs::UTF_8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zstd,
}

impl Compression {
    /// Decompression choice: encoding -> type -> file name suffix.
    pub fn detect(meta: &SourceMeta) -> Self {
        let ce = meta.content_encoding.to_ascii_lowercase();
        let ct = meta.content_type.to_ascii_lowercase();
        let name = meta.name_hint.to_ascii_lowercase();

        let encoded = |codec: &str| ce.split(',').any(|s| s.trim() == codec);
        if encoded("gzip") || ct.contains("gzip") || name.ends_with(".gz") {
            Compression::Gzip
        } else if encoded("zstd") || ct.contains("zstd") || name.ends_with(".zst") {
            Compression::Zstd
        } else {
            Compression::None
        }
    }

    fn magic(self) -> &'static [u8] {
        match self {
            Compression::None => &[],
            Compression::Gzip => &[0x1f, 0x8b],
            Compression::Zstd => &[0x28, 0xb5, 0x2f, 0xfd],
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
        })
    }
}

/// An open, decoded byte stream. Dropping it closes the underlying file or
/// connection.
pub struct SourceStream<'a> {
    reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
    meta: SourceMeta,
    compression: Compression,
}

impl<'a> SourceStream<'a> {
    /// Wrap a raw reader with optional decompression and UTF-8 transcoding.
    ///
    /// Compressed streams have their magic bytes checked here, so a corrupt or
    /// empty archive fails at open time rather than on the first row.
    pub async fn decode<R>(raw: R, meta: SourceMeta) -> Result<Self, SourceOpenError>
    where
        R: AsyncRead + Unpin + Send + 'a,
    {
        let compression = Compression::detect(&meta);
        let mut buf = BufReader::with_capacity(READ_BUFFER, raw);

        let decompressed: Box<dyn AsyncRead + Unpin + Send + 'a> = match compression {
            Compression::None => Box::new(buf),
            Compression::Gzip => {
                check_magic(&mut buf, compression, &meta.origin).await?;
                let mut gz = GzipDecoder::new(buf);
                gz.multiple_members(true);
                Box::new(gz)
            }
            Compression::Zstd => {
                check_magic(&mut buf, compression, &meta.origin).await?;
                Box::new(ZstdDecoder::new(buf))
            }
        };

        // Transcode only when charset != UTF-8 to avoid extra copies.
        let reader: Box<dyn AsyncRead + Unpin + Send + 'a> = if meta.charset == encoding_rs::UTF_8 {
            decompressed
        } else {
            let framed = FramedRead::new(decompressed, Utf8Transcoder::new(meta.charset));
            Box::new(StreamReader::new(framed))
        };

        debug!(
            origin = %meta.origin,
            %compression,
            charset = meta.charset.name(),
            "source opened"
        );
        Ok(Self {
            reader,
            meta,
            compression,
        })
    }

    pub fn meta(&self) -> &SourceMeta {
        &self.meta
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }
}

async fn check_magic<R>(
    buf: &mut BufReader<R>,
    codec: Compression,
    origin: &str,
) -> Result<(), SourceOpenError>
where
    R: AsyncRead + Unpin,
{
    let head = buf.fill_buf().await.map_err(|source| SourceOpenError::Io {
        origin: origin.to_string(),
        source,
    })?;
    let reason = if head.is_empty() {
        "empty stream"
    } else if !head.starts_with(codec.magic()) {
        "invalid header"
    } else {
        return Ok(());
    };
    Err(SourceOpenError::Decompress {
        origin: origin.to_string(),
        codec,
        reason,
    })
}

impl AsyncRead for SourceStream<'_> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl Drop for SourceStream<'_> {
    fn drop(&mut self) {
        debug!(origin = %self.meta.origin, "source closed");
    }
}

impl fmt::Debug for SourceStream<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceStream")
            .field("meta", &self.meta)
            .field("compression", &self.compression)
            .finish_non_exhaustive()
    }
}

/// A CSV file on the local filesystem. `*.gz` and `*.zst` are decompressed.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    charset: &'static encoding_rs::Encoding,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            charset: encoding_rs::UTF_8,
        }
    }

    pub fn with_charset(mut self, charset: &'static encoding_rs::Encoding) -> Self {
        self.charset = charset;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<'a> Source<'a> for FileSource {
    fn open(self) -> impl Future<Output = Result<SourceStream<'a>, SourceOpenError>> + Send {
        async move {
            let file = File::open(&self.path)
                .await
                .map_err(|source| SourceOpenError::File {
                    path: self.path.clone(),
                    source,
                })?;
            let meta = SourceMeta {
                origin: self.path.display().to_string(),
                name_hint: self
                    .path
                    .file_name()
                    .and_then(|s| s.to_str())
                    .unwrap_or_default()
                    .to_string(),
                charset: self.charset,
                ..Default::default()
            };
            SourceStream::decode(file, meta).await
        }
    }
}

/// A CSV document fetched with an HTTP GET.
///
/// Decompression follows the response's content-type / content-encoding
/// headers; the charset follows the content-type `charset=` parameter.
#[derive(Debug, Clone)]
pub struct HttpSource {
    url: String,
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(url, reqwest::Client::new())
    }

    pub fn with_client(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl<'a> Source<'a> for HttpSource {
    fn open(self) -> impl Future<Output = Result<SourceStream<'a>, SourceOpenError>> + Send {
        async move {
            let http_err = |source| SourceOpenError::Http {
                url: self.url.clone(),
                source,
            };
            let response = self
                .client
                .get(&self.url)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(http_err)?;

            let header = |name: reqwest::header::HeaderName| {
                response
                    .headers()
                    .get(name)
                    .and_then(|v: &reqwest::header::HeaderValue| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string()
            };
            let content_type = header(CONTENT_TYPE);
            let content_encoding = header(CONTENT_ENCODING);
            let meta = SourceMeta {
                origin: self.url.clone(),
                charset: charset_of(&content_type),
                content_type,
                content_encoding,
                ..Default::default()
            };

            let body = response.bytes_stream().map_err(io::Error::other);
            SourceStream::decode(StreamReader::new(Box::pin(body)), meta).await
        }
    }
}

/// Charset named by a content-type's `charset=` parameter, UTF-8 otherwise.
fn charset_of(content_type: &str) -> &'static encoding_rs::Encoding {
    content_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("charset"))
        .and_then(|(_, label)| encoding_rs::Encoding::for_label(label.trim().trim_matches('"').as_bytes()))
        .unwrap_or(encoding_rs::UTF_8)
}

/// An already-open reader.
///
/// Nothing is closed on the caller's behalf beyond dropping what was handed
/// over: pass `&mut reader` to keep ownership of the reader after the run.
/// By default the bytes are taken as plain UTF-8 CSV; use [`with_meta`]
/// to declare compression or a charset.
///
/// [`with_meta`]: ReaderSource::with_meta
#[derive(Debug)]
pub struct ReaderSource<R> {
    reader: R,
    meta: SourceMeta,
}

impl<R> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            meta: SourceMeta {
                origin: "<reader>".to_string(),
                ..Default::default()
            },
        }
    }

    pub fn with_meta(mut self, meta: SourceMeta) -> Self {
        self.meta = meta;
        self
    }
}

impl<'a, R> Source<'a> for ReaderSource<R>
where
    R: AsyncRead + Unpin + Send + 'a,
{
    fn open(self) -> impl Future<Output = Result<SourceStream<'a>, SourceOpenError>> + Send {
        SourceStream::decode(self.reader, self.meta)
    }
}

/// A file path or an `http(s)://` URL.
#[derive(Debug, Clone)]
pub enum Location {
    File(FileSource),
    Http(HttpSource),
}

impl Location {
    pub fn parse(location: &str) -> Self {
        let lower = location.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            Location::Http(HttpSource::new(location))
        } else {
            Location::File(FileSource::new(location))
        }
    }
}

impl<'a> Source<'a> for Location {
    fn open(self) -> impl Future<Output = Result<SourceStream<'a>, SourceOpenError>> + Send {
        async move {
            match self {
                Location::File(file) => file.open().await,
                Location::Http(http) => http.open().await,
            }
        }
    }
}
