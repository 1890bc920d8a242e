use std::ops::Index;

use csv_async::{AsyncReader, AsyncReaderBuilder, StringRecord, Trim};
use tokio::sync::mpsc;

use crate::error::{DispatchError, DispatchResult};
use crate::source::{SourceMeta, SourceStream};

/// Settings for splitting the byte stream into records.
#[derive(Debug, Clone)]
pub struct TokenizerConfig {
    pub delimiter: u8,
    pub quote: u8,
    pub comment: Option<u8>,
    /// Allow records with a different number of fields than the first one.
    pub flexible: bool,
    /// Trim whitespace around every field.
    pub trim: bool,
    /// Recycle field buffers between reads. Only takes effect with a single worker.
    pub reuse_records: bool,
    pub buffer_capacity: usize,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            delimiter: b',',
            quote: b'"',
            comment: None,
            flexible: false,
            trim: false,
            reuse_records: true,
            // Larger internal buffer reduces syscalls and allocator churn
            buffer_capacity: 1 << 20,
        }
    }
}

impl TokenizerConfig {
    pub fn delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn quote(mut self, quote: u8) -> Self {
        self.quote = quote;
        self
    }

    pub fn comment(mut self, comment: Option<u8>) -> Self {
        self.comment = comment;
        self
    }

    pub fn flexible(mut self, yes: bool) -> Self {
        self.flexible = yes;
        self
    }

    pub fn trim(mut self, yes: bool) -> Self {
        self.trim = yes;
        self
    }

    pub fn reuse_records(mut self, yes: bool) -> Self {
        self.reuse_records = yes;
        self
    }

    pub fn buffer_capacity(mut self, bytes: usize) -> Self {
        self.buffer_capacity = bytes;
        self
    }
}

/// One row of input and its 1-based ordinal in read order.
///
/// When the dispatcher runs with a single worker, the field buffer goes back to
/// the tokenizer once the record is dropped and is refilled by a later read.
#[derive(Debug)]
pub struct Record {
    line: u64,
    fields: StringRecord,
    recycle: Option<mpsc::UnboundedSender<StringRecord>>,
}

impl Record {
    pub fn new<I, S>(line: u64, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            line,
            fields: fields.into_iter().collect(),
            recycle: None,
        }
    }

    pub fn line(&self) -> u64 {
        self.line
    }

    pub fn fields(&self) -> &StringRecord {
        &self.fields
    }

    pub fn get(&self, i: usize) -> Option<&str> {
        self.fields.get(i)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.fields.iter()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.fields.iter().map(str::to_string).collect()
    }
}

impl Index<usize> for Record {
    type Output = str;

    fn index(&self, i: usize) -> &str {
        &self.fields[i]
    }
}

impl Drop for Record {
    fn drop(&mut self) {
        if let Some(recycle) = self.recycle.take() {
            // The tokenizer may already be gone at the end of a run.
            let _ = recycle.send(std::mem::replace(&mut self.fields, StringRecord::new()));
        }
    }
}

/// Column names read from the first record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    names: Vec<String>,
}

impl Headers {
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|h| h == name)
    }

    /// Indices of `required` columns, in the order given.
    pub fn require(&self, required: &[&str]) -> DispatchResult<Vec<usize>> {
        required
            .iter()
            .map(|req_h| {
                self.position(req_h)
                    .ok_or_else(|| DispatchError::MissingHeader(req_h.to_string()))
            })
            .collect()
    }
}

/// Sequential record reader over a [`SourceStream`]. Only the dispatch loop
/// touches it; workers receive owned [`Record`]s.
pub(crate) struct Tokenizer<'a> {
    reader: AsyncReader<SourceStream<'a>>,
    meta: SourceMeta,
    reuse: bool,
    recycled_tx: mpsc::UnboundedSender<StringRecord>,
    recycled_rx: mpsc::UnboundedReceiver<StringRecord>,
}

impl<'a> Tokenizer<'a> {
    pub(crate) fn new(stream: SourceStream<'a>, config: &TokenizerConfig) -> Self {
        let meta = stream.meta().clone();
        let reader = AsyncReaderBuilder::new()
            .has_headers(false)
            .delimiter(config.delimiter)
            .quote(config.quote)
            .comment(config.comment)
            .flexible(config.flexible)
            .trim(if config.trim { Trim::All } else { Trim::None })
            .buffer_capacity(config.buffer_capacity)
            .create_reader(stream);
        let (recycled_tx, recycled_rx) = mpsc::unbounded_channel();
        Self {
            reader,
            meta,
            reuse: config.reuse_records,
            recycled_tx,
            recycled_rx,
        }
    }

    pub(crate) fn meta(&self) -> &SourceMeta {
        &self.meta
    }

    /// Narrow the configured reuse policy; reuse can be switched off, never on.
    pub(crate) fn restrict_reuse(&mut self, allowed: bool) {
        self.reuse &= allowed;
    }

    pub(crate) async fn read_headers(&mut self) -> DispatchResult<Headers> {
        let mut record = StringRecord::new();
        if !self.reader.read_record(&mut record).await? {
            return Ok(Headers::default());
        }
        Ok(Headers {
            names: record.iter().map(str::to_string).collect(),
        })
    }

    /// Read the next record, tagging it with `line`. `Ok(None)` at end of stream.
    pub(crate) async fn read(&mut self, line: u64) -> Result<Option<Record>, csv_async::Error> {
        let mut fields = if self.reuse {
            self.recycled_rx
                .try_recv()
                .unwrap_or_else(|_| StringRecord::new())
        } else {
            StringRecord::new()
        };

        match self.reader.read_record(&mut fields).await {
            Ok(true) => Ok(Some(Record {
                line,
                fields,
                recycle: self.reuse.then(|| self.recycled_tx.clone()),
            })),
            Ok(false) => Ok(None),
            Err(err) => {
                if self.reuse {
                    let _ = self.recycled_tx.send(fields);
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{ReaderSource, Source};

    async fn tokenizer(input: &'static str, config: TokenizerConfig) -> Tokenizer<'static> {
        let stream = ReaderSource::new(input.as_bytes()).open().await.unwrap();
        Tokenizer::new(stream, &config)
    }

    #[tokio::test]
    async fn held_records_keep_their_fields_while_reusing() {
        let mut tok = tokenizer("1,one\n2,two\n3,three\n", TokenizerConfig::default()).await;

        let first = tok.read(1).await.unwrap().unwrap();
        let second = tok.read(2).await.unwrap().unwrap();
        assert_eq!(first.to_vec(), ["1", "one"]);
        assert_eq!(second.to_vec(), ["2", "two"]);

        drop(first);
        let third = tok.read(3).await.unwrap().unwrap();
        assert_eq!(third.line(), 3);
        assert_eq!(&third[1], "three");
        assert_eq!(second.get(1), Some("two"));
        assert!(tok.read(4).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dropped_records_return_their_buffer() {
        let mut tok = tokenizer("a,b\nc,d\n", TokenizerConfig::default()).await;
        drop(tok.read(1).await.unwrap().unwrap());
        assert!(!tok.recycled_rx.is_empty());

        let next = tok.read(2).await.unwrap().unwrap();
        assert!(tok.recycled_rx.is_empty());
        assert_eq!(next.to_vec(), ["c", "d"]);
    }

    #[tokio::test]
    async fn no_recycling_without_reuse() {
        let mut tok = tokenizer("a,b\nc,d\n", TokenizerConfig::default()).await;
        tok.restrict_reuse(false);
        drop(tok.read(1).await.unwrap().unwrap());
        assert!(tok.recycled_rx.is_empty());
    }

    #[tokio::test]
    async fn unequal_lengths_fail_only_that_record() {
        let mut tok = tokenizer("1,one\n2\n3,three\n", TokenizerConfig::default()).await;
        assert!(tok.read(1).await.unwrap().is_some());
        assert!(tok.read(2).await.is_err());
        assert_eq!(tok.read(3).await.unwrap().unwrap().to_vec(), ["3", "three"]);

        let mut tok = tokenizer("1,one\n2\n", TokenizerConfig::default().flexible(true)).await;
        assert!(tok.read(1).await.unwrap().is_some());
        assert_eq!(tok.read(2).await.unwrap().unwrap().to_vec(), ["2"]);
    }

    #[tokio::test]
    async fn honours_delimiter_and_trim() {
        let config = TokenizerConfig::default().delimiter(b';').trim(true);
        let mut tok = tokenizer(" x ; y \n", config).await;
        assert_eq!(tok.read(1).await.unwrap().unwrap().to_vec(), ["x", "y"]);
    }

    #[tokio::test]
    async fn headers_are_looked_up_by_name() {
        let mut tok = tokenizer("sku,qty\nA,1\n", TokenizerConfig::default()).await;
        let headers = tok.read_headers().await.unwrap();
        assert_eq!(headers.require(&["qty", "sku"]).unwrap(), [1, 0]);
        assert!(matches!(
            headers.require(&["price"]),
            Err(DispatchError::MissingHeader(h)) if h == "price"
        ));
        assert_eq!(tok.read(1).await.unwrap().unwrap().to_vec(), ["A", "1"]);
    }
}
