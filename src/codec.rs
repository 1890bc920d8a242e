use bytes::{Buf, BytesMut};
use std::io;
use tokio_util::codec::Decoder;

/// Turns bytes in a legacy charset into UTF-8 chunks for the CSV reader.
pub struct Utf8Transcoder {
    decoder: encoding_rs::Decoder,
    flushed: bool,
}

impl Utf8Transcoder {
    pub fn new(encoding: &'static encoding_rs::Encoding) -> Self {
        Self {
            decoder: encoding.new_decoder_with_bom_removal(),
            flushed: false,
        }
    }

    fn transcode(&mut self, src: &mut BytesMut, last: bool) -> Option<BytesMut> {
        let capacity = self
            .decoder
            .max_utf8_buffer_length(src.len())
            .unwrap_or_else(|| src.len() * 3 + 16);
        let mut out = BytesMut::zeroed(capacity);

        let (_result, read, written, _replaced) = self.decoder.decode_to_utf8(src, &mut out, last);
        src.advance(read);
        out.truncate(written);

        // Partial multi-byte sequences stay inside the decoder until more input arrives.
        (written > 0).then_some(out)
    }
}

impl Decoder for Utf8Transcoder {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        Ok(self.transcode(src, false))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.flushed {
            buf.clear();
            return Ok(None);
        }
        self.flushed = true;
        let out = self.transcode(buf, true);
        buf.clear();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcodes_latin1_to_utf8() {
        let mut codec = Utf8Transcoder::new(encoding_rs::WINDOWS_1252);
        let mut src = BytesMut::from(&b"caf\xe9,1\n"[..]);
        let out = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(&out[..], "café,1\n".as_bytes());
        assert!(src.is_empty());
    }

    #[test]
    fn holds_split_sequences_until_more_input() {
        let mut codec = Utf8Transcoder::new(encoding_rs::SHIFT_JIS);
        // "あ" in Shift_JIS is 0x82 0xA0; feed it one byte at a time.
        let mut first = BytesMut::from(&b"\x82"[..]);
        assert!(codec.decode(&mut first).unwrap().is_none());
        assert!(first.is_empty());

        let mut second = BytesMut::from(&b"\xa0"[..]);
        let out = codec.decode(&mut second).unwrap().unwrap();
        assert_eq!(&out[..], "あ".as_bytes());
    }

    #[test]
    fn flushes_dangling_bytes_once_at_eof() {
        let mut codec = Utf8Transcoder::new(encoding_rs::SHIFT_JIS);
        let mut src = BytesMut::from(&b"\x82"[..]);
        assert!(codec.decode(&mut src).unwrap().is_none());

        let mut empty = BytesMut::new();
        let out = codec.decode_eof(&mut empty).unwrap().unwrap();
        assert_eq!(&out[..], "\u{FFFD}".as_bytes());
        assert!(codec.decode_eof(&mut empty).unwrap().is_none());
    }
}
