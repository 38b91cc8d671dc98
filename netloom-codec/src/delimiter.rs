//! Delimiter-based framing.
//!
//! Cuts the inbound stream at every occurrence of a delimiter. Each frame
//! is emitted as `Bytes`, with or without the delimiter.
//!
//! A frame longer than the maximum is never buffered in full: the decoder
//! switches to discard mode, drops bytes until the next delimiter and then
//! reports one `FrameTooLong` error. Frames after it decode normally.

use crate::error::CodecError;

use bytes::{Buf, BytesMut};
use netloom_core::channel::Channel;
use netloom_core::codec::Decoder;
use netloom_core::error::HandlerError;
use netloom_core::pipeline::Message;
use tracing::{debug, trace};

/// Common line terminators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineCodec {
    /// `\n`
    Lf,
    /// `\r\n`
    CrLf,
}

impl LineCodec {
    #[must_use]
    pub const fn delimiter(self) -> &'static [u8] {
        match self {
            Self::Lf => b"\n",
            Self::CrLf => b"\r\n",
        }
    }

    /// Decoder cutting lines with this terminator, terminator stripped.
    #[must_use]
    pub fn decoder(self, max_frame_length: usize) -> DelimiterDecoder {
        DelimiterDecoder::new(self.delimiter(), max_frame_length)
    }
}

#[derive(Debug, Clone)]
pub struct DelimiterDecoder {
    delimiter: Vec<u8>,
    max_frame_length: usize,
    strip_delimiter: bool,
    /// Prefix of the buffer already known not to contain the delimiter.
    searched: usize,
    discarding: bool,
    discarded: u64,
}

impl DelimiterDecoder {
    /// # Panics
    ///
    /// If `delimiter` is empty.
    #[must_use]
    pub fn new(delimiter: &[u8], max_frame_length: usize) -> Self {
        assert!(!delimiter.is_empty(), "delimiter must not be empty");
        Self {
            delimiter: delimiter.to_vec(),
            max_frame_length,
            strip_delimiter: true,
            searched: 0,
            discarding: false,
            discarded: 0,
        }
    }

    /// Keep the delimiter at the end of every frame.
    #[must_use]
    pub fn keep_delimiter(mut self) -> Self {
        self.strip_delimiter = false;
        self
    }

    #[must_use]
    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    fn find(&mut self, src: &[u8]) -> Option<usize> {
        let dlen = self.delimiter.len();
        let start = self.searched.min(src.len());
        let found = if dlen == 1 {
            let d = self.delimiter[0];
            src[start..].iter().position(|b| *b == d)
        } else {
            src[start..]
                .windows(dlen)
                .position(|window| window == self.delimiter.as_slice())
        };
        match found {
            Some(offset) => {
                self.searched = 0;
                Some(start + offset)
            }
            None => {
                // The last dlen-1 bytes may start a delimiter.
                self.searched = src.len().saturating_sub(dlen - 1);
                None
            }
        }
    }

    /// Drop everything except a possible delimiter prefix at the end.
    fn discard_buffered(&mut self, src: &mut BytesMut) {
        let keep = (self.delimiter.len() - 1).min(src.len());
        let n = src.len() - keep;
        src.advance(n);
        self.discarded += n as u64;
        self.searched = 0;
    }
}

impl Decoder for DelimiterDecoder {
    fn decode(
        &mut self,
        channel: &Channel,
        src: &mut BytesMut,
        out: &mut Vec<Message>,
    ) -> Result<(), HandlerError> {
        let dlen = self.delimiter.len();
        loop {
            let found = self.find(src);

            if self.discarding {
                let Some(pos) = found else {
                    self.discard_buffered(src);
                    return Ok(());
                };
                let length = self.discarded + pos as u64;
                src.advance(pos + dlen);
                self.discarding = false;
                self.discarded = 0;
                debug!(channel = %channel.id(), length, "discarded oversized frame");
                return Err(CodecError::FrameTooLong {
                    length,
                    max: self.max_frame_length,
                }
                .into());
            }

            match found {
                Some(pos) if pos > self.max_frame_length => {
                    src.advance(pos + dlen);
                    return Err(CodecError::FrameTooLong {
                        length: pos as u64,
                        max: self.max_frame_length,
                    }
                    .into());
                }
                Some(pos) => {
                    let frame = src.split_to(pos + dlen).freeze();
                    let frame = if self.strip_delimiter {
                        frame.slice(..pos)
                    } else {
                        frame
                    };
                    trace!(channel = %channel.id(), bytes = frame.len(), "frame");
                    out.push(Box::new(frame));
                }
                None => {
                    if src.len() >= self.max_frame_length + dlen {
                        self.discarding = true;
                        self.discarded = 0;
                        self.discard_buffered(src);
                    }
                    return Ok(());
                }
            }
        }
    }

    fn max_buffered(&self) -> Option<usize> {
        Some(self.max_frame_length.saturating_add(self.delimiter.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use netloom_core::alloc::Arena;
    use netloom_core::options::{ArenaConfig, ChannelConfig};
    use netloom_core::pipeline::Pipeline;

    fn channel() -> Channel {
        Channel::new(
            Pipeline::new(),
            Arena::new(ArenaConfig::new(4096, 4096)),
            ChannelConfig::default(),
        )
    }

    fn frames(out: Vec<Message>) -> Vec<Bytes> {
        out.into_iter()
            .map(|msg| *msg.downcast::<Bytes>().unwrap())
            .collect()
    }

    #[test]
    fn test_cuts_every_delimiter() {
        let ch = channel();
        let mut decoder = LineCodec::CrLf.decoder(64);
        let mut src = BytesMut::from(&b"one\r\ntwo\r\nthr"[..]);
        let mut out = Vec::new();

        decoder.decode(&ch, &mut src, &mut out).unwrap();

        assert_eq!(frames(out), vec![Bytes::from("one"), Bytes::from("two")]);
        assert_eq!(&src[..], b"thr");
    }

    #[test]
    fn test_keep_delimiter() {
        let ch = channel();
        let mut decoder = LineCodec::Lf.decoder(64).keep_delimiter();
        let mut src = BytesMut::from(&b"a\nb\n"[..]);
        let mut out = Vec::new();

        decoder.decode(&ch, &mut src, &mut out).unwrap();

        assert_eq!(frames(out), vec![Bytes::from("a\n"), Bytes::from("b\n")]);
        assert!(src.is_empty());
    }

    #[test]
    fn test_delimiter_split_across_calls() {
        let ch = channel();
        let mut decoder = DelimiterDecoder::new(b"||", 64);
        let mut src = BytesMut::from(&b"abc|"[..]);
        let mut out = Vec::new();

        decoder.decode(&ch, &mut src, &mut out).unwrap();
        assert!(out.is_empty());
        src.extend_from_slice(b"|def");
        decoder.decode(&ch, &mut src, &mut out).unwrap();

        assert_eq!(frames(out), vec![Bytes::from("abc")]);
        assert_eq!(&src[..], b"def");
    }

    #[test]
    fn test_oversized_frame_with_delimiter_is_skipped() {
        let ch = channel();
        let mut decoder = LineCodec::Lf.decoder(4);
        let mut src = BytesMut::from(&b"toolong\nok\n"[..]);
        let mut out = Vec::new();

        let err = decoder.decode(&ch, &mut src, &mut out).unwrap_err();
        assert!(matches!(err, HandlerError::Decode(_)));
        decoder.decode(&ch, &mut src, &mut out).unwrap();

        assert_eq!(frames(out), vec![Bytes::from("ok")]);
    }

    #[test]
    fn test_partial_frame_stays_within_max_buffered() {
        let ch = channel();
        let mut decoder = LineCodec::CrLf.decoder(8);
        let limit = decoder.max_buffered().unwrap();
        let mut src = BytesMut::new();
        let mut out = Vec::new();

        for chunk in [&b"1234"[..], b"5678", b"9\r", b"abc", b"\r\nok\r\n"] {
            src.extend_from_slice(chunk);
            let _ = decoder.decode(&ch, &mut src, &mut out);
            assert!(src.len() <= limit, "{} bytes buffered", src.len());
        }
        // The oversized-frame error stopped decoding before "ok".
        decoder.decode(&ch, &mut src, &mut out).unwrap();
        assert_eq!(frames(out), vec![Bytes::from("ok")]);
    }

    #[test]
    fn test_discards_until_next_delimiter() {
        let ch = channel();
        let mut decoder = LineCodec::CrLf.decoder(4);
        let mut out = Vec::new();

        let mut src = BytesMut::from(&b"0123456789\r"[..]);
        decoder.decode(&ch, &mut src, &mut out).unwrap();
        // Only a possible delimiter prefix is kept.
        assert_eq!(&src[..], b"\r");

        src.extend_from_slice(b"xyz");
        decoder.decode(&ch, &mut src, &mut out).unwrap();
        src.extend_from_slice(b"\r\nnext\r\n");
        let err = decoder.decode(&ch, &mut src, &mut out).unwrap_err();
        assert_eq!(
            err.to_string(),
            "decode error: frame of 14 bytes exceeds the maximum of 4"
        );

        decoder.decode(&ch, &mut src, &mut out).unwrap();
        assert_eq!(frames(out), vec![Bytes::from("next")]);
        assert!(src.is_empty());
    }
}
