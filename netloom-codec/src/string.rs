//! UTF-8 text codec.
//!
//! `StringDecoder` sits after a framing decoder and turns every frame into a
//! `String`. `StringEncoder` turns outbound `String`s into bytes, optionally
//! terminated so a delimiter decoder on the other side can frame them.

use crate::error::CodecError;

use bytes::{Bytes, BytesMut};
use netloom_core::buffer::PooledBuf;
use netloom_core::channel::Channel;
use netloom_core::codec::Encoder;
use netloom_core::error::HandlerError;
use netloom_core::pipeline::{HandlerContext, InboundHandler, Message};

#[derive(Debug, Default, Clone, Copy)]
pub struct StringDecoder;

impl StringDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn decode(bytes: &[u8]) -> Result<String, CodecError> {
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|e| CodecError::InvalidUtf8(e.to_string()))
    }
}

impl InboundHandler for StringDecoder {
    fn channel_read(&mut self, ctx: &mut HandlerContext<'_>, msg: Message) -> Result<(), HandlerError> {
        let msg = match msg.downcast::<Bytes>() {
            Ok(bytes) => match String::from_utf8(Vec::from(*bytes)) {
                Ok(text) => {
                    ctx.fire_channel_read(Box::new(text));
                    return Ok(());
                }
                Err(e) => return Err(CodecError::InvalidUtf8(e.utf8_error().to_string()).into()),
            },
            Err(msg) => msg,
        };
        let msg = match msg.downcast::<PooledBuf>() {
            Ok(buf) => {
                let text = Self::decode(buf.as_slice())?;
                ctx.fire_channel_read(Box::new(text));
                return Ok(());
            }
            Err(msg) => msg,
        };
        match msg.downcast::<BytesMut>() {
            Ok(bytes) => {
                let text = Self::decode(&bytes)?;
                ctx.fire_channel_read(Box::new(text));
                Ok(())
            }
            Err(msg) => {
                ctx.fire_channel_read(msg);
                Ok(())
            }
        }
    }
}

/// Encodes `String` messages as UTF-8.
#[derive(Debug, Default, Clone)]
pub struct StringEncoder {
    terminator: Option<Vec<u8>>,
}

impl StringEncoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `terminator` after every string.
    #[must_use]
    pub fn with_terminator(terminator: &[u8]) -> Self {
        Self {
            terminator: Some(terminator.to_vec()),
        }
    }
}

impl Encoder for StringEncoder {
    type Item = String;

    fn encode(&mut self, _channel: &Channel, item: String, dst: &mut BytesMut) -> Result<(), HandlerError> {
        let extra = self.terminator.as_ref().map_or(0, Vec::len);
        dst.reserve(item.len() + extra);
        dst.extend_from_slice(item.as_bytes());
        if let Some(terminator) = &self.terminator {
            dst.extend_from_slice(terminator);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delimiter::LineCodec;
    use netloom_core::alloc::Arena;
    use netloom_core::options::{ArenaConfig, ChannelConfig};
    use netloom_core::pipeline::Pipeline;

    fn channel(pipeline: Pipeline) -> Channel {
        Channel::new(
            pipeline,
            Arena::new(ArenaConfig::new(64 * 1024, 16 * 1024)),
            ChannelConfig::default(),
        )
    }

    #[test]
    fn test_encoder_appends_terminator() {
        let mut pipeline = Pipeline::new();
        pipeline
            .add_encoder("text", StringEncoder::with_terminator(LineCodec::CrLf.delimiter()))
            .unwrap();
        let ch = channel(pipeline);
        let drain = ch.take_write_drain().unwrap();

        ch.write_and_flush(Box::new(String::from("héllo"))).unwrap();

        let entry = drain.try_next().unwrap();
        assert_eq!(entry.payload.as_slice(), "héllo\r\n".as_bytes());
    }

    #[test]
    fn test_empty_string_writes_nothing() {
        let mut pipeline = Pipeline::new();
        pipeline.add_encoder("text", StringEncoder::new()).unwrap();
        let ch = channel(pipeline);
        let drain = ch.take_write_drain().unwrap();

        ch.write_and_flush(Box::new(String::new())).unwrap();

        assert!(drain.try_next().is_none());
    }

    #[test]
    fn test_invalid_utf8_is_a_decode_error() {
        assert!(matches!(
            StringDecoder::decode(&[0xff, 0xfe]),
            Err(CodecError::InvalidUtf8(_))
        ));
        assert_eq!(StringDecoder::decode(b"ok").unwrap(), "ok");
    }
}
