//! Length-prefixed framing.
//!
//! Wire format: a big-endian unsigned length of 1, 2, 4 or 8 bytes followed
//! by exactly that many payload bytes.
//!
//! ```text
//! +--------+----------------+
//! | length |    payload     |
//! +--------+----------------+
//! ```
//!
//! Fast path: the whole frame is buffered and is split off without copying.
//! Slow path: the buffer reserves the missing bytes and waits.

use crate::error::CodecError;

use bytes::{Buf, Bytes, BytesMut};
use netloom_core::buffer::PooledBuf;
use netloom_core::channel::Channel;
use netloom_core::codec::Decoder;
use netloom_core::error::HandlerError;
use netloom_core::pipeline::{HandlerContext, Message, OutboundHandler};
use tracing::{debug, trace};

/// Width of the length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthWidth {
    U8,
    U16,
    U32,
    U64,
}

impl LengthWidth {
    #[inline]
    #[must_use]
    pub const fn bytes(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::U32 => 4,
            Self::U64 => 8,
        }
    }

    /// Largest length the field can carry.
    #[must_use]
    pub const fn max_value(self) -> u64 {
        match self {
            Self::U8 => u8::MAX as u64,
            Self::U16 => u16::MAX as u64,
            Self::U32 => u32::MAX as u64,
            Self::U64 => u64::MAX,
        }
    }

    fn read(self, mut src: &[u8]) -> u64 {
        match self {
            Self::U8 => u64::from(src.get_u8()),
            Self::U16 => u64::from(src.get_u16()),
            Self::U32 => u64::from(src.get_u32()),
            Self::U64 => src.get_u64(),
        }
    }

    fn write(self, len: u64, dst: &mut [u8]) {
        let be = len.to_be_bytes();
        let width = self.bytes();
        dst[..width].copy_from_slice(&be[8 - width..]);
    }
}

/// Cuts length-prefixed frames; emits each payload as `Bytes`.
#[derive(Debug, Clone)]
pub struct LengthFieldDecoder {
    width: LengthWidth,
    max_frame_length: usize,
    strip_header: bool,
    /// Bytes of an oversized frame still to be skipped.
    discarding: u64,
}

impl LengthFieldDecoder {
    #[must_use]
    pub fn new(width: LengthWidth, max_frame_length: usize) -> Self {
        Self {
            width,
            max_frame_length,
            strip_header: true,
            discarding: 0,
        }
    }

    /// Emit frames including their length prefix.
    #[must_use]
    pub fn keep_header(mut self) -> Self {
        self.strip_header = false;
        self
    }

    #[must_use]
    pub fn width(&self) -> LengthWidth {
        self.width
    }
}

impl Decoder for LengthFieldDecoder {
    fn decode(
        &mut self,
        channel: &Channel,
        src: &mut BytesMut,
        out: &mut Vec<Message>,
    ) -> Result<(), HandlerError> {
        if self.discarding > 0 {
            let n = usize::try_from(self.discarding).map_or(src.len(), |d| d.min(src.len()));
            src.advance(n);
            self.discarding -= n as u64;
            if self.discarding > 0 {
                return Ok(());
            }
        }

        let header = self.width.bytes();
        loop {
            if src.len() < header {
                return Ok(());
            }
            let length = self.width.read(&src[..header]);
            let body = match usize::try_from(length) {
                Ok(body) if body <= self.max_frame_length => body,
                _ => {
                    // Skip the oversized frame, including what is not here yet.
                    src.advance(header);
                    let available = src.len() as u64;
                    let skip = length.min(available);
                    src.advance(skip as usize);
                    self.discarding = length - skip;
                    debug!(channel = %channel.id(), length, "discarding oversized frame");
                    return Err(CodecError::FrameTooLong {
                        length,
                        max: self.max_frame_length,
                    }
                    .into());
                }
            };

            let total = header + body;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(());
            }

            let frame = src.split_to(total).freeze();
            let frame = if self.strip_header {
                frame.slice(header..)
            } else {
                frame
            };
            trace!(channel = %channel.id(), bytes = body, "frame");
            out.push(Box::new(frame));
        }
    }

    fn max_buffered(&self) -> Option<usize> {
        Some(self.max_frame_length.saturating_add(self.width.bytes()))
    }
}

/// Prepends a length field to every outbound byte message.
///
/// Accepts `PooledBuf`, `Bytes`, `BytesMut` and `Vec<u8>`; other messages
/// pass through. The framed result is one arena buffer.
#[derive(Debug, Clone)]
pub struct LengthFieldEncoder {
    width: LengthWidth,
}

impl LengthFieldEncoder {
    #[must_use]
    pub fn new(width: LengthWidth) -> Self {
        Self { width }
    }

    fn frame(&self, ctx: &mut HandlerContext<'_>, payload: &[u8]) -> Result<(), HandlerError> {
        let header = self.width.bytes();
        if payload.len() as u64 > self.width.max_value() {
            return Err(CodecError::LengthOverflow {
                length: payload.len(),
                width: header,
            }
            .into());
        }
        let mut prefix = [0u8; 8];
        self.width.write(payload.len() as u64, &mut prefix);

        let mut buf = ctx.alloc_buffer(header + payload.len())?;
        buf.put_slice(&prefix[..header])?;
        buf.put_slice(payload)?;
        ctx.write(Box::new(buf));
        Ok(())
    }
}

impl OutboundHandler for LengthFieldEncoder {
    fn write(&mut self, ctx: &mut HandlerContext<'_>, msg: Message) -> Result<(), HandlerError> {
        let msg = match msg.downcast::<PooledBuf>() {
            Ok(buf) => return self.frame(ctx, buf.as_slice()),
            Err(msg) => msg,
        };
        let msg = match msg.downcast::<Bytes>() {
            Ok(bytes) => return self.frame(ctx, &bytes),
            Err(msg) => msg,
        };
        let msg = match msg.downcast::<BytesMut>() {
            Ok(bytes) => return self.frame(ctx, &bytes),
            Err(msg) => msg,
        };
        match msg.downcast::<Vec<u8>>() {
            Ok(bytes) => self.frame(ctx, &bytes),
            Err(msg) => {
                ctx.write(msg);
                Ok(())
            }
        }
    }
}
