//! Codec and application contracts.
//!
//! Concrete framings live in `netloom-codec`; this module defines the traits
//! they implement and the handlers that plug them into a pipeline:
//!
//! - [`Decoder`] + [`DecoderHandler`]: cumulate inbound bytes, cut frames,
//!   fire one `ChannelRead` per decoded message in production order. The
//!   cumulation is heap memory outside the arena, bounded per channel by
//!   [`Decoder::max_buffered`].
//! - [`Encoder`] + [`EncoderHandler`]: turn one typed message into bytes in
//!   an arena buffer.
//! - [`ChannelHandler`] + [`HandlerAdapter`]: the terminal application
//!   handler receiving fully decoded messages.

use crate::buffer::PooledBuf;
use crate::channel::Channel;
use crate::error::HandlerError;
use crate::pipeline::{HandlerContext, IdleState, InboundHandler, Message, OutboundHandler};

use bytes::{Bytes, BytesMut};
use std::any::Any;
use tracing::{trace, warn};

/// Cuts logical messages out of a byte stream.
///
/// `decode` is called with everything received so far that earlier calls
/// did not consume. It consumes whole frames from the front of `src` and
/// pushes one message per frame to `out`; a trailing partial frame must be
/// left in `src` untouched.
pub trait Decoder: Send + 'static {
    fn decode(
        &mut self,
        channel: &Channel,
        src: &mut BytesMut,
        out: &mut Vec<Message>,
    ) -> Result<(), HandlerError>;

    /// Largest partial frame this decoder can leave buffered between reads.
    ///
    /// A cumulation that outgrows it after a successful decode is dropped and
    /// reported as a decode error. `None` leaves it unbounded.
    fn max_buffered(&self) -> Option<usize> {
        None
    }

    /// Called once more when the channel closes with bytes still buffered.
    fn decode_eof(
        &mut self,
        channel: &Channel,
        src: &mut BytesMut,
        out: &mut Vec<Message>,
    ) -> Result<(), HandlerError> {
        self.decode(channel, src, out)
    }
}

/// Encodes one message type into bytes.
pub trait Encoder: Send + 'static {
    type Item: Any + Send;

    fn encode(
        &mut self,
        channel: &Channel,
        item: Self::Item,
        dst: &mut BytesMut,
    ) -> Result<(), HandlerError>;
}

/// Inbound handler driving a [`Decoder`] over a cumulation buffer.
pub struct DecoderHandler<D> {
    decoder: D,
    cumulation: BytesMut,
    out: Vec<Message>,
}

impl<D: Decoder> DecoderHandler<D> {
    pub fn new(decoder: D) -> Self {
        Self {
            decoder,
            cumulation: BytesMut::new(),
            out: Vec::new(),
        }
    }

    /// Bytes received but not yet decoded.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.cumulation.len()
    }

    fn call_decode(&mut self, ctx: &mut HandlerContext<'_>) -> Result<(), HandlerError> {
        while !self.cumulation.is_empty() {
            let before = self.cumulation.len();
            let result = self
                .decoder
                .decode(ctx.channel(), &mut self.cumulation, &mut self.out);
            let produced = !self.out.is_empty();
            for msg in self.out.drain(..) {
                ctx.fire_channel_read(msg);
            }
            result?;

            let consumed = self.cumulation.len() != before;
            match (produced, consumed) {
                (false, false) => break,
                (true, false) => {
                    return Err(HandlerError::decode(
                        "decoder produced a message without consuming input",
                    ))
                }
                _ => {}
            }
        }

        if let Some(max) = self.decoder.max_buffered() {
            let buffered = self.cumulation.len();
            if buffered > max {
                self.cumulation.clear();
                return Err(HandlerError::decode(format!(
                    "{buffered} undecoded bytes exceed the cumulation limit of {max}"
                )));
            }
        }
        Ok(())
    }
}

impl<D: Decoder> InboundHandler for DecoderHandler<D> {
    fn channel_read(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        msg: Message,
    ) -> Result<(), HandlerError> {
        let msg = match msg.downcast::<PooledBuf>() {
            Ok(buf) => {
                // Copy out so the read page goes back before the next read.
                self.cumulation.extend_from_slice(buf.as_slice());
                drop(buf);
                return self.call_decode(ctx);
            }
            Err(msg) => msg,
        };
        let msg = match msg.downcast::<Bytes>() {
            Ok(bytes) => {
                self.cumulation.extend_from_slice(&bytes);
                return self.call_decode(ctx);
            }
            Err(msg) => msg,
        };
        match msg.downcast::<BytesMut>() {
            Ok(bytes) => {
                if self.cumulation.is_empty() {
                    self.cumulation = *bytes;
                } else {
                    self.cumulation.extend_from_slice(&bytes);
                }
                self.call_decode(ctx)
            }
            Err(msg) => {
                ctx.fire_channel_read(msg);
                Ok(())
            }
        }
    }

    fn channel_inactive(&mut self, ctx: &mut HandlerContext<'_>) -> Result<(), HandlerError> {
        if !self.cumulation.is_empty() {
            let result = self
                .decoder
                .decode_eof(ctx.channel(), &mut self.cumulation, &mut self.out);
            for msg in self.out.drain(..) {
                ctx.fire_channel_read(msg);
            }
            if !self.cumulation.is_empty() {
                trace!(
                    channel = %ctx.channel().id(),
                    bytes = self.cumulation.len(),
                    "discarding undecoded bytes on close"
                );
                self.cumulation.clear();
            }
            if let Err(err) = result {
                ctx.fire_exception_caught(err);
            }
        }
        ctx.fire_channel_inactive();
        Ok(())
    }
}

/// Outbound handler driving an [`Encoder`].
///
/// Messages of other types pass through untouched.
pub struct EncoderHandler<E> {
    encoder: E,
    scratch: BytesMut,
}

impl<E: Encoder> EncoderHandler<E> {
    pub fn new(encoder: E) -> Self {
        Self {
            encoder,
            scratch: BytesMut::new(),
        }
    }
}

impl<E: Encoder> OutboundHandler for EncoderHandler<E> {
    fn write(&mut self, ctx: &mut HandlerContext<'_>, msg: Message) -> Result<(), HandlerError> {
        let item = match msg.downcast::<E::Item>() {
            Ok(item) => *item,
            Err(msg) => {
                ctx.write(msg);
                return Ok(());
            }
        };

        self.scratch.clear();
        self.encoder.encode(ctx.channel(), item, &mut self.scratch)?;
        if self.scratch.is_empty() {
            return Ok(());
        }
        let mut buf = ctx.alloc_buffer(self.scratch.len())?;
        buf.put_slice(&self.scratch)?;
        ctx.write(Box::new(buf));
        Ok(())
    }
}

/// Application handler at the end of the pipeline.
pub trait ChannelHandler: Send + 'static {
    /// The decoded message type this handler consumes.
    type Message: Any + Send;

    fn on_connected(&mut self, channel: &Channel) -> Result<(), HandlerError> {
        let _ = channel;
        Ok(())
    }

    fn on_message(&mut self, channel: &Channel, msg: Self::Message) -> Result<(), HandlerError>;

    fn on_closed(&mut self, channel: &Channel) {
        let _ = channel;
    }

    /// Every failure of this channel ends here. The default logs and closes.
    fn on_error(&mut self, channel: &Channel, err: HandlerError) {
        warn!(channel = %channel.id(), error = %err, "closing channel after error");
        channel.close();
    }

    fn on_idle(&mut self, channel: &Channel, state: IdleState) -> Result<(), HandlerError> {
        let _ = (channel, state);
        Ok(())
    }
}

/// Adapts a [`ChannelHandler`] to the inbound handler contract.
pub struct HandlerAdapter<H> {
    handler: H,
}

impl<H: ChannelHandler> HandlerAdapter<H> {
    pub fn new(handler: H) -> Self {
        Self { handler }
    }
}

impl<H: ChannelHandler> InboundHandler for HandlerAdapter<H> {
    fn channel_active(&mut self, ctx: &mut HandlerContext<'_>) -> Result<(), HandlerError> {
        self.handler.on_connected(ctx.channel())?;
        ctx.fire_channel_active();
        Ok(())
    }

    fn channel_read(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        msg: Message,
    ) -> Result<(), HandlerError> {
        match msg.downcast::<H::Message>() {
            Ok(msg) => self.handler.on_message(ctx.channel(), *msg),
            Err(msg) => {
                ctx.fire_channel_read(msg);
                Ok(())
            }
        }
    }

    fn exception_caught(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        err: HandlerError,
    ) -> Result<(), HandlerError> {
        self.handler.on_error(ctx.channel(), err);
        Ok(())
    }

    fn channel_inactive(&mut self, ctx: &mut HandlerContext<'_>) -> Result<(), HandlerError> {
        self.handler.on_closed(ctx.channel());
        ctx.fire_channel_inactive();
        Ok(())
    }

    fn idle(&mut self, ctx: &mut HandlerContext<'_>, state: IdleState) -> Result<(), HandlerError> {
        self.handler.on_idle(ctx.channel(), state)
    }
}
