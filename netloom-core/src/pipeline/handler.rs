//! Handler capabilities.
//!
//! A pipeline entry is tagged with exactly one capability set. Traversal
//! skips entries that do not match the current direction, so an inbound-only
//! handler is invisible to writes and an outbound-only handler is invisible
//! to reads. Every default method forwards to the next matching handler.

use super::context::HandlerContext;
use super::event::{Direction, Event, IdleState, Message};
use crate::error::HandlerError;

/// Handles inbound events: activation, reads, exceptions, close and idle.
pub trait InboundHandler: Send + 'static {
    fn channel_active(&mut self, ctx: &mut HandlerContext<'_>) -> Result<(), HandlerError> {
        ctx.fire_channel_active();
        Ok(())
    }

    fn channel_read(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        msg: Message,
    ) -> Result<(), HandlerError> {
        ctx.fire_channel_read(msg);
        Ok(())
    }

    fn exception_caught(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        err: HandlerError,
    ) -> Result<(), HandlerError> {
        ctx.fire_exception_caught(err);
        Ok(())
    }

    fn channel_inactive(&mut self, ctx: &mut HandlerContext<'_>) -> Result<(), HandlerError> {
        ctx.fire_channel_inactive();
        Ok(())
    }

    fn idle(&mut self, ctx: &mut HandlerContext<'_>, state: IdleState) -> Result<(), HandlerError> {
        ctx.fire_idle(state);
        Ok(())
    }
}

/// Handles outbound writes.
pub trait OutboundHandler: Send + 'static {
    fn write(&mut self, ctx: &mut HandlerContext<'_>, msg: Message) -> Result<(), HandlerError> {
        ctx.write(msg);
        Ok(())
    }
}

/// Participates in both directions.
///
/// The same instance sees inbound events head to tail and writes tail to
/// head; `direction` says which traversal delivered `event`. Forwarding with
/// [`HandlerContext::forward`] continues in that direction.
pub trait DuplexHandler: Send + 'static {
    fn handle(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        event: Event,
        direction: Direction,
    ) -> Result<(), HandlerError>;
}

/// A handler tagged with its capability set.
pub enum HandlerKind {
    Inbound(Box<dyn InboundHandler>),
    Outbound(Box<dyn OutboundHandler>),
    Dual(Box<dyn DuplexHandler>),
}

impl HandlerKind {
    pub fn inbound(handler: impl InboundHandler) -> Self {
        Self::Inbound(Box::new(handler))
    }

    pub fn outbound(handler: impl OutboundHandler) -> Self {
        Self::Outbound(Box::new(handler))
    }

    pub fn dual(handler: impl DuplexHandler) -> Self {
        Self::Dual(Box::new(handler))
    }

    #[inline]
    #[must_use]
    pub const fn handles(&self, direction: Direction) -> bool {
        matches!(
            (self, direction),
            (Self::Dual(_), _)
                | (Self::Inbound(_), Direction::Inbound)
                | (Self::Outbound(_), Direction::Outbound)
        )
    }

    pub(crate) fn invoke_inbound(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        event: Event,
    ) -> Result<(), HandlerError> {
        match self {
            Self::Inbound(handler) => match event {
                Event::NewChannel => handler.channel_active(ctx),
                Event::ChannelRead(msg) => handler.channel_read(ctx, msg),
                Event::DecodeException(err) => handler.exception_caught(ctx, err),
                Event::ChannelClosed => handler.channel_inactive(ctx),
                Event::Idle(state) => handler.idle(ctx, state),
                Event::ChannelWrite(msg) => {
                    ctx.write(msg);
                    Ok(())
                }
            },
            Self::Dual(handler) => handler.handle(ctx, event, Direction::Inbound),
            Self::Outbound(_) => {
                ctx.forward(event);
                Ok(())
            }
        }
    }

    pub(crate) fn invoke_outbound(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        msg: Message,
    ) -> Result<(), HandlerError> {
        match self {
            Self::Outbound(handler) => handler.write(ctx, msg),
            Self::Dual(handler) => handler.handle(ctx, Event::ChannelWrite(msg), Direction::Outbound),
            Self::Inbound(_) => {
                ctx.write(msg);
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for HandlerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Inbound(_) => "Inbound",
            Self::Outbound(_) => "Outbound",
            Self::Dual(_) => "Dual",
        })
    }
}
