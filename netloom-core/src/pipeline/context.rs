//! Per-invocation handler context.

use super::chain::HandlerEntry;
use super::dispatch::{self, Deferred, DispatchState};
use super::event::{Direction, Event, IdleState, Message};
use crate::buffer::PooledBuf;
use crate::channel::Channel;
use crate::error::{ArenaError, ChannelError, HandlerError};

/// What a handler sees while it is being invoked.
///
/// The context owns the rest of the traversal: `fire_*` continues inbound
/// after this handler, `write` continues outbound before it. Calls that
/// would reverse the current direction are queued and run after the current
/// traversal returns, starting next to this handler.
pub struct HandlerContext<'a> {
    channel: &'a Channel,
    name: &'a str,
    position: usize,
    direction: Direction,
    next: &'a mut [HandlerEntry],
    state: &'a mut DispatchState,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(
        channel: &'a Channel,
        name: &'a str,
        position: usize,
        direction: Direction,
        next: &'a mut [HandlerEntry],
        state: &'a mut DispatchState,
    ) -> Self {
        Self {
            channel,
            name,
            position,
            direction,
            next,
            state,
        }
    }

    #[inline]
    pub fn channel(&self) -> &Channel {
        self.channel
    }

    /// Name the handler was registered under.
    #[inline]
    pub fn name(&self) -> &str {
        self.name
    }

    /// Index of the handler in its pipeline.
    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    #[inline]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn fire_channel_active(&mut self) {
        self.fire_inbound(Event::NewChannel);
    }

    pub fn fire_channel_read(&mut self, msg: Message) {
        self.fire_inbound(Event::ChannelRead(msg));
    }

    pub fn fire_exception_caught(&mut self, err: HandlerError) {
        self.fire_inbound(Event::DecodeException(err));
    }

    pub fn fire_channel_inactive(&mut self) {
        self.fire_inbound(Event::ChannelClosed);
    }

    pub fn fire_idle(&mut self, state: IdleState) {
        self.fire_inbound(Event::Idle(state));
    }

    /// Pass `event` on in its own direction.
    pub fn forward(&mut self, event: Event) {
        match event {
            Event::ChannelWrite(msg) => self.write(msg),
            other => self.fire_inbound(other),
        }
    }

    /// Send `msg` towards the head of the pipeline.
    pub fn write(&mut self, msg: Message) {
        self.write_inner(msg, None);
    }

    /// Like [`write`](Self::write), with a continuation that receives the
    /// outcome of the socket write.
    pub fn write_with<F>(&mut self, msg: Message, on_complete: F)
    where
        F: FnOnce(Result<(), ChannelError>) + Send + 'static,
    {
        self.write_inner(msg, Some(Box::new(on_complete)));
    }

    /// Close the channel. `ChannelClosed` is delivered after this traversal.
    pub fn close(&self) {
        self.channel.close();
    }

    /// Lease a pooled buffer from the channel's arena.
    pub fn alloc_buffer(&self, size: usize) -> Result<PooledBuf, ArenaError> {
        self.channel.alloc_buffer(size)
    }

    fn fire_inbound(&mut self, event: Event) {
        match self.direction {
            Direction::Inbound => dispatch::fire_inbound(
                self.channel,
                &mut *self.next,
                self.position + 1,
                event,
                self.state,
            ),
            Direction::Outbound => self.state.defer(Deferred::Inbound {
                from: self.position + 1,
                event,
            }),
        }
    }

    fn write_inner(&mut self, msg: Message, completion: Option<dispatch::Completion>) {
        match self.direction {
            Direction::Outbound => {
                if let Some(completion) = completion {
                    self.state.attach(completion);
                }
                dispatch::fire_outbound(self.channel, &mut *self.next, msg, self.state);
            }
            Direction::Inbound => self.state.defer(Deferred::Outbound {
                before: self.position,
                msg,
                completion,
            }),
        }
    }
}
