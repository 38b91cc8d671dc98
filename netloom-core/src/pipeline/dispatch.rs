//! Traversal of the handler list.
//!
//! Dispatch is a pair of free functions over a slice of entries. The
//! function owns the traversal index; a handler only ever sees the part of
//! the list that lies ahead of it in the current direction (`split_at_mut`),
//! so no handler can reach itself or anything behind it.
//!
//! - inbound: scan forward from the start of the slice for the first entry
//!   that handles inbound events; past the tail the event is dropped.
//! - outbound: scan backward from the end of the slice; past the head the
//!   message must be bytes and is collected for the write queue.
//!
//! A handler error never unwinds. Inbound, it becomes a `DecodeException`
//! delivered at the failing handler's position. Outbound, it fails the write
//! and the exception is queued for inbound delivery from the same position.

use super::chain::HandlerEntry;
use super::context::HandlerContext;
use super::event::{Direction, Event, Message};
use crate::buffer::PooledBuf;
use crate::channel::Channel;
use crate::error::{ChannelError, HandlerError};
use crate::write_queue::Payload;

pub(crate) use crate::write_queue::Completion;

use bytes::{Bytes, BytesMut};
use flume::Sender;
use smallvec::SmallVec;
use std::collections::VecDeque;
use tracing::{debug, trace, warn};

/// Work submitted to a channel's pipeline.
pub(crate) enum Action {
    Inbound {
        event: Event,
        /// Dropped once the event and everything it triggered are dispatched.
        done: Option<Sender<()>>,
    },
    Write {
        msg: Message,
        completion: Option<Completion>,
        admission: Option<Sender<Result<(), ChannelError>>>,
    },
    Closed,
}

/// Direction reversals requested during a traversal.
pub(crate) enum Deferred {
    Inbound { from: usize, event: Event },
    Outbound {
        before: usize,
        msg: Message,
        completion: Option<Completion>,
    },
}

/// Scratch state reused across traversals of one pipeline.
#[derive(Default)]
pub(crate) struct DispatchState {
    deferred: VecDeque<Deferred>,
    payloads: SmallVec<[Payload; 2]>,
    completions: SmallVec<[Completion; 1]>,
    write_error: Option<ChannelError>,
}

impl DispatchState {
    pub(crate) fn defer(&mut self, deferred: Deferred) {
        self.deferred.push_back(deferred);
    }

    pub(crate) fn attach(&mut self, completion: Completion) {
        self.completions.push(completion);
    }

    fn fail_write(&mut self, err: ChannelError) {
        if self.write_error.is_none() {
            self.write_error = Some(err);
        }
    }
}

/// Run one action and every reversal it queued.
pub(crate) fn run(
    channel: &Channel,
    handlers: &mut [HandlerEntry],
    action: Action,
    state: &mut DispatchState,
) {
    let mut done = None;
    match action {
        Action::Inbound { event, done: signal } => {
            done = signal;
            fire_inbound(channel, handlers, 0, event, state);
        }
        Action::Write {
            msg,
            completion,
            admission,
        } => {
            let tail = handlers.len();
            let outcome = write_through(channel, handlers, tail, msg, completion, state);
            if let Some(admission) = admission {
                let _ = admission.send(outcome);
            }
        }
        Action::Closed => fire_inbound(channel, handlers, 0, Event::ChannelClosed, state),
    }

    while let Some(deferred) = state.deferred.pop_front() {
        match deferred {
            Deferred::Inbound { from, event } => {
                let from = from.min(handlers.len());
                fire_inbound(channel, &mut handlers[from..], from, event, state);
            }
            Deferred::Outbound {
                before,
                msg,
                completion,
            } => {
                if let Err(err) = write_through(channel, handlers, before, msg, completion, state) {
                    debug!(channel = %channel.id(), error = %err, "handler write failed");
                }
            }
        }
    }
    drop(done);
}

/// Deliver `event` to the first inbound-capable entry of `handlers`.
///
/// `base` is the pipeline index of `handlers[0]`.
pub(crate) fn fire_inbound(
    channel: &Channel,
    handlers: &mut [HandlerEntry],
    base: usize,
    event: Event,
    state: &mut DispatchState,
) {
    let Some(offset) = handlers
        .iter()
        .position(|entry| entry.kind.handles(Direction::Inbound))
    else {
        tail_of_chain(channel, event);
        return;
    };

    let position = base + offset;
    let rethrown = matches!(event, Event::DecodeException(_));
    let Some((entry, rest)) = handlers[offset..].split_first_mut() else {
        return;
    };

    let result = {
        let mut ctx = HandlerContext::new(
            channel,
            &entry.name,
            position,
            Direction::Inbound,
            rest,
            state,
        );
        entry.kind.invoke_inbound(&mut ctx, event)
    };

    if let Err(err) = result {
        debug!(
            channel = %channel.id(),
            handler = %entry.name,
            error = %err,
            "inbound handler failed"
        );
        if rethrown {
            // exception_caught itself failed: move past this handler
            fire_inbound(channel, rest, position + 1, Event::DecodeException(err), state);
        } else {
            fire_inbound(
                channel,
                &mut handlers[offset..],
                position,
                Event::DecodeException(err),
                state,
            );
        }
    }
}

/// Deliver `msg` to the last outbound-capable entry of `handlers`.
///
/// Outbound slices always start at pipeline index 0.
pub(crate) fn fire_outbound(
    channel: &Channel,
    handlers: &mut [HandlerEntry],
    msg: Message,
    state: &mut DispatchState,
) {
    let Some(idx) = handlers
        .iter()
        .rposition(|entry| entry.kind.handles(Direction::Outbound))
    else {
        head_of_chain(channel, msg, state);
        return;
    };

    let (before, rest) = handlers.split_at_mut(idx);
    let Some(entry) = rest.first_mut() else {
        return;
    };

    let result = {
        let mut ctx =
            HandlerContext::new(channel, &entry.name, idx, Direction::Outbound, before, state);
        entry.kind.invoke_outbound(&mut ctx, msg)
    };

    if let Err(err) = result {
        if err.is_backpressure() || matches!(err, HandlerError::Closed) {
            debug!(channel = %channel.id(), handler = %entry.name, error = %err, "write refused");
            state.fail_write(ChannelError::from(err));
        } else {
            debug!(channel = %channel.id(), handler = %entry.name, error = %err, "outbound handler failed");
            state.fail_write(ChannelError::Handler(err.to_string()));
            state.defer(Deferred::Inbound {
                from: idx,
                event: Event::DecodeException(err),
            });
        }
    }
}

/// Push a message through the outbound chain ending before `before`, then
/// hand the resulting bytes to the channel's write queue.
fn write_through(
    channel: &Channel,
    handlers: &mut [HandlerEntry],
    before: usize,
    msg: Message,
    completion: Option<Completion>,
    state: &mut DispatchState,
) -> Result<(), ChannelError> {
    state.payloads.clear();
    state.completions.clear();
    state.write_error = None;
    if let Some(completion) = completion {
        state.completions.push(completion);
    }

    let before = before.min(handlers.len());
    fire_outbound(channel, &mut handlers[..before], msg, state);

    let payloads = std::mem::take(&mut state.payloads);
    let completion = combine(std::mem::take(&mut state.completions));
    match state.write_error.take() {
        Some(err) => {
            // Dropping the payloads returns their pages.
            drop(payloads);
            if let Some(completion) = completion {
                completion(Err(err.replicate()));
            }
            Err(err)
        }
        None => channel.enqueue(payloads, completion),
    }
}

fn combine(mut completions: SmallVec<[Completion; 1]>) -> Option<Completion> {
    match completions.len() {
        0 => None,
        1 => completions.pop(),
        _ => Some(Box::new(move |result: Result<(), ChannelError>| {
            for completion in completions {
                completion(match &result {
                    Ok(()) => Ok(()),
                    Err(err) => Err(err.replicate()),
                });
            }
        })),
    }
}

fn head_of_chain(channel: &Channel, msg: Message, state: &mut DispatchState) {
    match into_payload(msg) {
        Some(payload) if payload.is_empty() => {}
        Some(payload) => state.payloads.push(payload),
        None => {
            warn!(
                channel = %channel.id(),
                "outbound message reached the head of the pipeline without being encoded"
            );
            state.fail_write(ChannelError::UnsupportedMessage);
        }
    }
}

fn tail_of_chain(channel: &Channel, event: Event) {
    match event {
        Event::DecodeException(err) => {
            warn!(channel = %channel.id(), error = %err, "unhandled exception reached the tail of the pipeline");
        }
        Event::ChannelRead(_) => {
            trace!(channel = %channel.id(), "inbound message reached the tail unhandled, dropping");
        }
        other => trace!(channel = %channel.id(), event = ?other.kind(), "event reached the tail"),
    }
}

/// Byte-like messages the write queue accepts directly.
fn into_payload(msg: Message) -> Option<Payload> {
    let msg = match msg.downcast::<PooledBuf>() {
        Ok(buf) => return Some(Payload::Pooled(*buf)),
        Err(msg) => msg,
    };
    let msg = match msg.downcast::<Bytes>() {
        Ok(bytes) => return Some(Payload::Shared(*bytes)),
        Err(msg) => msg,
    };
    let msg = match msg.downcast::<BytesMut>() {
        Ok(bytes) => return Some(Payload::Shared(bytes.freeze())),
        Err(msg) => msg,
    };
    let msg = match msg.downcast::<Vec<u8>>() {
        Ok(bytes) => return Some(Payload::Shared(Bytes::from(*bytes))),
        Err(msg) => msg,
    };
    match msg.downcast::<String>() {
        Ok(text) => Some(Payload::Shared(Bytes::from(*text))),
        Err(_) => None,
    }
}
