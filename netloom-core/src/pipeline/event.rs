//! Events routed through a pipeline.

use crate::error::HandlerError;

use std::any::Any;
use std::fmt;

/// Type-erased message travelling between handlers.
///
/// Codecs downcast to the concrete type they expect and pass anything else
/// through untouched.
pub type Message = Box<dyn Any + Send>;

/// Box a value as a [`Message`].
#[inline]
pub fn message<T: Any + Send>(value: T) -> Message {
    Box::new(value)
}

/// Traversal direction. Inbound runs head to tail, outbound tail to head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdleState {
    /// Nothing was read for the idle timeout.
    ReaderIdle,
    /// Nothing was written for the idle timeout.
    WriterIdle,
    /// Neither read nor written.
    AllIdle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewChannel,
    ChannelRead,
    ChannelWrite,
    DecodeException,
    ChannelClosed,
    Idle,
}

pub enum Event {
    /// The channel became active.
    NewChannel,
    ChannelRead(Message),
    ChannelWrite(Message),
    /// A handler failed; carries the error to the rest of the chain.
    DecodeException(HandlerError),
    ChannelClosed,
    Idle(IdleState),
}

impl Event {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::NewChannel => EventKind::NewChannel,
            Self::ChannelRead(_) => EventKind::ChannelRead,
            Self::ChannelWrite(_) => EventKind::ChannelWrite,
            Self::DecodeException(_) => EventKind::DecodeException,
            Self::ChannelClosed => EventKind::ChannelClosed,
            Self::Idle(_) => EventKind::Idle,
        }
    }

    /// Writes travel outbound, everything else inbound.
    #[must_use]
    pub const fn direction(&self) -> Direction {
        match self {
            Self::ChannelWrite(_) => Direction::Outbound,
            _ => Direction::Inbound,
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DecodeException(err) => f.debug_tuple("DecodeException").field(err).finish(),
            Self::Idle(state) => f.debug_tuple("Idle").field(state).finish(),
            other => write!(f, "{:?}", other.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_writes_are_outbound() {
        assert_eq!(
            Event::ChannelWrite(message(1u8)).direction(),
            Direction::Outbound
        );
        for event in [
            Event::NewChannel,
            Event::ChannelRead(message("x")),
            Event::DecodeException(HandlerError::decode("bad")),
            Event::ChannelClosed,
            Event::Idle(IdleState::AllIdle),
        ] {
            assert_eq!(event.direction(), Direction::Inbound);
        }
    }
}
