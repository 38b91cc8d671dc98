//! Netloom error types.
//!
//! Errors are split by layer so each operation returns the narrowest type
//! that describes what can go wrong. Resource exhaustion (arena or write
//! queue timeouts) is always classified as backpressure via
//! `is_backpressure()` so callers can treat it as flow control.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by the memory arena.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArenaError {
    /// No space became available before the wait deadline.
    #[error("arena exhausted: no {size} byte page available within {waited:?}")]
    Timeout { size: usize, waited: Duration },

    /// The request can never be satisfied by this arena.
    #[error("allocation of {size} bytes exceeds arena capacity of {capacity} bytes")]
    TooLarge { size: usize, capacity: usize },

    /// The waiting channel was closed while blocked.
    #[error("allocation cancelled")]
    Cancelled,

    /// The arena was shut down.
    #[error("arena shut down")]
    Shutdown,

    /// The page was leased from a different arena.
    #[error("page does not belong to this arena")]
    ForeignPage,

    /// The lease behind this page was already returned.
    #[error("page released twice (region {region}, offset {offset})")]
    DoubleFree { region: usize, offset: usize },
}

impl ArenaError {
    /// Timeouts are flow control, not failures.
    #[must_use]
    pub const fn is_backpressure(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Errors returned by pooled buffer wrappers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// The wrapper's reference count already reached zero.
    #[error("buffer already released")]
    Released,

    /// A write would exceed the fixed page capacity.
    #[error("buffer overflow: {requested} bytes requested, {available} writable")]
    Overflow { requested: usize, available: usize },
}

/// Errors returned by the write queue admission path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// The queue stayed full for the whole admission timeout.
    #[error("write queue full for {0:?}")]
    Timeout(Duration),

    /// The queue was closed.
    #[error("write queue closed")]
    Closed,
}

impl WriteError {
    #[must_use]
    pub const fn is_backpressure(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Errors raised by pipeline handlers.
///
/// A handler returning one of these does not unwind the pipeline: the
/// dispatcher turns it into a `DecodeException` event that continues inbound
/// from the handler that raised it.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Malformed inbound bytes.
    #[error("decode error: {0}")]
    Decode(String),

    /// A message could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// A resource was exhausted; surfaced to the writer, not to handlers.
    #[error("backpressure: {0}")]
    Backpressure(String),

    #[error(transparent)]
    Arena(#[from] ArenaError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// The outbound message reached the head in a form that cannot be written.
    #[error("unsupported outbound message type")]
    UnsupportedMessage,

    /// The channel is closing or closed.
    #[error("channel closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    /// Create a decode error with a message
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create an encode error with a message
    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode(msg.into())
    }

    /// Wrap any error type.
    pub fn other<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Other(Box::new(err))
    }

    /// Check if this error is a flow-control signal.
    #[must_use]
    pub fn is_backpressure(&self) -> bool {
        match self {
            Self::Backpressure(_) => true,
            Self::Arena(e) => e.is_backpressure(),
            _ => false,
        }
    }
}

/// Errors reported to writers and write continuations.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The channel is closing or closed.
    #[error("channel closed")]
    Closed,

    /// The write was refused by admission control.
    #[error("backpressure: {0}")]
    Backpressure(String),

    /// No outbound handler turned the message into bytes.
    #[error("unsupported outbound message type")]
    UnsupportedMessage,

    /// An outbound handler failed; the failure was also fired through the pipeline.
    #[error("outbound handler failed: {0}")]
    Handler(String),

    /// The socket write failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ChannelError {
    #[must_use]
    pub const fn is_backpressure(&self) -> bool {
        matches!(self, Self::Backpressure(_))
    }

    /// Copy of this error for a second observer (writer and completion).
    #[must_use]
    pub fn replicate(&self) -> Self {
        match self {
            Self::Closed => Self::Closed,
            Self::Backpressure(msg) => Self::Backpressure(msg.clone()),
            Self::UnsupportedMessage => Self::UnsupportedMessage,
            Self::Handler(msg) => Self::Handler(msg.clone()),
            Self::Io(e) => Self::Io(io::Error::new(e.kind(), e.to_string())),
        }
    }
}

impl From<WriteError> for ChannelError {
    fn from(err: WriteError) -> Self {
        match err {
            WriteError::Timeout(_) => Self::Backpressure(err.to_string()),
            WriteError::Closed => Self::Closed,
        }
    }
}

impl From<HandlerError> for ChannelError {
    fn from(err: HandlerError) -> Self {
        match err {
            HandlerError::Closed => Self::Closed,
            HandlerError::UnsupportedMessage => Self::UnsupportedMessage,
            e if e.is_backpressure() => Self::Backpressure(e.to_string()),
            HandlerError::Io(e) => Self::Io(e),
            e => Self::Handler(e.to_string()),
        }
    }
}

/// Lets a handler write with `?`.
impl From<ChannelError> for HandlerError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Closed => Self::Closed,
            ChannelError::Backpressure(msg) => Self::Backpressure(msg),
            ChannelError::UnsupportedMessage => Self::UnsupportedMessage,
            ChannelError::Handler(msg) => Self::Other(msg.into()),
            ChannelError::Io(e) => Self::Io(e),
        }
    }
}

/// Errors raised while editing a pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("handler name already in use: {0}")]
    DuplicateName(String),

    #[error("no handler named {0}")]
    NotFound(String),

    /// The pipeline is being dispatched on the calling thread.
    #[error("pipeline is busy dispatching on this thread")]
    Reentrant,
}

/// Errors that abort engine startup or engine-level operations.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Options failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A thread or runtime could not be started.
    #[error("startup failed: {0}")]
    Startup(String),

    /// The engine (or the component addressed) is shutting down.
    #[error("engine shut down")]
    Shutdown,

    #[error("connect to {addr} timed out after {after:?}")]
    ConnectTimeout {
        addr: std::net::SocketAddr,
        after: Duration,
    },

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl EngineError {
    /// Create a configuration error with a message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a startup error with a message
    pub fn startup(msg: impl Into<String>) -> Self {
        Self::Startup(msg.into())
    }
}

/// Result type alias for engine-level operations
pub type Result<T> = std::result::Result<T, EngineError>;
