//! Netloom Core
//!
//! The channel I/O engine behind `netloom`:
//! - Fixed-capacity memory arena leasing pages for every read and write (`alloc`)
//! - Per-thread wrapper recycler (`recycler`) and the pooled buffer (`buffer`)
//! - Bidirectional handler pipeline (`pipeline`) and codec contracts (`codec`)
//! - Channels with a bounded, backpressured write queue (`channel`, `write_queue`)
//! - Socket task bridging compio completions to a channel (`transport`)
//! - Worker pool, idle timer and channel group (`executor`, `idle`, `group`)
//! - TCP utilities (`tcp`), options (`options`), events (`monitor`), errors (`error`)

// alloc and tcp need raw pointers / raw fds
#![cfg_attr(not(test), deny(unsafe_code))]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]
pub mod alloc;
pub mod buffer;
pub mod channel;
pub mod codec;
pub mod error;
pub mod executor;
pub mod group;
pub mod idle;
pub mod monitor;
pub mod options;
pub mod recycler;
pub mod tcp;
pub mod transport;
pub mod write_queue;

pub mod pipeline {
    pub mod chain;
    pub mod context;
    pub(crate) mod dispatch;
    pub mod event;
    pub mod handler;

    pub use chain::{HandlerEntry, Pipeline};
    pub use context::HandlerContext;
    pub use event::{message, Direction, Event, EventKind, IdleState, Message};
    pub use handler::{DuplexHandler, HandlerKind, InboundHandler, OutboundHandler};
}

// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::alloc::{Arena, ArenaStats, Page};
    pub use crate::buffer::PooledBuf;
    pub use crate::channel::{Channel, ChannelId, ChannelState};
    pub use crate::codec::{ChannelHandler, Decoder, Encoder};
    pub use crate::error::{
        ArenaError, BufferError, ChannelError, EngineError, HandlerError, PipelineError,
    };
    pub use crate::group::ChannelGroup;
    pub use crate::monitor::{EngineEvent, EngineMonitor};
    pub use crate::options::EngineOptions;
    pub use crate::pipeline::{
        message, Direction, DuplexHandler, Event, HandlerContext, IdleState, InboundHandler,
        Message, OutboundHandler, Pipeline,
    };
}
