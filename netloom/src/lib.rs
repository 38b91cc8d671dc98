//! # Netloom
//!
//! An embeddable network engine built on `io_uring` (via `compio`): pooled
//! buffers, bidirectional handler pipelines and channels with backpressured
//! write queues.
//!
//! ## Architecture
//!
//! - **`netloom-core`**: memory arena, wrapper recycler, pipeline, channel,
//!   write queue, worker pool, socket task
//! - **`netloom-codec`**: framing and string codecs for pipelines
//! - **`netloom`**: the [`Engine`] running boss threads over both (this crate)
//!
//! ## Quick Start
//!
//! ### Line echo server
//!
//! ```rust,no_run
//! use netloom::prelude::*;
//! use netloom::codec::{LineCodec, StringDecoder, StringEncoder};
//!
//! struct Echo;
//!
//! impl ChannelHandler for Echo {
//!     type Message = String;
//!
//!     fn on_message(&mut self, channel: &Channel, line: String) -> Result<(), HandlerError> {
//!         channel.write_and_flush(Box::new(line))?;
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::start(EngineOptions::default())?;
//! let server = engine.bind("127.0.0.1:7000".parse()?, |pipeline| {
//!     pipeline
//!         .add_decoder("framer", LineCodec::Lf.decoder(8192))?
//!         .add_inbound("text", StringDecoder::new())?
//!         .add_encoder("text-out", StringEncoder::with_terminator(b"\n"))?
//!         .add_handler("echo", Echo)?;
//!     Ok(())
//! })?;
//! println!("listening on {}", server.local_addr());
//! # Ok(())
//! # }
//! ```
//!
//! ## Resource model
//!
//! - Every socket read leases one arena page; the arena is the only shared
//!   allocator and its exhaustion surfaces as backpressure, never a crash
//! - Writes are admitted into a bounded per-channel queue; a full queue
//!   blocks the writer up to the write timeout
//! - Sockets stay on the boss thread that opened them; handlers run on the
//!   worker pool, one dispatch per channel at a time

#![warn(missing_docs)]
#![warn(clippy::all)]

mod boss;
pub mod dev_tracing;
mod engine;

pub use engine::{Engine, ServerHandle};

// Re-export core types
pub use bytes::Bytes;
pub use netloom_core::{
    alloc, buffer, channel, error, group, monitor, options, pipeline, recycler,
};

/// Ready-made codecs.
pub mod codec {
    pub use netloom_codec::*;
    pub use netloom_core::codec::{ChannelHandler, Decoder, Encoder};
}

/// Everything needed to write handlers and run an engine.
pub mod prelude {
    pub use crate::engine::{Engine, ServerHandle};
    pub use netloom_core::prelude::*;
}
