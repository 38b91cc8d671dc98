//! Engine event monitoring.
//!
//! Listener and connection lifecycle events for operators that want more
//! than log lines. Sending never blocks: a monitor nobody reads just grows.

use crate::channel::ChannelId;

use std::fmt;
use std::net::SocketAddr;

/// Listener and connection lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A listener is accepting on this address.
    Listening(SocketAddr),

    /// Accepting on a listener failed; the listener keeps running.
    AcceptFailed { addr: SocketAddr, reason: String },

    /// An inbound connection became a channel.
    Accepted { channel: ChannelId, peer: SocketAddr },

    /// An outbound connection became a channel.
    Connected { channel: ChannelId, peer: SocketAddr },

    /// Connection attempt failed or timed out.
    ConnectFailed { addr: SocketAddr, reason: String },

    /// A channel finished closing.
    Closed(ChannelId),
}

impl fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listening(addr) => write!(f, "Listening on {addr}"),
            Self::AcceptFailed { addr, reason } => {
                write!(f, "Accept failed on {addr}: {reason}")
            }
            Self::Accepted { channel, peer } => write!(f, "Accepted {channel} from {peer}"),
            Self::Connected { channel, peer } => write!(f, "Connected {channel} to {peer}"),
            Self::ConnectFailed { addr, reason } => {
                write!(f, "Connect failed for {addr}: {reason}")
            }
            Self::Closed(channel) => write!(f, "Closed {channel}"),
        }
    }
}

/// Receiving side of the engine's event stream.
pub type EngineMonitor = flume::Receiver<EngineEvent>;

/// Sending side, held by the engine.
pub type EngineEventSender = flume::Sender<EngineEvent>;

#[must_use]
pub fn create_monitor() -> (EngineEventSender, EngineMonitor) {
    flume::unbounded()
}
