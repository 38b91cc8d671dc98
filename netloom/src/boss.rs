//! Boss threads.
//!
//! Each boss runs its own compio runtime and owns every listener and socket
//! registered on it. Commands arrive over a flume queue; accepted and
//! connected sockets get a channel whose socket task stays on the boss while
//! pipeline dispatch moves to the worker pool.

use netloom_core::alloc::Arena;
use netloom_core::channel::{self, Channel, ChannelId};
use netloom_core::error::{EngineError, PipelineError};
use netloom_core::executor::Executor;
use netloom_core::group::ChannelGroup;
use netloom_core::monitor::{EngineEvent, EngineEventSender};
use netloom_core::options::ChannelConfig;
use netloom_core::pipeline::Pipeline;
use netloom_core::tcp::{self, SocketTuning};
use netloom_core::transport;

use compio::net::{TcpListener, TcpStream};
use flume::{Receiver, Sender};
use futures::{select, FutureExt};
use std::cell::Cell;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Builds the pipeline of every new channel.
pub(crate) type Initializer =
    Arc<dyn Fn(&mut Pipeline) -> Result<(), PipelineError> + Send + Sync + 'static>;

/// How long a stopping boss waits for its socket tasks.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Pause after a failed accept (usually fd exhaustion).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// State every boss reads.
pub(crate) struct Shared {
    pub(crate) arena: Arena,
    pub(crate) executor: Executor,
    pub(crate) group: ChannelGroup,
    pub(crate) channel_config: ChannelConfig,
    pub(crate) tuning: SocketTuning,
    pub(crate) connect_timeout: Duration,
    pub(crate) events: EngineEventSender,
}

pub(crate) enum BossCmd {
    /// Adopt a bound listener and accept until `stop` disconnects.
    Listen {
        listener: std::net::TcpListener,
        addr: SocketAddr,
        initializer: Initializer,
        stop: Receiver<()>,
        ready: Sender<io::Result<()>>,
    },
    Connect {
        addr: SocketAddr,
        initializer: Initializer,
        reply: Sender<Result<Channel, EngineError>>,
    },
    Shutdown,
}

/// Socket tasks alive on this boss.
#[derive(Clone, Default)]
struct LiveSockets(Rc<Cell<usize>>);

struct SocketGuard(Rc<Cell<usize>>);

impl LiveSockets {
    fn enter(&self) -> SocketGuard {
        self.0.set(self.0.get() + 1);
        SocketGuard(Rc::clone(&self.0))
    }

    fn count(&self) -> usize {
        self.0.get()
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        self.0.set(self.0.get() - 1);
    }
}

/// Boss thread body. Reports runtime creation on `started`, then serves
/// commands until `Shutdown` or until the engine drops its sender.
pub(crate) fn run(
    index: usize,
    shared: Arc<Shared>,
    rx: Receiver<BossCmd>,
    started: Sender<Result<(), EngineError>>,
) {
    let rt = match compio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(boss = index, error = %e, "failed to create runtime");
            let _ = started.send(Err(EngineError::startup(format!(
                "boss {index}: failed to create runtime: {e}"
            ))));
            return;
        }
    };
    channel::set_io_thread(true);
    let _ = started.send(Ok(()));
    drop(started);
    debug!(boss = index, "boss started");

    rt.block_on(async move {
        let live = LiveSockets::default();
        while let Ok(cmd) = rx.recv_async().await {
            match cmd {
                BossCmd::Listen {
                    listener,
                    addr,
                    initializer,
                    stop,
                    ready,
                } => match TcpListener::from_std(listener) {
                    Ok(listener) => {
                        let _ = ready.send(Ok(()));
                        compio::runtime::spawn(accept_loop(
                            index,
                            Arc::clone(&shared),
                            live.clone(),
                            listener,
                            addr,
                            initializer,
                            stop,
                        ))
                        .detach();
                    }
                    Err(e) => {
                        let _ = ready.send(Err(e));
                    }
                },
                BossCmd::Connect {
                    addr,
                    initializer,
                    reply,
                } => {
                    let shared = Arc::clone(&shared);
                    let live = live.clone();
                    compio::runtime::spawn(async move {
                        let result = connect(&shared, &live, addr, &initializer).await;
                        if let Err(e) = &result {
                            debug!(%addr, error = %e, "connect failed");
                            let _ = shared.events.send(EngineEvent::ConnectFailed {
                                addr,
                                reason: e.to_string(),
                            });
                        }
                        // Nobody is waiting any more: do not leak the connection.
                        if let Err(flume::SendError(Ok(channel))) = reply.send(result) {
                            channel.close();
                        }
                    })
                    .detach();
                }
                BossCmd::Shutdown => break,
            }
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while live.count() > 0 && Instant::now() < deadline {
            compio::time::sleep(Duration::from_millis(1)).await;
        }
        if live.count() > 0 {
            warn!(boss = index, remaining = live.count(), "abandoning socket tasks");
        }
    });

    debug!(boss = index, "boss stopped");
}

async fn accept_loop(
    index: usize,
    shared: Arc<Shared>,
    live: LiveSockets,
    listener: TcpListener,
    addr: SocketAddr,
    initializer: Initializer,
    stop: Receiver<()>,
) {
    trace!(boss = index, %addr, "accepting");
    loop {
        let accepted = {
            let accept = listener.accept().fuse();
            let stopped = stop.recv_async().fuse();
            futures::pin_mut!(accept, stopped);
            select! {
                res = accept => res,
                _ = stopped => break,
            }
        };
        match accepted {
            Ok((stream, peer)) => {
                let opened = open_channel(&shared, &live, stream, peer, &initializer, |channel| {
                    EngineEvent::Accepted { channel, peer }
                });
                if let Err(e) = opened {
                    warn!(boss = index, %peer, error = %e, "dropping accepted connection");
                }
            }
            Err(e) => {
                warn!(boss = index, %addr, error = %e, "accept failed");
                let _ = shared.events.send(EngineEvent::AcceptFailed {
                    addr,
                    reason: e.to_string(),
                });
                compio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    debug!(boss = index, %addr, "listener closed");
}

async fn connect(
    shared: &Shared,
    live: &LiveSockets,
    addr: SocketAddr,
    initializer: &Initializer,
) -> Result<Channel, EngineError> {
    let after = shared.connect_timeout;
    let stream = compio::time::timeout(after, TcpStream::connect(addr))
        .await
        .map_err(|_| EngineError::ConnectTimeout { addr, after })??;
    let peer = stream.peer_addr().unwrap_or(addr);
    open_channel(shared, live, stream, peer, initializer, |channel| {
        EngineEvent::Connected { channel, peer }
    })
}

/// Wrap a connected stream in a live channel.
///
/// The socket task is spawned before activation so writes issued from
/// `channel_active` find a running drain.
fn open_channel(
    shared: &Shared,
    live: &LiveSockets,
    stream: TcpStream,
    peer: SocketAddr,
    initializer: &Initializer,
    opened: impl FnOnce(ChannelId) -> EngineEvent,
) -> Result<Channel, EngineError> {
    tcp::configure_stream(&stream, &shared.tuning)?;
    let mut pipeline = Pipeline::new();
    initializer(&mut pipeline)?;

    let mut builder = Channel::builder(shared.arena.clone())
        .config(shared.channel_config)
        .executor(shared.executor.clone())
        .remote_addr(peer);
    if let Ok(local) = stream.local_addr() {
        builder = builder.local_addr(local);
    }
    let channel = builder.build(pipeline);

    shared.group.add(&channel);
    let _ = shared.events.send(opened(channel.id()));
    let events = shared.events.clone();
    channel.on_close(move |channel| {
        let _ = events.send(EngineEvent::Closed(channel.id()));
    });

    let guard = live.enter();
    let task_channel = channel.clone();
    compio::runtime::spawn(async move {
        transport::run(task_channel, stream).await;
        drop(guard);
    })
    .detach();

    channel.activate();
    Ok(channel)
}
