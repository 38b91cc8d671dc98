//! The engine: boss threads, worker pool, arena and listeners in one handle.
//!
//! ```text
//!   accept/connect ──▶ boss (compio runtime) ──▶ socket task ─┐
//!                                                            │ reads/writes
//!   handlers ◀── worker pool ◀── channel mailbox ◀───────────┘
//! ```
//!
//! Sockets never leave the boss that accepted or connected them. Pipeline
//! dispatch runs on the worker pool so a slow handler delays neither accepts
//! nor other channels' completions.

use crate::boss::{self, BossCmd, Initializer, Shared};

use netloom_core::alloc::Arena;
use netloom_core::channel::Channel;
use netloom_core::error::{EngineError, PipelineError};
use netloom_core::executor::WorkerPool;
use netloom_core::group::ChannelGroup;
use netloom_core::idle::IdleTimer;
use netloom_core::monitor::{create_monitor, EngineEvent, EngineMonitor};
use netloom_core::options::EngineOptions;
use netloom_core::pipeline::Pipeline;
use netloom_core::recycler;
use netloom_core::tcp::{self, SocketTuning};

use flume::Sender;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info};

/// Stop switch shared by a server handle and the engine.
type StopSwitch = Arc<Mutex<Option<Sender<()>>>>;

/// A running channel engine.
///
/// Dropping the engine shuts it down.
pub struct Engine {
    options: EngineOptions,
    shared: Arc<Shared>,
    bosses: Vec<Sender<BossCmd>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    workers: WorkerPool,
    idle: Option<IdleTimer>,
    servers: Mutex<Vec<StopSwitch>>,
    next_boss: AtomicUsize,
    monitor: EngineMonitor,
    stopped: AtomicBool,
}

impl Engine {
    /// Validate `options` and start every thread the engine needs.
    ///
    /// # Errors
    ///
    /// `EngineError::Config` for invalid options, `EngineError::Startup` when
    /// a thread or runtime cannot be created. Nothing is left running on
    /// failure.
    pub fn start(options: EngineOptions) -> Result<Self, EngineError> {
        options.validate()?;
        recycler::set_capacity(options.recycler_capacity);

        let arena = Arena::new(options.arena_config());
        let workers = WorkerPool::start("netloom-worker", options.worker_threads)?;
        let group = ChannelGroup::new();
        let (events, monitor) = create_monitor();
        let shared = Arc::new(Shared {
            arena,
            executor: workers.executor(),
            group,
            channel_config: options.channel_config(),
            tuning: SocketTuning::from(&options),
            connect_timeout: options.connect_timeout,
            events,
        });

        let mut bosses = Vec::with_capacity(options.boss_threads);
        let mut threads = Vec::with_capacity(options.boss_threads);
        for index in 0..options.boss_threads {
            let (tx, rx) = flume::unbounded();
            let (started_tx, started_rx) = flume::bounded(1);
            let boss_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("netloom-boss-{index}"))
                .spawn(move || boss::run(index, boss_shared, rx, started_tx));
            bosses.push(tx);
            let started = match spawned {
                Ok(handle) => {
                    threads.push(handle);
                    started_rx.recv().unwrap_or_else(|_| {
                        Err(EngineError::startup(format!("boss {index} exited during startup")))
                    })
                }
                Err(e) => Err(EngineError::startup(format!(
                    "failed to spawn boss {index}: {e}"
                ))),
            };
            if let Err(e) = started {
                abort_startup(&bosses, threads, &workers, &shared.arena);
                return Err(e);
            }
        }

        let idle = match options.idle_timeout {
            Some(timeout) => {
                match IdleTimer::start(
                    shared.group.clone(),
                    workers.executor(),
                    timeout,
                    options.idle_check_interval,
                ) {
                    Ok(timer) => Some(timer),
                    Err(e) => {
                        abort_startup(&bosses, threads, &workers, &shared.arena);
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        info!(
            bosses = options.boss_threads,
            workers = options.worker_threads,
            arena = options.arena_capacity,
            "engine started"
        );
        Ok(Self {
            options,
            shared,
            bosses,
            threads: Mutex::new(threads),
            workers,
            idle,
            servers: Mutex::new(Vec::new()),
            next_boss: AtomicUsize::new(0),
            monitor,
            stopped: AtomicBool::new(false),
        })
    }

    /// Start with default options.
    ///
    /// # Errors
    ///
    /// See [`Engine::start`].
    pub fn with_defaults() -> Result<Self, EngineError> {
        Self::start(EngineOptions::default())
    }

    /// Listen on `addr`; every accepted connection gets a pipeline built by
    /// `initializer`.
    ///
    /// With `reuse_port` every boss binds the address and the kernel spreads
    /// connections across them; otherwise boss 0 accepts alone. Port 0 picks
    /// a free port, see [`ServerHandle::local_addr`].
    ///
    /// # Errors
    ///
    /// Bind or listen failures, or `EngineError::Shutdown`. Listeners already
    /// started for this call are stopped again.
    pub fn bind<F>(&self, addr: SocketAddr, initializer: F) -> Result<ServerHandle, EngineError>
    where
        F: Fn(&mut Pipeline) -> Result<(), PipelineError> + Send + Sync + 'static,
    {
        self.ensure_running()?;
        let initializer: Initializer = Arc::new(initializer);
        let listeners = if self.options.reuse_port && cfg!(unix) {
            self.bosses.len()
        } else {
            1
        };
        let reuse_port = listeners > 1;

        let first = tcp::bind_listener(addr, reuse_port, self.options.backlog)?;
        let local_addr = first.local_addr()?;
        let (stop_tx, stop_rx) = flume::bounded::<()>(1);
        let stop: StopSwitch = Arc::new(Mutex::new(Some(stop_tx)));

        let mut pending = Some(first);
        for boss in &self.bosses[..listeners] {
            let listener = match pending.take() {
                Some(listener) => Ok(listener),
                None => tcp::bind_listener(local_addr, reuse_port, self.options.backlog),
            };
            let started = listener.map_err(EngineError::from).and_then(|listener| {
                let (ready_tx, ready_rx) = flume::bounded(1);
                boss.send(BossCmd::Listen {
                    listener,
                    addr: local_addr,
                    initializer: Arc::clone(&initializer),
                    stop: stop_rx.clone(),
                    ready: ready_tx,
                })
                .map_err(|_| EngineError::Shutdown)?;
                ready_rx.recv().map_err(|_| EngineError::Shutdown)??;
                Ok(())
            });
            if let Err(e) = started {
                stop.lock().take();
                return Err(e);
            }
        }

        self.servers.lock().push(Arc::clone(&stop));
        let _ = self.shared.events.send(EngineEvent::Listening(local_addr));
        info!(%local_addr, listeners, "listening");
        Ok(ServerHandle { local_addr, stop })
    }

    /// Connect to `addr` on the next boss, waiting up to the configured
    /// connect timeout.
    ///
    /// Blocks the calling thread. Use [`Engine::connect_async`] from async
    /// code.
    ///
    /// # Errors
    ///
    /// Connect failures, `EngineError::ConnectTimeout`, pipeline setup errors
    /// or `EngineError::Shutdown`.
    pub fn connect<F>(&self, addr: SocketAddr, initializer: F) -> Result<Channel, EngineError>
    where
        F: Fn(&mut Pipeline) -> Result<(), PipelineError> + Send + Sync + 'static,
    {
        let reply = self.submit_connect(addr, Arc::new(initializer))?;
        reply.recv().map_err(|_| EngineError::Shutdown)?
    }

    /// Async variant of [`Engine::connect`].
    ///
    /// # Errors
    ///
    /// See [`Engine::connect`].
    pub async fn connect_async<F>(
        &self,
        addr: SocketAddr,
        initializer: F,
    ) -> Result<Channel, EngineError>
    where
        F: Fn(&mut Pipeline) -> Result<(), PipelineError> + Send + Sync + 'static,
    {
        let reply = self.submit_connect(addr, Arc::new(initializer))?;
        reply.recv_async().await.map_err(|_| EngineError::Shutdown)?
    }

    fn submit_connect(
        &self,
        addr: SocketAddr,
        initializer: Initializer,
    ) -> Result<flume::Receiver<Result<Channel, EngineError>>, EngineError> {
        self.ensure_running()?;
        let index = self.next_boss.fetch_add(1, Ordering::Relaxed) % self.bosses.len();
        let (reply, rx) = flume::bounded(1);
        self.bosses[index]
            .send(BossCmd::Connect {
                addr,
                initializer,
                reply,
            })
            .map_err(|_| EngineError::Shutdown)?;
        Ok(rx)
    }

    /// Every open channel, accepted or connected.
    #[must_use]
    pub fn channels(&self) -> &ChannelGroup {
        &self.shared.group
    }

    /// The arena every channel of this engine leases from.
    #[must_use]
    pub fn arena(&self) -> &Arena {
        &self.shared.arena
    }

    /// Options the engine was started with.
    #[must_use]
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Subscribe to listener and connection events.
    #[must_use]
    pub fn monitor(&self) -> EngineMonitor {
        self.monitor.clone()
    }

    /// Whether [`Engine::shutdown`] was called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop listeners, close every channel, stop the bosses, the idle timer
    /// and the workers, then shut the arena. Later calls are no-ops.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("engine shutting down");

        for server in self.servers.lock().drain(..) {
            server.lock().take();
        }
        self.shared.group.close_all();

        for boss in &self.bosses {
            let _ = boss.send(BossCmd::Shutdown);
        }
        join_bosses(std::mem::take(&mut *self.threads.lock()));

        if let Some(idle) = &self.idle {
            idle.stop();
        }
        // Queued close notifications still run before the workers exit.
        self.workers.shutdown();
        self.shared.arena.shutdown();
        info!("engine stopped");
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        if self.is_shut_down() {
            Err(EngineError::Shutdown)
        } else {
            Ok(())
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("bosses", &self.bosses.len())
            .field("workers", &self.workers.threads())
            .field("channels", &self.shared.group.len())
            .field("stopped", &self.is_shut_down())
            .finish()
    }
}

fn abort_startup(
    bosses: &[Sender<BossCmd>],
    threads: Vec<JoinHandle<()>>,
    workers: &WorkerPool,
    arena: &Arena,
) {
    for boss in bosses {
        let _ = boss.send(BossCmd::Shutdown);
    }
    join_bosses(threads);
    workers.shutdown();
    arena.shutdown();
}

fn join_bosses(threads: Vec<JoinHandle<()>>) {
    for handle in threads {
        // Shutdown issued from a handler running on a boss.
        if handle.thread().id() == thread::current().id() {
            continue;
        }
        let _ = handle.join();
    }
}

/// A listening address served by the engine.
///
/// Dropping the handle keeps the listener running; call [`close`](Self::close)
/// or shut the engine down to stop it.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    stop: StopSwitch,
}

impl ServerHandle {
    /// The bound address, with the real port when port 0 was requested.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting. Open channels stay open.
    pub fn close(&self) {
        if self.stop.lock().take().is_some() {
            debug!(local_addr = %self.local_addr, "server closed");
        }
    }

    /// Whether the server stopped accepting.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.stop.lock().is_none()
    }
}
