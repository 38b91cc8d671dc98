//! Engine configuration options
//!
//! This module provides the configuration surface consumed by the channel
//! engine: arena sizing, read buffer size, write queue admission control,
//! thread counts, idle detection and TCP tuning.

use crate::error::EngineError;
use std::time::Duration;

/// Default arena capacity (64MB)
pub const DEFAULT_ARENA_CAPACITY: usize = 64 * 1024 * 1024;

/// Default region size (1MB)
///
/// Regions are opened lazily in this unit until the arena capacity is reached.
pub const DEFAULT_REGION_SIZE: usize = 1024 * 1024;

/// Default read buffer size (8KB)
///
/// Every socket read leases exactly one page of this size.
pub const DEFAULT_READ_BUF_SIZE: usize = 8192;

/// Small read buffer size (4KB)
pub const SMALL_READ_BUF_SIZE: usize = 4096;

/// Large read buffer size (16KB)
pub const LARGE_READ_BUF_SIZE: usize = 16384;

/// Default number of entries a channel's write queue admits.
pub const DEFAULT_WRITE_QUEUE_CAPACITY: usize = 1024;

/// Engine configuration options.
///
/// # Examples
///
/// ```
/// use netloom_core::options::EngineOptions;
/// use std::time::Duration;
///
/// let opts = EngineOptions::default()
///     .with_arena_capacity(8 * 1024 * 1024)
///     .with_write_timeout(Duration::from_millis(250))
///     .with_worker_threads(4);
/// assert!(opts.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Total bytes the arena may ever hold across all regions.
    ///
    /// This is the admission ceiling that bounds memory under connection storms.
    pub arena_capacity: usize,

    /// Size of each lazily opened arena region.
    pub region_size: usize,

    /// Maximum time a worker blocks waiting for arena space.
    ///
    /// - `Duration::ZERO`: fail immediately with a backpressure signal
    pub alloc_timeout: Duration,

    /// Bytes leased per socket read (bounded, never grown per read).
    pub read_buffer_size: usize,

    /// Maximum number of encoded payloads queued per channel.
    pub write_queue_capacity: usize,

    /// Maximum time `append` blocks on a full write queue.
    pub write_timeout: Duration,

    /// Threads owning socket completions (one compio runtime each).
    pub boss_threads: usize,

    /// Threads running pipeline dispatch and handler logic.
    pub worker_threads: usize,

    /// Wrapper objects kept per thread by the recycler.
    pub recycler_capacity: usize,

    /// Fire `IDLE` events after this much inactivity.
    ///
    /// - `None`: idle detection disabled (default)
    pub idle_timeout: Option<Duration>,

    /// How often the timer thread scans for idle channels.
    pub idle_check_interval: Duration,

    /// Disable Nagle's algorithm on every socket.
    pub tcp_nodelay: bool,

    /// TCP keepalive idle time.
    ///
    /// - `None`: OS default (keepalive off)
    pub tcp_keepalive: Option<Duration>,

    /// SO_SNDBUF in bytes (0 = OS default)
    pub sndbuf: usize,

    /// SO_RCVBUF in bytes (0 = OS default)
    pub rcvbuf: usize,

    /// Let every boss thread listen on the same address (unix only).
    pub reuse_port: bool,

    /// Listen backlog.
    pub backlog: i32,

    /// Maximum time `connect` waits for the TCP handshake.
    pub connect_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        let cores = num_cpus::get().max(1);
        Self {
            arena_capacity: DEFAULT_ARENA_CAPACITY,
            region_size: DEFAULT_REGION_SIZE,
            alloc_timeout: Duration::from_secs(1),
            read_buffer_size: DEFAULT_READ_BUF_SIZE,
            write_queue_capacity: DEFAULT_WRITE_QUEUE_CAPACITY,
            write_timeout: Duration::from_secs(5),
            boss_threads: cores.min(4),
            worker_threads: cores,
            recycler_capacity: 256,
            idle_timeout: None,
            idle_check_interval: Duration::from_millis(500),
            tcp_nodelay: true,
            tcp_keepalive: None,
            sndbuf: 0,
            rcvbuf: 0,
            reuse_port: cfg!(unix),
            backlog: 1024,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl EngineOptions {
    /// Create new engine options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Options tuned for many connections exchanging small messages.
    #[must_use]
    pub fn small() -> Self {
        Self::default()
            .with_read_buffer_size(SMALL_READ_BUF_SIZE)
            .with_write_queue_capacity(256)
    }

    /// Options tuned for fewer connections moving larger payloads.
    #[must_use]
    pub fn large() -> Self {
        Self::default()
            .with_read_buffer_size(LARGE_READ_BUF_SIZE)
            .with_region_size(4 * DEFAULT_REGION_SIZE)
            .with_arena_capacity(4 * DEFAULT_ARENA_CAPACITY)
    }

    /// Set the arena capacity in bytes.
    pub fn with_arena_capacity(mut self, bytes: usize) -> Self {
        self.arena_capacity = bytes;
        self
    }

    /// Set the region size in bytes.
    pub fn with_region_size(mut self, bytes: usize) -> Self {
        self.region_size = bytes;
        self
    }

    /// Set the arena allocation timeout.
    pub fn with_alloc_timeout(mut self, timeout: Duration) -> Self {
        self.alloc_timeout = timeout;
        self
    }

    /// Set read buffer size.
    ///
    /// # Examples
    ///
    /// ```
    /// use netloom_core::options::EngineOptions;
    ///
    /// // Small buffers for low latency
    /// let opts = EngineOptions::new().with_read_buffer_size(4096);
    /// assert_eq!(opts.read_buffer_size, 4096);
    /// ```
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Set the write queue capacity (entries).
    pub fn with_write_queue_capacity(mut self, capacity: usize) -> Self {
        self.write_queue_capacity = capacity;
        self
    }

    /// Set the write queue admission timeout.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the number of boss (I/O) threads.
    pub fn with_boss_threads(mut self, threads: usize) -> Self {
        self.boss_threads = threads;
        self
    }

    /// Set the number of worker threads.
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Set the per-thread recycler capacity.
    pub fn with_recycler_capacity(mut self, capacity: usize) -> Self {
        self.recycler_capacity = capacity;
        self
    }

    /// Enable idle detection.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Set the idle scan interval.
    pub fn with_idle_check_interval(mut self, interval: Duration) -> Self {
        self.idle_check_interval = interval;
        self
    }

    /// Enable or disable TCP_NODELAY.
    pub fn with_tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    /// Set TCP keepalive idle time.
    pub fn with_tcp_keepalive(mut self, idle: Duration) -> Self {
        self.tcp_keepalive = Some(idle);
        self
    }

    /// Set SO_SNDBUF.
    pub fn with_sndbuf(mut self, bytes: usize) -> Self {
        self.sndbuf = bytes;
        self
    }

    /// Set SO_RCVBUF.
    pub fn with_rcvbuf(mut self, bytes: usize) -> Self {
        self.rcvbuf = bytes;
        self
    }

    /// Enable or disable SO_REUSEPORT listening on every boss thread.
    pub fn with_reuse_port(mut self, enabled: bool) -> Self {
        self.reuse_port = enabled;
        self
    }

    /// Set the listen backlog.
    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Check that the options describe an engine that can start.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` naming the first inconsistent option.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.arena_capacity == 0 {
            return Err(EngineError::config("arena_capacity must be > 0"));
        }
        if self.region_size == 0 {
            return Err(EngineError::config("region_size must be > 0"));
        }
        if self.read_buffer_size == 0 {
            return Err(EngineError::config("read_buffer_size must be > 0"));
        }
        if self.read_buffer_size > self.arena_capacity {
            return Err(EngineError::config(format!(
                "read_buffer_size ({}) exceeds arena_capacity ({})",
                self.read_buffer_size, self.arena_capacity
            )));
        }
        if self.write_queue_capacity == 0 {
            return Err(EngineError::config("write_queue_capacity must be > 0"));
        }
        if self.boss_threads == 0 {
            return Err(EngineError::config("boss_threads must be > 0"));
        }
        if self.worker_threads == 0 {
            return Err(EngineError::config("worker_threads must be > 0"));
        }
        if self.idle_timeout.is_some() && self.idle_check_interval.is_zero() {
            return Err(EngineError::config(
                "idle_check_interval must be > 0 when idle detection is enabled",
            ));
        }
        Ok(())
    }

    /// Arena settings derived from these options.
    #[must_use]
    pub fn arena_config(&self) -> ArenaConfig {
        ArenaConfig {
            capacity: self.arena_capacity,
            region_size: self.region_size,
        }
    }

    /// Per-channel settings derived from these options.
    #[must_use]
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            read_buffer_size: self.read_buffer_size,
            alloc_timeout: self.alloc_timeout,
            write_queue_capacity: self.write_queue_capacity,
            write_timeout: self.write_timeout,
        }
    }
}

/// Arena sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Ceiling on region bytes (and therefore on outstanding bytes).
    pub capacity: usize,
    /// Unit in which regions are opened.
    pub region_size: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_ARENA_CAPACITY,
            region_size: DEFAULT_REGION_SIZE,
        }
    }
}

impl ArenaConfig {
    #[must_use]
    pub const fn new(capacity: usize, region_size: usize) -> Self {
        Self {
            capacity,
            region_size,
        }
    }
}

/// Per-channel buffer and write queue settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub read_buffer_size: usize,
    pub alloc_timeout: Duration,
    pub write_queue_capacity: usize,
    pub write_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        EngineOptions::default().channel_config()
    }
}
