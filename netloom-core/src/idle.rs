//! Idle detection timer.
//!
//! One lightweight thread wakes every check interval, walks the channel
//! group and asks each channel, on the worker pool, to fire the idle states
//! whose period elapsed. It never touches sockets or buffers.

use crate::error::EngineError;
use crate::executor::Executor;
use crate::group::ChannelGroup;

use flume::{RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace};

pub struct IdleTimer {
    stop_tx: Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl IdleTimer {
    /// Start scanning `group` every `interval` for channels idle longer than
    /// `timeout`.
    ///
    /// # Errors
    ///
    /// `EngineError::Startup` if the timer thread cannot be spawned.
    pub fn start(
        group: ChannelGroup,
        executor: Executor,
        timeout: Duration,
        interval: Duration,
    ) -> Result<Self, EngineError> {
        let (stop_tx, stop_rx) = flume::bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("netloom-idle".into())
            .spawn(move || {
                debug!(?timeout, ?interval, "idle timer started");
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => scan(&group, &executor, timeout),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("idle timer stopped");
            })
            .map_err(|e| EngineError::startup(format!("failed to spawn idle timer: {e}")))?;

        Ok(Self {
            stop_tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn scan(group: &ChannelGroup, executor: &Executor, timeout: Duration) {
    for channel in group.channels() {
        if !channel.is_active() {
            continue;
        }
        let id = channel.id();
        if executor
            .execute(move || {
                channel.check_idle(timeout);
            })
            .is_err()
        {
            trace!(channel = %id, "executor stopped, skipping idle check");
            return;
        }
    }
}
