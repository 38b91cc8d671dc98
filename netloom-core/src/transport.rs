//! Socket task driving one channel on its I/O thread.
//!
//! Two pumps share the stream:
//!
//! - **read pump**: lease one arena page, read into it, hand it to the
//!   pipeline and wait until that read was dispatched before leasing the next
//!   page. At most one read page per channel is outstanding.
//! - **write pump**: the channel's single write-queue drain. Pops entries in
//!   order, writes each fully, then runs its continuation.
//!
//! EOF, a socket error on either side or `Channel::close` ends both pumps;
//! the channel is closed on the way out.

use crate::alloc::IoBytes;
use crate::buffer::PooledBuf;
use crate::channel::Channel;
use crate::error::ChannelError;
use crate::write_queue::{Payload, WriteDrain, WriteEntry};

use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use compio::net::TcpStream;
use futures::{select, FutureExt};
use std::io;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

const MIN_ALLOC_BACKOFF: Duration = Duration::from_micros(200);
const MAX_ALLOC_BACKOFF: Duration = Duration::from_millis(20);

/// Run `channel` over `stream` until either side closes.
///
/// Must be spawned on the runtime that owns `stream`. The channel should be
/// activated after this task is spawned so writes issued from
/// `channel_active` find a running drain.
pub async fn run(channel: Channel, stream: TcpStream) {
    let Some(drain) = channel.take_write_drain() else {
        warn!(channel = %channel.id(), "write queue already drained elsewhere");
        channel.close();
        return;
    };
    let close_rx = channel.close_signal();

    let reader = read_pump(&channel, &stream).fuse();
    let writer = write_pump(&channel, &stream, &drain).fuse();
    let closed = close_rx.recv_async().fuse();
    futures::pin_mut!(reader, writer, closed);

    select! {
        res = reader => match res {
            Ok(()) => debug!(channel = %channel.id(), "peer closed"),
            Err(e) => debug!(channel = %channel.id(), error = %e, "read failed"),
        },
        res = writer => if let Err(e) = res {
            debug!(channel = %channel.id(), error = %e, "write failed");
        },
        _ = closed => trace!(channel = %channel.id(), "close requested"),
    }

    channel.close();
    let mut writer = &stream;
    if let Err(e) = writer.shutdown().await {
        trace!(channel = %channel.id(), error = %e, "socket shutdown");
    }
    trace!(channel = %channel.id(), "socket task finished");
}

async fn read_pump(channel: &Channel, stream: &TcpStream) -> io::Result<()> {
    let mut reader = stream;
    let size = channel.config().read_buffer_size;
    loop {
        let Some(buf) = acquire_read_buffer(channel, size).await else {
            return Ok(());
        };
        let BufResult(res, buf) = AsyncRead::read(&mut reader, buf).await;
        let n = res?;
        if n == 0 {
            return Ok(());
        }
        trace!(channel = %channel.id(), bytes = n, "read");

        let (done_tx, done_rx) = flume::bounded::<()>(1);
        channel.dispatch_read(buf, done_tx);
        // Disconnects once the pipeline consumed the read.
        let _ = done_rx.recv_async().await;
    }
}

/// Lease a read page without blocking the I/O thread.
///
/// Retries with backoff while the arena is exhausted; gives up once the
/// channel starts closing.
async fn acquire_read_buffer(channel: &Channel, size: usize) -> Option<PooledBuf> {
    let started = Instant::now();
    let mut backoff = MIN_ALLOC_BACKOFF;
    let mut reported = false;
    loop {
        if channel.is_closing() {
            return None;
        }
        match channel.arena().try_allocate(size) {
            Ok(page) => return Some(PooledBuf::new(page)),
            Err(e) if e.is_backpressure() => {
                if !reported && started.elapsed() >= channel.config().alloc_timeout {
                    debug!(channel = %channel.id(), size, "arena exhausted, read paused");
                    reported = true;
                }
                compio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_ALLOC_BACKOFF);
            }
            Err(e) => {
                warn!(channel = %channel.id(), error = %e, "cannot lease read buffer");
                return None;
            }
        }
    }
}

async fn write_pump(channel: &Channel, stream: &TcpStream, drain: &WriteDrain) -> io::Result<()> {
    let mut writer = stream;
    while let Some(entry) = drain.next().await {
        let WriteEntry {
            payload,
            on_complete,
        } = entry;
        let len = payload.len();
        let res = match payload {
            Payload::Pooled(buf) => writer.write_all(buf).await.0,
            Payload::Shared(bytes) => writer.write_all(IoBytes::new(bytes)).await.0,
        };
        match res {
            Ok(()) => {
                channel.touch_write();
                trace!(channel = %channel.id(), bytes = len, "wrote");
                if let Some(on_complete) = on_complete {
                    on_complete(Ok(()));
                }
            }
            Err(e) => {
                if let Some(on_complete) = on_complete {
                    on_complete(Err(ChannelError::Io(io::Error::new(e.kind(), e.to_string()))));
                }
                return Err(e);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Arena;
    use crate::error::HandlerError;
    use crate::options::{ArenaConfig, ChannelConfig};
    use crate::pipeline::{HandlerContext, InboundHandler, Message, Pipeline};
    use compio::io::AsyncReadExt;
    use compio::net::TcpListener;

    struct Echo;

    impl InboundHandler for Echo {
        fn channel_read(
            &mut self,
            ctx: &mut HandlerContext<'_>,
            msg: Message,
        ) -> Result<(), HandlerError> {
            ctx.write(msg);
            Ok(())
        }
    }

    #[test]
    fn echoes_over_a_socket_and_closes_on_eof() {
        compio::runtime::Runtime::new().unwrap().block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let (client, accepted) = futures::join!(TcpStream::connect(addr), listener.accept());
            let mut client = client.unwrap();
            let (server, _) = accepted.unwrap();

            let arena = Arena::new(ArenaConfig::new(64 * 1024, 16 * 1024));
            let mut pipeline = Pipeline::new();
            pipeline.add_inbound("echo", Echo).unwrap();
            let channel = Channel::new(pipeline, arena.clone(), ChannelConfig::default());
            let (closed_tx, closed_rx) = flume::bounded(1);
            channel.on_close(move |_| {
                let _ = closed_tx.send(());
            });
            let task = compio::runtime::spawn(run(channel.clone(), server));
            channel.activate();

            let BufResult(res, _) = client.write_all(b"hello".to_vec()).await;
            res.unwrap();
            let BufResult(res, echoed) = client.read_exact(vec![0u8; 5]).await;
            res.unwrap();
            assert_eq!(echoed, b"hello");

            drop(client);
            closed_rx.recv_async().await.unwrap();
            let _ = task.await;
            assert!(channel.is_closed());
            assert_eq!(arena.stats().outstanding, 0);
        });
    }

    #[test]
    fn close_stops_the_socket_task() {
        compio::runtime::Runtime::new().unwrap().block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let (client, accepted) = futures::join!(TcpStream::connect(addr), listener.accept());
            let mut client = client.unwrap();
            let (server, _) = accepted.unwrap();

            let arena = Arena::new(ArenaConfig::new(64 * 1024, 16 * 1024));
            let channel = Channel::new(Pipeline::new(), arena, ChannelConfig::default());
            let task = compio::runtime::spawn(run(channel.clone(), server));
            channel.activate();
            channel.close();
            let _ = task.await;

            let BufResult(res, _) = client.read(vec![0u8; 8]).await;
            assert_eq!(res.unwrap(), 0);
        });
    }
}
