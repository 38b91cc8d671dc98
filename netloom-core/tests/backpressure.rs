//! Integration tests for write-queue admission control

use bytes::Bytes;
use netloom_core::alloc::Arena;
use netloom_core::channel::Channel;
use netloom_core::error::{ChannelError, HandlerError};
use netloom_core::options::{ArenaConfig, ChannelConfig};
use netloom_core::pipeline::{HandlerContext, Message, OutboundHandler, Pipeline};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const CAPACITY: usize = 4;
const TIMEOUT: Duration = Duration::from_millis(150);

/// Writes every byte of a `Bytes` message as its own payload.
struct Fragment;

impl OutboundHandler for Fragment {
    fn write(&mut self, ctx: &mut HandlerContext<'_>, msg: Message) -> Result<(), HandlerError> {
        match msg.downcast::<Bytes>() {
            Ok(bytes) => {
                for i in 0..bytes.len() {
                    ctx.write(Box::new(bytes.slice(i..=i)));
                }
            }
            Err(other) => ctx.write(other),
        }
        Ok(())
    }
}

fn channel(timeout: Duration) -> Channel {
    channel_with(Pipeline::new(), timeout)
}

fn channel_with(pipeline: Pipeline, timeout: Duration) -> Channel {
    let config = ChannelConfig {
        write_queue_capacity: CAPACITY,
        write_timeout: timeout,
        ..ChannelConfig::default()
    };
    Channel::new(
        pipeline,
        Arena::new(ArenaConfig::new(64 * 1024, 16 * 1024)),
        config,
    )
}

fn frame(i: usize) -> Box<Bytes> {
    Box::new(Bytes::from(format!("frame-{i}")))
}

#[test]
fn test_write_beyond_capacity_times_out() {
    let channel = channel(TIMEOUT);
    let _paused = channel.take_write_drain().unwrap();

    for i in 0..CAPACITY {
        let started = Instant::now();
        channel.write_and_flush(frame(i)).unwrap();
        assert!(started.elapsed() < TIMEOUT);
    }

    let started = Instant::now();
    let err = channel.write_and_flush(frame(CAPACITY)).unwrap_err();
    let waited = started.elapsed();

    assert!(err.is_backpressure(), "unexpected error: {err}");
    assert!(waited >= TIMEOUT - Duration::from_millis(10), "returned after {waited:?}");
    assert!(waited < TIMEOUT * 10, "returned after {waited:?}");
    assert_eq!(channel.pending_writes(), CAPACITY);
    // Backpressure is not fatal to the channel.
    assert!(!channel.is_closing());
}

#[test]
fn test_blocked_writer_proceeds_once_drained() {
    let channel = channel(Duration::from_secs(10));
    let drain = channel.take_write_drain().unwrap();
    for i in 0..CAPACITY {
        channel.write_and_flush(frame(i)).unwrap();
    }

    let writer = {
        let channel = channel.clone();
        thread::spawn(move || channel.write_and_flush(frame(CAPACITY)))
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!writer.is_finished());

    let first = drain.try_next().unwrap();
    assert_eq!(first.payload.as_slice(), b"frame-0");
    writer.join().unwrap().unwrap();

    let rest: Vec<Vec<u8>> = std::iter::from_fn(|| drain.try_next())
        .map(|entry| entry.payload.as_slice().to_vec())
        .collect();
    let expected: Vec<Vec<u8>> = (1..=CAPACITY)
        .map(|i| format!("frame-{i}").into_bytes())
        .collect();
    assert_eq!(rest, expected);
}

#[test]
fn test_close_fails_a_blocked_writer_fast() {
    let channel = channel(Duration::from_secs(10));
    let _paused = channel.take_write_drain().unwrap();
    for i in 0..CAPACITY {
        channel.write_and_flush(frame(i)).unwrap();
    }

    let writer = {
        let channel = channel.clone();
        thread::spawn(move || {
            let started = Instant::now();
            (channel.write_and_flush(frame(CAPACITY)), started.elapsed())
        })
    };
    thread::sleep(Duration::from_millis(50));
    channel.close();

    let (result, waited) = writer.join().unwrap();
    assert!(matches!(result, Err(ChannelError::Closed)));
    assert!(waited < Duration::from_secs(5));
}

#[test]
fn test_refused_multi_payload_write_leaves_nothing_queued() {
    let mut pipeline = Pipeline::new();
    pipeline.add_outbound("fragment", Fragment).unwrap();
    let channel = channel_with(pipeline, Duration::from_millis(30));
    let drain = channel.take_write_drain().unwrap();
    channel.write_and_flush(Box::new(Bytes::from_static(b"x"))).unwrap();

    // Four payloads do not fit next to the queued one.
    let refused = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&refused);
    let err = channel
        .write_and_flush_with(Box::new(Bytes::from_static(b"abcd")), move |res| {
            assert!(res.unwrap_err().is_backpressure());
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap_err();
    assert!(err.is_backpressure(), "unexpected error: {err}");
    assert_eq!(refused.load(Ordering::SeqCst), 1);
    assert_eq!(channel.pending_writes(), 1);

    // A retry after draining sends the whole message exactly once.
    assert_eq!(drain.try_next().unwrap().payload.as_slice(), b"x");
    channel.write_and_flush(Box::new(Bytes::from_static(b"abcd"))).unwrap();
    let wire: Vec<u8> = std::iter::from_fn(|| drain.try_next())
        .flat_map(|entry| entry.payload.as_slice().to_vec())
        .collect();
    assert_eq!(wire, b"abcd");
}

#[test]
fn test_message_larger_than_the_queue_waits_for_an_empty_queue() {
    let mut pipeline = Pipeline::new();
    pipeline.add_outbound("fragment", Fragment).unwrap();
    let channel = channel_with(pipeline, Duration::from_secs(10));
    let drain = channel.take_write_drain().unwrap();
    channel.write_and_flush(Box::new(Bytes::from_static(b"x"))).unwrap();

    let writer = {
        let channel = channel.clone();
        thread::spawn(move || channel.write_and_flush(Box::new(Bytes::from_static(b"abcdef"))))
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!writer.is_finished());
    assert_eq!(channel.pending_writes(), 1);

    assert_eq!(drain.try_next().unwrap().payload.as_slice(), b"x");
    writer.join().unwrap().unwrap();
    assert_eq!(channel.pending_writes(), 6);
}
