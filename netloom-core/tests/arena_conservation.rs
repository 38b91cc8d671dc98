//! Integration tests for arena accounting across buffers and channels

use bytes::{Buf, BytesMut};
use netloom_core::alloc::Arena;
use netloom_core::buffer::PooledBuf;
use netloom_core::channel::Channel;
use netloom_core::codec::Encoder;
use netloom_core::error::{ArenaError, HandlerError};
use netloom_core::options::{ArenaConfig, ChannelConfig};
use netloom_core::pipeline::Pipeline;
use netloom_core::recycler;
use std::thread;
use std::time::Duration;

const CAPACITY: usize = 256 * 1024;

struct U32Encoder;

impl Encoder for U32Encoder {
    type Item = u32;

    fn encode(&mut self, _channel: &Channel, item: u32, dst: &mut BytesMut) -> Result<(), HandlerError> {
        dst.extend_from_slice(&item.to_be_bytes());
        Ok(())
    }
}

#[test]
fn test_paired_sequences_return_to_zero_under_contention() {
    let arena = Arena::new(ArenaConfig::new(CAPACITY, 32 * 1024));

    let handles: Vec<_> = (0..4usize)
        .map(|t| {
            let arena = arena.clone();
            thread::spawn(move || {
                let mut held = Vec::new();
                for i in 0..500usize {
                    let size = 1 + (i * 37 + t * 101) % 3000;
                    let mut buf = PooledBuf::allocate(&arena, size, Duration::from_secs(5)).unwrap();
                    buf.put_slice(&vec![t as u8; size]).unwrap();
                    let stats = arena.stats();
                    assert!(stats.outstanding <= CAPACITY);
                    assert!(stats.reserved <= CAPACITY);
                    if i % 3 == 0 {
                        held.push(buf);
                    } else {
                        assert!(buf.release().unwrap());
                    }
                    if held.len() > 8 {
                        held.clear();
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = arena.stats();
    assert_eq!(stats.outstanding, 0);
    assert_eq!(stats.live_pages, 0);
    assert!(stats.reserved <= CAPACITY);
}

#[test]
fn test_frozen_and_shared_buffers_return_on_last_drop() {
    let arena = Arena::new(ArenaConfig::new(CAPACITY, 32 * 1024));
    let buf = PooledBuf::copy_from_slice(&arena, b"shared payload", Duration::ZERO).unwrap();
    let frozen = buf.freeze();
    let clone = frozen.clone();
    let slice = frozen.slice(7..);
    drop(frozen);
    assert!(arena.stats().outstanding > 0);
    assert_eq!(slice.as_ref(), b"payload");
    drop(clone);
    assert!(arena.stats().outstanding > 0);
    drop(slice);
    assert_eq!(arena.stats().outstanding, 0);
}

#[test]
fn test_ceiling_is_backpressure_not_failure() {
    let arena = Arena::new(ArenaConfig::new(8192, 4096));
    let a = arena.allocate(4096, Duration::ZERO).unwrap();
    let b = arena.allocate(4096, Duration::ZERO).unwrap();

    let err = arena.allocate(64, Duration::from_millis(30)).unwrap_err();
    assert!(err.is_backpressure());
    assert!(matches!(
        arena.allocate(CAPACITY, Duration::ZERO),
        Err(ArenaError::TooLarge { .. })
    ));

    drop(a);
    arena.deallocate(b).unwrap();
    assert_eq!(arena.stats().outstanding, 0);
}

#[test]
fn test_encoded_writes_return_pages_once_written() {
    let arena = Arena::new(ArenaConfig::new(CAPACITY, 32 * 1024));
    let mut pipeline = Pipeline::new();
    pipeline.add_encoder("u32", U32Encoder).unwrap();
    let channel = Channel::new(pipeline, arena.clone(), ChannelConfig::default());
    let drain = channel.take_write_drain().unwrap();

    for n in 0..10u32 {
        channel.write_and_flush(Box::new(n)).unwrap();
    }
    assert_eq!(arena.stats().live_pages, 10);

    let mut seen = Vec::new();
    while let Some(entry) = drain.try_next() {
        let mut bytes = entry.payload.as_slice();
        seen.push(bytes.get_u32());
    }
    assert_eq!(seen, (0..10).collect::<Vec<_>>());
    assert_eq!(arena.stats().outstanding, 0);
}

#[test]
fn test_wrappers_are_recycled_on_the_releasing_thread() {
    let arena = Arena::new(ArenaConfig::new(CAPACITY, 32 * 1024));
    let before = recycler::stats();
    for _ in 0..100 {
        let buf = PooledBuf::allocate(&arena, 128, Duration::ZERO).unwrap();
        drop(buf);
    }
    let after = recycler::stats();
    assert!(after.reused - before.reused >= 99);
    assert!(recycler::local_len() >= 1);
    assert_eq!(arena.stats().outstanding, 0);
}
