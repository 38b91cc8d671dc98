#![no_main]

use bytes::{Bytes, BytesMut};
use libfuzzer_sys::fuzz_target;
use netloom_codec::{LengthFieldDecoder, LengthWidth};
use netloom_core::alloc::Arena;
use netloom_core::channel::Channel;
use netloom_core::codec::Decoder;
use netloom_core::options::{ArenaConfig, ChannelConfig};
use netloom_core::pipeline::Pipeline;

const MAX_FRAME: usize = 64;

// Input layout: [width selector][split seed][stream...]
fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }
    let width = match data[0] % 4 {
        0 => LengthWidth::U8,
        1 => LengthWidth::U16,
        2 => LengthWidth::U32,
        _ => LengthWidth::U64,
    };
    let seed = usize::from(data[1]);
    let stream = &data[2..];

    let channel = Channel::new(
        Pipeline::new(),
        Arena::new(ArenaConfig::new(4096, 4096)),
        ChannelConfig::default(),
    );

    let whole = decode_all(LengthFieldDecoder::new(width, MAX_FRAME), &channel, &[stream]);

    let chunk = seed % 11 + 1;
    let parts: Vec<&[u8]> = stream.chunks(chunk).collect();
    let split = decode_all(LengthFieldDecoder::new(width, MAX_FRAME), &channel, &parts);

    assert_eq!(whole, split, "framing depends on read boundaries");
    for frame in &whole {
        assert!(frame.len() <= MAX_FRAME);
    }
});

/// Feed `parts` in order, continuing after decode errors like the pipeline does.
fn decode_all(mut decoder: LengthFieldDecoder, channel: &Channel, parts: &[&[u8]]) -> Vec<Bytes> {
    let mut src = BytesMut::new();
    let mut frames = Vec::new();
    for part in parts {
        src.extend_from_slice(part);
        loop {
            let before = src.len();
            let mut out = Vec::new();
            let result = decoder.decode(channel, &mut src, &mut out);
            frames.extend(out.into_iter().filter_map(|msg| msg.downcast::<Bytes>().ok().map(|b| *b)));
            if result.is_ok() || src.len() == before {
                break;
            }
        }
    }
    frames
}
