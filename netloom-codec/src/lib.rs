//! Netloom Codecs
//!
//! Ready-made pipeline codecs built on the `netloom-core` codec contracts:
//! - Delimiter framing and line presets (`delimiter`)
//! - Length-prefixed framing with 1/2/4/8-byte fields (`length_field`)
//! - UTF-8 string decoding and encoding (`string`)
//!
//! Decoders emit `Bytes` frames; chain a `StringDecoder` after them for text.
//!
//! ```
//! use netloom_codec::{LineCodec, StringDecoder, StringEncoder};
//! use netloom_core::pipeline::Pipeline;
//!
//! let mut pipeline = Pipeline::new();
//! pipeline
//!     .add_decoder("framer", LineCodec::CrLf.decoder(8192))
//!     .unwrap()
//!     .add_inbound("text", StringDecoder::new())
//!     .unwrap()
//!     .add_encoder("text-out", StringEncoder::with_terminator(b"\r\n"))
//!     .unwrap();
//! assert_eq!(pipeline.names(), vec!["framer", "text", "text-out"]);
//! ```

#![deny(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]

pub mod delimiter;
pub mod error;
pub mod length_field;
pub mod string;

pub use delimiter::{DelimiterDecoder, LineCodec};
pub use error::CodecError;
pub use length_field::{LengthFieldDecoder, LengthFieldEncoder, LengthWidth};
pub use string::{StringDecoder, StringEncoder};
