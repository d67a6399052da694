//! Historical detection log decoding.
//!
//! Captured blobs are newline-delimited envelopes whose `Body` is base64 of a
//! detector record (`{image_name, detections}`). Decoding is per line: a
//! malformed line is dropped and counted, its siblings are kept.

mod envelope;

pub use envelope::{decode_blob, decode_line, encode_line, DecodedBlob};
