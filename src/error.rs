//! Error types for stream setup and the decode pipeline.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlayerError {
    /// Only 16-bit streams are playable; anything else is a broken
    /// session negotiation.
    #[error("only 16-bit samples are supported, stream specifies {0} bits")]
    UnsupportedFormat(u32),

    /// The requested latency needs more packet slots than the ring has.
    #[error("{needed} packet slots needed for a latency of {latency} frames, only {capacity} available")]
    ResourceExhausted {
        latency: i64,
        needed: usize,
        capacity: usize,
    },

    /// The decoder produced a packet of the wrong size.
    #[error("decoder produced {got} samples, expected {expected}")]
    DecodeMismatch { got: usize, expected: usize },

    /// Encoded payload larger than any valid packet.
    #[error("packet payload of {0} bytes exceeds the maximum packet size")]
    PacketTooLarge(usize),

    #[error("packet decryption failed")]
    Decrypt,

    #[error("decoder error: {0}")]
    Decode(String),
}
