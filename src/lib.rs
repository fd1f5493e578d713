//! Slave-clocked streaming audio player core.
//!
//! Receives encrypted, compressed audio packets from an unreliable
//! transport, reorders them in a sequence-addressed slot ring, decodes
//! them, and emits PCM to an output device whose clock is independent
//! of the sender's:
//! - the jitter buffer absorbs loss, reordering and duplication, and
//!   asks the transport to resend what is still recoverable
//! - the scheduler aligns every frame to a deadline derived from a
//!   remote reference anchor and pads with silence until the stream's
//!   latency is established
//! - the stuffing resampler inserts or drops single samples to track
//!   the sender's clock without audible artifacts
//!
//! Network I/O, key agreement, device drivers and clock recovery stay
//! with the embedder, behind the [`AudioOutput`], [`SessionHooks`] and
//! [`ReferenceClock`] traits.

mod clock;
mod config;
mod decode;
mod error;
mod jitter;
mod output;
mod player;
mod seqnum;
mod session;
mod stats;
mod stuff;

pub use clock::{MonotonicTime, ReferenceAnchor, ReferenceClock, SharedAnchor};
pub use config::{PlayerConfig, StreamConfig, StuffingMode, SAMPLE_RATE};
pub use decode::{AlacStreamDecoder, StreamDecoder, MAX_PACKET};
pub use error::PlayerError;
pub use output::{AudioOutput, AudioParameters};
pub use player::Player;
pub use session::SessionHooks;
