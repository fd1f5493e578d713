//! Player and per-stream configuration.

pub const SAMPLE_RATE: u32 = 44100;

/// Which strategy absorbs single-sample timing corrections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StuffingMode {
    /// Insert or drop one interpolated sample at a random position.
    #[default]
    Basic,
    /// One-shot high-quality resample of the whole packet (needs the
    /// `soxr` feature; falls back to `Basic` without it).
    Soxr,
}

/// Tuning knobs for the player. All frame counts are at 44100 Hz.
#[derive(Debug, Clone)]
pub struct PlayerConfig {
    /// Target end-to-end latency in frames. 88200 is two seconds.
    pub latency: i64,
    /// Signed frame offset added to every deadline, compensating a
    /// fixed delay in the audio backend.
    pub audio_backend_latency_offset: i64,
    /// Desired depth of the device queue in frames.
    pub audio_backend_buffer_desired_length: i64,
    /// Sync error below which no correction is attempted, in frames.
    pub tolerance: i64,
    /// Sync error that triggers a flush-resync after four consecutive
    /// excursions. Zero disables resync.
    pub resync_threshold: i64,
    /// Seconds of packet silence before requesting stream shutdown.
    /// Zero disables the check.
    pub timeout: u64,
    /// Correction strategy.
    pub packet_stuffing: StuffingMode,
    /// Must not exceed the slot ring size; checked at `play`.
    pub buffer_start_fill: u32,
    /// Emit a periodic statistics line.
    pub statistics_requested: bool,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            latency: 88_200,
            audio_backend_latency_offset: 0,
            audio_backend_buffer_desired_length: 6615,
            tolerance: 88,
            resync_threshold: 2205,
            timeout: 120,
            packet_stuffing: StuffingMode::Basic,
            buffer_start_fill: 220,
            statistics_requested: false,
        }
    }
}

/// Parameters of one incoming stream, handed over at `play`.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Whether packet payloads are AES-128-CBC encrypted.
    pub encrypted: bool,
    pub aes_key: [u8; 16],
    pub aes_iv: [u8; 16],
    /// The twelve fmtp values from session negotiation. Index 1 is the
    /// frame length in stereo samples, index 3 the bit depth, index 11
    /// the sample rate; the rest parameterize the decoder.
    pub fmtp: [u32; 12],
}

impl StreamConfig {
    /// An unencrypted stream with the conventional 352-sample packets.
    pub fn unencrypted(fmtp: [u32; 12]) -> Self {
        Self {
            encrypted: false,
            aes_key: [0; 16],
            aes_iv: [0; 16],
            fmtp,
        }
    }

    pub fn frame_samples(&self) -> usize {
        self.fmtp[1] as usize
    }

    pub fn sample_rate(&self) -> u32 {
        self.fmtp[11]
    }

    pub fn bits_per_sample(&self) -> u32 {
        self.fmtp[3]
    }
}
