//! Output device interface.
//!
//! The player drives whatever sits behind this trait; device drivers
//! themselves live with the embedder. Optional capabilities (flush,
//! queue depth, hardware volume) have no-op default methods, so a
//! minimal device only implements start/stop/play.

/// Volume capabilities and current setting of the output chain,
/// reported back to the control layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct AudioParameters {
    pub airplay_volume: f64,
    /// Attenuation range in hundredths of a dB.
    pub minimum_volume_db: i32,
    pub maximum_volume_db: i32,
    pub current_volume_db: i32,
    pub has_true_mute: bool,
    pub is_muted: bool,
}

/// A blocking PCM sink with optional queue introspection.
pub trait AudioOutput: Send + Sync {
    /// Open the device at the given rate.
    fn start(&self, sample_rate: u32);

    /// Close the device.
    fn stop(&self);

    /// Play interleaved stereo 16-bit samples. Blocks until the device
    /// has consumed the whole buffer.
    fn play(&self, pcm: &[i16]);

    /// Discard any queued audio. Default: unsupported, no-op.
    fn flush(&self) {}

    /// Frames currently queued in the device, `Some(-1)` on a device
    /// error, or `None` when the device cannot report its queue depth.
    /// Without a queue depth no clock-drift correction is possible.
    fn delay(&self) -> Option<i64> {
        None
    }

    /// Hand the raw airplay volume to a hardware mixer. Returns true if
    /// the device handled it, in which case no software attenuation is
    /// applied.
    fn hardware_volume(&self, _airplay_db: f64) -> bool {
        false
    }

    /// Fill in the device's volume range and mute capability. Returns
    /// false when the device has no such report.
    fn parameters(&self, _info: &mut AudioParameters) -> bool {
        false
    }
}
