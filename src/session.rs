//! Hooks into the surrounding session: the RTP/RTSP layers and any
//! configured start/stop commands. All methods are fire-and-forget
//! from the player's point of view.

pub trait SessionHooks: Send + Sync {
    /// Ask the sender to retransmit `count` packets starting at
    /// `first_seq`.
    fn request_resend(&self, first_seq: u16, count: u32);

    /// Ask the control layer to tear the stream down. Called at most
    /// once per stream, when the source has gone silent.
    fn request_shutdown(&self);

    /// Whether incoming audio should currently reach the output.
    fn requested_output_state(&self) -> bool;

    /// Playback is starting; run any configured start command.
    fn playback_started(&self) {}

    /// Playback has stopped; run any configured stop command.
    fn playback_stopped(&self) {}
}
