//! The player proper: packet intake, the scheduler thread that paces
//! frames against the reference clock, and the control surface.
//!
//! All stream state lives in one [`Player`] value: the embedder calls
//! [`Player::play`] when a stream starts, feeds packets in through
//! [`Player::put_packet`] from its network threads, and consumes the
//! player with [`Player::stop`] when the stream ends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::clock::{fp_from_frames, fp_to_duration, frames_from_fp, MonotonicTime, ReferenceClock};
use crate::config::{PlayerConfig, StreamConfig, StuffingMode, SAMPLE_RATE};
use crate::decode::{AlacStreamDecoder, DecodePipeline, PacketCipher, StreamDecoder};
use crate::error::PlayerError;
use crate::jitter::{Admission, SlotRing, BUFFER_FRAMES};
use crate::output::{AudioOutput, AudioParameters};
use crate::seqnum::{seq_succ, seq_sum, ts_after_or_equal};
use crate::session::SessionHooks;
use crate::stats::{Counters, TrendWindow, TREND_INTERVAL};
use crate::stuff::{
    airplay_to_attenuation, airplay_to_linear, stuff_buffer_basic, Dither, UNITY_VOLUME,
};

/// Frames the device must have queued before stuffing is worthwhile.
const DAC_BUFFER_QUEUE_MINIMUM_LENGTH: i64 = 5000;

/// Largest silence block fed to the device per buffering tick, and the
/// deepest we let the device queue get during buffering (0.1 s).
const MAX_DAC_DELAY: i64 = 4410;

/// Cap on head frames dropped by one flush-drain pass.
const FLUSH_DRAIN_LIMIT: u32 = 8820;

/// Scheduler wake period: four thirds of one 352-frame packet time.
const WAKEUP_FP: u64 = ((1u64 << 32) / SAMPLE_RATE as u64) * 4 * 352 / 3;

struct FlushState {
    requested: bool,
    /// Drop frames with timestamps at or before this; 0 means no filter.
    timestamp: u32,
}

struct VolumeState {
    fix_volume: i32,
}

/// Everything the ring lock guards.
struct StreamState {
    ring: SlotRing,
    buffering: bool,
    first_packet_timestamp: u32,
    first_packet_time_to_play: u64,
    time_of_last_audio_packet: u64,
    shutdown_requested: bool,
    connection_state_to_output: bool,
    pipeline: DecodePipeline,
    counters: Counters,
    /// Reference frame captured when playback proper began; the
    /// statistics baseline. Cleared by flush.
    session_start_frame: Option<u32>,
}

struct Shared {
    config: PlayerConfig,
    frame_samples: usize,
    state: Mutex<StreamState>,
    flowcontrol: Condvar,
    flush: Mutex<FlushState>,
    volume: Mutex<VolumeState>,
    audio_info: Mutex<Option<AudioParameters>>,
    please_stop: AtomicBool,
    output: Box<dyn AudioOutput>,
    clock: MonotonicTime,
    reference: Arc<dyn ReferenceClock>,
    hooks: Arc<dyn SessionHooks>,
}

/// One playing stream.
pub struct Player {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

/// What `get_frame` handed the play loop. A zero timestamp marks a
/// filler frame synthesized for a missing packet; fillers never drive
/// sync corrections.
struct FrameMeta {
    timestamp: u32,
    sequence_number: u16,
    occupancy: i32,
    start_time: u64,
}

impl Player {
    /// Start playing a stream, decoding with the built-in ALAC decoder.
    pub fn play(
        config: PlayerConfig,
        stream: StreamConfig,
        output: Box<dyn AudioOutput>,
        clock: MonotonicTime,
        reference: Arc<dyn ReferenceClock>,
        hooks: Arc<dyn SessionHooks>,
    ) -> Result<Self, PlayerError> {
        let decoder = AlacStreamDecoder::new(&stream.fmtp)?;
        Self::play_with_decoder(config, stream, Box::new(decoder), output, clock, reference, hooks)
    }

    /// Start playing with a caller-supplied decoder.
    pub fn play_with_decoder(
        config: PlayerConfig,
        stream: StreamConfig,
        decoder: Box<dyn StreamDecoder>,
        output: Box<dyn AudioOutput>,
        clock: MonotonicTime,
        reference: Arc<dyn ReferenceClock>,
        hooks: Arc<dyn SessionHooks>,
    ) -> Result<Self, PlayerError> {
        if stream.bits_per_sample() != 16 {
            return Err(PlayerError::UnsupportedFormat(stream.bits_per_sample()));
        }
        let frame_samples = stream.frame_samples();
        if frame_samples == 0 {
            return Err(PlayerError::UnsupportedFormat(stream.bits_per_sample()));
        }

        // enough slots for the whole requested latency, plus headroom
        let maximum_latency = config.latency + config.audio_backend_latency_offset;
        let needed =
            ((maximum_latency.max(0) as usize + frame_samples - 1) / frame_samples) + 10;
        if needed > BUFFER_FRAMES {
            return Err(PlayerError::ResourceExhausted {
                latency: maximum_latency,
                needed,
                capacity: BUFFER_FRAMES,
            });
        }
        if config.buffer_start_fill as usize > BUFFER_FRAMES {
            return Err(PlayerError::ResourceExhausted {
                latency: maximum_latency,
                needed: config.buffer_start_fill as usize,
                capacity: BUFFER_FRAMES,
            });
        }

        let cipher = stream
            .encrypted
            .then(|| PacketCipher::new(stream.aes_key, stream.aes_iv));
        let pipeline = DecodePipeline::new(cipher, decoder, frame_samples);
        let connection_state = hooks.requested_output_state();

        let shared = Arc::new(Shared {
            config,
            frame_samples,
            state: Mutex::new(StreamState {
                ring: SlotRing::new(frame_samples),
                buffering: true,
                first_packet_timestamp: 0,
                first_packet_time_to_play: 0,
                time_of_last_audio_packet: 0,
                shutdown_requested: false,
                connection_state_to_output: connection_state,
                pipeline,
                counters: Counters::default(),
                session_start_frame: None,
            }),
            flowcontrol: Condvar::new(),
            flush: Mutex::new(FlushState {
                requested: false,
                timestamp: 0,
            }),
            volume: Mutex::new(VolumeState {
                fix_volume: UNITY_VOLUME,
            }),
            audio_info: Mutex::new(None),
            please_stop: AtomicBool::new(false),
            output,
            clock,
            reference,
            hooks,
        });

        shared.hooks.playback_started();
        shared.output.start(stream.sample_rate());

        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("player".into())
            .stack_size(512 * 1024)
            .spawn(move || player_thread(thread_shared))
            .expect("spawning the player thread");

        info!(
            "player started: {} samples per packet at {} Hz, latency {} frames",
            frame_samples,
            stream.sample_rate(),
            shared.config.latency
        );

        Ok(Self {
            shared,
            thread: Some(handle),
        })
    }

    /// Feed one packet from the transport. Never blocks on anything but
    /// the ring lock; may be called from several network threads.
    pub fn put_packet(&self, seqno: u16, timestamp: u32, payload: &[u8]) {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        state.counters.packet_count += 1;
        state.time_of_last_audio_packet = shared.clock.now_fp();

        if !state.connection_state_to_output {
            // not routed to the output; just remember the arrival time
            return;
        }

        let mut dropped_by_flush = false;
        {
            let mut flush = shared.flush.lock();
            if flush.timestamp != 0 {
                if ts_after_or_equal(timestamp, flush.timestamp) {
                    debug!(
                        "dropping flushed packet seqno {seqno}, timestamp {timestamp}, flushing to {}",
                        flush.timestamp
                    );
                    dropped_by_flush = true;
                } else {
                    // first packet past the boundary clears the filter
                    flush.timestamp = 0;
                }
            }
        }

        if !dropped_by_flush {
            let admission = state.ring.admit(seqno);
            let store = match admission {
                Admission::Expected => true,
                Admission::Ahead {
                    resend_first,
                    resend_count,
                } => {
                    shared.hooks.request_resend(resend_first, resend_count);
                    state.counters.resend_requests += 1;
                    true
                }
                Admission::Late => {
                    state.counters.late_packets += 1;
                    true
                }
                Admission::TooLate => {
                    state.counters.too_late_packets += 1;
                    false
                }
            };

            if store {
                let StreamState { ring, pipeline, .. } = &mut *state;
                let slot = ring.slot_mut(seqno);
                match pipeline.decode_packet(payload, &mut slot.pcm) {
                    Ok(()) => {
                        slot.ready = true;
                        slot.timestamp = timestamp;
                        slot.sequence_number = seqno;
                    }
                    Err(e) => {
                        error!("dropping undecodable packet seqno {seqno}: {e}");
                    }
                }
            }
        }

        shared.flowcontrol.notify_one();
    }

    /// Discard everything up to and including `timestamp`. A timestamp
    /// of zero flushes whatever is buffered without installing a filter.
    pub fn flush(&self, timestamp: u32) {
        debug!("flush requested up to timestamp {timestamp}");
        request_flush(&self.shared, timestamp);
        self.shared.state.lock().session_start_frame = None;
        self.shared.flowcontrol.notify_one();
    }

    /// Set the volume from the airplay scale: -144 is mute, -30..0 is
    /// the slider range. Defers to the device's hardware mixer when it
    /// has one.
    pub fn volume(&self, airplay_db: f64) {
        let attenuation = airplay_to_attenuation(airplay_db);
        let mut linear = airplay_to_linear(airplay_db);

        if self.shared.output.hardware_volume(airplay_db) {
            // mixer does the attenuating; keep the samples untouched
            linear = 1.0;
        }

        let mut info = AudioParameters::default();
        if !self.shared.output.parameters(&mut info) {
            info.airplay_volume = airplay_db;
            info.minimum_volume_db = -4810;
            info.maximum_volume_db = 0;
            info.current_volume_db = attenuation as i32;
            info.has_true_mute = false;
            info.is_muted = false;
        }
        *self.shared.audio_info.lock() = Some(info);

        debug!("volume {airplay_db} dB, software gain {linear:.5}");
        self.shared.volume.lock().fix_volume = (65536.0 * linear) as i32;
    }

    /// Volume capabilities reported by the last `volume` call.
    pub fn audio_parameters(&self) -> Option<AudioParameters> {
        *self.shared.audio_info.lock()
    }

    /// Reference frame at which the current play segment began, once
    /// initial buffering has completed. Cleared by flush. Progress
    /// reporting hangs off this.
    pub fn play_segment_start(&self) -> Option<u32> {
        self.shared.state.lock().session_start_frame
    }

    /// Stop playback, join the scheduler and close the device.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };
        self.shared.please_stop.store(true, Ordering::SeqCst);
        self.shared.flowcontrol.notify_all();
        if handle.join().is_err() {
            error!("player thread panicked");
        }
        self.shared.output.stop();
        self.shared.hooks.playback_stopped();
        info!("player stopped");
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Install a flush filter; the scheduler applies it on its next tick.
fn request_flush(shared: &Shared, timestamp: u32) {
    let mut flush = shared.flush.lock();
    flush.requested = true;
    flush.timestamp = timestamp;
}

/// Add a signed frame offset to an fp instant.
fn offset_deadline(base: u64, frames: i64) -> u64 {
    let fp = fp_from_frames(frames, SAMPLE_RATE);
    if fp >= 0 {
        base.wrapping_add(fp as u64)
    } else {
        base.wrapping_sub((-fp) as u64)
    }
}

/// When the frame carrying `head_ts` should reach the device.
fn play_deadline(
    anchor_ts: u32,
    anchor_local: u64,
    head_ts: u32,
    latency: i64,
    latency_offset: i64,
    backend_buffer: i64,
) -> u64 {
    let delta = head_ts.wrapping_sub(anchor_ts) as i32 as i64;
    offset_deadline(anchor_local, delta + latency + latency_offset - backend_buffer)
}

/// Rate limit on corrections: none for the first five seconds of a
/// play session, roughly one per thousand frames for the next 25.
fn correction_allowed(now: u64, start: u64, roll: impl FnOnce() -> u32) -> bool {
    if start == 0 || now < start {
        return true;
    }
    let elapsed_secs = (now - start) >> 32;
    if elapsed_secs < 5 {
        false
    } else if elapsed_secs < 30 {
        roll() <= 352
    } else {
        true
    }
}

/// Run one packet through the configured stuffing strategy.
fn stuff_frame(
    mode: StuffingMode,
    input: &[i16],
    output: &mut [i16],
    stuff: i32,
    fix_volume: i32,
    dither: &mut Dither,
) -> usize {
    match mode {
        StuffingMode::Basic => stuff_buffer_basic(input, output, stuff, fix_volume, dither),
        StuffingMode::Soxr => {
            #[cfg(feature = "soxr")]
            let n = crate::stuff::stuff_buffer_soxr(input, output, stuff, fix_volume, dither);
            #[cfg(not(feature = "soxr"))]
            let n = stuff_buffer_basic(input, output, stuff, fix_volume, dither);
            n
        }
    }
}

/// Block until a frame is due, copying it into `pcm_out`. Returns
/// `None` when the player is stopping.
fn get_frame(shared: &Shared, pcm_out: &mut [i16]) -> Option<FrameMeta> {
    let config = &shared.config;
    let mut state = shared.state.lock();

    loop {
        let local_time_now = shared.clock.now_fp();

        // source-silence timeout: ask the session to shut us down, once
        if state.time_of_last_audio_packet != 0
            && !state.shutdown_requested
            && config.timeout > 0
            && local_time_now > state.time_of_last_audio_packet
            && local_time_now - state.time_of_last_audio_packet >= config.timeout << 32
        {
            warn!(
                "no audio for {} seconds, requesting stream shutdown",
                config.timeout
            );
            shared.hooks.request_shutdown();
            state.shutdown_requested = true;
        }

        // track the requested connection state; going off flushes
        let rco = shared.hooks.requested_output_state();
        if state.connection_state_to_output != rco {
            state.connection_state_to_output = rco;
            if !rco {
                shared.flush.lock().requested = true;
            }
        }

        // apply a pending flush
        {
            let mut flush = shared.flush.lock();
            if flush.requested {
                shared.output.flush();
                state.ring.resync();
                state.buffering = true;
                state.first_packet_timestamp = 0;
                state.first_packet_time_to_play = 0;
                flush.requested = false;
            }
        }

        // drain frames the flush filter still covers
        if state.ring.synced {
            let mut flush = shared.flush.lock();
            if flush.timestamp != 0 {
                let (dropped, cleared) =
                    state.ring.drain_flushed(flush.timestamp, FLUSH_DRAIN_LIMIT);
                if cleared {
                    flush.timestamp = 0;
                }
                if dropped >= FLUSH_DRAIN_LIMIT {
                    debug!("flush hit the {FLUSH_DRAIN_LIMIT} frame limit");
                }
            }
        }

        if state.ring.synced {
            state.ring.realign_head();

            if state.buffering && state.ring.head().ready {
                buffering_tick(shared, &mut state, local_time_now);
            }
        }

        // is the head frame due?
        let mut do_wait = true;
        if state.ring.synced && !state.buffering {
            if let (Some(head_ts), Some(anchor)) = (
                state.ring.effective_head_timestamp(),
                shared.reference.anchor(),
            ) {
                let time_to_play = play_deadline(
                    anchor.timestamp,
                    anchor.local_time,
                    head_ts,
                    config.latency,
                    config.audio_backend_latency_offset,
                    config.audio_backend_buffer_desired_length,
                );
                if local_time_now >= time_to_play {
                    do_wait = false;
                }
            }
        }

        let wait = (state.buffering || do_wait || !state.ring.synced)
            && !shared.please_stop.load(Ordering::SeqCst);
        if !wait {
            break;
        }
        let _ = shared
            .flowcontrol
            .wait_for(&mut state, fp_to_duration(WAKEUP_FP));
    }

    if shared.please_stop.load(Ordering::SeqCst) {
        return None;
    }

    // last-chance resends at doubling offsets into the window
    if !state.buffering {
        let span = state.ring.occupancy();
        let mut i = 8i32;
        while i < span / 2 {
            let next = seq_sum(state.ring.ab_read, i as u16);
            if !state.ring.slot(next).ready {
                shared.hooks.request_resend(next, 1);
                state.counters.resend_requests += 1;
            }
            i *= 2;
        }
    }

    let head_seq = state.ring.ab_read;
    let (timestamp, sequence_number) = {
        let StreamState { ring, counters, .. } = &mut *state;
        let head = ring.head_mut();
        let meta = if head.ready {
            pcm_out.copy_from_slice(&head.pcm);
            (head.timestamp, head.sequence_number)
        } else {
            counters.missing_packets += 1;
            pcm_out.fill(0);
            (0, head_seq)
        };
        head.ready = false;
        meta
    };
    state.ring.ab_read = seq_succ(head_seq);

    Some(FrameMeta {
        timestamp,
        sequence_number,
        occupancy: state.ring.occupancy(),
        start_time: state.first_packet_time_to_play,
    })
}

/// One tick of initial buffering: fix the deadline on the very first
/// frame, then feed the device silence until the deadline is close
/// enough to hand over to the play path.
fn buffering_tick(
    shared: &Shared,
    state: &mut StreamState,
    local_time_now: u64,
) {
    let config = &shared.config;

    if state.first_packet_timestamp == 0 {
        let Some(anchor) = shared.reference.anchor() else {
            return;
        };
        state.first_packet_timestamp = state.ring.head().timestamp;
        let delta = state
            .first_packet_timestamp
            .wrapping_sub(anchor.timestamp) as i32 as i64;
        state.first_packet_time_to_play = offset_deadline(
            anchor.local_time,
            delta + config.latency + config.audio_backend_latency_offset,
        );

        if local_time_now >= state.first_packet_time_to_play {
            debug!("first packet is late, it should have played before now; flushing 0.1 seconds");
            request_flush(shared, state.first_packet_timestamp.wrapping_add(4410));
            state.session_start_frame = None;
        }
    }

    if state.first_packet_time_to_play == 0 {
        return;
    }

    if local_time_now >= state.first_packet_time_to_play {
        // ran past the exact start time; start over
        shared.output.flush();
        state.ring.resync();
        state.first_packet_timestamp = 0;
        state.first_packet_time_to_play = 0;
        return;
    }

    let dac_delay = match shared.output.delay() {
        Some(-1) => {
            debug!("error getting dac delay while buffering");
            0
        }
        Some(d) => d,
        None => 0,
    };

    let gross_frame_gap = frames_from_fp(
        (state.first_packet_time_to_play - local_time_now) as i64,
        SAMPLE_RATE,
    );
    let exact_frame_gap = gross_frame_gap - dac_delay;

    if exact_frame_gap <= 0 {
        shared.output.flush();
        state.ring.resync();
        state.first_packet_timestamp = 0;
        state.first_packet_time_to_play = 0;
        return;
    }

    let mut fill = MAX_DAC_DELAY.min((MAX_DAC_DELAY - dac_delay).max(0));
    if exact_frame_gap <= fill || exact_frame_gap <= 2 * shared.frame_samples as i64 {
        fill = exact_frame_gap;
        state.buffering = false;
    }
    if fill > 0 {
        let silence = vec![0i16; 2 * fill as usize];
        shared.output.play(&silence);
    }
    if !state.buffering {
        if let Some(anchor) = shared.reference.anchor() {
            state.session_start_frame = Some(anchor.timestamp);
        }
        debug!(
            "initial buffering complete, {} frames of audio buffered",
            state.ring.occupancy() * shared.frame_samples as i32
        );
    }
}

fn player_thread(shared: Arc<Shared>) {
    let frame_samples = shared.frame_samples;
    let config = &shared.config;
    let has_delay = shared.output.delay().is_some();

    let mut inbuf = vec![0i16; 2 * frame_samples];
    let mut outbuf = vec![0i16; 2 * (frame_samples + 3)];
    let mut dither = Dither::new();
    let mut trend = TrendWindow::new();

    let mut play_number: u64 = 0;
    let mut last_seqno_read: Option<u16> = None;
    let mut sync_error_out_of_bounds = 0u32;
    let mut at_least_one_frame_seen = false;
    let mut minimum_dac_queue_size = i64::MAX;
    let mut minimum_buffer_occupancy = BUFFER_FRAMES as i32;
    let mut maximum_buffer_occupancy = 0i32;

    while !shared.please_stop.load(Ordering::SeqCst) {
        let Some(frame) = get_frame(&shared, &mut inbuf) else {
            break;
        };
        play_number += 1;

        if frame.timestamp == 0 {
            // synthesized silence for a missing packet; keep the
            // sequence tracker in step and skip all sync accounting
            last_seqno_read = last_seqno_read.map(seq_succ);
            shared.output.play(&inbuf);
        } else {
            at_least_one_frame_seen = true;

            if frame.occupancy < minimum_buffer_occupancy {
                minimum_buffer_occupancy = frame.occupancy;
            }
            if frame.occupancy > maximum_buffer_occupancy {
                maximum_buffer_occupancy = frame.occupancy;
            }

            match last_seqno_read {
                None => last_seqno_read = Some(frame.sequence_number),
                Some(prev) => {
                    let expected = seq_succ(prev);
                    if frame.sequence_number != expected {
                        debug!(
                            "packets out of sequence: expected {expected}, got {}",
                            frame.sequence_number
                        );
                    }
                    last_seqno_read = Some(frame.sequence_number);
                }
            }

            let mut sync_error: i64 = 0;
            let mut amount_to_stuff: i32 = 0;
            let fix_volume = shared.volume.lock().fix_volume;

            if has_delay {
                let current_delay = match shared.output.delay() {
                    Some(-1) => {
                        debug!("delay error when checking running latency");
                        0
                    }
                    Some(d) => d,
                    None => 0,
                };
                if current_delay < minimum_dac_queue_size {
                    minimum_dac_queue_size = current_delay;
                }

                if let Some(anchor) = shared.reference.anchor() {
                    let local_time_now = shared.clock.now_fp();
                    let td = local_time_now.wrapping_sub(anchor.local_time) as i64;
                    let td_in_frames = frames_from_fp(td, SAMPLE_RATE);

                    // frames of latency actually in flight right now
                    let frame_offset =
                        frame.timestamp.wrapping_sub(anchor.timestamp) as i32 as i64;
                    let delay = td_in_frames - frame_offset + current_delay;
                    sync_error = delay - config.latency;

                    if sync_error > config.tolerance {
                        amount_to_stuff = -1;
                    }
                    if sync_error < -config.tolerance {
                        amount_to_stuff = 1;
                    }
                    // not enough runway to hide a correction
                    if current_delay < DAC_BUFFER_QUEUE_MINIMUM_LENGTH {
                        amount_to_stuff = 0;
                    }
                    if amount_to_stuff != 0
                        && !correction_allowed(local_time_now, frame.start_time, || {
                            rand::thread_rng().gen_range(0..1000)
                        })
                    {
                        amount_to_stuff = 0;
                    }
                }

                if amount_to_stuff == 0 && fix_volume == UNITY_VOLUME {
                    shared.output.play(&inbuf);
                } else {
                    let frames_out = stuff_frame(
                        config.packet_stuffing,
                        &inbuf,
                        &mut outbuf,
                        amount_to_stuff,
                        fix_volume,
                        &mut dither,
                    );
                    shared.output.play(&outbuf[..2 * frames_out]);
                }

                // persistent gross sync error means the clock fix moved
                // under us; flush to the current head and resync
                if config.resync_threshold != 0 && sync_error.abs() > config.resync_threshold {
                    sync_error_out_of_bounds += 1;
                    if sync_error_out_of_bounds > 3 {
                        warn!(
                            "lost sync with source for {sync_error_out_of_bounds} consecutive packets, \
                             flushing and resyncing; error {sync_error}"
                        );
                        sync_error_out_of_bounds = 0;
                        request_flush(&shared, frame.timestamp);
                    }
                } else {
                    sync_error_out_of_bounds = 0;
                }
            } else {
                // no queue depth report, so no synchronisation either
                if fix_volume == UNITY_VOLUME {
                    shared.output.play(&inbuf);
                } else {
                    let frames_out = stuff_frame(
                        config.packet_stuffing,
                        &inbuf,
                        &mut outbuf,
                        0,
                        fix_volume,
                        &mut dither,
                    );
                    shared.output.play(&outbuf[..2 * frames_out]);
                }
            }

            trend.push(sync_error, amount_to_stuff as i64);
        }

        if play_number % TREND_INTERVAL as u64 == 0 {
            if config.statistics_requested {
                if at_least_one_frame_seen {
                    let counters = shared.state.lock().counters.clone();
                    info!(
                        "{}",
                        trend.format_display(
                            frame_samples,
                            &counters,
                            has_delay,
                            minimum_dac_queue_size,
                            minimum_buffer_occupancy,
                            maximum_buffer_occupancy,
                        )
                    );
                } else {
                    info!("no frames received in the last sampling interval");
                }
            }
            minimum_dac_queue_size = i64::MAX;
            minimum_buffer_occupancy = BUFFER_FRAMES as i32;
            maximum_buffer_occupancy = 0;
            at_least_one_frame_seen = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ReferenceAnchor;

    #[test]
    fn test_play_deadline_two_seconds_ahead() {
        let anchor = ReferenceAnchor {
            timestamp: 10_000,
            local_time: 100 << 32,
            remote_time: 0,
        };
        // head is the anchor frame itself, latency two seconds
        let deadline = play_deadline(anchor.timestamp, anchor.local_time, 10_000, 88_200, 0, 0);
        let expected = (100u64 << 32) + ((88_200u64 << 32) / 44_100);
        assert_eq!(deadline, expected);
        // exactly 2.0 s after the anchor instant
        assert_eq!(deadline - (100u64 << 32), 2 << 32);
    }

    #[test]
    fn test_play_deadline_negative_offset() {
        let deadline = play_deadline(10_000, 100 << 32, 10_000, 88_200, 0, 88_200 + 44_100);
        // net offset is minus one second
        assert_eq!(deadline, 99u64 << 32);
    }

    #[test]
    fn test_play_deadline_head_behind_anchor() {
        // a head older than the anchor pulls the deadline earlier
        let ahead = play_deadline(10_000, 100 << 32, 10_000 + 4410, 88_200, 0, 0);
        let behind = play_deadline(10_000, 100 << 32, 10_000 - 4410, 88_200, 0, 0);
        assert!(behind < ahead);
        assert_eq!(ahead - behind, (2 * 4410u64 << 32) / 44_100);
    }

    #[test]
    fn test_correction_rate_limit_phases() {
        let start = 1000u64 << 32;
        // before the session starts corrections are free
        assert!(correction_allowed(start - 1, start, || panic!("no roll")));
        assert!(correction_allowed(5, 0, || panic!("no roll")));
        // first five seconds: never
        assert!(!correction_allowed(start + (2 << 32), start, || 0));
        // five to thirty seconds: the dice decide
        assert!(correction_allowed(start + (10 << 32), start, || 352));
        assert!(!correction_allowed(start + (10 << 32), start, || 353));
        // after thirty seconds: always
        assert!(correction_allowed(start + (31 << 32), start, || panic!("no roll")));
    }

    #[test]
    fn test_wakeup_period_is_four_thirds_of_a_packet() {
        let packet_fp = ((1u64 << 32) / 44_100) * 352;
        assert_eq!(WAKEUP_FP, packet_fp * 4 / 3);
        let d = fp_to_duration(WAKEUP_FP);
        assert!(d.as_millis() >= 10 && d.as_millis() <= 11);
    }
}
