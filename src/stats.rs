//! Rolling playback statistics.
//!
//! A fixed window of the most recent frames tracks sync error, the
//! corrections applied, and drift (the change in sync error not
//! explained by the previous correction). Sums are maintained
//! incrementally so averages are O(1) per frame.

/// Window length in frames; about half a minute of 352-sample packets.
/// Kept prime so the reporting cadence does not beat against other
/// periodic work.
pub(crate) const TREND_INTERVAL: usize = 3758;

#[derive(Debug, Clone, Copy, Default)]
struct TrendSample {
    sync_error: i64,
    correction: i64,
    drift: i64,
}

/// Event counters for one stream.
#[derive(Debug, Default, Clone)]
pub(crate) struct Counters {
    pub packet_count: u64,
    pub missing_packets: u64,
    pub late_packets: u64,
    pub too_late_packets: u64,
    pub resend_requests: u64,
}

pub(crate) struct TrendWindow {
    samples: Vec<TrendSample>,
    oldest: usize,
    newest: usize,
    count: usize,
    sum_sync_errors: i64,
    sum_corrections: i64,
    sum_insertions_and_deletions: i64,
    sum_drifts: i64,
    previous_sync_error: i64,
    previous_correction: i64,
}

impl TrendWindow {
    pub fn new() -> Self {
        Self {
            samples: vec![TrendSample::default(); TREND_INTERVAL],
            oldest: 0,
            newest: 0,
            count: 0,
            sum_sync_errors: 0,
            sum_corrections: 0,
            sum_insertions_and_deletions: 0,
            sum_drifts: 0,
            previous_sync_error: 0,
            previous_correction: 0,
        }
    }

    /// Record one played frame's sync error and the correction applied.
    pub fn push(&mut self, sync_error: i64, correction: i64) {
        if self.count == TREND_INTERVAL {
            let old = self.samples[self.oldest];
            self.sum_sync_errors -= old.sync_error;
            self.sum_drifts -= old.drift;
            self.sum_insertions_and_deletions -= old.correction.abs();
            self.sum_corrections -= old.correction;
            self.oldest = (self.oldest + 1) % TREND_INTERVAL;
            self.count -= 1;
        }

        let drift = if self.count == 0 {
            0
        } else {
            sync_error - self.previous_sync_error - self.previous_correction
        };
        self.samples[self.newest] = TrendSample {
            sync_error,
            correction,
            drift,
        };
        self.previous_sync_error = sync_error;
        self.previous_correction = correction;

        self.sum_sync_errors += sync_error;
        self.sum_drifts += drift;
        self.sum_insertions_and_deletions += correction.abs();
        self.sum_corrections += correction;

        self.newest = (self.newest + 1) % TREND_INTERVAL;
        self.count += 1;
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn mean_sync_error(&self) -> f64 {
        self.sum_sync_errors as f64 / self.count.max(1) as f64
    }

    pub fn mean_correction(&self) -> f64 {
        self.sum_corrections as f64 / self.count.max(1) as f64
    }

    pub fn mean_insertions_plus_deletions(&self) -> f64 {
        self.sum_insertions_and_deletions as f64 / self.count.max(1) as f64
    }

    pub fn mean_drift(&self) -> f64 {
        self.sum_drifts as f64 / self.count.max(1) as f64
    }

    /// The periodic statistics line. Corrections are scaled to parts
    /// per million of played samples.
    pub fn format_display(
        &self,
        frame_samples: usize,
        counters: &Counters,
        has_delay: bool,
        min_dac_queue: i64,
        min_occupancy: i32,
        max_occupancy: i32,
    ) -> String {
        let per_frame_ppm = 1_000_000.0 / frame_samples as f64;
        if has_delay {
            format!(
                "Sync error: {:.1} (frames); net correction: {:.1} (ppm); corrections: {:.1} (ppm); \
                 drift: {:.1} (ppm); missing packets {}; late packets {}; too late packets {}; \
                 resend requests {}; min DAC queue size {}, min and max buffer occupancy {} and {}.",
                self.mean_sync_error(),
                self.mean_correction() * per_frame_ppm,
                self.mean_insertions_plus_deletions() * per_frame_ppm,
                self.mean_drift() * per_frame_ppm,
                counters.missing_packets,
                counters.late_packets,
                counters.too_late_packets,
                counters.resend_requests,
                min_dac_queue,
                min_occupancy,
                max_occupancy,
            )
        } else {
            format!(
                "Synchronisation disabled. Missing packets {}; late packets {}; too late packets {}; \
                 resend requests {}; min and max buffer occupancy {} and {}.",
                counters.missing_packets,
                counters.late_packets,
                counters.too_late_packets,
                counters.resend_requests,
                min_occupancy,
                max_occupancy,
            )
        }
    }
}
