//! Time in Q32.32 fixed point and the remote reference anchor.
//!
//! All deadlines in the scheduler are computed in `fp_time`: a `u64`
//! whose top 32 bits are seconds and bottom 32 bits a binary fraction
//! of a second. The player and the clock-recovery component must share
//! one [`MonotonicTime`] so their local times compare.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Convert a frame count at `rate` Hz into an `fp_time` interval.
#[inline]
pub fn fp_from_frames(frames: i64, rate: u32) -> i64 {
    (((frames as i128) << 32) / rate as i128) as i64
}

/// Convert an `fp_time` interval into frames at `rate` Hz, preserving sign.
#[inline]
pub fn frames_from_fp(fp: i64, rate: u32) -> i64 {
    if fp >= 0 {
        ((fp as i128 * rate as i128) >> 32) as i64
    } else {
        -(((-fp) as i128 * rate as i128) >> 32) as i64
    }
}

/// Convert an `fp_time` interval into a [`Duration`].
#[inline]
pub fn fp_to_duration(fp: u64) -> Duration {
    let secs = fp >> 32;
    let nanos = ((fp & 0xffff_ffff) * 1_000_000_000) >> 32;
    Duration::new(secs, nanos as u32)
}

/// A monotonic clock reporting `fp_time` since a shared origin.
///
/// Cheap to clone; clones share the origin, so values from different
/// clones are directly comparable.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicTime {
    origin: Instant,
}

impl MonotonicTime {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Current time as Q32.32 seconds since the origin.
    pub fn now_fp(&self) -> u64 {
        let elapsed = self.origin.elapsed();
        (elapsed.as_secs() << 32) | (((elapsed.subsec_nanos() as u64) << 32) / 1_000_000_000)
    }
}

impl Default for MonotonicTime {
    fn default() -> Self {
        Self::new()
    }
}

/// A fix mapping a remote frame timestamp to local and remote instants.
///
/// Produced by an external clock-recovery component roughly once a
/// second; the player only ever reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceAnchor {
    /// Remote frame timestamp of the fix.
    pub timestamp: u32,
    /// Local monotonic `fp_time` at which that frame was current.
    pub local_time: u64,
    /// The sender's `fp_time` for the same instant.
    pub remote_time: u64,
}

/// Source of the reference anchor, polled by the scheduler each tick.
pub trait ReferenceClock: Send + Sync {
    /// The current fix, or `None` while clock recovery has no lock yet.
    fn anchor(&self) -> Option<ReferenceAnchor>;
}

/// Lock-free anchor slot for clock-recovery publishers.
///
/// A sequence-locked snapshot: the writer bumps the version to an odd
/// value, stores the fields, then bumps it even again; readers retry
/// until they observe a stable even version. The anchor is updated
/// about once a second and read every scheduler tick, so readers
/// almost never spin.
#[derive(Debug, Default)]
pub struct SharedAnchor {
    version: AtomicU64,
    timestamp: AtomicU32,
    local_time: AtomicU64,
    remote_time: AtomicU64,
}

impl SharedAnchor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a new fix. A timestamp of zero clears the anchor.
    pub fn publish(&self, anchor: ReferenceAnchor) {
        self.version.fetch_add(1, Ordering::AcqRel);
        self.timestamp.store(anchor.timestamp, Ordering::Release);
        self.local_time.store(anchor.local_time, Ordering::Release);
        self.remote_time.store(anchor.remote_time, Ordering::Release);
        self.version.fetch_add(1, Ordering::AcqRel);
    }
}

impl ReferenceClock for SharedAnchor {
    fn anchor(&self) -> Option<ReferenceAnchor> {
        loop {
            let v1 = self.version.load(Ordering::Acquire);
            if v1 & 1 != 0 {
                std::hint::spin_loop();
                continue;
            }
            let snapshot = ReferenceAnchor {
                timestamp: self.timestamp.load(Ordering::Acquire),
                local_time: self.local_time.load(Ordering::Acquire),
                remote_time: self.remote_time.load(Ordering::Acquire),
            };
            if self.version.load(Ordering::Acquire) == v1 {
                // timestamp zero is the "no lock yet" sentinel
                return if snapshot.timestamp == 0 {
                    None
                } else {
                    Some(snapshot)
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fp_frame_conversions() {
        // one second of frames is exactly 1.0 in Q32.32
        assert_eq!(fp_from_frames(44100, 44100), 1 << 32);
        assert_eq!(frames_from_fp(1 << 32, 44100), 44100);
        // sign is preserved
        assert_eq!(frames_from_fp(-(1i64 << 32), 44100), -44100);
        assert_eq!(fp_from_frames(-44100, 44100), -(1i64 << 32));
    }

    #[test]
    fn test_fp_to_duration() {
        let half = 1u64 << 31; // 0.5 s
        let d = fp_to_duration((2 << 32) | half);
        assert_eq!(d.as_secs(), 2);
        assert!((d.subsec_millis() as i32 - 500).abs() <= 1);
    }

    #[test]
    fn test_monotonic_time_advances() {
        let clock = MonotonicTime::new();
        let a = clock.now_fp();
        std::thread::sleep(Duration::from_millis(5));
        let b = clock.now_fp();
        assert!(b > a);
    }

    #[test]
    fn test_shared_anchor_roundtrip() {
        let slot = SharedAnchor::new();
        assert_eq!(slot.anchor(), None);

        let fix = ReferenceAnchor {
            timestamp: 10_000,
            local_time: 123 << 32,
            remote_time: 456 << 32,
        };
        slot.publish(fix);
        assert_eq!(slot.anchor(), Some(fix));

        // zero timestamp clears the lock again
        slot.publish(ReferenceAnchor {
            timestamp: 0,
            local_time: 0,
            remote_time: 0,
        });
        assert_eq!(slot.anchor(), None);
    }
}
