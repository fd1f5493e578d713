//! Reordering slot ring.
//!
//! Decoded frames live in a fixed ring of slots addressed by packet
//! sequence number modulo the ring size, so out-of-order and resent
//! packets land in place without shuffling. The reader cursor walks
//! the ring in sequence order; unready slots between the cursors are
//! losses that a resend may still fill.
//!
//! Every method here must be called with the player's ring lock held:
//! ordinate comparisons are anchored on the live `ab_read`.

use tracing::debug;

use crate::seqnum::{seq_after, seq_diff, seq_ordinate, seq_pred, seq_succ, seq_sum, ts_after_or_equal};

/// Number of slots; must stay a power of two for the index mapping.
pub(crate) const BUFFER_FRAMES: usize = 512;

pub(crate) struct Slot {
    pub ready: bool,
    pub timestamp: u32,
    pub sequence_number: u16,
    pub pcm: Vec<i16>,
}

/// Where an arriving packet fits relative to the cursors.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Admission {
    /// The packet the writer was waiting for.
    Expected,
    /// Ahead of the writer; the skipped range needs a resend request.
    Ahead { resend_first: u16, resend_count: u32 },
    /// Behind the writer but not yet played; fills a hole.
    Late,
    /// Already behind the reader; useless.
    TooLate,
}

pub(crate) struct SlotRing {
    slots: Vec<Slot>,
    pub ab_read: u16,
    pub ab_write: u16,
    pub synced: bool,
    frame_samples: usize,
}

impl SlotRing {
    pub fn new(frame_samples: usize) -> Self {
        let slots = (0..BUFFER_FRAMES)
            .map(|_| Slot {
                ready: false,
                timestamp: 0,
                sequence_number: 0,
                pcm: vec![0i16; 2 * frame_samples],
            })
            .collect();
        Self {
            slots,
            ab_read: 0,
            ab_write: 0,
            synced: false,
            frame_samples,
        }
    }

    #[inline]
    fn index(seq: u16) -> usize {
        seq as usize & (BUFFER_FRAMES - 1)
    }

    pub fn slot(&self, seq: u16) -> &Slot {
        &self.slots[Self::index(seq)]
    }

    pub fn slot_mut(&mut self, seq: u16) -> &mut Slot {
        &mut self.slots[Self::index(seq)]
    }

    pub fn head(&self) -> &Slot {
        self.slot(self.ab_read)
    }

    pub fn head_mut(&mut self) -> &mut Slot {
        let seq = self.ab_read;
        self.slot_mut(seq)
    }

    /// Frames between the cursors. Never exceeds the ring size.
    pub fn occupancy(&self) -> i32 {
        seq_ordinate(self.ab_read, self.ab_write)
    }

    /// Forget everything buffered; the next packet re-syncs the cursors.
    pub fn resync(&mut self) {
        for slot in &mut self.slots {
            slot.ready = false;
            slot.timestamp = 0;
            slot.sequence_number = 0;
        }
        self.synced = false;
    }

    /// Classify an arriving sequence number and move the writer.
    ///
    /// On the first packet after a (re)sync both cursors snap to it.
    /// For a packet ahead of the writer all intervening slots are
    /// invalidated and the caller is told which range to ask for again.
    pub fn admit(&mut self, seq: u16) -> Admission {
        if !self.synced {
            debug!("syncing to seqno {seq}");
            self.ab_read = seq;
            self.ab_write = seq;
            self.synced = true;
        }

        if seq == self.ab_write {
            self.ab_write = seq_succ(seq);
            return Admission::Expected;
        }

        if seq_after(self.ab_read, self.ab_write, seq) {
            let gap = seq_diff(self.ab_read, self.ab_write, seq_pred(seq)) + 1;
            if gap <= 0 {
                debug!("unexpected gap size: {gap}");
            }
            for i in 0..gap.max(0) as u16 {
                let slot = self.slot_mut(seq_sum(self.ab_write, i));
                slot.ready = false;
                slot.timestamp = 0;
                slot.sequence_number = 0;
            }
            let resend_first = self.ab_write;
            self.ab_write = seq_succ(seq);
            return Admission::Ahead {
                resend_first,
                resend_count: gap.max(0) as u32,
            };
        }

        if seq_after(self.ab_read, self.ab_read, seq) {
            return Admission::Late;
        }

        Admission::TooLate
    }

    /// Drop ready head frames at or before the flush boundary, up to
    /// `max` of them. Returns how many were dropped and whether the
    /// filter was cleared by a frame past the boundary.
    pub fn drain_flushed(&mut self, flush_ts: u32, max: u32) -> (u32, bool) {
        let mut dropped = 0;
        while dropped < max {
            let seq = self.ab_read;
            let head = self.slot_mut(seq);
            if !head.ready {
                return (dropped, false);
            }
            if ts_after_or_equal(head.timestamp, flush_ts) {
                debug!(
                    "dropping flushed packet seqno {}, timestamp {}",
                    head.sequence_number, head.timestamp
                );
                head.ready = false;
                self.ab_read = seq_succ(seq);
                dropped += 1;
            } else {
                // first frame strictly after the boundary clears it
                return (dropped, true);
            }
        }
        (dropped, false)
    }

    /// Recover from a stale slot resident: a ready head whose recorded
    /// sequence number aliases the reader's ring index. The reader
    /// jumps forward to the resident if the resident is newer.
    pub fn realign_head(&mut self) {
        let head_seq = self.head().sequence_number;
        if !self.head().ready || head_seq == self.ab_read {
            return;
        }
        if Self::index(head_seq) == Self::index(self.ab_read) {
            if seq_after(self.ab_read, self.ab_read, head_seq) {
                debug!("aliasing of buffer index -- reset");
                self.ab_read = head_seq;
            }
        } else {
            debug!("inconsistent sequence numbers detected");
        }
    }

    /// Timestamp the head frame should carry, inferred from the first
    /// ready slot at or after the reader when the head itself is not
    /// ready. `None` when nothing buffered is ready.
    pub fn effective_head_timestamp(&self) -> Option<u32> {
        let span = self.occupancy();
        for i in 0..span.max(0) as u16 {
            let slot = self.slot(seq_sum(self.ab_read, i));
            if slot.ready {
                return Some(
                    slot.timestamp
                        .wrapping_sub(i as u32 * self.frame_samples as u32),
                );
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring() -> SlotRing {
        SlotRing::new(352)
    }

    fn store(ring: &mut SlotRing, seq: u16, ts: u32) -> Admission {
        let admission = ring.admit(seq);
        if !matches!(admission, Admission::TooLate) {
            let slot = ring.slot_mut(seq);
            slot.ready = true;
            slot.timestamp = ts;
            slot.sequence_number = seq;
        }
        admission
    }

    #[test]
    fn test_first_packet_syncs_cursors() {
        let mut r = ring();
        assert_eq!(store(&mut r, 100, 10_000), Admission::Expected);
        assert_eq!(r.ab_read, 100);
        assert_eq!(r.ab_write, 101);
        assert!(r.synced);
    }

    #[test]
    fn test_expected_packet_advances_writer_by_one() {
        let mut r = ring();
        store(&mut r, 100, 10_000);
        assert_eq!(store(&mut r, 101, 10_352), Admission::Expected);
        assert_eq!(r.ab_write, 102);
        assert!(r.slot(101).ready);
        assert_eq!(r.slot(101).sequence_number, 101);
    }

    #[test]
    fn test_gap_requests_resend_and_zeroes_slots() {
        let mut r = ring();
        store(&mut r, 100, 10_000);
        store(&mut r, 101, 10_352);
        // 102 lost, 103 arrives
        let admission = store(&mut r, 103, 11_056);
        assert_eq!(
            admission,
            Admission::Ahead {
                resend_first: 102,
                resend_count: 1
            }
        );
        assert_eq!(r.ab_write, 104);
        assert!(!r.slot(102).ready);

        // the resent packet still fits
        assert_eq!(store(&mut r, 102, 10_704), Admission::Late);
        assert!(r.slot(102).ready);
    }

    #[test]
    fn test_full_window_gap_wraps_writer() {
        let mut r = ring();
        store(&mut r, 65_500, 1_000);
        let seq = seq_sum(65_500, (BUFFER_FRAMES - 1) as u16); // 511 ahead
        let admission = r.admit(seq);
        assert_eq!(
            admission,
            Admission::Ahead {
                resend_first: 65_501,
                resend_count: (BUFFER_FRAMES - 2) as u32
            }
        );
        assert_eq!(r.ab_write, seq_succ(seq));
        assert!(r.occupancy() <= BUFFER_FRAMES as i32);
    }

    #[test]
    fn test_too_late_packet_rejected() {
        let mut r = ring();
        store(&mut r, 100, 10_000);
        store(&mut r, 101, 10_352);
        r.ab_read = 101; // 100 already played
        assert_eq!(r.admit(100), Admission::TooLate);
    }

    #[test]
    fn test_ready_slot_index_matches_sequence() {
        let mut r = ring();
        for seq in 100u16..140 {
            store(&mut r, seq, seq as u32 * 352);
        }
        let mut s = r.ab_read;
        while s != r.ab_write {
            let slot = r.slot(s);
            if slot.ready {
                assert_eq!(
                    slot.sequence_number as usize % BUFFER_FRAMES,
                    s as usize % BUFFER_FRAMES
                );
            }
            s = seq_succ(s);
        }
    }

    #[test]
    fn test_drain_flushed_inclusive_drop_exclusive_clear() {
        let mut r = ring();
        store(&mut r, 100, 54_000);
        store(&mut r, 101, 54_999);
        store(&mut r, 102, 55_000);
        store(&mut r, 103, 55_001);

        let (dropped, cleared) = r.drain_flushed(55_000, 8820);
        // 54_000, 54_999 and exactly 55_000 go; 55_001 clears the filter
        assert_eq!(dropped, 3);
        assert!(cleared);
        assert_eq!(r.ab_read, 103);
        assert!(r.head().ready);
        assert_eq!(r.head().timestamp, 55_001);
    }

    #[test]
    fn test_drain_flushed_respects_cap() {
        let mut r = ring();
        for i in 0..10u16 {
            store(&mut r, 100 + i, 1_000 + i as u32);
        }
        let (dropped, cleared) = r.drain_flushed(50_000, 4);
        assert_eq!(dropped, 4);
        assert!(!cleared);
        assert_eq!(r.ab_read, 104);
    }

    #[test]
    fn test_resync_clears_everything() {
        let mut r = ring();
        store(&mut r, 100, 10_000);
        store(&mut r, 101, 10_352);
        r.resync();
        assert!(!r.synced);
        assert!(!r.slot(100).ready);
        assert!(!r.slot(101).ready);
        // next packet re-syncs
        assert_eq!(store(&mut r, 500, 20_000), Admission::Expected);
        assert_eq!(r.ab_read, 500);
    }

    #[test]
    fn test_effective_head_timestamp_spans_holes() {
        let mut r = ring();
        store(&mut r, 100, 10_000);
        store(&mut r, 103, 10_000 + 3 * 352);
        // play out 100, leaving 101/102 as holes at the head
        r.head_mut().ready = false;
        r.ab_read = 101;

        assert_eq!(r.effective_head_timestamp(), Some(10_000 + 352));
        r.ab_read = 103;
        assert_eq!(r.effective_head_timestamp(), Some(10_000 + 3 * 352));
    }

    #[test]
    fn test_effective_head_timestamp_empty() {
        let mut r = ring();
        store(&mut r, 100, 10_000);
        r.head_mut().ready = false;
        assert_eq!(r.effective_head_timestamp(), None);
    }
}
