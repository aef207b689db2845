//! Sequence number and timestamp rewriting for one forwarded flow

use rand::RngExt;

use crate::stats::MAX_DROPOUT;

/// Maps the extended sequence numbers and timestamps of whatever incoming
/// source is currently selected onto one continuous outgoing timeline.
///
/// Switching source (encoding change, re-attach, unmute) calls [`rebase`],
/// after which the next forwarded packet continues right after the last one
/// sent. Packets filtered out by layer selection call [`skip`] so the
/// receiver does not see them as lost. An input step larger than
/// `MAX_DROPOUT` means the source restarted its numbering and is handled
/// like a rebase.
///
/// [`rebase`]: SequenceRewriter::rebase
/// [`skip`]: SequenceRewriter::skip
#[derive(Debug, Default)]
pub(crate) struct SequenceRewriter {
    started: bool,
    rebase_pending: bool,
    seq_offset: u32,
    ts_offset: u32,
    last_in_ext: u32,
    last_out_ext: u32,
    last_out_ts: u32,
    last_out_ms: u64,
}

impl SequenceRewriter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Start a new input timeline at the next packet.
    pub(crate) fn rebase(&mut self) {
        self.rebase_pending = true;
    }

    fn is_restart(&self, in_ext: u32) -> bool {
        in_ext - self.last_in_ext > u32::from(MAX_DROPOUT)
    }

    /// Returns the outgoing (sequence, timestamp), or `None` for packets older
    /// than the last one forwarded on the current input timeline.
    pub(crate) fn rewrite(
        &mut self,
        in_ext: u32,
        timestamp: u32,
        now_ms: u64,
        clock_rate: u32,
    ) -> Option<(u16, u32)> {
        if self.started && !self.rebase_pending {
            if in_ext <= self.last_in_ext {
                return None;
            }
            if self.is_restart(in_ext) {
                self.rebase_pending = true;
            }
        }

        if !self.started || self.rebase_pending {
            let (out_ext, out_ts) = if self.started {
                let elapsed = now_ms.saturating_sub(self.last_out_ms);
                let advance = (elapsed.saturating_mul(u64::from(clock_rate)) / 1000).max(1);
                (
                    self.last_out_ext.wrapping_add(1),
                    self.last_out_ts
                        .wrapping_add(u32::try_from(advance).unwrap_or(u32::MAX)),
                )
            } else {
                let mut rng = rand::rng();
                (u32::from(rng.random::<u16>()), rng.random::<u32>())
            };
            self.seq_offset = out_ext.wrapping_sub(in_ext);
            self.ts_offset = out_ts.wrapping_sub(timestamp);
            self.started = true;
            self.rebase_pending = false;
        }

        let out_ext = in_ext.wrapping_add(self.seq_offset);
        let out_ts = timestamp.wrapping_add(self.ts_offset);
        self.last_in_ext = in_ext;
        self.last_out_ext = out_ext;
        self.last_out_ts = out_ts;
        self.last_out_ms = now_ms;

        // Truncation to the 16-bit wire sequence number is intended.
        #[allow(clippy::cast_possible_truncation)]
        Some((out_ext as u16, out_ts))
    }

    /// Account a newer packet that is intentionally not forwarded.
    pub(crate) fn skip(&mut self, in_ext: u32) {
        if !self.started || self.rebase_pending || in_ext <= self.last_in_ext {
            return;
        }
        if self.is_restart(in_ext) {
            self.rebase_pending = true;
        } else {
            self.seq_offset = self.seq_offset.wrapping_sub(1);
            self.last_in_ext = in_ext;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_forwarding() {
        let mut rw = SequenceRewriter::new();
        let (s0, t0) = rw.rewrite(100, 1000, 0, 90_000).unwrap();
        let (s1, t1) = rw.rewrite(101, 4000, 33, 90_000).unwrap();
        assert_eq!(s1, s0.wrapping_add(1));
        assert_eq!(t1, t0.wrapping_add(3000));
    }

    #[test]
    fn test_loss_keeps_gap() {
        let mut rw = SequenceRewriter::new();
        let (s0, _) = rw.rewrite(100, 0, 0, 90_000).unwrap();
        let (s1, _) = rw.rewrite(103, 0, 0, 90_000).unwrap();
        assert_eq!(s1, s0.wrapping_add(3));
    }

    #[test]
    fn test_old_packet_dropped() {
        let mut rw = SequenceRewriter::new();
        rw.rewrite(100, 0, 0, 90_000).unwrap();
        rw.rewrite(101, 0, 0, 90_000).unwrap();
        assert!(rw.rewrite(101, 0, 0, 90_000).is_none());
        assert!(rw.rewrite(99, 0, 0, 90_000).is_none());
    }

    #[test]
    fn test_skip_closes_gap() {
        let mut rw = SequenceRewriter::new();
        let (s0, _) = rw.rewrite(10, 0, 0, 90_000).unwrap();
        rw.skip(11);
        rw.skip(12);
        let (s1, _) = rw.rewrite(13, 0, 0, 90_000).unwrap();
        assert_eq!(s1, s0.wrapping_add(1));
    }

    #[test]
    fn test_rebase_continues_after_last_sent() {
        let mut rw = SequenceRewriter::new();
        let (s0, t0) = rw.rewrite(500, 10_000, 0, 90_000).unwrap();
        rw.rebase();
        // New source with an unrelated numbering, 20 ms later
        let (s1, t1) = rw.rewrite(40_000, 777, 20, 90_000).unwrap();
        assert_eq!(s1, s0.wrapping_add(1));
        assert_eq!(t1, t0.wrapping_add(1800));
        let (s2, t2) = rw.rewrite(40_001, 777 + 3000, 53, 90_000).unwrap();
        assert_eq!(s2, s0.wrapping_add(2));
        assert_eq!(t2, t1.wrapping_add(3000));
    }

    #[test]
    fn test_rebase_without_elapsed_time_still_advances_timestamp() {
        let mut rw = SequenceRewriter::new();
        let (_, t0) = rw.rewrite(1, 0, 5, 48_000).unwrap();
        rw.rebase();
        let (_, t1) = rw.rewrite(9, 0, 5, 48_000).unwrap();
        assert_eq!(t1, t0.wrapping_add(1));
    }

    #[test]
    fn test_restarted_input_continues_output() {
        let mut rw = SequenceRewriter::new();
        let (s0, t0) = rw.rewrite(101, 5000, 0, 90_000).unwrap();
        // The source numbering moved a full stride ahead
        let (s1, t1) = rw.rewrite(101 + (1 << 16) + 1, 90, 20, 90_000).unwrap();
        assert_eq!(s1, s0.wrapping_add(1));
        assert_eq!(t1, t0.wrapping_add(1800));
        let (s2, _) = rw.rewrite(101 + (1 << 16) + 2, 3090, 53, 90_000).unwrap();
        assert_eq!(s2, s0.wrapping_add(2));
    }

    #[test]
    fn test_skipped_restart_rebases_next_packet() {
        let mut rw = SequenceRewriter::new();
        let (s0, _) = rw.rewrite(10, 0, 0, 90_000).unwrap();
        rw.skip(10 + (1 << 16));
        let (s1, _) = rw.rewrite(11 + (1 << 16), 0, 0, 90_000).unwrap();
        assert_eq!(s1, s0.wrapping_add(1));
    }

    #[test]
    fn test_skip_before_start_is_ignored() {
        let mut rw = SequenceRewriter::new();
        rw.skip(5);
        let (s0, _) = rw.rewrite(6, 0, 0, 90_000).unwrap();
        let (s1, _) = rw.rewrite(7, 0, 0, 90_000).unwrap();
        assert_eq!(s1, s0.wrapping_add(1));
    }
}
