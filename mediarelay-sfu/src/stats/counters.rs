//! Per-source packet counters: extended sequence, loss, jitter and layers

use std::collections::BTreeMap;

use super::bitrate::BitrateAccumulator;
use super::{LayerStatsSnapshot, SourceStatsSnapshot};
use crate::packet::LayerId;

/// Largest forward step accepted as in order (RFC 3550 A.1)
pub(crate) const MAX_DROPOUT: u16 = 3000;
/// Largest backward step accepted as a late packet
const MAX_MISORDER: u16 = 100;
/// Extended-sequence distance between the old and new run after a restart
const RESTART_STRIDE: u32 = 1 << 16;

#[derive(Debug, Clone)]
struct LayerCounters {
    packets: u64,
    bytes: u64,
    bitrate: BitrateAccumulator,
}

/// Mutable counters behind a [`crate::source::Source`] lock.
#[derive(Debug, Clone)]
pub(crate) struct SourceCounters {
    started: bool,
    cycles: u32,
    last_seq: u16,
    /// Raw sequence that confirms a large jump when it arrives next
    bad_seq: Option<u16>,
    restarts: u32,
    base_ext_seq: u32,
    highest_ext_seq: u32,

    packets: u64,
    bytes: u64,

    // Receiver-report interval bookkeeping (RFC 3550 A.3)
    expected_prior: u64,
    received_prior: u64,
    total_lost: i64,
    fraction_lost: u8,

    jitter: f64,
    last_transit: Option<u32>,

    last_packet_ms: Option<u64>,
    bitrate: BitrateAccumulator,

    window_ms: u64,
    max_samples: usize,
    /// Only tracked for video sources
    layers: Option<BTreeMap<LayerId, LayerCounters>>,
}

impl SourceCounters {
    pub(crate) fn new(track_layers: bool, window_ms: u64, max_samples: usize) -> Self {
        Self {
            started: false,
            cycles: 0,
            last_seq: 0,
            bad_seq: None,
            restarts: 0,
            base_ext_seq: 0,
            highest_ext_seq: 0,
            packets: 0,
            bytes: 0,
            expected_prior: 0,
            received_prior: 0,
            total_lost: 0,
            fraction_lost: 0,
            jitter: 0.0,
            last_transit: None,
            last_packet_ms: None,
            bitrate: BitrateAccumulator::new(window_ms, max_samples),
            window_ms,
            max_samples,
            layers: track_layers.then(BTreeMap::new),
        }
    }

    /// Account one packet and return its extended sequence number.
    pub(crate) fn update(&mut self, now_ms: u64, seq: u16, size: usize) -> u32 {
        let ext = self.extend(seq);

        self.packets += 1;
        self.bytes += size as u64;
        self.bitrate.record(now_ms, size);
        self.last_packet_ms = Some(now_ms);

        ext
    }

    /// Place `seq` on the extended timeline.
    ///
    /// The result never exceeds the highest extended sequence seen, except
    /// for packets that advance it. A jump of more than [`MAX_DROPOUT`]
    /// forward (or [`MAX_MISORDER`] back) is held at the current highest until
    /// the next packet confirms it; the sequence then restarts one
    /// [`RESTART_STRIDE`] further on.
    fn extend(&mut self, seq: u16) -> u32 {
        if !self.started {
            self.started = true;
            self.last_seq = seq;
            self.base_ext_seq = u32::from(seq);
            self.highest_ext_seq = self.base_ext_seq;
            return self.highest_ext_seq;
        }

        let delta = seq.wrapping_sub(self.last_seq);
        if delta != 0 && delta < MAX_DROPOUT {
            // In order. A smaller raw value means we crossed 65535 -> 0.
            if seq < self.last_seq {
                self.cycles = self.cycles.wrapping_add(1);
            }
            self.last_seq = seq;
            self.bad_seq = None;
            self.highest_ext_seq = self.highest_ext_seq.wrapping_add(u32::from(delta));
            return self.highest_ext_seq;
        }

        if delta != 0 && delta <= u16::MAX - MAX_MISORDER + 1 {
            if self.bad_seq != Some(seq) {
                self.bad_seq = Some(seq.wrapping_add(1));
                return self.highest_ext_seq;
            }
            // Two in a row after the jump: the sender restarted its numbering.
            // Both packets open the new run, so expected grows by two.
            self.restarts = self.restarts.wrapping_add(1);
            self.last_seq = seq;
            self.bad_seq = None;
            self.highest_ext_seq = self.highest_ext_seq.wrapping_add(RESTART_STRIDE);
            self.base_ext_seq = self.base_ext_seq.wrapping_add(RESTART_STRIDE - 2);
            return self.highest_ext_seq;
        }

        // Duplicate or late packet
        let back = u32::from(self.last_seq.wrapping_sub(seq));
        match self.highest_ext_seq.checked_sub(back) {
            Some(ext) => {
                if ext < self.base_ext_seq {
                    self.base_ext_seq = ext;
                }
                ext
            }
            // Sent before the first packet of the run
            None => 0,
        }
    }

    /// RFC 3550 interarrival jitter, in RTP timestamp units.
    pub(crate) fn update_jitter(&mut self, now_ms: u64, rtp_timestamp: u32, clock_rate: u32) {
        let arrival = (now_ms.wrapping_mul(u64::from(clock_rate)) / 1000) as u32;
        let transit = arrival.wrapping_sub(rtp_timestamp);
        if let Some(last) = self.last_transit {
            let d = f64::from((transit.wrapping_sub(last) as i32).unsigned_abs());
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.last_transit = Some(transit);
    }

    pub(crate) fn update_layer(&mut self, layer: LayerId, now_ms: u64, size: usize) {
        let (window_ms, max_samples) = (self.window_ms, self.max_samples);
        if let Some(layers) = self.layers.as_mut() {
            let counters = layers.entry(layer).or_insert_with(|| LayerCounters {
                packets: 0,
                bytes: 0,
                bitrate: BitrateAccumulator::new(window_ms, max_samples),
            });
            counters.packets += 1;
            counters.bytes += size as u64;
            counters.bitrate.record(now_ms, size);
        }
    }

    fn expected(&self) -> u64 {
        if self.started {
            u64::from(self.highest_ext_seq.wrapping_sub(self.base_ext_seq)) + 1
        } else {
            0
        }
    }

    /// Expected minus received since the last report boundary.
    ///
    /// Negative when duplicates outnumber losses.
    fn lost_since_report(&self) -> i64 {
        let expected = self.expected().saturating_sub(self.expected_prior);
        let received = self.packets.saturating_sub(self.received_prior);
        expected as i64 - received as i64
    }

    /// Close the current receiver-report interval.
    pub(crate) fn close_report_interval(&mut self) {
        let expected_interval = self.expected().saturating_sub(self.expected_prior);
        let lost_interval = self.lost_since_report();

        self.total_lost += lost_interval;
        self.fraction_lost = if expected_interval == 0 || lost_interval <= 0 {
            0
        } else {
            ((lost_interval as u64 * 256) / expected_interval).min(255) as u8
        };

        self.expected_prior = self.expected();
        self.received_prior = self.packets;
    }

    pub(crate) fn snapshot(&self, ssrc: u32, now_ms: u64) -> SourceStatsSnapshot {
        let layers = self
            .layers
            .as_ref()
            .map(|layers| {
                layers
                    .iter()
                    .map(|(id, c)| LayerStatsSnapshot {
                        spatial: id.spatial,
                        temporal: id.temporal,
                        packets: c.packets,
                        bytes: c.bytes,
                        bitrate_bps: c.bitrate.bitrate_bps(now_ms),
                    })
                    .collect()
            })
            .unwrap_or_default();

        SourceStatsSnapshot {
            ssrc,
            packets: self.packets,
            bytes: self.bytes,
            cycles: self.cycles,
            restarts: self.restarts,
            extended_seq: self.highest_ext_seq,
            expected: self.expected(),
            lost_since_report: self.lost_since_report(),
            total_lost: self.total_lost,
            fraction_lost: self.fraction_lost,
            jitter: self.jitter,
            bitrate_bps: self.bitrate.bitrate_bps(now_ms),
            last_packet_ms: self.last_packet_ms,
            layers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters() -> SourceCounters {
        SourceCounters::new(true, 1000, 1000)
    }

    #[test]
    fn test_wrap_increments_cycle_once() {
        let mut c = counters();
        let exts: Vec<u32> = [65534u16, 65535, 0, 1]
            .iter()
            .enumerate()
            .map(|(i, seq)| c.update(i as u64, *seq, 100))
            .collect();

        assert_eq!(exts, vec![65534, 65535, 65536, 65537]);
        assert!(exts.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(c.snapshot(1, 4).cycles, 1);
    }

    #[test]
    fn test_late_packet_from_previous_cycle() {
        let mut c = counters();
        c.update(0, 65534, 10);
        c.update(1, 0, 10);
        // 65535 arrives after the wrap; it belongs to cycle 0
        let ext = c.update(2, 65535, 10);
        assert_eq!(ext, 65535);
        let snap = c.snapshot(1, 2);
        assert_eq!(snap.cycles, 1);
        assert_eq!(snap.extended_seq, 65536);
    }

    #[test]
    fn test_packet_from_before_first_stays_behind() {
        let mut c = counters();
        assert_eq!(c.update(0, 0, 10), 0);
        // 65535 was sent just before 0
        assert_eq!(c.update(1, 65535, 10), 0);
        for seq in 1..=200u16 {
            assert_eq!(c.update(2, seq, 10), u32::from(seq));
        }
        let snap = c.snapshot(1, 2);
        assert_eq!(snap.extended_seq, 200);
        assert_eq!(snap.cycles, 0);
        assert_eq!(snap.expected, 201);
        assert_eq!(snap.lost_since_report, -1);
    }

    #[test]
    fn test_late_packet_never_passes_highest() {
        let mut c = counters();
        for seq in [65500u16, 65530, 5] {
            c.update(0, seq, 10);
        }
        let highest = c.snapshot(1, 0).extended_seq;
        for seq in [65531u16, 65535, 0, 4, 5] {
            assert!(c.update(0, seq, 10) <= highest);
        }
        assert_eq!(c.snapshot(1, 0).extended_seq, highest);
    }

    #[test]
    fn test_single_large_jump_is_ignored() {
        let mut c = counters();
        c.update(0, 100, 10);
        c.update(0, 101, 10);
        // A stray packet far ahead is held at the current highest
        assert_eq!(c.update(0, 40_101, 10), 101);
        assert_eq!(c.update(0, 102, 10), 102);
        assert_eq!(c.update(0, 103, 10), 103);
        let snap = c.snapshot(1, 0);
        assert_eq!(snap.restarts, 0);
        assert_eq!(snap.extended_seq, 103);
    }

    #[test]
    fn test_confirmed_jump_restarts_sequence() {
        let mut c = counters();
        c.update(0, 100, 10);
        c.update(0, 101, 10);
        assert_eq!(c.update(0, 40_101, 10), 101);
        let restarted = c.update(0, 40_102, 10);
        assert!(restarted - 101 > u32::from(MAX_DROPOUT));

        let mut last = restarted;
        for seq in 40_103..40_103 + 30_000u32 {
            let ext = c.update(0, seq as u16, 10);
            assert_eq!(ext, last + 1);
            last = ext;
        }

        let snap = c.snapshot(1, 0);
        assert_eq!(snap.restarts, 1);
        assert_eq!(snap.cycles, 1);
        assert_eq!(snap.extended_seq, last);
        assert_eq!(snap.expected, snap.packets);
        assert_eq!(snap.lost_since_report, 0);
    }

    #[test]
    fn test_loss_since_report_and_interval_close() {
        let mut c = counters();
        for seq in [10u16, 11, 13, 14] {
            c.update(0, seq, 10);
        }
        let snap = c.snapshot(1, 0);
        assert_eq!(snap.expected, 5);
        assert_eq!(snap.lost_since_report, 1);
        assert_eq!(snap.total_lost, 0);

        c.close_report_interval();
        let snap = c.snapshot(1, 0);
        assert_eq!(snap.lost_since_report, 0);
        assert_eq!(snap.total_lost, 1);
        // 1 of 5 lost -> 51/256
        assert_eq!(snap.fraction_lost, 51);

        c.update(0, 15, 10);
        c.close_report_interval();
        let snap = c.snapshot(1, 0);
        assert_eq!(snap.total_lost, 1);
        assert_eq!(snap.fraction_lost, 0);
    }

    #[test]
    fn test_duplicates_make_loss_negative() {
        let mut c = counters();
        c.update(0, 1, 10);
        c.update(0, 1, 10);
        assert_eq!(c.snapshot(1, 0).lost_since_report, -1);
    }

    #[test]
    fn test_jitter_constant_transit_is_zero() {
        let mut c = counters();
        // 20ms apart in both wall time and media time at 48kHz
        c.update_jitter(0, 0, 48_000);
        c.update_jitter(20, 960, 48_000);
        c.update_jitter(40, 1920, 48_000);
        assert!(c.snapshot(1, 40).jitter.abs() < f64::EPSILON);

        // 10ms late
        c.update_jitter(70, 2880, 48_000);
        assert!((c.snapshot(1, 70).jitter - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_layers_tracked_only_for_video() {
        let mut video = counters();
        video.update_layer(LayerId::new(0, 0), 0, 100);
        video.update_layer(LayerId::new(1, 0), 0, 300);
        video.update_layer(LayerId::new(1, 0), 0, 300);
        let layers = video.snapshot(1, 0).layers;
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[1].packets, 2);
        assert_eq!(layers[1].bytes, 600);

        let mut audio = SourceCounters::new(false, 1000, 1000);
        audio.update_layer(LayerId::new(0, 0), 0, 100);
        assert!(audio.snapshot(1, 0).layers.is_empty());
    }
}
