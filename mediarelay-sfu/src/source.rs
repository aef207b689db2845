//! A single RTP flow, identified by its ssrc

use parking_lot::Mutex;

use crate::config::StatsConfig;
use crate::packet::RtpPacket;
use crate::stats::{SourceCounters, SourceStatsSnapshot};

/// One ssrc and its counters.
///
/// An ssrc of 0 marks an absent rtx/fec role. Such a source is never
/// registered for dispatch, so its counters stay at zero.
#[derive(Debug)]
pub struct Source {
    ssrc: u32,
    clock_rate: u32,
    counters: Mutex<SourceCounters>,
}

impl Source {
    pub(crate) fn new(ssrc: u32, clock_rate: u32, track_layers: bool, stats: &StatsConfig) -> Self {
        Self {
            ssrc,
            clock_rate,
            counters: Mutex::new(SourceCounters::new(
                track_layers,
                stats.bitrate_window_ms,
                stats.max_bitrate_samples,
            )),
        }
    }

    #[must_use]
    pub const fn ssrc(&self) -> u32 {
        self.ssrc
    }

    #[must_use]
    pub const fn is_present(&self) -> bool {
        self.ssrc != 0
    }

    /// Account one observed packet by arrival time, raw sequence and size.
    ///
    /// Returns the extended sequence number of the packet.
    pub fn update(&self, now_ms: u64, seq: u16, size: usize) -> u32 {
        self.counters.lock().update(now_ms, seq, size)
    }

    /// Full per-packet accounting: counters, jitter and the packet's layer.
    pub(crate) fn record(&self, now_ms: u64, packet: &RtpPacket) -> u32 {
        let mut counters = self.counters.lock();
        let ext = counters.update(now_ms, packet.sequence_number, packet.size());
        counters.update_jitter(now_ms, packet.timestamp, self.clock_rate);
        if let Some(layer) = packet.layer {
            counters.update_layer(layer, now_ms, packet.size());
        }
        ext
    }

    pub fn close_report_interval(&self) {
        self.counters.lock().close_report_interval();
    }

    #[must_use]
    pub fn get_stats(&self, now_ms: u64) -> SourceStatsSnapshot {
        self.counters.lock().snapshot(self.ssrc, now_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_counts_packets_and_bytes() {
        let source = Source::new(1111, 90_000, true, &StatsConfig::default());
        source.update(0, 100, 500);
        source.update(10, 101, 700);

        let stats = source.get_stats(10);
        assert_eq!(stats.ssrc, 1111);
        assert_eq!(stats.packets, 2);
        assert_eq!(stats.bytes, 1200);
        assert_eq!(stats.extended_seq, 101);
        assert_eq!(stats.bitrate_bps, 1200 * 8);
    }

    #[test]
    fn test_record_tracks_layers() {
        let source = Source::new(1111, 90_000, true, &StatsConfig::default());
        source.record(0, &RtpPacket::new(1111, 1, 0, vec![0u8; 88]).with_layer(0, 1));
        source.record(0, &RtpPacket::new(1111, 2, 0, vec![0u8; 88]).with_layer(1, 1));

        let stats = source.get_stats(0);
        assert_eq!(stats.layers.len(), 2);
        assert!(stats.layers.iter().all(|l| l.packets == 1 && l.bytes == 100));
    }

    #[test]
    fn test_absent_source() {
        let source = Source::new(0, 90_000, false, &StatsConfig::default());
        assert!(!source.is_present());
        assert_eq!(source.get_stats(0).packets, 0);
    }
}
