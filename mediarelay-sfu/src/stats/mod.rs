//! Statistics snapshots
//!
//! Counters are updated on the packet path under each source's own lock and
//! copied out into the plain, serializable snapshot types below.

mod bitrate;
mod counters;

pub(crate) use counters::{SourceCounters, MAX_DROPOUT};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{MediaKind, TrackId};

/// Per (spatial, temporal) layer counters of a video source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerStatsSnapshot {
    pub spatial: u8,
    pub temporal: u8,
    pub packets: u64,
    pub bytes: u64,
    pub bitrate_bps: u64,
}

/// Counters of a single ssrc
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceStatsSnapshot {
    pub ssrc: u32,
    pub packets: u64,
    pub bytes: u64,
    /// Number of times the 16-bit sequence number wrapped
    pub cycles: u32,
    /// Confirmed sequence discontinuities that restarted the count
    pub restarts: u32,
    /// Highest extended sequence number seen
    pub extended_seq: u32,
    /// Packets implied by the extended sequence range
    pub expected: u64,
    pub lost_since_report: i64,
    /// Loss accumulated over closed report intervals
    pub total_lost: i64,
    /// Loss fraction of the last closed interval, in 1/256 units
    pub fraction_lost: u8,
    /// Interarrival jitter in RTP timestamp units
    pub jitter: f64,
    pub bitrate_bps: u64,
    pub last_packet_ms: Option<u64>,
    pub layers: Vec<LayerStatsSnapshot>,
}

/// What the remote receiver last reported about one of our outgoing ssrcs
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteReport {
    pub fraction_lost: u8,
    pub total_lost: u32,
    pub jitter: u32,
    pub received_at_ms: u64,
}

/// Counters of one media/rtx/fec triple
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceGroupStats {
    pub rid: Option<String>,
    pub mid: Option<String>,
    pub media: SourceStatsSnapshot,
    pub rtx: SourceStatsSnapshot,
    pub fec: SourceStatsSnapshot,
    /// Round trip estimate, incoming groups only
    pub rtt_ms: Option<u32>,
    /// Last receiver report, outgoing groups only
    pub remote: Option<RemoteReport>,
}

impl SourceGroupStats {
    /// Packets across all three roles
    #[must_use]
    pub const fn total_packets(&self) -> u64 {
        self.media.packets + self.rtx.packets + self.fec.packets
    }
}

/// Statistics of a track, keyed by encoding ("" for single-flow tracks)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackStats {
    pub track_id: TrackId,
    pub kind: MediaKind,
    pub encodings: BTreeMap<String, SourceGroupStats>,
}

impl TrackStats {
    #[must_use]
    pub fn total_packets(&self) -> u64 {
        self.encodings.values().map(SourceGroupStats::total_packets).sum()
    }

    #[must_use]
    pub fn total_bitrate_bps(&self) -> u64 {
        self.encodings.values().map(|e| e.media.bitrate_bps).sum()
    }

    /// Serialize for export to an application layer
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
