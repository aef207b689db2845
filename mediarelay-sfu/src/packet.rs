//! Opaque RTP packet records handed over by the RTP engine

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed RTP header length, without CSRCs or extensions
pub const RTP_HEADER_LEN: usize = 12;

/// Scalable/simulcast layer a packet belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerId {
    pub spatial: u8,
    pub temporal: u8,
}

impl LayerId {
    /// Target that lets every layer through
    pub const MAX: Self = Self {
        spatial: u8::MAX,
        temporal: u8::MAX,
    };

    #[must_use]
    pub const fn new(spatial: u8, temporal: u8) -> Self {
        Self { spatial, temporal }
    }

    /// True when both ids are at or below `target`.
    #[must_use]
    pub const fn fits(&self, target: Self) -> bool {
        self.spatial <= target.spatial && self.temporal <= target.temporal
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}T{}", self.spatial, self.temporal)
    }
}

/// RTP packet with the metadata the routing core is allowed to look at.
///
/// The payload is carried through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub ssrc: u32,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub payload_type: u8,
    pub marker: bool,
    /// Layer ids parsed from the descriptor extension, if the codec is layered
    pub layer: Option<LayerId>,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn new(ssrc: u32, sequence_number: u16, timestamp: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            ssrc,
            sequence_number,
            timestamp,
            payload_type: 0,
            marker: false,
            layer: None,
            payload: payload.into(),
        }
    }

    #[must_use]
    pub fn with_layer(mut self, spatial: u8, temporal: u8) -> Self {
        self.layer = Some(LayerId::new(spatial, temporal));
        self
    }

    #[must_use]
    pub fn with_payload_type(mut self, payload_type: u8) -> Self {
        self.payload_type = payload_type;
        self
    }

    /// Size on the wire, used for byte and bitrate accounting
    #[must_use]
    pub fn size(&self) -> usize {
        RTP_HEADER_LEN + self.payload.len()
    }
}
