//! Session descriptors consumed by the routing core
//!
//! These are the already-parsed shapes of an SDP media section; parsing the
//! SDP text itself happens elsewhere.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ordered ssrc list tagged with its grouping semantics ("FID", "FEC-FR", "SIM", ...)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsrcGroupDescriptor {
    pub semantics: String,
    pub ssrcs: Vec<u32>,
}

impl SsrcGroupDescriptor {
    pub fn new(semantics: impl Into<String>, ssrcs: impl Into<Vec<u32>>) -> Self {
        Self {
            semantics: semantics.into(),
            ssrcs: ssrcs.into(),
        }
    }
}

/// A named encoding (simulcast rid) with its parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodingDescriptor {
    pub rid: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl EncodingDescriptor {
    pub fn new(rid: impl Into<String>) -> Self {
        Self {
            rid: rid.into(),
            params: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackDescriptor {
    pub id: String,
    /// "audio" or "video", compared case-insensitively
    pub kind: String,
    #[serde(default)]
    pub mid: Option<String>,
    #[serde(default)]
    pub ssrcs: Vec<u32>,
    #[serde(default)]
    pub encodings: Vec<EncodingDescriptor>,
    #[serde(default)]
    pub ssrc_groups: Vec<SsrcGroupDescriptor>,
}

impl TrackDescriptor {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_mid(mut self, mid: impl Into<String>) -> Self {
        self.mid = Some(mid.into());
        self
    }

    #[must_use]
    pub fn with_ssrc(mut self, ssrc: u32) -> Self {
        self.ssrcs.push(ssrc);
        self
    }

    #[must_use]
    pub fn with_encoding(mut self, encoding: EncodingDescriptor) -> Self {
        self.encodings.push(encoding);
        self
    }

    #[must_use]
    pub fn with_ssrc_group(mut self, semantics: &str, ssrcs: &[u32]) -> Self {
        self.ssrc_groups
            .push(SsrcGroupDescriptor::new(semantics, ssrcs.to_vec()));
        self
    }

    /// First grouping with the given semantics
    #[must_use]
    pub fn ssrc_group(&self, semantics: &str) -> Option<&SsrcGroupDescriptor> {
        self.ssrc_groups.iter().find(|g| g.semantics == semantics)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub id: String,
    #[serde(default)]
    pub tracks: Vec<TrackDescriptor>,
}

impl StreamDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_track(mut self, track: TrackDescriptor) -> Self {
        self.tracks.push(track);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        let track = TrackDescriptor::new("v0", "video")
            .with_mid("1")
            .with_ssrc(1111)
            .with_ssrc(2222)
            .with_ssrc_group("FID", &[1111, 2222])
            .with_encoding(EncodingDescriptor::new("h").with_param("ssrc", "1111"));

        assert_eq!(track.mid.as_deref(), Some("1"));
        assert_eq!(track.ssrcs, vec![1111, 2222]);
        assert_eq!(track.ssrc_group("FID").unwrap().ssrcs, vec![1111, 2222]);
        assert!(track.ssrc_group("SIM").is_none());
        assert_eq!(track.encodings[0].params.get("ssrc").unwrap(), "1111");
    }

    #[test]
    fn test_deserialize_minimal_json() {
        let json = r#"{"id":"s1","tracks":[{"id":"a0","kind":"audio","ssrcs":[42]}]}"#;
        let stream: StreamDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(stream.tracks.len(), 1);
        assert!(stream.tracks[0].encodings.is_empty());
        assert_eq!(stream.tracks[0].ssrcs, vec![42]);
    }
}
