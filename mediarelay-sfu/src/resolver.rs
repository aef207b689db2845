//! Source group resolution
//!
//! A track descriptor comes in one of three shapes:
//!
//! 1. explicit rid encodings, each naming its media ssrc in an `ssrc` parameter
//! 2. legacy (Chrome style) simulcast, a `SIM` ssrc-group listing the layers
//! 3. a single flow, whose media ssrc is the first ssrc of the track
//!
//! Each shape is reduced to the same list of [`ResolvedGroup`]s. Entries that
//! cannot be resolved are skipped with a warning; the rest still resolve.

use tracing::{debug, warn};

use crate::descriptor::{EncodingDescriptor, TrackDescriptor};

pub const SEMANTICS_FID: &str = "FID";
pub const SEMANTICS_FEC_FR: &str = "FEC-FR";
pub const SEMANTICS_SIM: &str = "SIM";

/// One media/rtx/fec triple, before anything is registered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedGroup {
    /// Encoding key: the rid, the SIM position, or "" for a single flow
    pub key: String,
    pub rid: Option<String>,
    pub mid: Option<String>,
    pub media_ssrc: u32,
    /// 0 when there is no retransmission companion
    pub rtx_ssrc: u32,
    /// 0 when there is no FEC companion
    pub fec_ssrc: u32,
}

/// Resolve every source group an incoming track carries.
#[must_use]
pub fn resolve_incoming(track: &TrackDescriptor) -> Vec<ResolvedGroup> {
    if !track.encodings.is_empty() {
        resolve_encodings(track)
    } else if let Some(sim) = track.ssrc_group(SEMANTICS_SIM) {
        debug!(track_id = %track.id, layers = sim.ssrcs.len(), "Resolving legacy simulcast group");
        // Keys stay positional, so a skipped member leaves a hole
        sim.ssrcs
            .iter()
            .enumerate()
            .filter_map(|(index, &ssrc)| {
                if ssrc == 0 {
                    warn!(track_id = %track.id, position = index, "SIM member ssrc is 0, skipping");
                    return None;
                }
                let (rtx_ssrc, fec_ssrc) = companions_of(track, ssrc);
                Some(ResolvedGroup {
                    key: index.to_string(),
                    rid: None,
                    mid: track.mid.clone(),
                    media_ssrc: ssrc,
                    rtx_ssrc,
                    fec_ssrc,
                })
            })
            .collect()
    } else {
        resolve_single_flow(track).into_iter().collect()
    }
}

/// Resolve the one source group of a single-flow track.
///
/// Returns `None` when the track lists no ssrc at all.
#[must_use]
pub fn resolve_single_flow(track: &TrackDescriptor) -> Option<ResolvedGroup> {
    let Some(&media_ssrc) = track.ssrcs.first() else {
        warn!(track_id = %track.id, "Track has no ssrc, cannot resolve a source group");
        return None;
    };
    if media_ssrc == 0 {
        warn!(track_id = %track.id, "Track media ssrc is 0, cannot resolve a source group");
        return None;
    }

    Some(ResolvedGroup {
        key: String::new(),
        rid: None,
        mid: track.mid.clone(),
        media_ssrc,
        rtx_ssrc: second_member(track, SEMANTICS_FID),
        fec_ssrc: second_member(track, SEMANTICS_FEC_FR),
    })
}

fn resolve_encodings(track: &TrackDescriptor) -> Vec<ResolvedGroup> {
    let mut resolved: Vec<ResolvedGroup> = Vec::with_capacity(track.encodings.len());

    for encoding in &track.encodings {
        if resolved.iter().any(|g| g.key == encoding.rid) {
            warn!(track_id = %track.id, rid = %encoding.rid, "Duplicate rid, keeping the first encoding");
            continue;
        }

        // Encodings without an ssrc would need rid-based demuxing, which the
        // dispatch table does not do.
        let Some(raw) = encoding.params.get("ssrc") else {
            warn!(track_id = %track.id, rid = %encoding.rid, "Encoding has no ssrc parameter, skipping");
            continue;
        };

        let media_ssrc = match raw.trim().parse::<u32>() {
            Ok(0) => {
                warn!(track_id = %track.id, rid = %encoding.rid, "Encoding ssrc is 0, skipping");
                continue;
            }
            Ok(ssrc) => ssrc,
            Err(e) => {
                warn!(
                    track_id = %track.id,
                    rid = %encoding.rid,
                    ssrc = %raw,
                    error = %e,
                    "Unparseable encoding ssrc, skipping"
                );
                continue;
            }
        };

        let (rtx_ssrc, fec_ssrc) = companions_of(track, media_ssrc);
        resolved.push(ResolvedGroup {
            key: encoding.rid.clone(),
            rid: Some(encoding.rid.clone()),
            mid: track.mid.clone(),
            media_ssrc,
            rtx_ssrc,
            fec_ssrc,
        });
    }

    resolved
}

/// Rebuild a track descriptor that resolves back to `groups`.
#[must_use]
pub fn describe(id: &str, kind: &str, groups: &[ResolvedGroup]) -> TrackDescriptor {
    let mut track = TrackDescriptor::new(id, kind);
    track.mid = groups.iter().find_map(|g| g.mid.clone());

    for group in groups {
        track.ssrcs.extend(
            [group.media_ssrc, group.rtx_ssrc, group.fec_ssrc]
                .into_iter()
                .filter(|&ssrc| ssrc != 0),
        );
        if let Some(rid) = &group.rid {
            track.encodings.push(
                EncodingDescriptor::new(rid.clone()).with_param("ssrc", group.media_ssrc.to_string()),
            );
        }
    }

    if track.encodings.is_empty() && groups.len() > 1 {
        let layers: Vec<u32> = groups.iter().map(|g| g.media_ssrc).collect();
        track = track.with_ssrc_group(SEMANTICS_SIM, &layers);
    }
    for group in groups {
        if group.rtx_ssrc != 0 {
            track = track.with_ssrc_group(SEMANTICS_FID, &[group.media_ssrc, group.rtx_ssrc]);
        }
        if group.fec_ssrc != 0 {
            track = track.with_ssrc_group(SEMANTICS_FEC_FR, &[group.media_ssrc, group.fec_ssrc]);
        }
    }

    track
}

/// Scan the FID and FEC-FR groupings led by `media_ssrc`.
fn companions_of(track: &TrackDescriptor, media_ssrc: u32) -> (u32, u32) {
    let mut rtx = 0;
    let mut fec = 0;

    for group in &track.ssrc_groups {
        let [first, second, ..] = group.ssrcs.as_slice() else {
            continue;
        };
        if *first != media_ssrc {
            continue;
        }
        match group.semantics.as_str() {
            SEMANTICS_FID => rtx = *second,
            SEMANTICS_FEC_FR => fec = *second,
            _ => {}
        }
    }

    (rtx, fec)
}

/// Second member of the first grouping with these semantics, or 0.
fn second_member(track: &TrackDescriptor, semantics: &str) -> u32 {
    match track.ssrc_group(semantics) {
        Some(group) => group.ssrcs.get(1).copied().unwrap_or_else(|| {
            warn!(track_id = %track.id, semantics, "Grouping has fewer than two members");
            0
        }),
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoding(rid: &str, ssrc: &str) -> EncodingDescriptor {
        EncodingDescriptor::new(rid).with_param("ssrc", ssrc)
    }

    #[test]
    fn test_explicit_encoding_with_fid() {
        let track = TrackDescriptor::new("v0", "video")
            .with_encoding(encoding("h", "1111"))
            .with_ssrc_group("FID", &[1111, 2222]);

        let groups = resolve_incoming(&track);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].key, "h");
        assert_eq!(groups[0].rid.as_deref(), Some("h"));
        assert_eq!(groups[0].media_ssrc, 1111);
        assert_eq!(groups[0].rtx_ssrc, 2222);
        assert_eq!(groups[0].fec_ssrc, 0);
    }

    #[test]
    fn test_explicit_encodings_bind_companions_per_encoding() {
        let track = TrackDescriptor::new("v0", "video")
            .with_mid("0")
            .with_encoding(encoding("h", "1"))
            .with_encoding(encoding("m", "3"))
            .with_encoding(encoding("l", "5"))
            .with_ssrc_group("FID", &[1, 2])
            .with_ssrc_group("FID", &[3, 4])
            .with_ssrc_group("FEC-FR", &[5, 6]);

        let groups = resolve_incoming(&track);
        let keys: Vec<_> = groups.iter().map(|g| g.key.as_str()).collect();
        assert_eq!(keys, vec!["h", "m", "l"]);
        assert_eq!((groups[0].rtx_ssrc, groups[0].fec_ssrc), (2, 0));
        assert_eq!((groups[1].rtx_ssrc, groups[1].fec_ssrc), (4, 0));
        assert_eq!((groups[2].rtx_ssrc, groups[2].fec_ssrc), (0, 6));
        assert!(groups.iter().all(|g| g.mid.as_deref() == Some("0")));
    }

    #[test]
    fn test_unparseable_ssrc_skips_only_that_encoding() {
        let track = TrackDescriptor::new("v0", "video")
            .with_encoding(encoding("h", "not-a-number"))
            .with_encoding(encoding("m", "4294967296"))
            .with_encoding(encoding("l", "7"));

        let groups = resolve_incoming(&track);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].key, "l");
        assert_eq!(groups[0].media_ssrc, 7);
    }

    #[test]
    fn test_encoding_without_ssrc_is_skipped() {
        let track = TrackDescriptor::new("v0", "video")
            .with_encoding(EncodingDescriptor::new("h"))
            .with_encoding(encoding("l", "9"))
            .with_ssrc_group("FID", &[8, 10]);

        let groups = resolve_incoming(&track);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].key, "l");
    }

    #[test]
    fn test_duplicate_rid_keeps_first() {
        let track = TrackDescriptor::new("v0", "video")
            .with_encoding(encoding("h", "1"))
            .with_encoding(encoding("h", "2"));

        let groups = resolve_incoming(&track);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].media_ssrc, 1);
    }

    #[test]
    fn test_legacy_sim_group() {
        let track = TrackDescriptor::new("v0", "video")
            .with_ssrc(10)
            .with_ssrc(11)
            .with_ssrc(20)
            .with_ssrc(21)
            .with_ssrc(30)
            .with_ssrc_group("SIM", &[10, 20, 30])
            .with_ssrc_group("FID", &[10, 11])
            .with_ssrc_group("FID", &[20, 21]);

        let groups = resolve_incoming(&track);
        let keys: Vec<_> = groups.iter().map(|g| g.key.as_str()).collect();
        assert_eq!(keys, vec!["0", "1", "2"]);
        assert_eq!(
            groups.iter().map(|g| (g.media_ssrc, g.rtx_ssrc)).collect::<Vec<_>>(),
            vec![(10, 11), (20, 21), (30, 0)]
        );
        assert!(groups.iter().all(|g| g.rid.is_none()));
    }

    #[test]
    fn test_sim_member_zero_is_skipped() {
        let track = TrackDescriptor::new("v0", "video")
            .with_ssrc(10)
            .with_ssrc(30)
            .with_ssrc_group("SIM", &[10, 0, 30]);

        let groups = resolve_incoming(&track);
        let resolved: Vec<_> = groups.iter().map(|g| (g.key.as_str(), g.media_ssrc)).collect();
        assert_eq!(resolved, vec![("0", 10), ("2", 30)]);
    }

    #[test]
    fn test_single_flow_with_zero_ssrc_resolves_nothing() {
        let track = TrackDescriptor::new("a0", "audio").with_ssrc(0);
        assert!(resolve_incoming(&track).is_empty());
    }

    #[test]
    fn test_explicit_encodings_win_over_sim() {
        let track = TrackDescriptor::new("v0", "video")
            .with_encoding(encoding("h", "10"))
            .with_ssrc_group("SIM", &[10, 20]);

        let groups = resolve_incoming(&track);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].key, "h");
    }

    #[test]
    fn test_single_flow_fallback() {
        let track = TrackDescriptor::new("a0", "audio")
            .with_ssrc(100)
            .with_ssrc(101)
            .with_ssrc(102)
            .with_ssrc_group("FID", &[100, 101])
            .with_ssrc_group("FEC-FR", &[100, 102]);

        let groups = resolve_incoming(&track);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].key, "");
        assert_eq!(
            (groups[0].media_ssrc, groups[0].rtx_ssrc, groups[0].fec_ssrc),
            (100, 101, 102)
        );
    }

    #[test]
    fn test_single_flow_without_companions() {
        let track = TrackDescriptor::new("a0", "audio").with_ssrc(100);
        let group = resolve_single_flow(&track).unwrap();
        assert_eq!((group.rtx_ssrc, group.fec_ssrc), (0, 0));
    }

    #[test]
    fn test_short_grouping_is_ignored() {
        let track = TrackDescriptor::new("a0", "audio")
            .with_ssrc(100)
            .with_ssrc_group("FID", &[100]);
        let group = resolve_single_flow(&track).unwrap();
        assert_eq!(group.rtx_ssrc, 0);
    }

    #[test]
    fn test_describe_resolves_back_to_same_groups() {
        let track = TrackDescriptor::new("v0", "video")
            .with_mid("2")
            .with_ssrc(10)
            .with_ssrc(11)
            .with_ssrc(20)
            .with_ssrc_group("SIM", &[10, 20])
            .with_ssrc_group("FID", &[10, 11]);
        let groups = resolve_incoming(&track);

        let described = describe("v0", "video", &groups);
        assert_eq!(described.ssrcs, vec![10, 11, 20]);
        assert_eq!(resolve_incoming(&described), groups);
    }

    #[test]
    fn test_no_ssrc_resolves_nothing() {
        let track = TrackDescriptor::new("a0", "audio");
        assert!(resolve_incoming(&track).is_empty());
        assert!(resolve_single_flow(&track).is_none());
    }
}
