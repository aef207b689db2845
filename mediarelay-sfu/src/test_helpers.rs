//! Fixtures shared by unit tests

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::clock::ManualClock;
use crate::config::SfuConfig;
use crate::descriptor::{EncodingDescriptor, TrackDescriptor};
use crate::sink::{ChannelSink, SinkEvent};
use crate::transport::Transport;

const RIDS: [&str; 3] = ["h", "m", "l"];

/// Track with one media ssrc and nothing else
pub fn single_flow(id: &str, kind: &str, ssrc: u32) -> TrackDescriptor {
    TrackDescriptor::new(id, kind).with_ssrc(ssrc)
}

/// Video track with one rid encoding per media ssrc ("h", "m", "l"), each
/// with an rtx companion at `ssrc + 1`
pub fn simulcast_video(id: &str, media_ssrcs: &[u32]) -> TrackDescriptor {
    let mut track = TrackDescriptor::new(id, "video");
    for (rid, &ssrc) in RIDS.iter().zip(media_ssrcs) {
        track = track
            .with_ssrc(ssrc)
            .with_ssrc(ssrc + 1)
            .with_ssrc_group("FID", &[ssrc, ssrc + 1])
            .with_encoding(EncodingDescriptor::new(*rid).with_param("ssrc", ssrc.to_string()));
    }
    track
}

pub fn test_transport_with(
    config: SfuConfig,
) -> (Arc<Transport>, Arc<ManualClock>, mpsc::Receiver<SinkEvent>) {
    let clock = Arc::new(ManualClock::new(0));
    let (sink, rx) = ChannelSink::new(1024);
    let transport = Transport::new(config, clock.clone(), Arc::new(sink));
    (transport, clock, rx)
}

pub fn test_transport() -> (Arc<Transport>, Arc<ManualClock>, mpsc::Receiver<SinkEvent>) {
    test_transport_with(SfuConfig::default())
}
