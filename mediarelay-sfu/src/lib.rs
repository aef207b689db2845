//! Media routing core of a WebRTC SFU (Selective Forwarding Unit)
//!
//! This crate turns the encodings a peer describes into registered RTP source
//! groups, and forwards packets from published (incoming) tracks to
//! subscribed (outgoing) tracks with ssrc, sequence and timestamp rewriting.
//!
//! ## Architecture
//!
//! - **`Transport`**: one peer session; ssrc dispatch tables and stream registry
//! - **`IncomingStream` / `OutgoingStream`**: keyed track containers and factories
//! - **`IncomingTrack` / `OutgoingTrack`**: one media flow, one source group per encoding
//! - **`IncomingSourceGroup` / `OutgoingSourceGroup`**: media, rtx and fec sources
//! - **`Transponder`**: forwards one incoming group onto one outgoing group
//!
//! ## Features
//!
//! - Explicit rid simulcast, legacy `SIM` groups and single flows
//! - Gap-free outgoing timeline across layer drops, encoding switches and re-attach
//! - Per-source loss, jitter, bitrate and per-layer counters
//! - Keyframe request relay in both directions
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mediarelay_sfu::{ChannelSink, MonotonicClock, SfuConfig, StreamDescriptor, Transport};
//!
//! let (sink, mut events) = ChannelSink::new(1024);
//! let transport = Transport::new(SfuConfig::load(None)?, Arc::new(MonotonicClock::new()), Arc::new(sink));
//!
//! let published = transport.create_incoming_stream(&offer)?;
//! let subscribed = transport.create_outgoing_stream(&answer)?;
//! subscribed.attach_to(&published);
//!
//! transport.dispatch_rtp(&packet);
//! ```

mod clock;
mod config;
mod descriptor;
mod error;
mod incoming_stream;
mod incoming_track;
mod listeners;
pub mod logging;
mod outgoing_stream;
mod outgoing_track;
mod packet;
mod report;
pub mod resolver;
mod rewriter;
mod sink;
mod source;
mod source_group;
pub mod stats;
mod transponder;
mod transport;
mod types;

#[cfg(test)]
mod test_helpers;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{DispatchConfig, ForwardingConfig, LoggingConfig, SfuConfig, StatsConfig};
pub use descriptor::{EncodingDescriptor, SsrcGroupDescriptor, StreamDescriptor, TrackDescriptor};
pub use error::{Error, Result};
pub use incoming_stream::IncomingStream;
pub use incoming_track::IncomingTrack;
pub use listeners::ListenerId;
pub use outgoing_stream::OutgoingStream;
pub use outgoing_track::OutgoingTrack;
pub use packet::{LayerId, RtpPacket, RTP_HEADER_LEN};
pub use report::spawn_report_task;
pub use sink::{ChannelSink, MediaSink, SinkEvent};
pub use source::Source;
pub use source_group::{
    FeedbackListener, IncomingSourceGroup, OutgoingSourceGroup, RtpListener, SourceRole,
};
pub use stats::{
    LayerStatsSnapshot, RemoteReport, SourceGroupStats, SourceStatsSnapshot, TrackStats,
};
pub use transponder::Transponder;
pub use transport::Transport;
pub use types::{MediaKind, StreamId, TrackId};
