//! Media/rtx/fec source triples
//!
//! An incoming group fans media packets out to its RTP listeners (transponders).
//! An outgoing group is the rewritten side of one forwarded flow and fans
//! keyframe requests from the remote receiver back to its feedback listeners.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

use crate::config::SfuConfig;
use crate::listeners::{ListenerId, ListenerSet};
use crate::packet::RtpPacket;
use crate::resolver::ResolvedGroup;
use crate::source::Source;
use crate::stats::{RemoteReport, SourceGroupStats};
use crate::types::MediaKind;

/// Role an ssrc plays inside its group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceRole {
    Media,
    Rtx,
    Fec,
}

/// Receives media packets of the incoming groups it subscribed to
pub trait RtpListener: Send + Sync {
    /// Called with the packet and its extended sequence number, after accounting.
    fn on_rtp(&self, group: &Arc<IncomingSourceGroup>, packet: &RtpPacket, ext_seq: u32);

    /// The group is going away; no further packets will be delivered.
    fn on_ended(&self, group: &Arc<IncomingSourceGroup>);
}

/// Receives feedback the remote receiver sent for an outgoing group
pub trait FeedbackListener: Send + Sync {
    fn on_pli(&self);
}

fn build_sources(
    kind: MediaKind,
    resolved: &ResolvedGroup,
    config: &SfuConfig,
) -> (Source, Source, Source) {
    let clock_rate = config.forwarding.clock_rate(kind);
    let layered = kind.is_video();
    (
        Source::new(resolved.media_ssrc, clock_rate, layered, &config.stats),
        Source::new(resolved.rtx_ssrc, clock_rate, false, &config.stats),
        Source::new(resolved.fec_ssrc, clock_rate, false, &config.stats),
    )
}

fn present_ssrcs(media: &Source, rtx: &Source, fec: &Source) -> Vec<u32> {
    [media, rtx, fec]
        .into_iter()
        .filter(|s| s.is_present())
        .map(Source::ssrc)
        .collect()
}

pub struct IncomingSourceGroup {
    kind: MediaKind,
    key: String,
    rid: Option<String>,
    mid: Option<String>,
    media: Source,
    rtx: Source,
    fec: Source,
    // 0 until the first estimate arrives
    rtt_ms: AtomicU32,
    listeners: ListenerSet<dyn RtpListener>,
}

impl IncomingSourceGroup {
    pub(crate) fn new(kind: MediaKind, resolved: &ResolvedGroup, config: &SfuConfig) -> Self {
        let (media, rtx, fec) = build_sources(kind, resolved, config);
        Self {
            kind,
            key: resolved.key.clone(),
            rid: resolved.rid.clone(),
            mid: resolved.mid.clone(),
            media,
            rtx,
            fec,
            rtt_ms: AtomicU32::new(0),
            listeners: ListenerSet::new(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Encoding key inside the owning track
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn rid(&self) -> Option<&str> {
        self.rid.as_deref()
    }

    #[must_use]
    pub fn mid(&self) -> Option<&str> {
        self.mid.as_deref()
    }

    #[must_use]
    pub const fn media(&self) -> &Source {
        &self.media
    }

    #[must_use]
    pub const fn rtx(&self) -> &Source {
        &self.rtx
    }

    #[must_use]
    pub const fn fec(&self) -> &Source {
        &self.fec
    }

    /// Non-zero ssrcs, media first
    #[must_use]
    pub fn ssrcs(&self) -> Vec<u32> {
        present_ssrcs(&self.media, &self.rtx, &self.fec)
    }

    pub(crate) fn shape(&self) -> ResolvedGroup {
        ResolvedGroup {
            key: self.key.clone(),
            rid: self.rid.clone(),
            mid: self.mid.clone(),
            media_ssrc: self.media.ssrc(),
            rtx_ssrc: self.rtx.ssrc(),
            fec_ssrc: self.fec.ssrc(),
        }
    }

    #[must_use]
    pub fn role_of(&self, ssrc: u32) -> Option<SourceRole> {
        if ssrc == 0 {
            None
        } else if ssrc == self.media.ssrc() {
            Some(SourceRole::Media)
        } else if ssrc == self.rtx.ssrc() {
            Some(SourceRole::Rtx)
        } else if ssrc == self.fec.ssrc() {
            Some(SourceRole::Fec)
        } else {
            None
        }
    }

    /// Account a packet addressed to one of our ssrcs and, for media, hand it
    /// to every subscribed listener.
    ///
    /// Returns the role the packet was accounted under.
    pub fn on_packet(self: &Arc<Self>, now_ms: u64, packet: &RtpPacket) -> Option<SourceRole> {
        let role = self.role_of(packet.ssrc)?;
        match role {
            SourceRole::Media => {
                let ext_seq = self.media.record(now_ms, packet);
                for listener in self.listeners.snapshot() {
                    listener.on_rtp(self, packet, ext_seq);
                }
            }
            SourceRole::Rtx => {
                self.rtx.record(now_ms, packet);
            }
            SourceRole::Fec => {
                self.fec.record(now_ms, packet);
            }
        }
        trace!(ssrc = packet.ssrc, seq = packet.sequence_number, ?role, "Accounted incoming packet");
        Some(role)
    }

    /// Subscribe to media packets. `None` once the group has ended.
    pub fn add_listener(&self, listener: Weak<dyn RtpListener>) -> Option<ListenerId> {
        self.listeners.try_add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Drop every subscription, refuse new ones and tell the listeners the
    /// group ended.
    pub(crate) fn end(self: &Arc<Self>) {
        for listener in self.listeners.close() {
            listener.on_ended(self);
        }
    }

    pub fn set_rtt(&self, rtt_ms: u32) {
        self.rtt_ms.store(rtt_ms, Ordering::Relaxed);
    }

    #[must_use]
    pub fn rtt_ms(&self) -> Option<u32> {
        match self.rtt_ms.load(Ordering::Relaxed) {
            0 => None,
            rtt => Some(rtt),
        }
    }

    pub fn close_report_interval(&self) {
        self.media.close_report_interval();
        self.rtx.close_report_interval();
        self.fec.close_report_interval();
    }

    #[must_use]
    pub fn get_stats(&self, now_ms: u64) -> SourceGroupStats {
        SourceGroupStats {
            rid: self.rid.clone(),
            mid: self.mid.clone(),
            media: self.media.get_stats(now_ms),
            rtx: self.rtx.get_stats(now_ms),
            fec: self.fec.get_stats(now_ms),
            rtt_ms: self.rtt_ms(),
            remote: None,
        }
    }
}

impl std::fmt::Debug for IncomingSourceGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingSourceGroup")
            .field("kind", &self.kind)
            .field("key", &self.key)
            .field("media", &self.media.ssrc())
            .field("rtx", &self.rtx.ssrc())
            .field("fec", &self.fec.ssrc())
            .finish_non_exhaustive()
    }
}

pub struct OutgoingSourceGroup {
    kind: MediaKind,
    mid: Option<String>,
    media: Source,
    rtx: Source,
    fec: Source,
    remote: Mutex<Option<RemoteReport>>,
    feedback: ListenerSet<dyn FeedbackListener>,
}

impl OutgoingSourceGroup {
    pub(crate) fn new(kind: MediaKind, resolved: &ResolvedGroup, config: &SfuConfig) -> Self {
        let (media, rtx, fec) = build_sources(kind, resolved, config);
        Self {
            kind,
            mid: resolved.mid.clone(),
            media,
            rtx,
            fec,
            remote: Mutex::new(None),
            feedback: ListenerSet::new(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> MediaKind {
        self.kind
    }

    #[must_use]
    pub const fn media(&self) -> &Source {
        &self.media
    }

    #[must_use]
    pub fn ssrcs(&self) -> Vec<u32> {
        present_ssrcs(&self.media, &self.rtx, &self.fec)
    }

    pub(crate) fn shape(&self) -> ResolvedGroup {
        ResolvedGroup {
            key: String::new(),
            rid: None,
            mid: self.mid.clone(),
            media_ssrc: self.media.ssrc(),
            rtx_ssrc: self.rtx.ssrc(),
            fec_ssrc: self.fec.ssrc(),
        }
    }

    #[must_use]
    pub fn owns(&self, ssrc: u32) -> bool {
        ssrc != 0 && self.ssrcs().contains(&ssrc)
    }

    /// Account a rewritten packet leaving on this group.
    pub fn record_sent(&self, now_ms: u64, packet: &RtpPacket) {
        if packet.ssrc == self.media.ssrc() {
            self.media.record(now_ms, packet);
        } else if packet.ssrc == self.rtx.ssrc() {
            self.rtx.record(now_ms, packet);
        } else if packet.ssrc == self.fec.ssrc() {
            self.fec.record(now_ms, packet);
        }
    }

    pub fn add_feedback_listener(&self, listener: Weak<dyn FeedbackListener>) -> ListenerId {
        self.feedback.add(listener)
    }

    pub fn remove_feedback_listener(&self, id: ListenerId) -> bool {
        self.feedback.remove(id)
    }

    /// The remote receiver asked for a keyframe on this group.
    pub fn request_keyframe(&self) {
        for listener in self.feedback.snapshot() {
            listener.on_pli();
        }
    }

    pub fn record_remote_report(&self, report: RemoteReport) {
        *self.remote.lock() = Some(report);
    }

    #[must_use]
    pub fn remote_report(&self) -> Option<RemoteReport> {
        *self.remote.lock()
    }

    pub fn close_report_interval(&self) {
        self.media.close_report_interval();
        self.rtx.close_report_interval();
        self.fec.close_report_interval();
    }

    #[must_use]
    pub fn get_stats(&self, now_ms: u64) -> SourceGroupStats {
        SourceGroupStats {
            rid: None,
            mid: self.mid.clone(),
            media: self.media.get_stats(now_ms),
            rtx: self.rtx.get_stats(now_ms),
            fec: self.fec.get_stats(now_ms),
            rtt_ms: None,
            remote: self.remote_report(),
        }
    }
}

impl std::fmt::Debug for OutgoingSourceGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingSourceGroup")
            .field("kind", &self.kind)
            .field("media", &self.media.ssrc())
            .finish_non_exhaustive()
    }
}
