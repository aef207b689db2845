//! Forwarding from one incoming source group to one outgoing source group

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::config::ForwardingConfig;
use crate::incoming_track::IncomingTrack;
use crate::listeners::ListenerId;
use crate::packet::{LayerId, RtpPacket};
use crate::rewriter::SequenceRewriter;
use crate::sink::MediaSink;
use crate::source_group::{FeedbackListener, IncomingSourceGroup, OutgoingSourceGroup, RtpListener};

struct TransponderState {
    track: Weak<IncomingTrack>,
    group: Option<Arc<IncomingSourceGroup>>,
    subscription: Option<ListenerId>,
    /// Encoding key to prefer when attaching; first encoding when unset
    encoding: Option<String>,
    target: LayerId,
    muted: bool,
    rewriter: SequenceRewriter,
    stopped: bool,
}

impl TransponderState {
    fn unsubscribe(&mut self) -> Option<Arc<IncomingSourceGroup>> {
        let group = self.group.take()?;
        if let Some(id) = self.subscription.take() {
            group.remove_listener(id);
        }
        Some(group)
    }
}

/// Rewrites the packets of the selected incoming group onto the fixed
/// outgoing group and hands them to the sink.
pub struct Transponder {
    outgoing: Arc<OutgoingSourceGroup>,
    sink: Weak<dyn MediaSink>,
    clock: Arc<dyn Clock>,
    clock_rate: u32,
    keyframe_on_switch: bool,
    self_ref: Weak<Self>,
    feedback: ListenerId,
    forwarded: AtomicU64,
    dropped: AtomicU64,
    state: Mutex<TransponderState>,
}

impl Transponder {
    pub(crate) fn new(
        outgoing: Arc<OutgoingSourceGroup>,
        sink: Weak<dyn MediaSink>,
        clock: Arc<dyn Clock>,
        forwarding: &ForwardingConfig,
        muted: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref: &Weak<Self>| {
            let listener: Weak<dyn FeedbackListener> = self_ref.clone();
            let feedback = outgoing.add_feedback_listener(listener);
            Self {
                clock_rate: forwarding.clock_rate(outgoing.kind()),
                keyframe_on_switch: forwarding.request_keyframe_on_switch && outgoing.kind().is_video(),
                outgoing,
                sink,
                clock,
                self_ref: self_ref.clone(),
                feedback,
                forwarded: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                state: Mutex::new(TransponderState {
                    track: Weak::new(),
                    group: None,
                    subscription: None,
                    encoding: None,
                    target: LayerId::MAX,
                    muted,
                    rewriter: SequenceRewriter::new(),
                    stopped: false,
                }),
            }
        })
    }

    #[must_use]
    pub fn outgoing_group(&self) -> &Arc<OutgoingSourceGroup> {
        &self.outgoing
    }

    #[must_use]
    pub fn incoming_group(&self) -> Option<Arc<IncomingSourceGroup>> {
        self.state.lock().group.clone()
    }

    #[must_use]
    pub fn incoming_track(&self) -> Option<Arc<IncomingTrack>> {
        self.state.lock().track.upgrade()
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.state.lock().group.is_some()
    }

    #[must_use]
    pub fn selected_encoding(&self) -> Option<String> {
        self.state.lock().encoding.clone()
    }

    #[must_use]
    pub fn target_layer(&self) -> LayerId {
        self.state.lock().target
    }

    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.state.lock().muted
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    #[must_use]
    pub fn forwarded_packets(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn dropped_packets(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// False when the group already ended; the state is left unsubscribed.
    fn subscribe(&self, state: &mut TransponderState, group: Arc<IncomingSourceGroup>) -> bool {
        let listener: Weak<dyn RtpListener> = self.self_ref.clone();
        let Some(id) = group.add_listener(listener) else {
            return false;
        };
        state.subscription = Some(id);
        state.group = Some(group);
        state.rewriter.rebase();
        true
    }

    /// Forward from `track` (its selected or first encoding), or stop
    /// forwarding with `None`. The outgoing timeline continues either way.
    pub fn set_incoming(&self, track: Option<&Arc<IncomingTrack>>) {
        let switched_to = {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.unsubscribe();
            state.track = Weak::new();

            let Some(track) = track else {
                debug!(ssrc = self.outgoing.media().ssrc(), "Transponder detached");
                return;
            };
            state.track = Arc::downgrade(track);

            let group = state
                .encoding
                .as_deref()
                .and_then(|key| track.source_group(key))
                .or_else(|| track.first_source_group());
            let Some(group) = group else {
                return;
            };
            let media_ssrc = group.media().ssrc();
            if !self.subscribe(&mut state, group) {
                state.track = Weak::new();
                debug!(track_id = %track.id(), "Incoming track ended, not attaching");
                return;
            }
            debug!(
                track_id = %track.id(),
                incoming_ssrc = media_ssrc,
                outgoing_ssrc = self.outgoing.media().ssrc(),
                "Transponder attached"
            );
            media_ssrc
        };

        if let Some(track) = track {
            self.keyframe_after_switch(track, switched_to);
        }
    }

    pub fn detach(&self) {
        self.set_incoming(None);
    }

    /// Switch to another encoding of the attached incoming track.
    ///
    /// Returns false when nothing is attached or the track has no such
    /// encoding. The choice is remembered across re-attachment.
    pub fn select_encoding(&self, key: &str) -> bool {
        let (track, media_ssrc) = {
            let mut state = self.state.lock();
            if state.stopped {
                return false;
            }
            let Some(track) = state.track.upgrade() else {
                return false;
            };
            let Some(group) = track.source_group(key) else {
                debug!(track_id = %track.id(), encoding = key, "Unknown encoding requested");
                return false;
            };
            state.encoding = Some(key.to_string());
            if state.group.as_ref().is_some_and(|g| Arc::ptr_eq(g, &group)) {
                return true;
            }

            state.unsubscribe();
            let media_ssrc = group.media().ssrc();
            if !self.subscribe(&mut state, group) {
                state.track = Weak::new();
                return false;
            }
            debug!(track_id = %track.id(), encoding = key, "Switched encoding");
            (track, media_ssrc)
        };

        self.keyframe_after_switch(&track, media_ssrc);
        true
    }

    /// Forward only layers at or below (spatial, temporal).
    pub fn select_layer(&self, spatial: u8, temporal: u8) {
        let target = LayerId::new(spatial, temporal);
        self.state.lock().target = target;
        debug!(ssrc = self.outgoing.media().ssrc(), %target, "Selected layer");
    }

    pub fn set_muted(&self, muted: bool) {
        let resumed = {
            let mut state = self.state.lock();
            if state.muted == muted {
                return;
            }
            state.muted = muted;
            if !muted {
                state.rewriter.rebase();
            }
            if muted {
                None
            } else {
                state
                    .group
                    .as_ref()
                    .map(|g| g.media().ssrc())
                    .zip(state.track.upgrade())
            }
        };

        if let Some((media_ssrc, track)) = resumed {
            self.keyframe_after_switch(&track, media_ssrc);
        }
    }

    fn keyframe_after_switch(&self, track: &IncomingTrack, media_ssrc: u32) {
        if self.keyframe_on_switch {
            track.send_pli(media_ssrc);
        }
    }

    /// Ask the source of the current incoming group for a keyframe.
    pub fn request_keyframe(&self) -> bool {
        let (track, group) = {
            let state = self.state.lock();
            (state.track.upgrade(), state.group.clone())
        };
        match (track, group) {
            (Some(track), Some(group)) => track.send_pli(group.media().ssrc()),
            _ => false,
        }
    }

    /// Stop forwarding for good and drop every subscription.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.unsubscribe();
            state.track = Weak::new();
        }
        self.outgoing.remove_feedback_listener(self.feedback);
        debug!(
            ssrc = self.outgoing.media().ssrc(),
            forwarded = self.forwarded_packets(),
            "Transponder stopped"
        );
    }

    fn drop_packet(&self, ssrc: u32, reason: &'static str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        trace!(ssrc, reason, "Dropping packet");
    }
}

impl RtpListener for Transponder {
    fn on_rtp(&self, group: &Arc<IncomingSourceGroup>, packet: &RtpPacket, ext_seq: u32) {
        let now = self.clock.now_ms();
        // Held through the send so nothing goes out once detach or stop returns
        let mut state = self.state.lock();
        let current = state.group.as_ref().is_some_and(|g| Arc::ptr_eq(g, group));
        if state.stopped || !current {
            return;
        }
        if state.muted {
            drop(state);
            self.drop_packet(packet.ssrc, "muted");
            return;
        }
        if let Some(layer) = packet.layer {
            if !layer.fits(state.target) {
                state.rewriter.skip(ext_seq);
                drop(state);
                self.drop_packet(packet.ssrc, "layer above target");
                return;
            }
        }
        let Some((sequence_number, timestamp)) =
            state.rewriter.rewrite(ext_seq, packet.timestamp, now, self.clock_rate)
        else {
            drop(state);
            self.drop_packet(packet.ssrc, "older than last forwarded");
            return;
        };

        if let Some(sink) = self.sink.upgrade() {
            sink.send(RtpPacket {
                ssrc: self.outgoing.media().ssrc(),
                sequence_number,
                timestamp,
                ..packet.clone()
            });
            self.forwarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_ended(&self, group: &Arc<IncomingSourceGroup>) {
        let mut state = self.state.lock();
        if state.group.as_ref().is_some_and(|g| Arc::ptr_eq(g, group)) {
            // The group already dropped its listeners
            state.group = None;
            state.subscription = None;
            state.track = Weak::new();
            debug!(ssrc = group.media().ssrc(), "Incoming group ended, transponder idle");
        }
    }
}

impl FeedbackListener for Transponder {
    fn on_pli(&self) {
        self.request_keyframe();
    }
}

impl Drop for Transponder {
    fn drop(&mut self) {
        self.outgoing.remove_feedback_listener(self.feedback);
    }
}

impl std::fmt::Debug for Transponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transponder")
            .field("outgoing", &self.outgoing.media().ssrc())
            .field("forwarded", &self.forwarded_packets())
            .finish_non_exhaustive()
    }
}
