//! Published media flow

use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::descriptor::TrackDescriptor;
use crate::error::{Error, Result};
use crate::incoming_stream::IncomingStream;
use crate::listeners::TrackStopCallback;
use crate::resolver::{self, resolve_incoming};
use crate::sink::MediaSink;
use crate::source_group::IncomingSourceGroup;
use crate::stats::TrackStats;
use crate::transport::Transport;
use crate::types::{MediaKind, TrackId};

struct IncomingTrackState {
    // None once stopped
    transport: Option<Weak<Transport>>,
    receiver: Option<Weak<dyn MediaSink>>,
    stream: Weak<IncomingStream>,
    on_stop: Vec<TrackStopCallback>,
}

/// A track received from a remote peer, with one source group per encoding.
pub struct IncomingTrack {
    id: TrackId,
    kind: MediaKind,
    groups: IndexMap<String, Arc<IncomingSourceGroup>>,
    clock: Arc<dyn Clock>,
    state: Mutex<IncomingTrackState>,
}

impl IncomingTrack {
    /// Resolve `descriptor` and register every resulting group with `transport`.
    ///
    /// The track is not part of any stream until added to one.
    pub fn create(transport: &Arc<Transport>, descriptor: &TrackDescriptor) -> Result<Arc<Self>> {
        Self::build(transport, transport.sink_ref(), Weak::new(), descriptor)
    }

    pub(crate) fn build(
        transport: &Arc<Transport>,
        receiver: Weak<dyn MediaSink>,
        stream: Weak<IncomingStream>,
        descriptor: &TrackDescriptor,
    ) -> Result<Arc<Self>> {
        let kind: MediaKind = descriptor.kind.parse()?;
        let resolved = resolve_incoming(descriptor);
        if resolved.is_empty() {
            return Err(Error::MalformedDescriptor(format!(
                "track {} has no resolvable source group",
                descriptor.id
            )));
        }

        let groups: IndexMap<String, Arc<IncomingSourceGroup>> = resolved
            .iter()
            .map(|r| {
                (
                    r.key.clone(),
                    Arc::new(IncomingSourceGroup::new(kind, r, transport.config())),
                )
            })
            .collect();
        let batch: Vec<_> = groups.values().cloned().collect();
        transport.register_incoming(&batch)?;

        info!(
            track_id = %descriptor.id,
            kind = %kind,
            encodings = groups.len(),
            "Incoming track created"
        );

        Ok(Arc::new(Self {
            id: TrackId::new(descriptor.id.clone()),
            kind,
            groups,
            clock: transport.clock(),
            state: Mutex::new(IncomingTrackState {
                transport: Some(Arc::downgrade(transport)),
                receiver: Some(receiver),
                stream,
                on_stop: Vec::new(),
            }),
        }))
    }

    #[must_use]
    pub const fn id(&self) -> &TrackId {
        &self.id
    }

    #[must_use]
    pub const fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Encoding keys in resolution order
    #[must_use]
    pub fn encodings(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    #[must_use]
    pub fn source_group(&self, key: &str) -> Option<Arc<IncomingSourceGroup>> {
        self.groups.get(key).cloned()
    }

    #[must_use]
    pub fn first_source_group(&self) -> Option<Arc<IncomingSourceGroup>> {
        self.groups.first().map(|(_, g)| Arc::clone(g))
    }

    #[must_use]
    pub fn source_groups(&self) -> Vec<Arc<IncomingSourceGroup>> {
        self.groups.values().cloned().collect()
    }

    #[must_use]
    pub fn stream(&self) -> Option<Arc<IncomingStream>> {
        self.state.lock().stream.upgrade()
    }

    pub(crate) fn set_stream(&self, stream: Weak<IncomingStream>) {
        self.state.lock().stream = stream;
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state.lock().transport.is_none()
    }

    /// Register a callback run once when the track stops.
    pub fn on_stop(&self, callback: impl Fn(&TrackId) + Send + Sync + 'static) {
        self.state.lock().on_stop.push(Arc::new(callback));
    }

    /// Send a keyframe request upstream for `ssrc`.
    pub(crate) fn send_pli(&self, ssrc: u32) -> bool {
        let receiver = self.state.lock().receiver.as_ref().and_then(Weak::upgrade);
        match receiver {
            Some(receiver) => {
                receiver.send_pli(ssrc);
                true
            }
            None => false,
        }
    }

    /// Ask the publisher for a keyframe on every encoding.
    pub fn request_keyframe(&self) {
        for group in self.groups.values() {
            self.send_pli(group.media().ssrc());
        }
        debug!(track_id = %self.id, encodings = self.groups.len(), "Requested keyframe");
    }

    #[must_use]
    pub fn get_stats(&self) -> TrackStats {
        let now = self.clock.now_ms();
        TrackStats {
            track_id: self.id.clone(),
            kind: self.kind,
            encodings: self
                .groups
                .iter()
                .map(|(key, group)| (key.clone(), group.get_stats(now)))
                .collect(),
        }
    }

    /// Descriptor of the live track, resolvable back to the same groups
    #[must_use]
    pub fn descriptor(&self) -> TrackDescriptor {
        let shapes: Vec<_> = self.groups.values().map(|g| g.shape()).collect();
        resolver::describe(self.id.as_str(), self.kind.as_str(), &shapes)
    }

    /// Unregister the source groups, end every forwarding subscription on
    /// them, then leave the owning stream. Runs once; later calls do nothing.
    pub fn stop(&self) {
        let (transport, stream, on_stop) = {
            let mut state = self.state.lock();
            let Some(transport) = state.transport.take() else {
                return;
            };
            state.receiver = None;
            (
                transport,
                std::mem::take(&mut state.stream),
                std::mem::take(&mut state.on_stop),
            )
        };

        let groups = self.source_groups();
        match transport.upgrade() {
            Some(transport) => transport.unregister_incoming(&groups),
            None => warn!(track_id = %self.id, "Transport dropped before track stop"),
        }
        for group in &groups {
            group.end();
        }

        for callback in on_stop {
            callback(&self.id);
        }
        if let Some(stream) = stream.upgrade() {
            stream.forget_track(self);
        }

        info!(track_id = %self.id, "Incoming track stopped");
    }
}

impl std::fmt::Debug for IncomingTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("encodings", &self.groups.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::EncodingDescriptor;
    use crate::packet::RtpPacket;
    use crate::sink::SinkEvent;
    use crate::config::SfuConfig;
    use crate::test_helpers::{simulcast_video, test_transport, test_transport_with};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_create_registers_every_encoding() {
        let (transport, _clock, _rx) = test_transport();
        let track = IncomingTrack::create(&transport, &simulcast_video("v0", &[100, 200, 300])).unwrap();

        assert_eq!(track.encodings(), vec!["h", "m", "l"]);
        assert_eq!(transport.registered_group_count(), 3);
        assert!(transport.incoming_group(201).is_some());
        assert!(track.stream().is_none());
    }

    #[test]
    fn test_unresolvable_track_is_not_created() {
        let (transport, _clock, _rx) = test_transport();
        let descriptor = TrackDescriptor::new("v0", "video")
            .with_encoding(EncodingDescriptor::new("h").with_param("ssrc", "bogus"));

        let err = IncomingTrack::create(&transport, &descriptor).unwrap_err();
        assert!(matches!(err, Error::MalformedDescriptor(_)));
        assert_eq!(transport.registered_group_count(), 0);
    }

    #[test]
    fn test_zero_sim_member_takes_no_group_slot() {
        let mut config = SfuConfig::default();
        config.dispatch.max_source_groups = 2;
        let (transport, _clock, _rx) = test_transport_with(config);
        let descriptor = TrackDescriptor::new("v0", "video")
            .with_ssrc(10)
            .with_ssrc(30)
            .with_ssrc_group("SIM", &[10, 0, 30]);

        let track = IncomingTrack::create(&transport, &descriptor).unwrap();
        assert_eq!(track.encodings(), vec!["0", "2"]);
        assert_eq!(transport.registered_group_count(), 2);
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let (transport, _clock, _rx) = test_transport();
        let descriptor = TrackDescriptor::new("d0", "data").with_ssrc(1);
        assert!(matches!(
            IncomingTrack::create(&transport, &descriptor),
            Err(Error::MalformedDescriptor(_))
        ));
    }

    #[test]
    fn test_stop_unregisters_once_and_notifies() {
        let (transport, _clock, _rx) = test_transport();
        let track = IncomingTrack::create(&transport, &simulcast_video("v0", &[100, 200])).unwrap();
        let stops = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&stops);
        track.on_stop(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        track.stop();
        track.stop();

        assert!(track.is_stopped());
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert_eq!(transport.registered_group_count(), 0);
        assert!(!transport.dispatch_rtp(&RtpPacket::new(100, 1, 0, vec![])));
    }

    #[test]
    fn test_request_keyframe_per_encoding() {
        let (transport, _clock, mut rx) = test_transport();
        let track = IncomingTrack::create(&transport, &simulcast_video("v0", &[100, 200])).unwrap();

        track.request_keyframe();
        assert_eq!(rx.try_recv().unwrap(), SinkEvent::Pli(100));
        assert_eq!(rx.try_recv().unwrap(), SinkEvent::Pli(200));

        track.stop();
        track.request_keyframe();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_stats_keyed_by_encoding() {
        let (transport, clock, _rx) = test_transport();
        let track = IncomingTrack::create(&transport, &simulcast_video("v0", &[100, 200])).unwrap();

        clock.advance(5);
        transport.dispatch_rtp(&RtpPacket::new(200, 7, 0, vec![0u8; 88]));
        let stats = track.get_stats();
        assert_eq!(stats.encodings["m"].media.packets, 1);
        assert_eq!(stats.encodings["m"].media.last_packet_ms, Some(5));
        assert_eq!(stats.encodings["h"].media.packets, 0);
        assert_eq!(stats.total_packets(), 1);
    }
}
