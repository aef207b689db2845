//! Media flow sent to a remote peer

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::ForwardingConfig;
use crate::descriptor::TrackDescriptor;
use crate::error::{Error, Result};
use crate::incoming_track::IncomingTrack;
use crate::listeners::TrackStopCallback;
use crate::outgoing_stream::OutgoingStream;
use crate::resolver::{self, resolve_single_flow};
use crate::source_group::OutgoingSourceGroup;
use crate::stats::TrackStats;
use crate::transponder::Transponder;
use crate::transport::Transport;
use crate::types::{MediaKind, TrackId};

struct OutgoingTrackState {
    transport: Option<Weak<Transport>>,
    transponder: Option<Arc<Transponder>>,
    muted: bool,
    stream: Weak<OutgoingStream>,
    on_stop: Vec<TrackStopCallback>,
}

pub struct OutgoingTrack {
    id: TrackId,
    kind: MediaKind,
    group: Arc<OutgoingSourceGroup>,
    clock: Arc<dyn Clock>,
    forwarding: ForwardingConfig,
    state: Mutex<OutgoingTrackState>,
}

impl OutgoingTrack {
    /// Resolve the single outgoing flow of `descriptor` and register it.
    pub fn create(transport: &Arc<Transport>, descriptor: &TrackDescriptor) -> Result<Arc<Self>> {
        Self::build(transport, Weak::new(), descriptor, false)
    }

    pub(crate) fn build(
        transport: &Arc<Transport>,
        stream: Weak<OutgoingStream>,
        descriptor: &TrackDescriptor,
        muted: bool,
    ) -> Result<Arc<Self>> {
        let kind: MediaKind = descriptor.kind.parse()?;
        let resolved = resolve_single_flow(descriptor).ok_or_else(|| {
            Error::MalformedDescriptor(format!("outgoing track {} has no ssrc", descriptor.id))
        })?;

        let group = Arc::new(OutgoingSourceGroup::new(kind, &resolved, transport.config()));
        transport.register_outgoing(&[Arc::clone(&group)])?;

        info!(
            track_id = %descriptor.id,
            kind = %kind,
            ssrc = resolved.media_ssrc,
            "Outgoing track created"
        );

        Ok(Arc::new(Self {
            id: TrackId::new(descriptor.id.clone()),
            kind,
            group,
            clock: transport.clock(),
            forwarding: transport.config().forwarding.clone(),
            state: Mutex::new(OutgoingTrackState {
                transport: Some(Arc::downgrade(transport)),
                transponder: None,
                muted,
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

    #[must_use]
    pub fn source_group(&self) -> &Arc<OutgoingSourceGroup> {
        &self.group
    }

    #[must_use]
    pub fn stream(&self) -> Option<Arc<OutgoingStream>> {
        self.state.lock().stream.upgrade()
    }

    pub(crate) fn set_stream(&self, stream: Weak<OutgoingStream>) {
        self.state.lock().stream = stream;
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state.lock().transport.is_none()
    }

    #[must_use]
    pub fn transponder(&self) -> Option<Arc<Transponder>> {
        self.state.lock().transponder.clone()
    }

    pub fn on_stop(&self, callback: impl Fn(&TrackId) + Send + Sync + 'static) {
        self.state.lock().on_stop.push(Arc::new(callback));
    }

    /// Forward `incoming` on this track, reusing the existing transponder.
    ///
    /// Returns `None` when either track is stopped or the kinds differ.
    pub fn attach_to(&self, incoming: &Arc<IncomingTrack>) -> Option<Arc<Transponder>> {
        if incoming.kind() != self.kind {
            warn!(
                track_id = %self.id,
                incoming_track_id = %incoming.id(),
                kind = %self.kind,
                incoming_kind = %incoming.kind(),
                "Refusing to attach tracks of different kinds"
            );
            return None;
        }
        if incoming.is_stopped() {
            debug!(track_id = %self.id, incoming_track_id = %incoming.id(), "Incoming track already stopped");
            return None;
        }

        let transponder = {
            let mut state = self.state.lock();
            let transport = state.transport.as_ref().and_then(Weak::upgrade)?;
            let muted = state.muted;
            Arc::clone(state.transponder.get_or_insert_with(|| {
                Transponder::new(
                    Arc::clone(&self.group),
                    transport.sink_ref(),
                    Arc::clone(&self.clock),
                    &self.forwarding,
                    muted,
                )
            }))
        };

        transponder.set_incoming(Some(incoming));
        info!(track_id = %self.id, incoming_track_id = %incoming.id(), "Outgoing track attached");
        Some(transponder)
    }

    /// Stop forwarding; the track stays usable for a later attach.
    pub fn detach(&self) {
        if let Some(transponder) = self.transponder() {
            transponder.detach();
        }
    }

    pub fn mute(&self, muted: bool) {
        let transponder = {
            let mut state = self.state.lock();
            state.muted = muted;
            state.transponder.clone()
        };
        if let Some(transponder) = transponder {
            transponder.set_muted(muted);
        }
        debug!(track_id = %self.id, muted, "Outgoing track mute changed");
    }

    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.state.lock().muted
    }

    #[must_use]
    pub fn get_stats(&self) -> TrackStats {
        let mut encodings = BTreeMap::new();
        encodings.insert(String::new(), self.group.get_stats(self.clock.now_ms()));
        TrackStats {
            track_id: self.id.clone(),
            kind: self.kind,
            encodings,
        }
    }

    #[must_use]
    pub fn descriptor(&self) -> TrackDescriptor {
        resolver::describe(self.id.as_str(), self.kind.as_str(), &[self.group.shape()])
    }

    /// Stop the transponder, unregister the group and leave the stream.
    pub fn stop(&self) {
        let (transport, transponder, stream, on_stop) = {
            let mut state = self.state.lock();
            let Some(transport) = state.transport.take() else {
                return;
            };
            (
                transport,
                state.transponder.take(),
                std::mem::take(&mut state.stream),
                std::mem::take(&mut state.on_stop),
            )
        };

        if let Some(transponder) = transponder {
            transponder.stop();
        }
        if let Some(transport) = transport.upgrade() {
            transport.unregister_outgoing(&[Arc::clone(&self.group)]);
        }
        for callback in on_stop {
            callback(&self.id);
        }
        if let Some(stream) = stream.upgrade() {
            stream.forget_track(self);
        }

        info!(track_id = %self.id, "Outgoing track stopped");
    }
}

impl std::fmt::Debug for OutgoingTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("ssrc", &self.group.media().ssrc())
            .finish_non_exhaustive()
    }
}
