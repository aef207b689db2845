//! Streams forwarded to the remote peer

use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

use crate::descriptor::{StreamDescriptor, TrackDescriptor};
use crate::error::{Error, Result};
use crate::incoming_stream::IncomingStream;
use crate::listeners::{StreamStopCallback, TrackCallback};
use crate::outgoing_track::OutgoingTrack;
use crate::stats::TrackStats;
use crate::transponder::Transponder;
use crate::transport::Transport;
use crate::types::{MediaKind, StreamId, TrackId};

struct OutgoingStreamState {
    transport: Option<Weak<Transport>>,
    tracks: IndexMap<TrackId, Arc<OutgoingTrack>>,
    muted: bool,
    on_track: Vec<TrackCallback<OutgoingTrack>>,
    on_stop: Vec<StreamStopCallback>,
}

pub struct OutgoingStream {
    id: StreamId,
    self_ref: Weak<Self>,
    state: Mutex<OutgoingStreamState>,
}

impl OutgoingStream {
    pub(crate) fn new(transport: Weak<Transport>, descriptor: &StreamDescriptor) -> Result<Arc<Self>> {
        let stream = Arc::new_cyclic(|self_ref| Self {
            id: StreamId::new(descriptor.id.clone()),
            self_ref: self_ref.clone(),
            state: Mutex::new(OutgoingStreamState {
                transport: Some(transport),
                tracks: IndexMap::new(),
                muted: false,
                on_track: Vec::new(),
                on_stop: Vec::new(),
            }),
        });

        for track in &descriptor.tracks {
            if let Err(e) = stream.create_track(track) {
                stream.stop();
                return Err(e);
            }
        }
        Ok(stream)
    }

    #[must_use]
    pub const fn id(&self) -> &StreamId {
        &self.id
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state.lock().transport.is_none()
    }

    /// Register a new single-flow track. `Ok(None)` on a duplicate id or a
    /// stopped stream.
    pub fn create_track(&self, descriptor: &TrackDescriptor) -> Result<Option<Arc<OutgoingTrack>>> {
        let (track, listeners) = {
            let mut state = self.state.lock();
            let Some(transport) = state.transport.as_ref().and_then(Weak::upgrade) else {
                debug!(stream_id = %self.id, track_id = %descriptor.id, "Stream stopped, ignoring track");
                return Ok(None);
            };

            let id = TrackId::new(descriptor.id.clone());
            if state.tracks.contains_key(&id) {
                debug!(stream_id = %self.id, track_id = %id, "Track already exists");
                return Ok(None);
            }

            let track = OutgoingTrack::build(&transport, self.self_ref.clone(), descriptor, state.muted)?;
            state.tracks.insert(id, Arc::clone(&track));
            (track, state.on_track.clone())
        };

        for listener in listeners {
            listener(&track);
        }
        Ok(Some(track))
    }

    /// Adopt a track created outside this stream, taking it from its previous
    /// stream if it had one. The track follows this stream's mute state.
    pub fn add_track(&self, track: Arc<OutgoingTrack>) -> Result<()> {
        let (previous, listeners) = {
            let mut state = self.state.lock();
            if state.transport.is_none() {
                return Err(Error::StaleReference(format!("stream {} is stopped", self.id)));
            }
            if track.is_stopped() {
                return Err(Error::StaleReference(format!("track {} is stopped", track.id())));
            }
            if state.tracks.contains_key(track.id()) {
                return Err(Error::DuplicateId(format!("track {}", track.id())));
            }
            let previous = track.stream();
            track.set_stream(self.self_ref.clone());
            track.mute(state.muted);
            state.tracks.insert(track.id().clone(), Arc::clone(&track));
            (previous, state.on_track.clone())
        };

        if let Some(previous) = previous {
            previous.forget_track(&track);
        }
        for listener in listeners {
            listener(&track);
        }
        Ok(())
    }

    pub fn remove_track(&self, track: &OutgoingTrack) -> Option<Arc<OutgoingTrack>> {
        let removed = self.forget_track(track)?;
        removed.set_stream(Weak::new());
        Some(removed)
    }

    pub(crate) fn forget_track(&self, track: &OutgoingTrack) -> Option<Arc<OutgoingTrack>> {
        let mut state = self.state.lock();
        let owned = state
            .tracks
            .get(track.id())
            .is_some_and(|t| std::ptr::eq(Arc::as_ptr(t), track));
        if owned {
            state.tracks.shift_remove(track.id())
        } else {
            None
        }
    }

    #[must_use]
    pub fn get_track(&self, id: &str) -> Option<Arc<OutgoingTrack>> {
        self.state.lock().tracks.get(&TrackId::new(id)).cloned()
    }

    #[must_use]
    pub fn get_tracks(&self) -> Vec<Arc<OutgoingTrack>> {
        self.state.lock().tracks.values().cloned().collect()
    }

    fn tracks_of(&self, kind: MediaKind) -> Vec<Arc<OutgoingTrack>> {
        self.state
            .lock()
            .tracks
            .values()
            .filter(|t| t.kind() == kind)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn get_audio_tracks(&self) -> Vec<Arc<OutgoingTrack>> {
        self.tracks_of(MediaKind::Audio)
    }

    #[must_use]
    pub fn get_video_tracks(&self) -> Vec<Arc<OutgoingTrack>> {
        self.tracks_of(MediaKind::Video)
    }

    #[must_use]
    pub fn get_stats(&self) -> Vec<TrackStats> {
        self.get_tracks().iter().map(|t| t.get_stats()).collect()
    }

    #[must_use]
    pub fn descriptor(&self) -> StreamDescriptor {
        StreamDescriptor {
            id: self.id.to_string(),
            tracks: self.get_tracks().iter().map(|t| t.descriptor()).collect(),
        }
    }

    /// Mute or unmute every track, including tracks created later.
    pub fn mute(&self, muted: bool) {
        let tracks = {
            let mut state = self.state.lock();
            state.muted = muted;
            state.tracks.values().cloned().collect::<Vec<_>>()
        };
        for track in &tracks {
            track.mute(muted);
        }
        info!(stream_id = %self.id, muted, "Outgoing stream mute changed");
    }

    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.state.lock().muted
    }

    /// Forward `incoming` on this stream.
    ///
    /// Existing pairings are released first. Tracks are then paired by
    /// position within each kind, up to the shorter of the two lists.
    pub fn attach_to(&self, incoming: &IncomingStream) -> Vec<Arc<Transponder>> {
        self.detach();

        let audio = self.get_audio_tracks().into_iter().zip(incoming.get_audio_tracks());
        let video = self.get_video_tracks().into_iter().zip(incoming.get_video_tracks());
        let transponders: Vec<_> = audio
            .chain(video)
            .filter_map(|(outgoing, incoming)| outgoing.attach_to(&incoming))
            .collect();

        info!(
            stream_id = %self.id,
            incoming_stream_id = %incoming.id(),
            transponders = transponders.len(),
            "Outgoing stream attached"
        );
        transponders
    }

    /// Release every pairing; tracks stay registered and re-attachable.
    pub fn detach(&self) {
        for track in self.get_tracks() {
            track.detach();
        }
    }

    pub fn on_track(&self, callback: impl Fn(&Arc<OutgoingTrack>) + Send + Sync + 'static) {
        self.state.lock().on_track.push(Arc::new(callback));
    }

    pub fn on_stop(&self, callback: impl Fn(&StreamId) + Send + Sync + 'static) {
        self.state.lock().on_stop.push(Arc::new(callback));
    }

    /// Stop every track (transponders first, then ssrc registrations) and
    /// leave the transport. Idempotent.
    pub fn stop(&self) {
        let (transport, tracks, on_stop) = {
            let mut state = self.state.lock();
            let Some(transport) = state.transport.take() else {
                return;
            };
            state.on_track.clear();
            let tracks: Vec<_> = state.tracks.drain(..).map(|(_, t)| t).collect();
            (transport, tracks, std::mem::take(&mut state.on_stop))
        };

        for track in &tracks {
            track.stop();
        }
        if let (Some(transport), Some(this)) = (transport.upgrade(), self.self_ref.upgrade()) {
            transport.forget_outgoing_stream(&this);
        }
        for callback in on_stop {
            callback(&self.id);
        }

        info!(stream_id = %self.id, tracks = tracks.len(), "Outgoing stream stopped");
    }
}

impl std::fmt::Debug for OutgoingStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingStream")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
