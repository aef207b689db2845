//! Streams published by the remote peer

use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

use crate::descriptor::{StreamDescriptor, TrackDescriptor};
use crate::error::{Error, Result};
use crate::incoming_track::IncomingTrack;
use crate::listeners::{StreamStopCallback, TrackCallback};
use crate::sink::MediaSink;
use crate::stats::TrackStats;
use crate::transport::Transport;
use crate::types::{MediaKind, StreamId, TrackId};

struct IncomingStreamState {
    transport: Option<Weak<Transport>>,
    receiver: Option<Weak<dyn MediaSink>>,
    tracks: IndexMap<TrackId, Arc<IncomingTrack>>,
    on_track: Vec<TrackCallback<IncomingTrack>>,
    on_stop: Vec<StreamStopCallback>,
}

pub struct IncomingStream {
    id: StreamId,
    self_ref: Weak<Self>,
    state: Mutex<IncomingStreamState>,
}

impl IncomingStream {
    /// Build the stream and every track `descriptor` lists. If any track
    /// fails, the tracks already created are stopped and the error returned.
    pub(crate) fn new(
        transport: Weak<Transport>,
        receiver: Weak<dyn MediaSink>,
        descriptor: &StreamDescriptor,
    ) -> Result<Arc<Self>> {
        let stream = Arc::new_cyclic(|self_ref| Self {
            id: StreamId::new(descriptor.id.clone()),
            self_ref: self_ref.clone(),
            state: Mutex::new(IncomingStreamState {
                transport: Some(transport),
                receiver: Some(receiver),
                tracks: IndexMap::new(),
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

    /// Resolve and register a new track.
    ///
    /// Returns `Ok(None)` without side effects when the id is already
    /// present or the stream is stopped.
    pub fn create_track(&self, descriptor: &TrackDescriptor) -> Result<Option<Arc<IncomingTrack>>> {
        let (track, listeners) = {
            let mut state = self.state.lock();
            let (Some(transport), Some(receiver)) = (
                state.transport.as_ref().and_then(Weak::upgrade),
                state.receiver.clone(),
            ) else {
                debug!(stream_id = %self.id, track_id = %descriptor.id, "Stream stopped, ignoring track");
                return Ok(None);
            };

            let id = TrackId::new(descriptor.id.clone());
            if state.tracks.contains_key(&id) {
                debug!(stream_id = %self.id, track_id = %id, "Track already exists");
                return Ok(None);
            }

            let track = IncomingTrack::build(&transport, receiver, self.self_ref.clone(), descriptor)?;
            state.tracks.insert(id, Arc::clone(&track));
            (track, state.on_track.clone())
        };

        for listener in listeners {
            listener(&track);
        }
        Ok(Some(track))
    }

    /// Adopt a track created outside this stream, taking it from its previous
    /// stream if it had one.
    pub fn add_track(&self, track: Arc<IncomingTrack>) -> Result<()> {
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

    /// Remove `track` from the stream without stopping it.
    pub fn remove_track(&self, track: &IncomingTrack) -> Option<Arc<IncomingTrack>> {
        let removed = self.forget_track(track)?;
        removed.set_stream(Weak::new());
        Some(removed)
    }

    pub(crate) fn forget_track(&self, track: &IncomingTrack) -> Option<Arc<IncomingTrack>> {
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
    pub fn get_track(&self, id: &str) -> Option<Arc<IncomingTrack>> {
        self.state.lock().tracks.get(&TrackId::new(id)).cloned()
    }

    #[must_use]
    pub fn get_tracks(&self) -> Vec<Arc<IncomingTrack>> {
        self.state.lock().tracks.values().cloned().collect()
    }

    fn tracks_of(&self, kind: MediaKind) -> Vec<Arc<IncomingTrack>> {
        self.state
            .lock()
            .tracks
            .values()
            .filter(|t| t.kind() == kind)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn get_audio_tracks(&self) -> Vec<Arc<IncomingTrack>> {
        self.tracks_of(MediaKind::Audio)
    }

    #[must_use]
    pub fn get_video_tracks(&self) -> Vec<Arc<IncomingTrack>> {
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

    /// Called synchronously for every track created or added afterwards.
    pub fn on_track(&self, callback: impl Fn(&Arc<IncomingTrack>) + Send + Sync + 'static) {
        self.state.lock().on_track.push(Arc::new(callback));
    }

    pub fn on_stop(&self, callback: impl Fn(&StreamId) + Send + Sync + 'static) {
        self.state.lock().on_stop.push(Arc::new(callback));
    }

    /// Stop every track, release the receive endpoint and leave the
    /// transport. Idempotent.
    pub fn stop(&self) {
        let (transport, tracks, on_stop) = {
            let mut state = self.state.lock();
            let Some(transport) = state.transport.take() else {
                return;
            };
            state.receiver = None;
            state.on_track.clear();
            let tracks: Vec<_> = state.tracks.drain(..).map(|(_, t)| t).collect();
            (transport, tracks, std::mem::take(&mut state.on_stop))
        };

        for track in &tracks {
            track.stop();
        }
        if let (Some(transport), Some(this)) = (transport.upgrade(), self.self_ref.upgrade()) {
            transport.forget_incoming_stream(&this);
        }
        for callback in on_stop {
            callback(&self.id);
        }

        info!(stream_id = %self.id, tracks = tracks.len(), "Incoming stream stopped");
    }
}

impl std::fmt::Debug for IncomingStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingStream")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
