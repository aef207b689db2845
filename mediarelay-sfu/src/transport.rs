//! Per-session dispatch endpoint
//!
//! Owns the ssrc dispatch tables for both directions and the streams created
//! on the session. The RTP engine feeds packets and RTCP feedback in through
//! the `dispatch_*` methods; rewritten packets leave through the
//! [`MediaSink`] it was built with.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};

use crate::clock::Clock;
use crate::config::SfuConfig;
use crate::descriptor::StreamDescriptor;
use crate::error::{Error, Result};
use crate::incoming_stream::IncomingStream;
use crate::outgoing_stream::OutgoingStream;
use crate::packet::RtpPacket;
use crate::sink::MediaSink;
use crate::source_group::{IncomingSourceGroup, OutgoingSourceGroup};
use crate::stats::RemoteReport;
use crate::types::StreamId;

pub struct Transport {
    config: Arc<SfuConfig>,
    clock: Arc<dyn Clock>,
    output: Arc<dyn MediaSink>,
    self_ref: Weak<Self>,

    incoming: DashMap<u32, Arc<IncomingSourceGroup>>,
    outgoing: DashMap<u32, Arc<OutgoingSourceGroup>>,
    /// Registered group count; held across check-and-insert so batches are atomic
    registration: Mutex<usize>,

    incoming_streams: DashMap<StreamId, Arc<IncomingStream>>,
    outgoing_streams: DashMap<StreamId, Arc<OutgoingStream>>,

    stopped: AtomicBool,
    unknown_ssrc_packets: AtomicU64,
}

impl Transport {
    pub fn new(config: SfuConfig, clock: Arc<dyn Clock>, output: Arc<dyn MediaSink>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config: Arc::new(config),
            clock,
            output,
            self_ref: self_ref.clone(),
            incoming: DashMap::new(),
            outgoing: DashMap::new(),
            registration: Mutex::new(0),
            incoming_streams: DashMap::new(),
            outgoing_streams: DashMap::new(),
            stopped: AtomicBool::new(false),
            unknown_ssrc_packets: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub(crate) fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// This transport as the sink for rewritten packets, without keeping it alive
    pub(crate) fn sink_ref(&self) -> Weak<dyn MediaSink> {
        self.self_ref.clone()
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Create an incoming stream and every track its descriptor lists.
    pub fn create_incoming_stream(&self, descriptor: &StreamDescriptor) -> Result<Arc<IncomingStream>> {
        let id = StreamId::new(descriptor.id.clone());
        self.ensure_stream_slot(&id, self.incoming_streams.contains_key(&id))?;

        let stream = IncomingStream::new(self.self_ref.clone(), self.sink_ref(), descriptor)?;
        let inserted = match self.incoming_streams.entry(id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&stream));
                true
            }
        };
        // The entry guard is released before stopping, stop() removes from the map
        if !inserted {
            stream.stop();
            return Err(Error::DuplicateId(format!("stream {id}")));
        }
        if self.is_stopped() {
            stream.stop();
            return Err(Error::StaleReference("transport is stopped".to_string()));
        }

        info!(stream_id = %id, tracks = stream.get_tracks().len(), "Incoming stream created");
        Ok(stream)
    }

    pub fn create_outgoing_stream(&self, descriptor: &StreamDescriptor) -> Result<Arc<OutgoingStream>> {
        let id = StreamId::new(descriptor.id.clone());
        self.ensure_stream_slot(&id, self.outgoing_streams.contains_key(&id))?;

        let stream = OutgoingStream::new(self.self_ref.clone(), descriptor)?;
        let inserted = match self.outgoing_streams.entry(id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&stream));
                true
            }
        };
        // The entry guard is released before stopping, stop() removes from the map
        if !inserted {
            stream.stop();
            return Err(Error::DuplicateId(format!("stream {id}")));
        }
        if self.is_stopped() {
            stream.stop();
            return Err(Error::StaleReference("transport is stopped".to_string()));
        }

        info!(stream_id = %id, tracks = stream.get_tracks().len(), "Outgoing stream created");
        Ok(stream)
    }

    fn ensure_stream_slot(&self, id: &StreamId, taken: bool) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::StaleReference("transport is stopped".to_string()));
        }
        if taken {
            debug!(stream_id = %id, "Stream id already in use");
            return Err(Error::DuplicateId(format!("stream {id}")));
        }
        Ok(())
    }

    #[must_use]
    pub fn incoming_stream(&self, id: &StreamId) -> Option<Arc<IncomingStream>> {
        self.incoming_streams.get(id).map(|s| Arc::clone(s.value()))
    }

    #[must_use]
    pub fn outgoing_stream(&self, id: &StreamId) -> Option<Arc<OutgoingStream>> {
        self.outgoing_streams.get(id).map(|s| Arc::clone(s.value()))
    }

    #[must_use]
    pub fn incoming_streams(&self) -> Vec<Arc<IncomingStream>> {
        self.incoming_streams.iter().map(|s| Arc::clone(s.value())).collect()
    }

    #[must_use]
    pub fn outgoing_streams(&self) -> Vec<Arc<OutgoingStream>> {
        self.outgoing_streams.iter().map(|s| Arc::clone(s.value())).collect()
    }

    pub(crate) fn forget_incoming_stream(&self, stream: &Arc<IncomingStream>) {
        self.incoming_streams
            .remove_if(stream.id(), |_, s| Arc::ptr_eq(s, stream));
    }

    pub(crate) fn forget_outgoing_stream(&self, stream: &Arc<OutgoingStream>) {
        self.outgoing_streams
            .remove_if(stream.id(), |_, s| Arc::ptr_eq(s, stream));
    }

    fn check_capacity(&self, registered: usize, adding: usize) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::StaleReference("transport is stopped".to_string()));
        }
        let max = self.config.dispatch.max_source_groups;
        if max > 0 && registered + adding > max {
            warn!(registered, adding, max, "Source group limit reached");
            return Err(Error::ResourceExhaustion(format!(
                "cannot register {adding} more source group(s), limit is {max}"
            )));
        }
        Ok(())
    }

    /// Register a batch of incoming groups. Either all are registered or none.
    pub(crate) fn register_incoming(&self, groups: &[Arc<IncomingSourceGroup>]) -> Result<()> {
        let mut registered = self.registration.lock();
        self.check_capacity(*registered, groups.len())?;

        let mut claimed: Vec<u32> = Vec::new();
        for ssrc in groups.iter().flat_map(|g| g.ssrcs()) {
            if self.incoming.contains_key(&ssrc) || claimed.contains(&ssrc) {
                warn!(ssrc, "Incoming ssrc already registered");
                return Err(Error::SsrcConflict(ssrc));
            }
            claimed.push(ssrc);
        }

        for group in groups {
            for ssrc in group.ssrcs() {
                self.incoming.insert(ssrc, Arc::clone(group));
            }
        }
        *registered += groups.len();
        debug!(groups = groups.len(), ssrcs = ?claimed, "Registered incoming source groups");
        Ok(())
    }

    pub(crate) fn unregister_incoming(&self, groups: &[Arc<IncomingSourceGroup>]) {
        let mut registered = self.registration.lock();
        for group in groups {
            let mut removed = false;
            for ssrc in group.ssrcs() {
                removed |= self
                    .incoming
                    .remove_if(&ssrc, |_, g| Arc::ptr_eq(g, group))
                    .is_some();
            }
            if removed {
                *registered = registered.saturating_sub(1);
            }
        }
    }

    pub(crate) fn register_outgoing(&self, groups: &[Arc<OutgoingSourceGroup>]) -> Result<()> {
        let mut registered = self.registration.lock();
        self.check_capacity(*registered, groups.len())?;

        let mut claimed: Vec<u32> = Vec::new();
        for ssrc in groups.iter().flat_map(|g| g.ssrcs()) {
            if self.outgoing.contains_key(&ssrc) || claimed.contains(&ssrc) {
                warn!(ssrc, "Outgoing ssrc already registered");
                return Err(Error::SsrcConflict(ssrc));
            }
            claimed.push(ssrc);
        }

        for group in groups {
            for ssrc in group.ssrcs() {
                self.outgoing.insert(ssrc, Arc::clone(group));
            }
        }
        *registered += groups.len();
        debug!(groups = groups.len(), ssrcs = ?claimed, "Registered outgoing source groups");
        Ok(())
    }

    pub(crate) fn unregister_outgoing(&self, groups: &[Arc<OutgoingSourceGroup>]) {
        let mut registered = self.registration.lock();
        for group in groups {
            let mut removed = false;
            for ssrc in group.ssrcs() {
                removed |= self
                    .outgoing
                    .remove_if(&ssrc, |_, g| Arc::ptr_eq(g, group))
                    .is_some();
            }
            if removed {
                *registered = registered.saturating_sub(1);
            }
        }
    }

    #[must_use]
    pub fn registered_group_count(&self) -> usize {
        *self.registration.lock()
    }

    #[must_use]
    pub fn incoming_group(&self, ssrc: u32) -> Option<Arc<IncomingSourceGroup>> {
        self.incoming.get(&ssrc).map(|g| Arc::clone(g.value()))
    }

    #[must_use]
    pub fn outgoing_group(&self, ssrc: u32) -> Option<Arc<OutgoingSourceGroup>> {
        self.outgoing.get(&ssrc).map(|g| Arc::clone(g.value()))
    }

    /// Packets dropped because no group claimed their ssrc
    #[must_use]
    pub fn unknown_ssrc_packets(&self) -> u64 {
        self.unknown_ssrc_packets.load(Ordering::Relaxed)
    }

    /// Route one received RTP packet to the group owning its ssrc.
    ///
    /// Returns false when the ssrc is unknown and the packet was dropped.
    pub fn dispatch_rtp(&self, packet: &RtpPacket) -> bool {
        // Clone out so the shard lock is not held while forwarding
        let Some(group) = self.incoming_group(packet.ssrc) else {
            self.unknown_ssrc_packets.fetch_add(1, Ordering::Relaxed);
            trace!(ssrc = packet.ssrc, "Dropping packet for unknown ssrc");
            return false;
        };
        group.on_packet(self.clock.now_ms(), packet).is_some()
    }

    /// The remote receiver asked for a keyframe on one of our outgoing ssrcs.
    pub fn dispatch_pli(&self, ssrc: u32) -> bool {
        match self.outgoing_group(ssrc) {
            Some(group) => {
                debug!(ssrc, "Keyframe requested by remote receiver");
                group.request_keyframe();
                true
            }
            None => false,
        }
    }

    pub fn dispatch_rtt(&self, ssrc: u32, rtt_ms: u32) -> bool {
        match self.incoming_group(ssrc) {
            Some(group) => {
                group.set_rtt(rtt_ms);
                true
            }
            None => false,
        }
    }

    /// Record a receiver report block the remote sent about an outgoing ssrc.
    pub fn dispatch_receiver_report(
        &self,
        ssrc: u32,
        fraction_lost: u8,
        total_lost: u32,
        jitter: u32,
    ) -> bool {
        match self.outgoing_group(ssrc) {
            Some(group) => {
                group.record_remote_report(RemoteReport {
                    fraction_lost,
                    total_lost,
                    jitter,
                    received_at_ms: self.clock.now_ms(),
                });
                true
            }
            None => false,
        }
    }

    /// Close the receiver-report interval on every registered source.
    pub fn close_report_interval(&self) {
        let incoming: Vec<_> = self
            .incoming
            .iter()
            .filter(|e| *e.key() == e.value().media().ssrc())
            .map(|e| Arc::clone(e.value()))
            .collect();
        let outgoing: Vec<_> = self
            .outgoing
            .iter()
            .filter(|e| *e.key() == e.value().media().ssrc())
            .map(|e| Arc::clone(e.value()))
            .collect();

        for group in &incoming {
            group.close_report_interval();
        }
        for group in &outgoing {
            group.close_report_interval();
        }
        trace!(incoming = incoming.len(), outgoing = outgoing.len(), "Closed report interval");
    }

    /// Stop every stream and refuse further registrations. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        // Outgoing first so transponders detach before their sources go away
        let outgoing = self.outgoing_streams();
        let incoming = self.incoming_streams();
        for stream in &outgoing {
            stream.stop();
        }
        for stream in &incoming {
            stream.stop();
        }
        self.outgoing_streams.clear();
        self.incoming_streams.clear();

        info!(
            incoming = incoming.len(),
            outgoing = outgoing.len(),
            "Transport stopped"
        );
    }
}

impl MediaSink for Transport {
    fn send(&self, packet: RtpPacket) {
        if self.is_stopped() {
            return;
        }
        if let Some(group) = self.outgoing_group(packet.ssrc) {
            group.record_sent(self.clock.now_ms(), &packet);
        }
        self.output.send(packet);
    }

    fn send_pli(&self, ssrc: u32) {
        if self.is_stopped() {
            return;
        }
        self.output.send_pli(ssrc);
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("incoming_ssrcs", &self.incoming.len())
            .field("outgoing_ssrcs", &self.outgoing.len())
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ResolvedGroup;
    use crate::test_helpers::{test_transport, test_transport_with};
    use crate::types::MediaKind;

    fn group(media: u32, rtx: u32) -> Arc<IncomingSourceGroup> {
        let resolved = ResolvedGroup {
            key: String::new(),
            rid: None,
            mid: None,
            media_ssrc: media,
            rtx_ssrc: rtx,
            fec_ssrc: 0,
        };
        Arc::new(IncomingSourceGroup::new(
            MediaKind::Video,
            &resolved,
            &SfuConfig::default(),
        ))
    }

    #[test]
    fn test_register_routes_every_role() {
        let (transport, _clock, _rx) = test_transport();
        let g = group(1111, 2222);
        transport.register_incoming(&[Arc::clone(&g)]).unwrap();

        assert!(transport.dispatch_rtp(&RtpPacket::new(1111, 1, 0, vec![])));
        assert!(transport.dispatch_rtp(&RtpPacket::new(2222, 1, 0, vec![])));
        assert!(!transport.dispatch_rtp(&RtpPacket::new(3333, 1, 0, vec![])));
        assert_eq!(transport.unknown_ssrc_packets(), 1);
        assert_eq!(g.get_stats(0).rtx.packets, 1);
        assert_eq!(transport.registered_group_count(), 1);
    }

    #[test]
    fn test_conflicting_batch_registers_nothing() {
        let (transport, _clock, _rx) = test_transport();
        transport.register_incoming(&[group(1, 0)]).unwrap();

        let err = transport
            .register_incoming(&[group(5, 0), group(6, 1)])
            .unwrap_err();
        assert!(matches!(err, Error::SsrcConflict(1)));
        assert!(transport.incoming_group(5).is_none());
        assert_eq!(transport.registered_group_count(), 1);
    }

    #[test]
    fn test_unregister_only_removes_own_entries() {
        let (transport, _clock, _rx) = test_transport();
        let a = group(1, 2);
        transport.register_incoming(&[Arc::clone(&a)]).unwrap();

        // A group that was never registered must not evict `a`
        transport.unregister_incoming(&[group(1, 0)]);
        assert!(transport.incoming_group(1).is_some());

        transport.unregister_incoming(&[Arc::clone(&a)]);
        transport.unregister_incoming(&[a]);
        assert!(transport.incoming_group(1).is_none());
        assert!(transport.incoming_group(2).is_none());
        assert_eq!(transport.registered_group_count(), 0);
    }

    #[test]
    fn test_capacity_limit() {
        let mut config = SfuConfig::default();
        config.dispatch.max_source_groups = 2;
        let (transport, _clock, _rx) = test_transport_with(config);

        transport.register_incoming(&[group(1, 0), group(2, 0)]).unwrap();
        let err = transport.register_incoming(&[group(3, 0)]).unwrap_err();
        assert!(matches!(err, Error::ResourceExhaustion(_)));
    }

    #[test]
    fn test_rtt_and_unknown_feedback() {
        let (transport, _clock, _rx) = test_transport();
        let g = group(10, 0);
        transport.register_incoming(&[Arc::clone(&g)]).unwrap();

        assert!(transport.dispatch_rtt(10, 55));
        assert_eq!(g.rtt_ms(), Some(55));
        assert!(!transport.dispatch_rtt(11, 55));
        assert!(!transport.dispatch_pli(10));
        assert!(!transport.dispatch_receiver_report(10, 0, 0, 0));
    }

    #[test]
    fn test_stopped_transport_refuses_registration() {
        let (transport, _clock, _rx) = test_transport();
        transport.stop();
        transport.stop();
        assert!(transport.is_stopped());
        let err = transport.register_incoming(&[group(1, 0)]).unwrap_err();
        assert!(matches!(err, Error::StaleReference(_)));
        assert!(transport
            .create_incoming_stream(&StreamDescriptor::new("s"))
            .is_err());
    }
}
