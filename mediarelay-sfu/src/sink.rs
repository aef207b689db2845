//! Output seam towards the RTP engine

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::warn;

use crate::packet::RtpPacket;

/// Where rewritten packets and keyframe requests go
pub trait MediaSink: Send + Sync {
    /// Called on the packet path with the forwarding transponder locked.
    /// Must not block or call back into tracks or transponders.
    fn send(&self, packet: RtpPacket);

    /// Ask the sender of `ssrc` for a keyframe.
    fn send_pli(&self, ssrc: u32);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Rtp(RtpPacket),
    Pli(u32),
}

/// Sink that hands events to an async consumer over a bounded channel.
///
/// The packet path never blocks: when the channel is full the event is
/// dropped and counted.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<SinkEvent>,
    dropped: AtomicU64,
}

impl ChannelSink {
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SinkEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn push(&self, event: SinkEvent) {
        if let Err(e) = self.tx.try_send(event) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                warn!(dropped, error = %e, "Output channel rejected event");
            }
        }
    }
}

impl MediaSink for ChannelSink {
    fn send(&self, packet: RtpPacket) {
        self.push(SinkEvent::Rtp(packet));
    }

    fn send_pli(&self, ssrc: u32) {
        self.push(SinkEvent::Pli(ssrc));
    }
}
