use crate::channel::InboundQueue;
use crate::packet::{Packet, PacketType};
use crate::send_pipeline::SendPipeline;
use crate::stats::NetStats;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Best-effort sequenced delivery: no retransmission, duplicates suppressed, gaps in
///  the released sequence counted as lost packets.
pub struct UnreliableChannel {
    peer_addr: SocketAddr,
    pipeline: Arc<SendPipeline>,
    stats: Arc<NetStats>,
    next_sequence: AtomicU16,
    inbound: Mutex<InboundQueue>,
}

impl UnreliableChannel {
    pub fn new(
        peer_addr: SocketAddr,
        pipeline: Arc<SendPipeline>,
        stats: Arc<NetStats>,
        jitter_buffer_hold: Duration,
    ) -> UnreliableChannel {
        UnreliableChannel {
            peer_addr,
            pipeline,
            stats,
            next_sequence: AtomicU16::new(0),
            inbound: Mutex::new(InboundQueue::new(jitter_buffer_hold)),
        }
    }

    pub async fn send(&self, payload: Vec<u8>) {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let packet = Packet::with_body(PacketType::Unreliable, sequence, payload);

        self.stats.unreliable.record_sent(packet.wire_len());
        self.pipeline.send_packet(self.peer_addr, &packet).await;
    }

    pub fn on_packet(&self, sequence: u16, body: Vec<u8>, now: Instant) {
        if !self.inbound.lock().unwrap().offer(sequence, body, now) {
            trace!(
                "{:?}: dropping duplicate/stale unreliable packet {}",
                self.peer_addr,
                sequence
            );
        }
    }

    /// Releases the next buffered packet once its jitter hold has elapsed. Any gap to
    ///  the previously released sequence is assumed lost and accounted as such.
    pub fn try_poll(&self, now: Instant) -> Option<Vec<u8>> {
        let (gap, body) = self.inbound.lock().unwrap().poll_sequenced(now)?;
        if gap > 0 {
            debug!("{:?}: {} unreliable packet(s) lost", self.peer_addr, gap);
            self.stats.record_lost(gap);
        }
        Some(body)
    }
}
