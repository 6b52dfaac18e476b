use crate::channel::InboundQueue;
use crate::packet::{Packet, PacketType};
use crate::send_pipeline::SendPipeline;
use crate::stats::NetStats;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

struct PendingPacket {
    body: Vec<u8>,
    sent_at: Instant,
    resend_count: u32,
}

/// Result of a retransmission scan.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ScanOutcome {
    Alive,
    /// a pending packet exhausted its resend budget - the connection is dead and the
    ///  caller must apply the timeout transition
    PeerDead,
}

/// Guaranteed, ordered delivery: every sent packet is retained until acknowledged and
///  retransmitted with a bounded budget; received packets are acked immediately and
///  released to the application strictly in sequence order.
pub struct ReliableChannel {
    peer_addr: SocketAddr,
    pipeline: Arc<SendPipeline>,
    stats: Arc<NetStats>,
    next_sequence: AtomicU16,
    inbound: Mutex<InboundQueue>,
    /// sent but not yet acknowledged, keyed by sequence
    pending_ack: Mutex<BTreeMap<u16, PendingPacket>>,
}

impl ReliableChannel {
    pub fn new(
        peer_addr: SocketAddr,
        pipeline: Arc<SendPipeline>,
        stats: Arc<NetStats>,
        jitter_buffer_hold: Duration,
    ) -> ReliableChannel {
        ReliableChannel {
            peer_addr,
            pipeline,
            stats,
            next_sequence: AtomicU16::new(0),
            inbound: Mutex::new(InboundQueue::new(jitter_buffer_hold)),
            pending_ack: Mutex::new(BTreeMap::new()),
        }
    }

    pub async fn send(&self, payload: Vec<u8>, now: Instant) {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let packet = Packet::with_body(PacketType::Reliable, sequence, payload);

        self.pending_ack.lock().unwrap().insert(
            sequence,
            PendingPacket {
                body: packet.body.clone(),
                sent_at: now,
                resend_count: 0,
            },
        );

        debug!("{:?}: sending reliable packet {}", self.peer_addr, sequence);
        self.stats.reliable.record_sent(packet.wire_len());
        self.pipeline.send_packet(self.peer_addr, &packet).await;
    }

    /// A reliable data packet is always acknowledged, duplicates included - a
    ///  retransmission means the sender has not seen our earlier ack.
    pub async fn on_packet(&self, sequence: u16, body: Vec<u8>, now: Instant) {
        trace!("{:?}: sending ack for {}", self.peer_addr, sequence);
        let ack = Packet::new(PacketType::Ack, sequence);
        self.stats.internal.record_sent(ack.wire_len());
        self.pipeline.send_packet(self.peer_addr, &ack).await;

        if !self.inbound.lock().unwrap().offer(sequence, body, now) {
            trace!(
                "{:?}: reliable packet {} already delivered or buffered - ack resent, not re-delivering",
                self.peer_addr,
                sequence
            );
        }
    }

    /// An ack for a sequence that is not pending (already acked, or never sent) is a
    ///  no-op, not an error.
    pub fn on_ack(&self, sequence: u16) {
        if self.pending_ack.lock().unwrap().remove(&sequence).is_none() {
            trace!("{:?}: ack for unknown sequence {}", self.peer_addr, sequence);
        } else {
            trace!("{:?}: got ack for {}", self.peer_addr, sequence);
        }
    }

    /// Walks pending packets in wrap-aware ascending sequence order - earlier sequence
    ///  means earlier send time, so the walk stops at the first entry younger than
    ///  `resend_delay`. Every expired entry counts as one lost packet. An entry that
    ///  reaches the resend budget declares the connection dead; otherwise it is
    ///  resent unchanged under a fresh timestamp, relying on the receiver's duplicate
    ///  suppression.
    pub async fn retransmit_scan(
        &self,
        resend_delay: Duration,
        max_resend_attempts: u32,
        now: Instant,
    ) -> ScanOutcome {
        let mut to_resend = Vec::new();
        {
            let mut pending = self.pending_ack.lock().unwrap();

            // all pending sequences are behind next_sequence, so starting the range
            //  there puts wrapped-around (oldest) entries first
            let anchor = self.next_sequence.load(Ordering::Relaxed);
            let ordered: Vec<u16> = pending
                .range(anchor..)
                .chain(pending.range(..anchor))
                .map(|(&seq, _)| seq)
                .collect();

            for sequence in ordered {
                let entry = pending
                    .get_mut(&sequence)
                    .expect("sequence collected from the map above");
                if now.saturating_duration_since(entry.sent_at) < resend_delay {
                    break;
                }

                // no ack within the resend delay: packet loss
                self.stats.record_lost(1);
                entry.resend_count += 1;

                if entry.resend_count >= max_resend_attempts {
                    debug!(
                        "{:?}: reliable packet {} exhausted its resend budget of {}",
                        self.peer_addr, sequence, max_resend_attempts
                    );
                    return ScanOutcome::PeerDead;
                }

                entry.sent_at = now;
                to_resend.push(Packet::with_body(
                    PacketType::Reliable,
                    sequence,
                    entry.body.clone(),
                ));
            }
        }

        for packet in to_resend {
            debug!(
                "{:?}: re-sending reliable packet {}",
                self.peer_addr, packet.sequence
            );
            self.stats.reliable.record_sent(packet.wire_len());
            self.pipeline.send_packet(self.peer_addr, &packet).await;
        }
        ScanOutcome::Alive
    }

    /// Strict in-order release once the jitter hold has elapsed; a missing sequence
    ///  blocks everything behind it until its retransmission arrives.
    pub fn try_poll(&self, now: Instant) -> Option<Vec<u8>> {
        self.inbound.lock().unwrap().poll_ordered(now)
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending_ack.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::send_pipeline::MockSendSocket;

    const HOLD: Duration = Duration::from_millis(20);
    const RESEND_DELAY: Duration = Duration::from_millis(100);

    fn test_channel(socket: MockSendSocket) -> (ReliableChannel, Arc<NetStats>) {
        let stats = Arc::new(NetStats::default());
        let channel = ReliableChannel::new(
            SocketAddr::from(([127, 0, 0, 1], 9)),
            Arc::new(SendPipeline::new(Arc::new(socket))),
            stats.clone(),
            HOLD,
        );
        (channel, stats)
    }

    fn expect_acks(socket: &mut MockSendSocket, count: usize) {
        socket
            .expect_do_send_packet()
            .times(count)
            .withf(|_, buf| buf[0] == PacketType::Ack as u8)
            .return_const(());
    }

    #[tokio::test]
    async fn test_in_order_delivery_without_loss() {
        let mut socket = MockSendSocket::new();
        expect_acks(&mut socket, 3);
        let (channel, _) = test_channel(socket);
        let base = Instant::now();

        // arrival order 1, 0, 2
        channel.on_packet(1, vec![1], base).await;
        channel.on_packet(0, vec![0], base).await;
        channel.on_packet(2, vec![2], base).await;

        let now = base + HOLD;
        let mut delivered = Vec::new();
        while let Some(body) = channel.try_poll(now) {
            delivered.push(body);
        }
        assert_eq!(delivered, vec![vec![0], vec![1], vec![2]]);
    }

    #[tokio::test]
    async fn test_duplicate_acked_but_not_redelivered() {
        let mut socket = MockSendSocket::new();
        // both the original and the replay are acked
        expect_acks(&mut socket, 2);
        let (channel, stats) = test_channel(socket);
        let base = Instant::now();

        channel.on_packet(0, vec![0], base).await;
        assert_eq!(channel.try_poll(base + HOLD), Some(vec![0]));

        channel.on_packet(0, vec![0], base + HOLD).await;
        assert_eq!(channel.try_poll(base + Duration::from_secs(1)), None);
        assert_eq!(stats.lost_packets(), 0);
    }

    #[tokio::test]
    async fn test_ack_clears_pending() {
        let mut socket = MockSendSocket::new();
        socket.expect_do_send_packet().times(2).return_const(());
        let (channel, _) = test_channel(socket);
        let now = Instant::now();

        channel.send(vec![1], now).await;
        channel.send(vec![2], now).await;
        assert_eq!(channel.pending_len(), 2);

        channel.on_ack(0);
        assert_eq!(channel.pending_len(), 1);

        // unknown sequence: no-op
        channel.on_ack(55);
        assert_eq!(channel.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_scan_leaves_young_packets_alone() {
        let mut socket = MockSendSocket::new();
        socket.expect_do_send_packet().times(1).return_const(());
        let (channel, stats) = test_channel(socket);
        let base = Instant::now();

        channel.send(vec![1], base).await;

        let outcome = channel
            .retransmit_scan(RESEND_DELAY, 3, base + Duration::from_millis(50))
            .await;
        assert_eq!(outcome, ScanOutcome::Alive);
        assert_eq!(stats.snapshot().reliable.sent_packets, 1);
        assert_eq!(stats.lost_packets(), 0);
    }

    #[tokio::test]
    async fn test_resend_budget_of_n_resends_n_minus_one_times() {
        let mut socket = MockSendSocket::new();
        // 1 initial send + exactly 2 resends for a budget of 3
        socket
            .expect_do_send_packet()
            .times(3)
            .withf(|_, buf| buf[0] == PacketType::Reliable as u8)
            .return_const(());
        let (channel, stats) = test_channel(socket);
        let base = Instant::now();

        channel.send(vec![1], base).await;

        let mut now = base;
        for _ in 0..2 {
            now += RESEND_DELAY;
            assert_eq!(
                channel.retransmit_scan(RESEND_DELAY, 3, now).await,
                ScanOutcome::Alive
            );
        }

        now += RESEND_DELAY;
        assert_eq!(
            channel.retransmit_scan(RESEND_DELAY, 3, now).await,
            ScanOutcome::PeerDead
        );
        assert_eq!(stats.lost_packets(), 3);
    }

    #[tokio::test]
    async fn test_ack_after_resend_stops_retransmission() {
        let mut socket = MockSendSocket::new();
        socket.expect_do_send_packet().times(2).return_const(());
        let (channel, _) = test_channel(socket);
        let base = Instant::now();

        channel.send(vec![1], base).await;
        assert_eq!(
            channel
                .retransmit_scan(RESEND_DELAY, 5, base + RESEND_DELAY)
                .await,
            ScanOutcome::Alive
        );

        channel.on_ack(0);
        assert_eq!(channel.pending_len(), 0);
        assert_eq!(
            channel
                .retransmit_scan(RESEND_DELAY, 5, base + Duration::from_secs(60))
                .await,
            ScanOutcome::Alive
        );
    }

    #[tokio::test]
    async fn test_scan_stops_at_first_young_entry() {
        let mut socket = MockSendSocket::new();
        // 2 initial sends + 1 resend of the older packet only
        socket.expect_do_send_packet().times(3).return_const(());
        let (channel, stats) = test_channel(socket);
        let base = Instant::now();

        channel.send(vec![1], base).await;
        channel.send(vec![2], base + Duration::from_millis(80)).await;

        // sequence 0 is expired, sequence 1 is 20ms short of the delay
        assert_eq!(
            channel
                .retransmit_scan(RESEND_DELAY, 5, base + Duration::from_millis(150))
                .await,
            ScanOutcome::Alive
        );
        assert_eq!(stats.lost_packets(), 1);
    }
}
