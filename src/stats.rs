use crate::packet::PacketType;
use std::sync::atomic::{AtomicU64, Ordering};

/// Sent/received counters for one traffic category. Mutated concurrently from the I/O
///  and tick actors, so everything is atomic.
#[derive(Debug, Default)]
pub struct ChannelStats {
    sent_packets: AtomicU64,
    sent_bytes: AtomicU64,
    received_packets: AtomicU64,
    received_bytes: AtomicU64,
}

impl ChannelStats {
    pub fn record_sent(&self, wire_len: usize) {
        self.sent_packets.fetch_add(1, Ordering::Relaxed);
        self.sent_bytes.fetch_add(wire_len as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, wire_len: usize) {
        self.received_packets.fetch_add(1, Ordering::Relaxed);
        self.received_bytes.fetch_add(wire_len as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ChannelStatsSnapshot {
        ChannelStatsSnapshot {
            sent_packets: self.sent_packets.load(Ordering::Relaxed),
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            received_packets: self.received_packets.load(Ordering::Relaxed),
            received_bytes: self.received_bytes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct ChannelStatsSnapshot {
    pub sent_packets: u64,
    pub sent_bytes: u64,
    pub received_packets: u64,
    pub received_bytes: u64,
}

impl std::ops::AddAssign for ChannelStatsSnapshot {
    fn add_assign(&mut self, rhs: ChannelStatsSnapshot) {
        self.sent_packets += rhs.sent_packets;
        self.sent_bytes += rhs.sent_bytes;
        self.received_packets += rhs.received_packets;
        self.received_bytes += rhs.received_bytes;
    }
}

/// Per-peer statistics: one counter block per traffic category plus lost packets.
///  'internal' covers handshake, ping/pong, ack and disconnect traffic.
#[derive(Debug, Default)]
pub struct NetStats {
    pub reliable: ChannelStats,
    pub unreliable: ChannelStats,
    pub internal: ChannelStats,
    lost_packets: AtomicU64,
}

impl NetStats {
    pub fn for_packet_type(&self, packet_type: PacketType) -> &ChannelStats {
        match packet_type {
            PacketType::Reliable => &self.reliable,
            PacketType::Unreliable => &self.unreliable,
            _ => &self.internal,
        }
    }

    pub fn record_lost(&self, count: u64) {
        self.lost_packets.fetch_add(count, Ordering::Relaxed);
    }

    pub fn lost_packets(&self) -> u64 {
        self.lost_packets.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> NetStatsSnapshot {
        NetStatsSnapshot {
            reliable: self.reliable.snapshot(),
            unreliable: self.unreliable.snapshot(),
            internal: self.internal.snapshot(),
            lost_packets: self.lost_packets(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct NetStatsSnapshot {
    pub reliable: ChannelStatsSnapshot,
    pub unreliable: ChannelStatsSnapshot,
    pub internal: ChannelStatsSnapshot,
    pub lost_packets: u64,
}

/// Snapshots add up category by category, so per-peer blocks aggregate into a
///  per-socket total.
impl std::ops::AddAssign for NetStatsSnapshot {
    fn add_assign(&mut self, rhs: NetStatsSnapshot) {
        self.reliable += rhs.reliable;
        self.unreliable += rhs.unreliable;
        self.internal += rhs.internal;
        self.lost_packets += rhs.lost_packets;
    }
}
