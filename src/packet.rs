use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use num_enum::TryFromPrimitive;

/// The type tag of a packet, determining how the receiving peer routes it and whether
///  its sequence number is meaningful.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Unreliable = 0,
    Reliable = 1,

    ConnectionRequest = 10,
    ConnectionAccept = 11,
    ConnectionReject = 12,

    Disconnect = 20,

    Ack = 100,

    Ping = 200,
    Pong = 201,

    Debug = 255,
}

/// The minimal on-wire unit: a type tag, a 16-bit sequence number and an opaque body.
///
/// Sequence numbers are per channel and per direction - a sequence number is only
///  meaningful relative to other packets of the same type from the same sender.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub sequence: u16,
    pub body: Vec<u8>,
}

impl Packet {
    /// type tag (u8) + sequence (u16 BE). Datagrams shorter than this are invalid.
    pub const HEADER_SIZE: usize = 3;

    pub fn new(packet_type: PacketType, sequence: u16) -> Packet {
        Packet {
            packet_type,
            sequence,
            body: Vec::new(),
        }
    }

    pub fn with_body(packet_type: PacketType, sequence: u16, body: Vec<u8>) -> Packet {
        Packet {
            packet_type,
            sequence,
            body,
        }
    }

    pub fn wire_len(&self) -> usize {
        Self::HEADER_SIZE + self.body.len()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.packet_type as u8);
        buf.put_u16(self.sequence);
        buf.put_slice(&self.body);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Packet> {
        let tag = buf.try_get_u8()?;
        let packet_type = PacketType::try_from_primitive(tag)
            .map_err(|_| anyhow!("unknown packet type tag {}", tag))?;
        let sequence = buf.try_get_u16()?;

        let mut body = vec![0u8; buf.remaining()];
        buf.copy_to_slice(&mut body);

        Ok(Packet {
            packet_type,
            sequence,
            body,
        })
    }
}
