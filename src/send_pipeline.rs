use crate::packet::Packet;
use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)]
use mockall::automock;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, error, trace};

/// Abstraction for sending a serialized packet on a UDP socket, introduced to
///  facilitate mocking the I/O part away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]);

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        trace!("UDP socket: sending packet to {:?}", to);

        if let Err(e) = self.send_to(packet_buf, to).await {
            match e.kind() {
                // expected when the remote side went away; the timeout machinery
                //  handles the peer itself
                ErrorKind::ConnectionReset | ErrorKind::HostUnreachable => {
                    debug!("peer {:?} unreachable: {}", to, e)
                }
                _ => error!("error sending UDP packet to {:?}: {}", to, e),
            }
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref()
            .local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}

/// Serializes packets into a per-call scratch buffer and hands them to the socket.
#[derive(Clone)]
pub struct SendPipeline {
    socket: Arc<dyn SendSocket>,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>) -> SendPipeline {
        SendPipeline { socket }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub async fn send_packet(&self, to: SocketAddr, packet: &Packet) {
        let mut buf = BytesMut::with_capacity(packet.wire_len());
        packet.ser(&mut buf);

        trace!(
            "sending {:?} packet ({} bytes) to {:?}",
            packet.packet_type,
            buf.len(),
            to
        );
        self.socket.do_send_packet(to, &buf).await;
    }
}
