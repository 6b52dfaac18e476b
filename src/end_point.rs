use crate::atomic_map::AtomicMap;
use crate::config::{NetConfig, Role};
use crate::events::{AcceptAll, ConnectResult, ConnectionGate, PeerEvent};
use crate::packet::Packet;
use crate::peer::Peer;
use crate::send_pipeline::SendPipeline;
use crate::stats::NetStatsSnapshot;
use anyhow::bail;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, span, warn, Instrument, Level};
use uuid::Uuid;

/// Normalizes IPv4-mapped IPv6 addresses to plain IPv4 so a remote never appears
///  under two different registry keys.
fn canonical(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(addr.ip().to_canonical(), addr.port())
}

/// EndPoint is where the parts of the protocol come together: it listens on a
///  UdpSocket, dispatching incoming packets to their peers, drives all peers'
///  periodic housekeeping, and has the API for application code to connect and
///  send messages.
pub struct EndPoint {
    receive_socket: Arc<UdpSocket>,
    pipeline: Arc<SendPipeline>,
    peers: AtomicMap<SocketAddr, Arc<Peer>>,
    role: Role,
    config: Arc<NetConfig>,
    gate: Arc<dyn ConnectionGate>,
    events: mpsc::Sender<PeerEvent>,
}

impl EndPoint {
    /// A client endpoint initiates connections and accepts none, so it carries no
    ///  connection gate.
    pub async fn client(
        bind_addr: SocketAddr,
        config: NetConfig,
    ) -> anyhow::Result<(Arc<EndPoint>, mpsc::Receiver<PeerEvent>)> {
        Self::bound(bind_addr, Role::Client, config, Arc::new(AcceptAll)).await
    }

    /// A server endpoint accepts connections, asking the gate for each request.
    pub async fn server(
        bind_addr: SocketAddr,
        config: NetConfig,
        gate: Arc<dyn ConnectionGate>,
    ) -> anyhow::Result<(Arc<EndPoint>, mpsc::Receiver<PeerEvent>)> {
        Self::bound(bind_addr, Role::Server, config, gate).await
    }

    async fn bound(
        bind_addr: SocketAddr,
        role: Role,
        config: NetConfig,
        gate: Arc<dyn ConnectionGate>,
    ) -> anyhow::Result<(Arc<EndPoint>, mpsc::Receiver<PeerEvent>)> {
        config.validate()?;

        let receive_socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        info!(
            "bound {:?} endpoint to {:?}",
            role,
            receive_socket.local_addr()?
        );

        let (events, event_receiver) = mpsc::channel(config.event_queue_size);

        let end_point = Arc::new(EndPoint {
            pipeline: Arc::new(SendPipeline::new(Arc::new(receive_socket.clone()))),
            receive_socket,
            peers: AtomicMap::new(),
            role,
            config: Arc::new(config),
            gate,
            events,
        });

        tokio::spawn({
            let end_point = end_point.clone();
            async move { end_point.recv_loop().await }
        });
        tokio::spawn({
            let end_point = end_point.clone();
            async move { end_point.tick_loop().await }
        });

        Ok((end_point, event_receiver))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.pipeline.local_addr()
    }

    pub fn peer_stats(&self, peer: SocketAddr) -> Option<NetStatsSnapshot> {
        self.peers.get(&canonical(peer)).map(|p| p.stats_snapshot())
    }

    /// The whole socket's traffic: per-peer statistics aggregated over all
    ///  registered peers.
    pub fn stats(&self) -> NetStatsSnapshot {
        let mut total = NetStatsSnapshot::default();
        for peer in self.peers.snapshot().values() {
            total += peer.stats_snapshot();
        }
        total
    }

    pub fn peer_ping(&self, peer: SocketAddr) -> Option<Duration> {
        self.peers.get(&canonical(peer)).map(|p| p.current_ping())
    }

    fn get_or_add_peer(&self, peer_addr: SocketAddr) -> Arc<Peer> {
        if let Some(peer) = self.peers.get(&peer_addr) {
            return peer;
        }

        debug!("first contact with {:?}, registering peer", peer_addr);
        self.peers.get_or_insert_with(peer_addr, || {
            Arc::new(Peer::new(
                peer_addr,
                self.role,
                self.config.clone(),
                self.pipeline.clone(),
                self.gate.clone(),
                self.events.clone(),
            ))
        })
    }

    /// Receives datagrams until the socket dies, decoding and routing each one to its
    ///  peer. Malformed datagrams and per-peer failures never end the loop.
    async fn recv_loop(&self) {
        info!("starting receive loop");

        let mut buf = vec![0u8; 0x10000];
        loop {
            let (num_read, from) = match self.receive_socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "packet_received", ?correlation_id);
            let entered = span.enter();

            let from = canonical(from);

            if num_read < Packet::HEADER_SIZE {
                warn!("incomplete packet header from {:?} - dropping", from);
                continue;
            }
            let packet = match Packet::deser(&mut &buf[..num_read]) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("unparsable packet from {:?} - dropping: {}", from, e);
                    continue;
                }
            };

            let peer = self.get_or_add_peer(from);
            drop(entered);
            peer.handle_packet(packet).instrument(span).await;
        }
    }

    async fn tick_loop(&self) {
        let mut ticks = tokio::time::interval(self.config.tick_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticks.tick().await;
            self.tick().await;
        }
    }

    /// One round of housekeeping on every registered peer.
    pub async fn tick(&self) {
        let now = Instant::now();
        for peer in self.peers.snapshot().values() {
            peer.tick(now).await;
        }
    }

    /// Performs the client side of the handshake with a remote endpoint, waiting for
    ///  its answer (or lack thereof) under the configured timeout.
    pub async fn connect(&self, host: &str, port: u16) -> ConnectResult {
        if self.role == Role::Server {
            warn!("connect() called on a server-role endpoint - refusing");
            return ConnectResult::NotAllowed;
        }

        // the resolved address must match the bound socket's family
        let local_is_ipv4 = self.local_addr().is_ipv4();
        let remote = match tokio::net::lookup_host((host, port)).await {
            Ok(addrs) => addrs
                .map(canonical)
                .find(|addr| addr.is_ipv4() == local_is_ipv4),
            Err(e) => {
                debug!("resolving {:?} failed: {}", host, e);
                None
            }
        };
        let Some(remote) = remote else {
            return ConnectResult::HostNotFound;
        };

        info!("connecting to {:?}", remote);
        let peer = self.get_or_add_peer(remote);
        let waiter = match peer.begin_connect().await {
            Ok(waiter) => waiter,
            Err(e) => {
                warn!("{:?}: {}", remote, e);
                return ConnectResult::Error;
            }
        };

        match tokio::time::timeout(self.config.connection_timeout, waiter).await {
            Ok(Ok(accepted)) => {
                let result = peer.finish_connect(accepted);
                if result == ConnectResult::Rejected {
                    self.peers.remove(&remote);
                }
                result
            }
            Ok(Err(_)) | Err(_) => {
                debug!("{:?}: no handshake response", remote);
                peer.connect_timed_out();
                ConnectResult::Timeout
            }
        }
    }

    /// Sends application data to a connected peer on the chosen channel.
    pub async fn send(&self, to: SocketAddr, data: Vec<u8>, reliable: bool) -> anyhow::Result<()> {
        let to = canonical(to);
        let Some(peer) = self.peers.get(&to) else {
            bail!("no peer registered at {:?}", to);
        };
        if !peer.is_connected() {
            bail!("peer {:?} is not connected", to);
        }

        if reliable {
            peer.send_reliable(data).await;
        } else {
            peer.send_unreliable(data).await;
        }
        Ok(())
    }

    /// Tells the remote side we are going away and drops the connection locally. The
    ///  notification is best effort, the remote's timeout covers a lost datagram.
    pub async fn disconnect(&self, peer: SocketAddr) {
        if let Some(peer) = self.peers.get(&canonical(peer)) {
            peer.disconnect().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{DisconnectReason, MockConnectionGate};

    fn test_config() -> NetConfig {
        NetConfig {
            connection_timeout: Duration::from_millis(500),
            ..NetConfig::default()
        }
    }

    fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    async fn next_event(rx: &mut mpsc::Receiver<PeerEvent>) -> PeerEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timeout waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_connect_to_accepting_server() {
        let (server, mut server_events) =
            EndPoint::server(loopback(), test_config(), Arc::new(AcceptAll))
                .await
                .unwrap();
        let (client, mut client_events) = EndPoint::client(loopback(), test_config())
            .await
            .unwrap();

        let result = client
            .connect("127.0.0.1", server.local_addr().port())
            .await;
        assert_eq!(result, ConnectResult::Connected);

        assert_eq!(
            next_event(&mut server_events).await,
            PeerEvent::PeerConnected {
                peer: client.local_addr()
            }
        );
        assert_eq!(
            next_event(&mut client_events).await,
            PeerEvent::PeerConnected {
                peer: server.local_addr()
            }
        );
    }

    #[tokio::test]
    async fn test_connect_to_rejecting_server() {
        let mut gate = MockConnectionGate::new();
        gate.expect_allow_connection().return_const(false);

        let (server, _server_events) = EndPoint::server(loopback(), test_config(), Arc::new(gate))
            .await
            .unwrap();
        let (client, _client_events) = EndPoint::client(loopback(), test_config())
            .await
            .unwrap();

        let server_addr = server.local_addr();
        let result = client.connect("127.0.0.1", server_addr.port()).await;

        assert_eq!(result, ConnectResult::Rejected);
        // a rejected peer is dropped so a later connect starts from scratch
        assert!(client.peer_stats(server_addr).is_none());
    }

    #[tokio::test]
    async fn test_connect_without_server() {
        let (client, _events) = EndPoint::client(loopback(), test_config())
            .await
            .unwrap();

        // discard port, nothing answers
        assert_eq!(client.connect("127.0.0.1", 9).await, ConnectResult::Timeout);
    }

    #[tokio::test]
    async fn test_connect_unresolvable_host() {
        let (client, _events) = EndPoint::client(loopback(), test_config())
            .await
            .unwrap();

        assert_eq!(
            client.connect("host.invalid", 1234).await,
            ConnectResult::HostNotFound
        );
    }

    #[tokio::test]
    async fn test_connect_refused_for_server_role() {
        let (server, _events) = EndPoint::server(loopback(), test_config(), Arc::new(AcceptAll))
            .await
            .unwrap();

        assert_eq!(
            server.connect("127.0.0.1", 1234).await,
            ConnectResult::NotAllowed
        );
    }

    #[tokio::test]
    async fn test_send_requires_connected_peer() {
        let (client, _events) = EndPoint::client(loopback(), test_config())
            .await
            .unwrap();

        assert!(client
            .send(SocketAddr::from(([127, 0, 0, 1], 9)), vec![1], true)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_reliable_messages_arrive_in_order() {
        let (server, mut server_events) =
            EndPoint::server(loopback(), test_config(), Arc::new(AcceptAll))
                .await
                .unwrap();
        let (client, _client_events) = EndPoint::client(loopback(), test_config())
            .await
            .unwrap();

        let server_addr = server.local_addr();
        assert_eq!(
            client.connect("127.0.0.1", server_addr.port()).await,
            ConnectResult::Connected
        );
        assert!(matches!(
            next_event(&mut server_events).await,
            PeerEvent::PeerConnected { .. }
        ));

        for i in 0u8..5 {
            client.send(server_addr, vec![i], true).await.unwrap();
        }

        for i in 0u8..5 {
            assert_eq!(
                next_event(&mut server_events).await,
                PeerEvent::MessageReceived {
                    peer: client.local_addr(),
                    data: vec![i],
                    reliable: true,
                }
            );
        }
    }

    #[tokio::test]
    async fn test_unreliable_message_arrives() {
        let (server, mut server_events) =
            EndPoint::server(loopback(), test_config(), Arc::new(AcceptAll))
                .await
                .unwrap();
        let (client, _client_events) = EndPoint::client(loopback(), test_config())
            .await
            .unwrap();

        let server_addr = server.local_addr();
        assert_eq!(
            client.connect("127.0.0.1", server_addr.port()).await,
            ConnectResult::Connected
        );
        assert!(matches!(
            next_event(&mut server_events).await,
            PeerEvent::PeerConnected { .. }
        ));

        client.send(server_addr, vec![7, 8, 9], false).await.unwrap();

        assert_eq!(
            next_event(&mut server_events).await,
            PeerEvent::MessageReceived {
                peer: client.local_addr(),
                data: vec![7, 8, 9],
                reliable: false,
            }
        );
    }

    #[tokio::test]
    async fn test_disconnect_notifies_remote() {
        let (server, mut server_events) =
            EndPoint::server(loopback(), test_config(), Arc::new(AcceptAll))
                .await
                .unwrap();
        let (client, _client_events) = EndPoint::client(loopback(), test_config())
            .await
            .unwrap();

        let server_addr = server.local_addr();
        assert_eq!(
            client.connect("127.0.0.1", server_addr.port()).await,
            ConnectResult::Connected
        );
        assert!(matches!(
            next_event(&mut server_events).await,
            PeerEvent::PeerConnected { .. }
        ));

        client.disconnect(server_addr).await;

        assert_eq!(
            next_event(&mut server_events).await,
            PeerEvent::PeerDisconnected {
                peer: client.local_addr(),
                reason: DisconnectReason::RemoteDisconnected,
            }
        );
    }

    #[tokio::test]
    async fn test_stats_reflect_traffic() {
        let (server, mut server_events) =
            EndPoint::server(loopback(), test_config(), Arc::new(AcceptAll))
                .await
                .unwrap();
        let (client, _client_events) = EndPoint::client(loopback(), test_config())
            .await
            .unwrap();

        let server_addr = server.local_addr();
        assert_eq!(
            client.connect("127.0.0.1", server_addr.port()).await,
            ConnectResult::Connected
        );
        assert!(matches!(
            next_event(&mut server_events).await,
            PeerEvent::PeerConnected { .. }
        ));

        client.send(server_addr, vec![1, 2, 3], true).await.unwrap();
        assert!(matches!(
            next_event(&mut server_events).await,
            PeerEvent::MessageReceived { .. }
        ));

        let client_stats = client.peer_stats(server_addr).unwrap();
        assert_eq!(client_stats.reliable.sent_packets, 1);
        assert_eq!(
            client_stats.reliable.sent_bytes,
            (Packet::HEADER_SIZE + 3) as u64
        );
        assert!(client_stats.internal.sent_packets >= 1); // at least the connection request

        let server_stats = server.peer_stats(client.local_addr()).unwrap();
        assert_eq!(server_stats.reliable.received_packets, 1);
    }

    #[tokio::test]
    async fn test_socket_stats_aggregate_all_peers() {
        let (server_a, mut events_a) =
            EndPoint::server(loopback(), test_config(), Arc::new(AcceptAll))
                .await
                .unwrap();
        let (server_b, mut events_b) =
            EndPoint::server(loopback(), test_config(), Arc::new(AcceptAll))
                .await
                .unwrap();
        let (client, _client_events) = EndPoint::client(loopback(), test_config())
            .await
            .unwrap();

        for (server, events) in [(&server_a, &mut events_a), (&server_b, &mut events_b)] {
            let addr = server.local_addr();
            assert_eq!(
                client.connect("127.0.0.1", addr.port()).await,
                ConnectResult::Connected
            );
            assert!(matches!(
                next_event(events).await,
                PeerEvent::PeerConnected { .. }
            ));
            client.send(addr, vec![1], true).await.unwrap();
            assert!(matches!(
                next_event(events).await,
                PeerEvent::MessageReceived { .. }
            ));
        }

        // one reliable packet per peer, two in the socket-wide aggregate
        assert_eq!(
            client
                .peer_stats(server_a.local_addr())
                .unwrap()
                .reliable
                .sent_packets,
            1
        );
        assert_eq!(client.stats().reliable.sent_packets, 2);
        assert!(client.stats().internal.sent_packets >= 2);
    }
}
