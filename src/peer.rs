use crate::channel::reliable::{ReliableChannel, ScanOutcome};
use crate::channel::unreliable::UnreliableChannel;
use crate::config::{NetConfig, Role};
use crate::events::{ConnectResult, ConnectionGate, DisconnectReason, PeerEvent};
use crate::fsm::{StateMachine, StateMachineBuilder};
use crate::packet::{Packet, PacketType};
use crate::rtt::PingTracker;
use crate::send_pipeline::SendPipeline;
use crate::stats::{NetStats, NetStatsSnapshot};
use anyhow::anyhow;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub(crate) enum PeerState {
    Disconnected,
    ConnectionRequested,
    Connected,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub(crate) enum PeerCommand {
    RequestConnection,
    ConnectionAccepted,
    ConnectionRejected,
    Disconnect,
    Timeout,
}

/// factor applied to the current ping when deriving the resend delay, chosen to avoid
///  spurious retransmits under jitter
const RESEND_DELAY_RTT_FACTOR: f64 = 2.5;

/// A single remote endpoint's session: connection lifecycle, liveness, RTT tracking
///  and the two delivery channels. Routed into concurrently from the I/O actor
///  (`handle_packet`) and the timer actor (`tick`).
pub struct Peer {
    peer_addr: SocketAddr,
    role: Role,
    config: Arc<NetConfig>,
    pipeline: Arc<SendPipeline>,
    state: StateMachine<PeerState, PeerCommand>,
    ping: Mutex<PingTracker>,
    unreliable: UnreliableChannel,
    reliable: ReliableChannel,
    stats: Arc<NetStats>,
    last_packet: Mutex<Instant>,
    /// waiter of an in-flight outbound connect, resolved by ConnectionAccept/Reject
    connect_waiter: Mutex<Option<oneshot::Sender<bool>>>,
    gate: Arc<dyn ConnectionGate>,
    events: mpsc::Sender<PeerEvent>,
}

impl Peer {
    pub fn new(
        peer_addr: SocketAddr,
        role: Role,
        config: Arc<NetConfig>,
        pipeline: Arc<SendPipeline>,
        gate: Arc<dyn ConnectionGate>,
        events: mpsc::Sender<PeerEvent>,
    ) -> Peer {
        let stats = Arc::new(NetStats::default());

        let state = StateMachineBuilder::new(PeerState::Disconnected)
            .add(PeerState::Disconnected, PeerCommand::RequestConnection, PeerState::ConnectionRequested)
            .add(PeerState::ConnectionRequested, PeerCommand::ConnectionAccepted, PeerState::Connected)
            .add(PeerState::ConnectionRequested, PeerCommand::ConnectionRejected, PeerState::Disconnected)
            .add(PeerState::ConnectionRequested, PeerCommand::Timeout, PeerState::Disconnected)
            .add(PeerState::Connected, PeerCommand::Disconnect, PeerState::Disconnected)
            .add(PeerState::Connected, PeerCommand::Timeout, PeerState::Disconnected)
            .on_enter(PeerState::Connected, move || debug!("{:?}: connected", peer_addr))
            .on_enter(PeerState::Disconnected, move || debug!("{:?}: disconnected", peer_addr))
            .build()
            .expect("peer transition table is statically valid");

        Peer {
            peer_addr,
            role,
            pipeline: pipeline.clone(),
            state,
            ping: Mutex::new(PingTracker::new(config.ping_window)),
            unreliable: UnreliableChannel::new(
                peer_addr,
                pipeline.clone(),
                stats.clone(),
                config.jitter_buffer_hold,
            ),
            reliable: ReliableChannel::new(
                peer_addr,
                pipeline,
                stats.clone(),
                config.jitter_buffer_hold,
            ),
            stats,
            last_packet: Mutex::new(Instant::now()),
            connect_waiter: Mutex::new(None),
            gate,
            events,
            config,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub(crate) fn state(&self) -> PeerState {
        self.state.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state.state() == PeerState::Connected
    }

    pub fn stats_snapshot(&self) -> NetStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn current_ping(&self) -> Duration {
        self.ping.lock().unwrap().current_ping()
    }

    /// RTT-derived retransmission delay: a jitter allowance of 2.5x the current ping
    ///  plus the configured fixed floor (so RTT ~ 0 does not cause rapid-fire resends).
    fn resend_delay(&self) -> Duration {
        self.current_ping().mul_f64(RESEND_DELAY_RTT_FACTOR) + self.config.resend_time
    }

    fn emit(&self, event: PeerEvent) {
        if self.events.try_send(event).is_err() {
            warn!(
                "{:?}: application event queue full or closed - dropping event",
                self.peer_addr
            );
        }
    }

    async fn send_internal(&self, packet: Packet) {
        self.stats.internal.record_sent(packet.wire_len());
        self.pipeline.send_packet(self.peer_addr, &packet).await;
    }

    /// Applies a command that was triggered by remote traffic. An invalid transition
    ///  means a misbehaving or stale remote peer - logged and ignored, never an error
    ///  that could take the local side down.
    fn apply_remote(&self, command: PeerCommand) -> bool {
        match self.state.apply(command) {
            Ok(_) => true,
            Err(e) => {
                debug!("{:?}: ignoring packet - {}", self.peer_addr, e);
                false
            }
        }
    }

    /// Locally initiated disconnect: tell the remote side, then drop the connection.
    pub async fn disconnect(&self) {
        if self.state.apply(PeerCommand::Disconnect).is_ok() {
            self.send_internal(Packet::new(PacketType::Disconnect, 0)).await;
        }
    }

    pub async fn send_reliable(&self, data: Vec<u8>) {
        self.reliable.send(data, Instant::now()).await;
    }

    pub async fn send_unreliable(&self, data: Vec<u8>) {
        self.unreliable.send(data).await;
    }

    /// Dispatches an inbound envelope. Any packet, whatever its type, counts as a
    ///  sign of life for timeout detection.
    pub async fn handle_packet(&self, packet: Packet) {
        let now = Instant::now();
        *self.last_packet.lock().unwrap() = now;
        self.stats
            .for_packet_type(packet.packet_type)
            .record_received(packet.wire_len());

        match packet.packet_type {
            PacketType::ConnectionRequest => self.on_connection_request().await,
            PacketType::ConnectionAccept => self.resolve_connect(true),
            PacketType::ConnectionReject => self.resolve_connect(false),
            PacketType::Ping => {
                self.send_internal(Packet::new(PacketType::Pong, packet.sequence))
                    .await;
            }
            PacketType::Pong => {
                self.ping.lock().unwrap().on_pong(packet.sequence, now);
            }
            PacketType::Disconnect => {
                if self.apply_remote(PeerCommand::Disconnect) {
                    self.emit(PeerEvent::PeerDisconnected {
                        peer: self.peer_addr,
                        reason: DisconnectReason::RemoteDisconnected,
                    });
                }
            }
            PacketType::Ack => self.reliable.on_ack(packet.sequence),
            PacketType::Unreliable => self.unreliable.on_packet(packet.sequence, packet.body, now),
            PacketType::Reliable => {
                self.reliable
                    .on_packet(packet.sequence, packet.body, now)
                    .await
            }
            PacketType::Debug => trace!("{:?}: debug packet", self.peer_addr),
        }
    }

    async fn on_connection_request(&self) {
        if self.role == Role::Client {
            debug!(
                "{:?}: ignoring connection request - this endpoint is client-role",
                self.peer_addr
            );
            return;
        }

        // a request while already Connected (or mid-handshake) is a protocol
        //  violation, not a reconnect
        if !self.apply_remote(PeerCommand::RequestConnection) {
            return;
        }

        if self.gate.allow_connection(self.peer_addr) {
            debug!("{:?}: accepting connection request", self.peer_addr);
            self.send_internal(Packet::new(PacketType::ConnectionAccept, 0))
                .await;
            if self.apply_remote(PeerCommand::ConnectionAccepted) {
                self.emit(PeerEvent::PeerConnected {
                    peer: self.peer_addr,
                });
            }
        } else {
            debug!("{:?}: rejecting connection request", self.peer_addr);
            self.send_internal(Packet::new(PacketType::ConnectionReject, 0))
                .await;
            self.apply_remote(PeerCommand::ConnectionRejected);
        }
    }

    /// Starts an outbound handshake: applies RequestConnection, registers a waiter
    ///  and sends the ConnectionRequest. The returned receiver resolves when the
    ///  remote answers; the caller owns the timeout.
    pub async fn begin_connect(&self) -> anyhow::Result<oneshot::Receiver<bool>> {
        self.state
            .apply(PeerCommand::RequestConnection)
            .map_err(|e| anyhow!("cannot connect: {}", e))?;

        let (tx, rx) = oneshot::channel();
        *self.connect_waiter.lock().unwrap() = Some(tx);

        self.send_internal(Packet::new(PacketType::ConnectionRequest, 0))
            .await;
        Ok(rx)
    }

    fn resolve_connect(&self, accepted: bool) {
        match self.connect_waiter.lock().unwrap().take() {
            Some(waiter) => {
                let _ = waiter.send(accepted);
            }
            None => debug!(
                "{:?}: connection response without a pending connect - ignoring",
                self.peer_addr
            ),
        }
    }

    /// Completes an outbound handshake after the remote answered.
    pub fn finish_connect(&self, accepted: bool) -> ConnectResult {
        if accepted {
            match self.state.apply(PeerCommand::ConnectionAccepted) {
                Ok(_) => {
                    self.emit(PeerEvent::PeerConnected {
                        peer: self.peer_addr,
                    });
                    ConnectResult::Connected
                }
                Err(e) => {
                    warn!("{:?}: accepted response in unexpected state - {}", self.peer_addr, e);
                    ConnectResult::Error
                }
            }
        } else {
            self.apply_remote(PeerCommand::ConnectionRejected);
            ConnectResult::Rejected
        }
    }

    /// Resolves an outbound handshake that got no answer.
    pub fn connect_timed_out(&self) {
        *self.connect_waiter.lock().unwrap() = None;
        self.apply_remote(PeerCommand::Timeout);
    }

    /// Periodic update, independent of I/O. Liveness first: the time since the last
    ///  received packet is the *only* liveness signal, and exceeding the timeout
    ///  disconnects. Otherwise drives retransmission, RTT upkeep, an outbound ping
    ///  and the release of buffered messages to the application.
    pub async fn tick(&self, now: Instant) {
        if self.state.state() != PeerState::Connected {
            return;
        }

        let since_last_packet = now.saturating_duration_since(*self.last_packet.lock().unwrap());
        if since_last_packet > self.config.connection_timeout {
            debug!(
                "{:?}: no packet for {:?} - timing out",
                self.peer_addr, since_last_packet
            );
            if self.apply_remote(PeerCommand::Timeout) {
                self.emit(PeerEvent::PeerDisconnected {
                    peer: self.peer_addr,
                    reason: DisconnectReason::Timeout,
                });
            }
            return;
        }

        let scan = self
            .reliable
            .retransmit_scan(self.resend_delay(), self.config.max_resend_attempts, now)
            .await;
        if scan == ScanOutcome::PeerDead {
            if self.apply_remote(PeerCommand::Timeout) {
                self.emit(PeerEvent::PeerDisconnected {
                    peer: self.peer_addr,
                    reason: DisconnectReason::Timeout,
                });
            }
            return;
        }

        let (lost_pings, ping_sequence) = {
            let mut ping = self.ping.lock().unwrap();
            (ping.evict(now), ping.send_ping(now))
        };
        if lost_pings > 0 {
            self.stats.record_lost(lost_pings);
        }
        self.send_internal(Packet::new(PacketType::Ping, ping_sequence))
            .await;

        while let Some(data) = self.reliable.try_poll(now) {
            self.emit(PeerEvent::MessageReceived {
                peer: self.peer_addr,
                data,
                reliable: true,
            });
        }
        while let Some(data) = self.unreliable.try_poll(now) {
            self.emit(PeerEvent::MessageReceived {
                peer: self.peer_addr,
                data,
                reliable: false,
            });
        }
    }
}
