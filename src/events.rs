use std::net::SocketAddr;

#[cfg(test)]
use mockall::automock;

/// Why a connected peer transitioned back to disconnected.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DisconnectReason {
    /// the remote side sent an explicit Disconnect
    RemoteDisconnected,
    /// no packet within the configured timeout, or the reliable resend budget
    ///  was exhausted
    Timeout,
}

/// Outcome of a `connect()` call.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectResult {
    Connected,
    /// DNS yielded no usable address for the socket's address family
    HostNotFound,
    /// no handshake response within the configured timeout
    Timeout,
    /// the remote side explicitly rejected the request
    Rejected,
    /// initiating connections is a client-role operation
    NotAllowed,
    /// a local error, e.g. the connection request could not be sent
    Error,
}

/// Notifications from the protocol core to the application, delivered through a
///  bounded channel so a slow consumer cannot stall the I/O or tick actors.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PeerEvent {
    PeerConnected {
        peer: SocketAddr,
    },
    PeerDisconnected {
        peer: SocketAddr,
        reason: DisconnectReason,
    },
    MessageReceived {
        peer: SocketAddr,
        data: Vec<u8>,
        reliable: bool,
    },
}

/// Server-side decision callback for inbound connection requests.
#[cfg_attr(test, automock)]
pub trait ConnectionGate: Send + Sync + 'static {
    fn allow_connection(&self, peer: SocketAddr) -> bool;
}

/// Accepts every connection request. The default for servers without an
///  application-level admission policy.
pub struct AcceptAll;

impl ConnectionGate for AcceptAll {
    fn allow_connection(&self, _peer: SocketAddr) -> bool {
        true
    }
}
