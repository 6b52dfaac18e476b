use anyhow::bail;
use std::time::Duration;

/// Whether this endpoint initiates connections or accepts them. A client never
///  answers inbound connection requests, a server never initiates.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Role {
    Client,
    Server,
}

pub struct NetConfig {
    /// Two uses: the liveness timeout (a connected peer that has not sent *any*
    ///  packet for this long is disconnected), and the handshake timeout for
    ///  `connect()`.
    pub connection_timeout: Duration,

    /// How long a received packet resides in the jitter buffer before it may be
    ///  released to the application. This gives slightly-late reordered packets a
    ///  chance to arrive in front of it.
    pub jitter_buffer_hold: Duration,

    /// Width of the sliding window over ping round-trip samples. Pings unanswered
    ///  for longer than this count as lost.
    pub ping_window: Duration,

    /// Fixed floor added to the RTT-derived resend delay, so retransmissions stay
    ///  sane when the measured RTT is near zero.
    pub resend_time: Duration,

    /// How often an unacknowledged reliable packet is retransmitted before the
    ///  connection is declared dead. With a budget of N, a packet is resent N-1
    ///  times; the Nth expiry disconnects the peer.
    pub max_resend_attempts: u32,

    /// Interval of the periodic per-peer update (retransmission scan, ping,
    ///  timeout detection, receive-buffer drain).
    pub tick_interval: Duration,

    /// Capacity of the bounded application event queue. Events are dropped with a
    ///  warning when the application does not keep up.
    pub event_queue_size: usize,
}

impl Default for NetConfig {
    fn default() -> NetConfig {
        NetConfig {
            connection_timeout: Duration::from_secs(5),
            jitter_buffer_hold: Duration::from_millis(20),
            ping_window: Duration::from_secs(3),
            resend_time: Duration::from_millis(50),
            max_resend_attempts: 10,
            tick_interval: Duration::from_millis(100),
            event_queue_size: 1024,
        }
    }
}

impl NetConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.connection_timeout.is_zero() {
            bail!("connection timeout must be non-zero");
        }
        if self.tick_interval.is_zero() {
            bail!("tick interval must be non-zero");
        }
        if self.connection_timeout <= self.tick_interval {
            bail!("connection timeout must exceed the tick interval, otherwise every peer times out between ticks");
        }
        if self.max_resend_attempts < 2 {
            bail!("max resend attempts must be at least 2 - a budget of 1 would disconnect without ever retransmitting");
        }
        if self.event_queue_size == 0 {
            bail!("event queue size must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[test]
    fn test_default_is_valid() {
        assert!(NetConfig::default().validate().is_ok());
    }

    #[rstest]
    #[case::zero_timeout(NetConfig { connection_timeout: Duration::ZERO, ..NetConfig::default() })]
    #[case::zero_tick(NetConfig { tick_interval: Duration::ZERO, ..NetConfig::default() })]
    #[case::timeout_below_tick(NetConfig { connection_timeout: Duration::from_millis(50), ..NetConfig::default() })]
    #[case::resend_budget_too_small(NetConfig { max_resend_attempts: 1, ..NetConfig::default() })]
    #[case::zero_event_queue(NetConfig { event_queue_size: 0, ..NetConfig::default() })]
    fn test_invalid_configs(#[case] config: NetConfig) {
        assert!(config.validate().is_err());
    }
}
