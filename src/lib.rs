//! A connection-oriented messaging protocol on top of UDP, providing an explicit
//!  handshake, liveness detection and per-message delivery guarantees while keeping
//!  the low latency of datagrams.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (i.e. defined-length chunks of
//!   data as opposed to streams of bytes)
//! * Client / server roles: a server endpoint listens on a well-known port and accepts
//!   (or rejects) connection requests, a client endpoint initiates them
//! * A 'connection' is a protocol-level concept on top of connectionless UDP: an
//!   explicit request / accept / reject handshake, and a liveness timeout based
//!   exclusively on the time since the last received packet
//! * Two delivery channels per connection, selected per message:
//!   * *reliable*: every packet is acknowledged and re-sent until acknowledged or the
//!     re-send budget is exhausted (which kills the connection); delivery to the
//!     application is strictly in send order
//!   * *unreliable*: fire-and-forget, but out-of-date packets are discarded and gaps
//!     are counted, so the application sees each message at most once and never out
//!     of order
//! * Buffer incoming data for a short, configurable hold to give out-of-order arrival
//!   a chance before declaring a gap
//! * Continuous RTT estimation from ping / pong over a sliding time window, feeding
//!   the retransmission delay
//! * A single fixed-rate housekeeping tick per endpoint drives timeouts, pings and
//!   retransmission - no per-packet timers
//! * All application-visible activity is reported through one bounded event queue: a
//!   slow consumer costs events, never blocks the protocol
//!
//! ## Packet format
//!
//! All packets share one envelope - numbers in network byte order (BE):
//!
//! ```ascii
//! 0: packet type (u8)
//! 1: sequence number (u16) - channel-scoped and wrapping for data packets, ping
//!     correlation for ping / pong, 0 where meaningless
//! 3: payload - application data for channel packets, empty otherwise
//! ```
//!
//! Sequence numbers wrap at u16::MAX; ordering comparisons are wrap-aware, so a
//!  long-lived connection can run through the sequence space indefinitely as long as
//!  no more than half the space is in flight at once.

pub mod atomic_map;
mod channel;
pub mod codec;
pub mod config;
pub mod end_point;
pub mod events;
mod fsm;
pub mod packet;
mod peer;
mod rtt;
mod send_pipeline;
pub mod stats;
