//! Round-trip-time estimation over a time-bounded sliding window of ping/pong
//!  samples. All operations take `now` explicitly so the logic stays independent of
//!  any clock or runtime.

use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::trace;

pub struct PingTracker {
    window: Duration,
    next_sequence: u16,
    /// ping sequence -> send time, for pings whose pong has not arrived yet
    awaiting_pong: FxHashMap<u16, Instant>,
    /// (arrival time, measured round trip) - oldest first
    samples: VecDeque<(Instant, Duration)>,
    /// running sum over `samples`
    round_trip_sum: Duration,
}

impl PingTracker {
    pub fn new(window: Duration) -> PingTracker {
        PingTracker {
            window,
            next_sequence: 0,
            awaiting_pong: Default::default(),
            samples: Default::default(),
            round_trip_sum: Duration::ZERO,
        }
    }

    /// Allocates a fresh ping sequence and records its send time. The first ping in a
    ///  session has sequence 1.
    pub fn send_ping(&mut self, now: Instant) -> u16 {
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.awaiting_pong.insert(self.next_sequence, now);
        self.next_sequence
    }

    /// Feeds in a pong. A sequence we are not waiting for (already expired, or never
    ///  sent) is a no-op.
    pub fn on_pong(&mut self, sequence: u16, now: Instant) -> Option<Duration> {
        let sent = self.awaiting_pong.remove(&sequence)?;

        let sample = now.saturating_duration_since(sent);
        trace!("pong {}: round trip {:?}", sequence, sample);

        self.samples.push_back((now, sample));
        self.round_trip_sum += sample;
        Some(sample)
    }

    /// Evicts samples that have aged out of the window, and gives up on pings that
    ///  have gone unanswered for longer than the window. Returns the number of pings
    ///  declared lost.
    pub fn evict(&mut self, now: Instant) -> u64 {
        while let Some(&(arrival, sample)) = self.samples.front() {
            if now.saturating_duration_since(arrival) <= self.window {
                break;
            }
            self.round_trip_sum -= sample;
            self.samples.pop_front();
        }

        let before = self.awaiting_pong.len();
        let window = self.window;
        self.awaiting_pong
            .retain(|_, sent| now.saturating_duration_since(*sent) <= window);
        (before - self.awaiting_pong.len()) as u64
    }

    /// Current one-way latency estimate: half the average round trip over the window,
    ///  or zero if there are no samples.
    pub fn current_ping(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        self.round_trip_sum / (2 * self.samples.len() as u32)
    }
}
