//! The two delivery channels multiplexed over one peer connection, and the inbound
//!  jitter/ordering queue they share. Sequence numbers are 16-bit with wraparound;
//!  all comparisons are wrap-aware over the half-window of the sequence space.

pub mod reliable;
pub mod unreliable;

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// `a` comes after `b` in wrap-aware terms, i.e. `a` is within the half-window
///  ahead of `b`.
pub(crate) fn seq_is_newer(a: u16, b: u16) -> bool {
    let distance = a.wrapping_sub(b);
    distance != 0 && distance < 0x8000
}

/// Receive side of a channel: duplicate suppression, a time-stamped ordering buffer,
///  and the hold duration that lets slightly-late reordered packets arrive before
///  release.
///
/// There is no separate duplicate-tracking set: a sequence at-or-behind the last
///  released one is stale by definition (reliable channels release strictly in order,
///  unreliable channels advance past gaps), and anything newer is either absent or
///  already buffered. That bounds duplicate tracking to a sliding window over the
///  sequence space.
pub struct InboundQueue {
    hold: Duration,
    last_released: Option<u16>,
    buffer: BTreeMap<u16, (Instant, Vec<u8>)>,
}

impl InboundQueue {
    pub fn new(hold: Duration) -> InboundQueue {
        InboundQueue {
            hold,
            last_released: None,
            buffer: BTreeMap::new(),
        }
    }

    /// The next sequence an in-order consumer is waiting for.
    pub fn expected(&self) -> u16 {
        match self.last_released {
            Some(seq) => seq.wrapping_add(1),
            None => 0,
        }
    }

    /// Accepts a packet into the buffer. Returns false for duplicates and for packets
    ///  at-or-behind the release cursor.
    pub fn offer(&mut self, sequence: u16, body: Vec<u8>, now: Instant) -> bool {
        if let Some(last) = self.last_released {
            if !seq_is_newer(sequence, last) {
                return false;
            }
        }
        match self.buffer.entry(sequence) {
            Entry::Occupied(_) => false,
            Entry::Vacant(e) => {
                e.insert((now, body));
                true
            }
        }
    }

    /// The wrap-aware lowest buffered sequence: numerically-at-or-above `expected`
    ///  first, wrapped-around entries otherwise.
    fn lowest_pending(&self) -> Option<u16> {
        let expected = self.expected();
        self.buffer
            .range(expected..)
            .next()
            .or_else(|| self.buffer.iter().next())
            .map(|(&seq, _)| seq)
    }

    fn hold_elapsed(&self, sequence: u16, now: Instant) -> bool {
        match self.buffer.get(&sequence) {
            Some((arrival, _)) => now.saturating_duration_since(*arrival) >= self.hold,
            None => false,
        }
    }

    /// Strict in-order release: yields only the expected sequence, and only once its
    ///  hold time has elapsed. A gap means head-of-line blocking until the missing
    ///  packet arrives.
    pub fn poll_ordered(&mut self, now: Instant) -> Option<Vec<u8>> {
        let expected = self.expected();
        if !self.hold_elapsed(expected, now) {
            return None;
        }

        let (_, body) = self
            .buffer
            .remove(&expected)
            .expect("hold check implies a buffered entry");
        self.last_released = Some(expected);
        Some(body)
    }

    /// Best-effort release: yields the lowest buffered sequence once its hold time
    ///  has elapsed, together with the sequence gap to the previous release. Gaps are
    ///  assumed lost, not out-of-order-and-still-coming.
    pub fn poll_sequenced(&mut self, now: Instant) -> Option<(u64, Vec<u8>)> {
        let sequence = self.lowest_pending()?;
        if !self.hold_elapsed(sequence, now) {
            return None;
        }

        let (_, body) = self
            .buffer
            .remove(&sequence)
            .expect("hold check implies a buffered entry");
        let gap = match self.last_released {
            Some(last) => sequence.wrapping_sub(last).wrapping_sub(1) as u64,
            None => sequence as u64,
        };
        self.last_released = Some(sequence);
        Some((gap, body))
    }

    #[cfg(test)]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
