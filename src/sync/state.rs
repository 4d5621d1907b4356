//! Shared per-session state.
//!
//! Everything the session's tasks mutate together lives here, behind one
//! reader/writer lock held only for map and queue manipulation, never
//! across I/O. File handles are task-local and deliberately absent.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::crypto::NodeId;

use super::message::PktHash;

/// What the peer told us about one queued packet.
#[derive(Debug, Clone, Copy)]
pub struct AdvertisedInfo {
    /// Niceness the peer queued it at.
    pub nice: u8,
    /// Full size of the file being offered.
    pub size: u64,
}

/// One outstanding request the peer asked us to serve.
#[derive(Debug, Clone)]
pub struct FreqWithNice {
    /// Content hash to serve.
    pub hash: PktHash,
    /// Next offset to read from; advances as chunks go out.
    pub offset: u64,
    /// Niceness of the underlying packet; the queue orders by this.
    pub nice: u8,
}

/// Map/queue state shared by the session's tasks.
#[derive(Debug, Default)]
pub struct SharedState {
    /// Candidate transfer set: what the peer advertised to us. An entry
    /// leaves this map exactly once, via a Done in either direction.
    pub infos_their: HashMap<PktHash, AdvertisedInfo>,
    /// Hashes we have already advertised, with their niceness; prevents
    /// duplicate Infos across rescans and answers incoming Freqs.
    pub infos_our_seen: HashMap<PktHash, u8>,
    /// Requests the peer asked us to serve, ascending by niceness.
    pub queue_their: Vec<FreqWithNice>,
}

impl SharedState {
    /// Fresh state for a new session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a request keeping the queue sorted by ascending niceness;
    /// equal niceness preserves arrival order.
    pub fn enqueue_freq(&mut self, hash: PktHash, offset: u64, nice: u8) {
        let at = self
            .queue_their
            .iter()
            .position(|f| f.nice > nice)
            .unwrap_or(self.queue_their.len());
        self.queue_their.insert(at, FreqWithNice { hash, offset, nice });
    }

    /// Forget everything the peer wanted from us (Halt).
    pub fn clear_queue(&mut self) {
        self.queue_their.clear();
    }
}

/// Cumulative traffic counters and activity timestamps.
#[derive(Debug, Clone, Copy)]
pub struct Counters {
    /// Bytes taken off the wire, framing included.
    pub rx_bytes: u64,
    /// Bytes put on the wire, framing included.
    pub tx_bytes: u64,
    /// Last time anything was received.
    pub rx_last_seen: Instant,
    /// Last time something other than a Ping was received.
    pub rx_last_nonping: Instant,
    /// Last time anything was sent.
    pub tx_last_seen: Instant,
    /// Last time something other than a Ping was sent.
    pub tx_last_nonping: Instant,
}

impl Counters {
    /// Counters for a session that started now.
    pub fn new(started: Instant) -> Self {
        Self {
            rx_bytes: 0,
            tx_bytes: 0,
            rx_last_seen: started,
            rx_last_nonping: started,
            tx_last_seen: started,
            tx_last_nonping: started,
        }
    }

    /// Account one received frame.
    pub fn note_rx(&mut self, bytes: u64) {
        self.rx_bytes += bytes;
        self.rx_last_seen = Instant::now();
    }

    /// A non-ping message arrived inside the last received frame.
    pub fn note_rx_nonping(&mut self) {
        self.rx_last_nonping = self.rx_last_seen;
    }

    /// Account one transmitted frame.
    pub fn note_tx(&mut self, bytes: u64, ping: bool) {
        self.tx_bytes += bytes;
        self.tx_last_seen = Instant::now();
        if !ping {
            self.tx_last_nonping = self.tx_last_seen;
        }
    }
}

/// Aggregate result of one completed session.
#[derive(Debug, Clone)]
pub struct SessionStats {
    /// Peer the session ran against.
    pub peer: NodeId,
    /// Wall-clock session duration.
    pub duration: Duration,
    /// Total bytes received, framing included.
    pub rx_bytes: u64,
    /// Total bytes sent, framing included.
    pub tx_bytes: u64,
    /// Effective receive rate in bytes per second.
    pub rx_speed: u64,
    /// Effective transmit rate in bytes per second.
    pub tx_speed: u64,
}

impl SessionStats {
    /// Derive the stats from final counters.
    pub fn from_counters(peer: NodeId, started: Instant, counters: &Counters) -> Self {
        let duration = started.elapsed();
        let rx_secs = counters.rx_last_seen.duration_since(started).as_secs();
        let tx_secs = counters.tx_last_seen.duration_since(started).as_secs();
        Self {
            peer,
            duration,
            rx_bytes: counters.rx_bytes,
            tx_bytes: counters.tx_bytes,
            rx_speed: if rx_secs > 0 { counters.rx_bytes / rx_secs } else { counters.rx_bytes },
            tx_speed: if tx_secs > 0 { counters.tx_bytes / tx_secs } else { counters.tx_bytes },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freq_queue_orders_by_niceness() {
        let mut state = SharedState::new();
        state.enqueue_freq([5; 32], 0, 5);
        state.enqueue_freq([1; 32], 0, 1);
        state.enqueue_freq([3; 32], 0, 3);

        let order: Vec<u8> = state.queue_their.iter().map(|f| f.nice).collect();
        assert_eq!(order, vec![1, 3, 5]);
    }

    #[test]
    fn freq_queue_ties_preserve_arrival_order() {
        let mut state = SharedState::new();
        state.enqueue_freq([1; 32], 0, 7);
        state.enqueue_freq([2; 32], 0, 7);
        state.enqueue_freq([3; 32], 0, 7);

        let order: Vec<[u8; 32]> = state.queue_their.iter().map(|f| f.hash).collect();
        assert_eq!(order, vec![[1; 32], [2; 32], [3; 32]]);
    }

    #[test]
    fn halt_clears_the_queue() {
        let mut state = SharedState::new();
        state.enqueue_freq([1; 32], 0, 1);
        state.enqueue_freq([2; 32], 0, 2);
        state.clear_queue();
        assert!(state.queue_their.is_empty());
    }

    #[test]
    fn ping_does_not_touch_nonping_timers() {
        let started = Instant::now();
        let mut counters = Counters::new(started);
        let before = counters.tx_last_nonping;

        counters.note_tx(10, true);
        assert_eq!(counters.tx_last_nonping, before);
        assert!(counters.tx_last_seen >= before);

        counters.note_tx(10, false);
        assert!(counters.tx_last_nonping >= before);
    }

    #[test]
    fn stats_fall_back_to_raw_bytes_for_short_sessions() {
        let started = Instant::now();
        let mut counters = Counters::new(started);
        counters.note_rx(4096);
        let stats = SessionStats::from_counters(NodeId::from_bytes([0; 32]), started, &counters);
        assert_eq!(stats.rx_bytes, 4096);
        assert_eq!(stats.rx_speed, 4096);
    }
}
