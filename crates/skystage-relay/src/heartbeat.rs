//! Heartbeat timestamps and round-trip measurement.

use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Heartbeats awaiting a pong before the oldest is forgotten.
const MAX_PENDING: usize = 8;

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Matches pongs to the pings that caused them.
///
/// Pings are keyed by the wall-clock timestamp they carried, but elapsed
/// time is measured with [`Instant`], so a measured latency is never
/// negative even if the wall clock jumps.
#[derive(Debug, Default)]
pub struct LatencyTracker {
    pending: VecDeque<(u64, Instant)>,
    last: Option<Duration>,
}

impl LatencyTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a ping carrying `timestamp` was just sent.
    pub fn record_ping(&mut self, timestamp: u64) {
        self.record_ping_at(timestamp, Instant::now());
    }

    /// Record a pong echoing `timestamp`.
    ///
    /// Returns the round-trip time, or `None` for an unknown timestamp.
    pub fn record_pong(&mut self, timestamp: u64) -> Option<Duration> {
        self.record_pong_at(timestamp, Instant::now())
    }

    fn record_ping_at(&mut self, timestamp: u64, sent: Instant) {
        if self.pending.len() == MAX_PENDING {
            self.pending.pop_front();
        }
        self.pending.push_back((timestamp, sent));
    }

    fn record_pong_at(&mut self, timestamp: u64, received: Instant) -> Option<Duration> {
        let index = self.pending.iter().position(|(ts, _)| *ts == timestamp)?;
        let (_, sent) = self.pending.remove(index)?;
        // Older pings were answered out of order or lost.
        self.pending.drain(..index);

        let rtt = received.saturating_duration_since(sent);
        self.last = Some(rtt);
        Some(rtt)
    }

    /// Most recent round-trip time.
    #[must_use]
    pub fn latency(&self) -> Option<Duration> {
        self.last
    }

    /// Number of pings still waiting for a pong.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Forget outstanding pings, e.g. after the connection dropped.
    pub fn reset(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut tracker = LatencyTracker::new();
        let sent = Instant::now();
        tracker.record_ping_at(1_000, sent);

        let rtt = tracker
            .record_pong_at(1_000, sent + Duration::from_millis(42))
            .unwrap();
        assert_eq!(rtt, Duration::from_millis(42));
        assert_eq!(tracker.latency(), Some(rtt));
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn test_unknown_pong_ignored() {
        let mut tracker = LatencyTracker::new();
        tracker.record_ping(1);
        assert!(tracker.record_pong(2).is_none());
        assert!(tracker.latency().is_none());
        assert_eq!(tracker.pending(), 1);
    }

    #[test]
    fn test_latency_never_negative() {
        let mut tracker = LatencyTracker::new();
        let sent = Instant::now() + Duration::from_secs(5);
        tracker.record_ping_at(7, sent);

        // A pong observed "before" the ping clamps to zero.
        let rtt = tracker.record_pong_at(7, Instant::now()).unwrap();
        assert_eq!(rtt, Duration::ZERO);
    }

    #[test]
    fn test_stale_pings_dropped() {
        let mut tracker = LatencyTracker::new();
        for ts in 0..(MAX_PENDING as u64 + 3) {
            tracker.record_ping(ts);
        }
        assert_eq!(tracker.pending(), MAX_PENDING);
        assert!(tracker.record_pong(0).is_none());

        // Answering a later ping discards the ones before it.
        assert!(tracker.record_pong(5).is_some());
        assert_eq!(tracker.pending(), MAX_PENDING - 3);

        tracker.reset();
        assert_eq!(tracker.pending(), 0);
    }
}
