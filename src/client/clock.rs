//! NTP-lite clock synchronization (§4.6)
//!
//! A client periodically `ping`s the coordinator and gets back a `pong`
//! carrying the coordinator's wall-clock time. From a sliding window of
//! the last 8 round trips we take the median offset, and only move the
//! client's published estimate when the new median differs from the
//! current one by more than [`HYSTERESIS_MS`] — small jitter between
//! consecutive samples should never perturb note-scheduling math.

use std::collections::VecDeque;

/// Number of most recent samples kept for the median estimate.
const WINDOW: usize = 8;

/// Minimum change, in milliseconds, required before the published offset
/// estimate moves. Prevents the scheduler from seeing a new "now" on every
/// single ping reply.
const HYSTERESIS_MS: f64 = 5.0;

/// One completed ping/pong round trip.
#[derive(Debug, Clone, Copy)]
struct Sample {
    /// Estimated coordinator-minus-client clock offset, milliseconds.
    offset_ms: f64,
    /// Round-trip time, milliseconds.
    rtt_ms: f64,
}

/// Tracks clock offset between this client and the coordinator.
#[derive(Debug, Default)]
pub struct ClockSync {
    /// Sliding window of the most recent round trips.
    samples: VecDeque<Sample>,
    /// Currently published offset estimate, milliseconds. Added to a
    /// client-local timestamp to get the coordinator's equivalent time.
    published_offset_ms: f64,
    /// Whether at least one sample has ever been recorded.
    has_estimate: bool,
}

impl ClockSync {
    /// Construct a fresh clock sync with no samples yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one ping/pong round trip and update the published offset
    /// estimate if the new median clears the hysteresis band.
    ///
    /// `client_sent_ts` / `client_received_ts` are client-local
    /// timestamps (milliseconds) bracketing the round trip;
    /// `server_ts` is the coordinator's wall-clock time from the `pong`.
    pub fn record_round_trip(&mut self, client_sent_ts: f64, client_received_ts: f64, server_ts: f64) {
        let rtt_ms = client_received_ts - client_sent_ts;
        let midpoint = client_sent_ts + rtt_ms / 2.0;
        let offset_ms = server_ts - midpoint;

        self.samples.push_back(Sample { offset_ms, rtt_ms });
        if self.samples.len() > WINDOW {
            self.samples.pop_front();
        }

        let median = self.median_offset();
        if !self.has_estimate || (median - self.published_offset_ms).abs() > HYSTERESIS_MS {
            self.published_offset_ms = median;
            self.has_estimate = true;
        }
    }

    /// Median offset across the current sample window.
    fn median_offset(&self) -> f64 {
        let mut offsets: Vec<f64> = self.samples.iter().map(|s| s.offset_ms).collect();
        offsets.sort_by(|a, b| a.partial_cmp(b).expect("offsets are always finite"));
        let mid = offsets.len() / 2;
        if offsets.len() % 2 == 0 {
            (offsets[mid - 1] + offsets[mid]) / 2.0
        } else {
            offsets[mid]
        }
    }

    /// The currently published coordinator-minus-client offset, in
    /// milliseconds. `0.0` until the first sample arrives.
    pub fn offset_ms(&self) -> f64 {
        self.published_offset_ms
    }

    /// Convert a client-local timestamp into the coordinator's equivalent
    /// wall-clock time.
    pub fn to_server_time(&self, client_ts: f64) -> f64 {
        client_ts + self.published_offset_ms
    }

    /// Whether at least one round trip has been recorded.
    pub fn has_estimate(&self) -> bool {
        self.has_estimate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_converges_toward_the_true_offset() {
        let mut clock = ClockSync::new();
        // Client clock is 100ms behind the coordinator; 20ms RTT every time.
        for i in 0..8 {
            let sent = (i as f64) * 1000.0;
            let received = sent + 20.0;
            let server_ts = sent + 10.0 + 100.0;
            clock.record_round_trip(sent, received, server_ts);
        }
        assert!((clock.offset_ms() - 100.0).abs() < 1.0);
    }

    #[test]
    fn small_jitter_does_not_move_the_published_estimate() {
        let mut clock = ClockSync::new();
        clock.record_round_trip(0.0, 20.0, 110.0);
        let first = clock.offset_ms();
        // A single sample 3ms off the first: within hysteresis, should not move.
        clock.record_round_trip(1000.0, 1020.0, 1113.0);
        assert_eq!(clock.offset_ms(), first);
    }

    #[test]
    fn window_caps_at_eight_samples() {
        let mut clock = ClockSync::new();
        for i in 0..20 {
            let sent = (i as f64) * 1000.0;
            clock.record_round_trip(sent, sent + 20.0, sent + 10.0);
        }
        assert_eq!(clock.samples.len(), WINDOW);
    }
}
