//! Client-side half of the hash-challenge protocol (§4.8)
//!
//! The coordinator's debounced mismatch counter lives in
//! [`crate::coordinator`]; this is what decides, from the client's side,
//! *when* to issue a challenge in the first place — on a fixed interval,
//! so a quiet session still periodically double-checks it hasn't silently
//! drifted (a missed `applied` broadcast leaves no other signal).

use std::time::{Duration, Instant};

use crate::hash::canonical_hash;
use crate::model::Session;
use crate::protocol::ClientMessage;

/// How often a client re-checks its mirror against the coordinator (§4.8:
/// "every 30s, when connected and idle").
const CHALLENGE_INTERVAL: Duration = Duration::from_secs(30);

/// Schedules periodic hash challenges and builds the outgoing message.
#[derive(Debug)]
pub struct DivergenceDetector {
    /// When the last challenge was issued.
    last_challenge_at: Option<Instant>,
}

impl Default for DivergenceDetector {
    fn default() -> Self {
        DivergenceDetector { last_challenge_at: None }
    }
}

impl DivergenceDetector {
    /// Construct a detector that will fire its first challenge
    /// immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a challenge is due at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_challenge_at {
            None => true,
            Some(last) => now.duration_since(last) >= CHALLENGE_INTERVAL,
        }
    }

    /// Build a `hash_challenge` message for the local mirror at `seq`,
    /// and mark a challenge as having just been issued at `now`.
    pub fn challenge(&mut self, session: &Session, seq: u64, now: Instant) -> ClientMessage {
        self.last_challenge_at = Some(now);
        ClientMessage::HashChallenge {
            local_hash: canonical_hash(session),
            at_seq: seq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Session;

    #[test]
    fn first_challenge_is_immediately_due() {
        let detector = DivergenceDetector::new();
        assert!(detector.is_due(Instant::now()));
    }

    #[test]
    fn not_due_again_until_the_interval_elapses() {
        let mut detector = DivergenceDetector::new();
        let t0 = Instant::now();
        let session = Session::new("s1");
        detector.challenge(&session, 0, t0);
        assert!(!detector.is_due(t0 + Duration::from_secs(1)));
        assert!(detector.is_due(t0 + CHALLENGE_INTERVAL));
    }
}
