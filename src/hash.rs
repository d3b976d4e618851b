//! Canonical state fingerprinting for divergence detection
//!
//! The coordinator and every client must compute byte-identical hashes
//! from semantically-identical state. This fingerprints a *canonical
//! projection* of session state with `sha2`, since the hash must survive
//! re-serialization and must deliberately exclude local-only fields
//! (`muted`, `soloed`) — see the docs on [`canonical_hash`] for why that
//! exclusion is the single most error-prone part of the system.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::model::{ParameterLock, Session, Track};

/// The subset of a [`Track`] that participates in the canonical hash.
/// Deliberately omits `muted` and `soloed` — those are local-only fields
/// ("my ears, my control") and must never affect convergence between
/// clients.
#[derive(Serialize)]
struct HashableTrack<'a> {
    id: &'a str,
    name: &'a str,
    sample_id: &'a str,
    volume: f64,
    transpose: i32,
    step_count: u32,
    playback_mode: crate::model::PlaybackMode,
    steps: &'a [bool],
    parameter_locks: &'a [Option<ParameterLock>],
}

impl<'a> From<&'a Track> for HashableTrack<'a> {
    fn from(track: &'a Track) -> Self {
        HashableTrack {
            id: &track.id,
            name: &track.name,
            sample_id: &track.sample_id,
            volume: track.volume,
            transpose: track.transpose,
            step_count: track.step_count,
            playback_mode: track.playback_mode,
            steps: &track.steps,
            parameter_locks: &track.parameter_locks,
        }
    }
}

/// The subset of [`Session`] that participates in the canonical hash:
/// tempo, swing, version, and each track's hashable projection, in
/// declared order. `session_id`, `name`, `effects` and `state_seq` are
/// excluded deliberately — the fingerprint is over pattern *content*, and
/// including `state_seq` would make the hash trivially diverge on every
/// mutation rather than letting the challenge protocol compare apples to
/// apples at a given sequence number (the caller pins `at_seq` instead).
#[derive(Serialize)]
struct HashableSession<'a> {
    version: u32,
    tempo: f64,
    swing: f64,
    tracks: Vec<HashableTrack<'a>>,
}

impl<'a> From<&'a Session> for HashableSession<'a> {
    fn from(session: &'a Session) -> Self {
        HashableSession {
            version: session.version,
            tempo: session.tempo,
            swing: session.swing,
            tracks: session.tracks.iter().map(HashableTrack::from).collect(),
        }
    }
}

/// Compute the canonical fingerprint of `session`'s replicated state.
///
/// Both the coordinator and every client must produce byte-identical
/// input to the hash; `serde_json` with Rust's deterministic struct field
/// order gives us that for free as long as no side ever hand-rolls the
/// projection differently. Returns a lowercase hex-encoded SHA-256 digest.
pub fn canonical_hash(session: &Session) -> String {
    let hashable = HashableSession::from(session);
    // `serde_json` cannot fail serializing a value built entirely from
    // owned Rust data with no fallible `Serialize` impls.
    let canonical = serde_json::to_vec(&hashable).expect("canonical projection always serializes");
    let digest = Sha256::digest(&canonical);
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Track;

    #[test]
    fn hash_excludes_local_only_fields() {
        let mut session = Session::new("s1");
        session.tracks.push(Track::new("t1", "kick", "909"));
        let before = canonical_hash(&session);
        session.tracks[0].muted = true;
        session.tracks[0].soloed = true;
        let after = canonical_hash(&session);
        assert_eq!(before, after);
    }

    #[test]
    fn hash_changes_on_pattern_edit() {
        let mut session = Session::new("s1");
        session.tracks.push(Track::new("t1", "kick", "909"));
        let before = canonical_hash(&session);
        session.tracks[0].steps[0] = true;
        let after = canonical_hash(&session);
        assert_ne!(before, after);
    }

    #[test]
    fn hash_is_stable_across_reserialization() {
        let mut session = Session::new("s1");
        session.tracks.push(Track::new("t1", "kick", "909"));
        session.tracks[0].steps[3] = true;
        let json = serde_json::to_string(&session).unwrap();
        let round_tripped: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(canonical_hash(&session), canonical_hash(&round_tripped));
    }

    #[test]
    fn round_trip_toggle_twice_is_a_no_op_on_hash() {
        let mut session = Session::new("s1");
        session.tracks.push(Track::new("t1", "kick", "909"));
        let before = canonical_hash(&session);
        session.tracks[0].step_count = 64;
        session.tracks[0].step_count = 128;
        let after = canonical_hash(&session);
        assert_eq!(before, after);
    }
}
