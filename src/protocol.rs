//! The wire protocol between clients and the session coordinator
//!
//! All messages are JSON-framed over WebSocket (§4.3). `Op` is the tagged
//! discriminated union over every mutation in §6.2; each variant carries
//! only the minimum delta (track id + step index + new value), never the
//! whole track. The tagged-enum shape mirrors the `ControlMessage` pattern
//! used for the AANP WebSocket control channel in the wider Rust audio
//! ecosystem this crate draws from — `#[serde(tag = "...")]` over a plain
//! enum, rather than hand-rolled discriminator fields.

use serde::{Deserialize, Serialize};

use crate::id::PlayerId;
use crate::model::{ParameterLock, PlaybackMode, Session, Track};

/// The authoritative mutation op set (§6.2). Unknown ops fail to parse as
/// this enum and are rejected with [`crate::error::MutationError::UnknownOp`]
/// at the layer above.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", content = "payload", rename_all = "snake_case")]
pub enum Op {
    /// Flip `tracks[track_id].steps[step]`.
    ToggleStep {
        /// Track to mutate.
        track_id: String,
        /// Step index, `[0, 128)`.
        step: usize,
    },
    /// Replace or clear a step's parameter lock.
    SetParameterLock {
        /// Track to mutate.
        track_id: String,
        /// Step index, `[0, 128)`.
        step: usize,
        /// New lock, or `None` to clear it.
        lock: Option<ParameterLock>,
    },
    /// Append a new track; rejected once the session holds
    /// [`crate::model::MAX_TRACKS`].
    AddTrack {
        /// The track to append, fully specified by the client.
        track: Track,
    },
    /// Remove a track.
    DeleteTrack {
        /// Track to remove.
        track_id: String,
    },
    /// Reorder a track to a new index.
    MoveTrack {
        /// Track to move.
        track_id: String,
        /// Destination index in the `tracks` sequence.
        to_index: usize,
    },
    /// Rename a track.
    SetTrackName {
        /// Track to rename.
        track_id: String,
        /// New name.
        name: String,
    },
    /// Change a track's instrument/sample reference.
    SetTrackSample {
        /// Track to mutate.
        track_id: String,
        /// New sample/preset reference.
        sample_id: String,
    },
    /// Set a track's volume.
    SetTrackVolume {
        /// Track to mutate.
        track_id: String,
        /// New volume, clamped to `[0, 2]`.
        volume: f64,
    },
    /// Set a track's transpose.
    SetTrackTranspose {
        /// Track to mutate.
        track_id: String,
        /// New transpose in semitones, clamped to `[-24, 24]`.
        transpose: i32,
    },
    /// Change a track's view-window length. Storage arrays are never
    /// resized.
    SetTrackStepCount {
        /// Track to mutate.
        track_id: String,
        /// Requested step count; snapped to the nearest valid value.
        step_count: u32,
    },
    /// Set a track's playback mode.
    SetTrackPlaybackMode {
        /// Track to mutate.
        track_id: String,
        /// New mode.
        mode: PlaybackMode,
    },
    /// Zero a track's steps and parameter locks across all 128 slots.
    ClearTrack {
        /// Track to clear.
        track_id: String,
    },
    /// Deep-copy one track's pattern data onto another's, across all 128
    /// slots, always.
    CopyTrackPattern {
        /// Source track.
        from_id: String,
        /// Destination track.
        to_id: String,
    },
    /// Set the session tempo.
    SetTempo {
        /// New BPM, clamped to `[20, 300]`.
        bpm: f64,
    },
    /// Set the session swing percentage.
    SetSwing {
        /// New swing percent, clamped to `[0, 100]`.
        percent: f64,
    },
    /// Rename the session.
    SetSessionName {
        /// New name.
        name: Option<String>,
    },
    /// Replace the global effects blob, opaque to the core.
    SetEffects {
        /// New effects parameters.
        effects: serde_json::Value,
    },
}

/// Every `op` discriminant [`Op`] accepts, in wire form (`snake_case`).
/// Used by [`crate::server`] to tell an unknown op apart from a known op
/// with a malformed payload when the envelope fails to parse as a whole.
pub const KNOWN_OP_TAGS: &[&str] = &[
    "toggle_step",
    "set_parameter_lock",
    "add_track",
    "delete_track",
    "move_track",
    "set_track_name",
    "set_track_sample",
    "set_track_volume",
    "set_track_transpose",
    "set_track_step_count",
    "set_track_playback_mode",
    "clear_track",
    "copy_track_pattern",
    "set_tempo",
    "set_swing",
    "set_session_name",
    "set_effects",
];

/// Messages sent from a client to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Initial handshake after connecting.
    Hello {
        /// Client's protocol version, for compatibility checks.
        client_protocol_version: u32,
    },
    /// A mutation request. `client_op_id` allows idempotent retry from the
    /// outbox after a reconnect.
    Mutate {
        /// The operation to apply.
        op: Op,
        /// Stable id for this submission, used to de-duplicate retries.
        client_op_id: String,
    },
    /// Clock-sync probe.
    Ping {
        /// Client-local timestamp (milliseconds since an arbitrary epoch).
        client_ts: f64,
    },
    /// Request a full snapshot, optionally hinting the last known seq.
    SnapshotRequest {
        /// The highest `seq` this client has already applied, if any.
        known_seq: Option<u64>,
    },
    /// Divergence-detection probe: the client's locally computed hash at
    /// a given seq.
    HashChallenge {
        /// Client's canonical hash.
        local_hash: String,
        /// The seq at which the client computed `local_hash`.
        at_seq: u64,
    },
    /// Ephemeral, unsequenced, unpersisted cursor broadcast.
    Cursor {
        /// Cursor x position (UI-defined units).
        x: f64,
        /// Cursor y position (UI-defined units).
        y: f64,
    },
}

/// Messages sent from the coordinator to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full state snapshot.
    Snapshot {
        /// Complete session state.
        state: Session,
        /// The `state_seq` this snapshot was taken at.
        seq: u64,
        /// Canonical hash of `state` at `seq`.
        hash: String,
        /// Coordinator wall-clock time, milliseconds.
        server_ts: f64,
    },
    /// A confirmed mutation delta, broadcast to every connection except
    /// the originator.
    Applied {
        /// The operation that was applied.
        op: Op,
        /// The resulting sequence number.
        seq: u64,
        /// Id of the player whose mutation this was.
        origin_player_id: PlayerId,
        /// Canonical hash of the resulting state.
        hash: String,
    },
    /// Acknowledges a mutation to its originator only.
    Ack {
        /// The `client_op_id` being acknowledged.
        client_op_id: String,
        /// The sequence number assigned to this mutation.
        seq: u64,
    },
    /// A mutation was rejected.
    Nack {
        /// The `client_op_id` being rejected.
        client_op_id: String,
        /// Why it was rejected.
        reason: String,
    },
    /// Clock-sync reply.
    Pong {
        /// Echoes the client's `client_ts`.
        client_ts: f64,
        /// Coordinator wall-clock time, milliseconds.
        server_ts: f64,
    },
    /// Result of a hash challenge.
    HashResult {
        /// Whether the client's hash matched.
        matched: bool,
        /// The coordinator's hash at `at_seq`.
        server_hash: String,
        /// The seq the comparison was made at.
        at_seq: u64,
    },
    /// Current connected-player roster.
    Presence {
        /// Players currently connected.
        players: Vec<PlayerSummary>,
    },
}

/// Public-facing summary of a connected player, used in `presence`
/// broadcasts. Does not include local-only state (mute/solo are per-client
/// and never known to the coordinator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerSummary {
    /// The player's connection-scoped id.
    pub player_id: PlayerId,
    /// Assigned color/animal avatar.
    pub avatar: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_round_trips_through_json() {
        let op = Op::ToggleStep {
            track_id: "t1".into(),
            step: 3,
        };
        let json = serde_json::to_string(&op).unwrap();
        let back: Op = serde_json::from_str(&json).unwrap();
        assert_eq!(op, back);
    }

    #[test]
    fn unknown_op_fails_to_parse() {
        let json = r#"{"op":"not_a_real_op","payload":{}}"#;
        let result: Result<Op, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn mutate_envelope_round_trips() {
        let message = ClientMessage::Mutate {
            op: Op::SetTempo { bpm: 128.0 },
            client_op_id: "abc-123".into(),
        };
        let json = serde_json::to_string(&message).unwrap();
        let back: ClientMessage = serde_json::from_str(&json).unwrap();
        match back {
            ClientMessage::Mutate { op, client_op_id } => {
                assert_eq!(client_op_id, "abc-123");
                assert_eq!(op, Op::SetTempo { bpm: 128.0 });
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
