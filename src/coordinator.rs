//! The per-session coordinator actor
//!
//! One coordinator owns exactly one session's authoritative state and runs
//! as a single task consuming a command channel: a `tokio::spawn`ed loop
//! draining an `mpsc::Receiver<Command>`, holding all mutable state itself
//! so no lock is needed. Because every command runs to completion before
//! the next is dequeued, mutations are trivially serialized: there is no
//! interleaving to reason about inside a single session.
//!
//! [`apply_mutation`] is the pure, synchronous core of the validate-and-
//! apply step; the actor loop in [`run`] wraps it with repair, seq bump,
//! persist, then broadcast/ack.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::MutationError;
use crate::hash::canonical_hash;
use crate::id::{avatar_for_connection_index, PlayerId};
use crate::model::{Session, MAX_TRACKS};
use crate::persistence::Persistence;
use crate::protocol::{Op, PlayerSummary, ServerMessage};

/// Current coordinator wall-clock time, in milliseconds since the Unix
/// epoch. Used both for `ping`/`pong` and as `server_ts` on snapshots.
/// Monotonic in practice, not by construction — this accepts the small
/// risk of a backward NTP step on the host, same as any wall-clock-based
/// system.
pub fn wall_clock_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
        * 1000.0
}

/// Apply a single mutation to `session` in place.
///
/// Validates referential integrity (unknown track ids, track-count cap)
/// and applies the delta. Range clamps are *not* done here — those are
/// performed uniformly by [`Session::validate_and_repair`] after every
/// mutation, successful or not attempted on a now-invalid value.
pub fn apply_mutation(session: &mut Session, op: &Op) -> Result<(), MutationError> {
    match op {
        Op::ToggleStep { track_id, step } => {
            let track = session
                .track_mut(track_id)
                .ok_or_else(|| MutationError::UnknownTrack(track_id.clone()))?;
            let step = *step;
            if step >= track.steps.len() {
                return Err(MutationError::MalformedPayload {
                    op: "toggle_step".into(),
                    reason: format!("step {step} out of range"),
                });
            }
            track.steps[step] = !track.steps[step];
            Ok(())
        }

        Op::SetParameterLock { track_id, step, lock } => {
            let track = session
                .track_mut(track_id)
                .ok_or_else(|| MutationError::UnknownTrack(track_id.clone()))?;
            let step = *step;
            if step >= track.parameter_locks.len() {
                return Err(MutationError::MalformedPayload {
                    op: "set_parameter_lock".into(),
                    reason: format!("step {step} out of range"),
                });
            }
            let mut lock = lock.clone();
            if let Some(l) = lock.as_mut() {
                l.clamp();
                if l.is_empty() {
                    lock = None;
                }
            }
            track.parameter_locks[step] = lock;
            Ok(())
        }

        Op::AddTrack { track } => {
            if session.tracks.len() >= MAX_TRACKS {
                return Err(MutationError::TrackLimitReached { max: MAX_TRACKS });
            }
            if session.track(&track.id).is_some() {
                return Err(MutationError::MalformedPayload {
                    op: "add_track".into(),
                    reason: format!("track id {} already exists", track.id),
                });
            }
            session.tracks.push(track.clone());
            Ok(())
        }

        Op::DeleteTrack { track_id } => {
            let index = session
                .track_index(track_id)
                .ok_or_else(|| MutationError::UnknownTrack(track_id.clone()))?;
            session.tracks.remove(index);
            Ok(())
        }

        Op::MoveTrack { track_id, to_index } => {
            let from = session
                .track_index(track_id)
                .ok_or_else(|| MutationError::UnknownTrack(track_id.clone()))?;
            let to = (*to_index).min(session.tracks.len().saturating_sub(1));
            let track = session.tracks.remove(from);
            session.tracks.insert(to, track);
            Ok(())
        }

        Op::SetTrackName { track_id, name } => {
            let track = session
                .track_mut(track_id)
                .ok_or_else(|| MutationError::UnknownTrack(track_id.clone()))?;
            track.name = name.clone();
            Ok(())
        }

        Op::SetTrackSample { track_id, sample_id } => {
            let track = session
                .track_mut(track_id)
                .ok_or_else(|| MutationError::UnknownTrack(track_id.clone()))?;
            track.sample_id = sample_id.clone();
            Ok(())
        }

        Op::SetTrackVolume { track_id, volume } => {
            let track = session
                .track_mut(track_id)
                .ok_or_else(|| MutationError::UnknownTrack(track_id.clone()))?;
            track.volume = *volume;
            Ok(())
        }

        Op::SetTrackTranspose { track_id, transpose } => {
            let track = session
                .track_mut(track_id)
                .ok_or_else(|| MutationError::UnknownTrack(track_id.clone()))?;
            track.transpose = *transpose;
            Ok(())
        }

        Op::SetTrackStepCount { track_id, step_count } => {
            let track = session
                .track_mut(track_id)
                .ok_or_else(|| MutationError::UnknownTrack(track_id.clone()))?;
            track.step_count = *step_count;
            Ok(())
        }

        Op::SetTrackPlaybackMode { track_id, mode } => {
            let track = session
                .track_mut(track_id)
                .ok_or_else(|| MutationError::UnknownTrack(track_id.clone()))?;
            track.playback_mode = *mode;
            Ok(())
        }

        Op::ClearTrack { track_id } => {
            let track = session
                .track_mut(track_id)
                .ok_or_else(|| MutationError::UnknownTrack(track_id.clone()))?;
            track.clear_pattern();
            Ok(())
        }

        Op::CopyTrackPattern { from_id, to_id } => {
            if !session.tracks.iter().any(|t| &t.id == from_id) {
                return Err(MutationError::UnknownTrack(from_id.clone()));
            }
            if !session.tracks.iter().any(|t| &t.id == to_id) {
                return Err(MutationError::UnknownTrack(to_id.clone()));
            }
            let source = session.track(from_id).expect("checked above").clone();
            let dest = session.track_mut(to_id).expect("checked above");
            dest.copy_pattern_from(&source);
            Ok(())
        }

        Op::SetTempo { bpm } => {
            session.tempo = *bpm;
            Ok(())
        }

        Op::SetSwing { percent } => {
            session.swing = *percent;
            Ok(())
        }

        Op::SetSessionName { name } => {
            session.name = name.clone();
            Ok(())
        }

        Op::SetEffects { effects } => {
            session.effects = effects.clone();
            Ok(())
        }
    }
}

/// Debounced consecutive-mismatch counter for one connection's hash
/// challenges. Two mismatches must be at least [`MISMATCH_DEBOUNCE`] apart
/// to both count, preventing a storm of snapshots while a client is merely
/// a mutation or two behind.
#[derive(Debug, Default)]
struct MismatchTracker {
    /// Consecutive mismatches counted so far.
    count: u32,
    /// When the last *counted* mismatch happened.
    last_counted_at: Option<Instant>,
}

/// Minimum spacing between two mismatches for both to count toward the
/// resync threshold.
const MISMATCH_DEBOUNCE: Duration = Duration::from_secs(2);

/// Consecutive mismatches required before an unsolicited snapshot is sent.
const MISMATCH_THRESHOLD: u32 = 2;

impl MismatchTracker {
    /// Record a mismatch at `now`. Returns `true` if the debounced
    /// threshold has just been reached and a resync should fire.
    fn record_mismatch(&mut self, now: Instant) -> bool {
        let counts = match self.last_counted_at {
            None => true,
            Some(t) => now.duration_since(t) >= MISMATCH_DEBOUNCE,
        };
        if counts {
            self.count += 1;
            self.last_counted_at = Some(now);
        }
        if self.count >= MISMATCH_THRESHOLD {
            self.count = 0;
            self.last_counted_at = None;
            true
        } else {
            false
        }
    }

    /// Record a match, resetting the streak.
    fn record_match(&mut self) {
        self.count = 0;
        self.last_counted_at = None;
    }
}

/// A registered connection: where to send `ServerMessage`s, and the
/// bookkeeping the coordinator keeps about it.
struct Connection {
    /// Channel back to this connection's send loop.
    sender: mpsc::UnboundedSender<ServerMessage>,
    /// Assigned avatar, shown in presence broadcasts.
    avatar: String,
    /// Debounced hash-mismatch tracking for this connection.
    mismatches: MismatchTracker,
}

/// Commands the coordinator actor accepts. One variant per public
/// mutation/query operation, plus connection lifecycle management that
/// the wire protocol doesn't expose directly.
pub enum Command {
    /// Register a new connection and immediately reply with a snapshot.
    Connect {
        /// The connecting player's id.
        player_id: PlayerId,
        /// Channel the coordinator will push `ServerMessage`s onto.
        sender: mpsc::UnboundedSender<ServerMessage>,
    },
    /// Deregister a connection on socket close.
    Disconnect {
        /// The disconnecting player's id.
        player_id: PlayerId,
    },
    /// A validated-at-the-wire-level mutation request.
    Mutate {
        /// Originating player.
        player_id: PlayerId,
        /// Client-chosen id for idempotent retry.
        client_op_id: String,
        /// The operation to attempt.
        op: Op,
    },
    /// Explicit snapshot request (e.g. on reconnect).
    SnapshotRequest {
        /// Requesting player.
        player_id: PlayerId,
        /// The client's last known seq, informational only — the
        /// coordinator always replies with the full current state since
        /// it does not retain a replayable mutation log.
        known_seq: Option<u64>,
    },
    /// Clock-sync probe.
    Ping {
        /// Requesting player.
        player_id: PlayerId,
        /// Client-local send timestamp, echoed back verbatim.
        client_ts: f64,
    },
    /// Divergence-detection probe.
    HashChallenge {
        /// Requesting player.
        player_id: PlayerId,
        /// The client's locally computed hash.
        local_hash: String,
        /// The seq the client computed it at.
        at_seq: u64,
    },
    /// A `mutate` envelope that failed to parse at the wire level, before
    /// it could even become an [`Op`] — an unknown op tag, or a payload
    /// that doesn't match a known tag's shape. Delivered as a direct
    /// [`ServerMessage::Nack`] with no effect on session state (§7: unknown
    /// op / malformed payload never disconnects).
    RejectMutate {
        /// Originating player.
        player_id: PlayerId,
        /// The `client_op_id` recovered from the otherwise-unparseable
        /// envelope, if the envelope carried one.
        client_op_id: String,
        /// Why the envelope was rejected.
        reason: String,
    },
    /// Stop the actor loop (graceful shutdown / eviction).
    Shutdown,
    /// Ask whether this coordinator currently has zero connections, for
    /// the registry's idle-eviction check. Never removes state itself.
    QueryIdle {
        /// Where to send the answer.
        reply: tokio::sync::oneshot::Sender<bool>,
    },
}

/// A clonable front-end for sending [`Command`]s into a running
/// coordinator actor. Cloning is cheap (an `mpsc::Sender` clone), so it can
/// be handed out freely to every connection handler that needs it.
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
}

impl CoordinatorHandle {
    /// Send a command, waiting for channel capacity if necessary.
    pub async fn send(&self, command: Command) {
        if self.commands.send(command).await.is_err() {
            warn!("coordinator actor is gone; dropping command");
        }
    }

    /// Ask whether this coordinator currently has zero connections.
    /// Returns `true` (safe to evict) if the actor is already gone.
    pub async fn is_idle(&self) -> bool {
        let (reply, rx) = tokio::sync::oneshot::channel();
        if self.commands.send(Command::QueryIdle { reply }).await.is_err() {
            return true;
        }
        rx.await.unwrap_or(true)
    }
}

/// Depth of the coordinator's command queue. Generous since mutation
/// handling is fast (in-memory apply + a local filesystem write); this
/// just absorbs bursts from many connections toggling steps at once.
const COMMAND_QUEUE_DEPTH: usize = 256;

/// Spawn a coordinator actor for `session`, returning a handle to it.
///
/// Takes ownership of `session` (already hydrated from persistence by the
/// caller — see [`crate::registry`]) and runs until a [`Command::Shutdown`]
/// is received or every sender handle is dropped.
pub fn spawn(session: Session, persistence: Persistence) -> CoordinatorHandle {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    tokio::spawn(run(session, persistence, rx));
    CoordinatorHandle { commands: tx }
}

/// The actor loop itself. Holds `session` and `connections` with no
/// synchronization: because this is the only task that ever touches them,
/// and messages are processed one at a time, there is nothing to race.
async fn run(mut session: Session, persistence: Persistence, mut commands: mpsc::Receiver<Command>) {
    let mut connections: HashMap<PlayerId, Connection> = HashMap::new();
    let mut next_connection_index: usize = 0;

    info!(session_id = %session.session_id, "coordinator actor started");

    while let Some(command) = commands.recv().await {
        match command {
            Command::Connect { player_id, sender } => {
                let avatar = avatar_for_connection_index(next_connection_index).to_string();
                next_connection_index += 1;

                let hash = canonical_hash(&session);
                let _ = sender.send(ServerMessage::Snapshot {
                    state: session.clone(),
                    seq: session.state_seq,
                    hash,
                    server_ts: wall_clock_ms(),
                });

                connections.insert(
                    player_id.clone(),
                    Connection {
                        sender,
                        avatar,
                        mismatches: MismatchTracker::default(),
                    },
                );
                debug!(player = %player_id, "connection registered");
                broadcast_presence(&connections);
            }

            Command::Disconnect { player_id } => {
                connections.remove(&player_id);
                debug!(player = %player_id, "connection removed");
                broadcast_presence(&connections);

                if connections.is_empty() {
                    if let Err(err) = persistence.write_cold(&session).await {
                        warn!(session_id = %session.session_id, error = %err, "cold-tier write on quiescence failed");
                    }
                }
            }

            Command::Mutate { player_id, client_op_id, op } => {
                handle_mutate(&mut session, &persistence, &mut connections, &player_id, client_op_id, op).await;
            }

            Command::SnapshotRequest { player_id, known_seq } => {
                debug!(player = %player_id, ?known_seq, "snapshot requested");
                if let Some(connection) = connections.get(&player_id) {
                    let hash = canonical_hash(&session);
                    let _ = connection.sender.send(ServerMessage::Snapshot {
                        state: session.clone(),
                        seq: session.state_seq,
                        hash,
                        server_ts: wall_clock_ms(),
                    });
                }
            }

            Command::Ping { player_id, client_ts } => {
                if let Some(connection) = connections.get(&player_id) {
                    let _ = connection.sender.send(ServerMessage::Pong {
                        client_ts,
                        server_ts: wall_clock_ms(),
                    });
                }
            }

            Command::HashChallenge { player_id, local_hash, at_seq } => {
                let server_hash = canonical_hash(&session);
                let matched = local_hash == server_hash;

                if let Some(connection) = connections.get_mut(&player_id) {
                    let _ = connection.sender.send(ServerMessage::HashResult {
                        matched,
                        server_hash: server_hash.clone(),
                        at_seq,
                    });

                    let should_resync = if matched {
                        connection.mismatches.record_match();
                        false
                    } else {
                        connection.mismatches.record_mismatch(Instant::now())
                    };

                    if should_resync {
                        warn!(player = %player_id, "hash mismatch debounce threshold reached; sending unsolicited snapshot");
                        let _ = connection.sender.send(ServerMessage::Snapshot {
                            state: session.clone(),
                            seq: session.state_seq,
                            hash: server_hash,
                            server_ts: wall_clock_ms(),
                        });
                    }
                }
            }

            Command::RejectMutate { player_id, client_op_id, reason } => {
                debug!(player = %player_id, %reason, "rejecting unparseable mutate envelope");
                if let Some(connection) = connections.get(&player_id) {
                    let _ = connection.sender.send(ServerMessage::Nack { client_op_id, reason });
                }
            }

            Command::Shutdown => {
                info!(session_id = %session.session_id, "coordinator actor shutting down");
                if let Err(err) = persistence.write_cold(&session).await {
                    warn!(session_id = %session.session_id, error = %err, "cold-tier write on shutdown failed");
                }
                break;
            }

            Command::QueryIdle { reply } => {
                let _ = reply.send(connections.is_empty());
            }
        }
    }
}

/// Run the full mutation-handling pipeline for one `mutate` command:
/// validate, apply, repair, bump the sequence number, persist, and
/// broadcast the outcome.
async fn handle_mutate(
    session: &mut Session,
    persistence: &Persistence,
    connections: &mut HashMap<PlayerId, Connection>,
    player_id: &PlayerId,
    client_op_id: String,
    op: Op,
) {
    // Snapshot the pre-mutation state so a persistence failure can roll
    // back in memory before nacking.
    let before = session.clone();

    let outcome = apply_mutation(session, &op);

    let nack_reason = match outcome {
        Err(err) => Some(err.to_string()),
        Ok(()) => {
            session.validate_and_repair();
            session.state_seq += 1;

            match persistence.write_hot(session).await {
                Ok(()) => None,
                Err(err) => {
                    warn!(error = %err, "hot-tier write failed; rolling back mutation");
                    *session = before;
                    Some(MutationError::PersistenceFailed(err.to_string()).to_string())
                }
            }
        }
    };

    if let Some(reason) = nack_reason {
        if let Some(connection) = connections.get(player_id) {
            let _ = connection.sender.send(ServerMessage::Nack {
                client_op_id,
                reason,
            });
        }
        return;
    }

    let hash = canonical_hash(session);
    let seq = session.state_seq;

    if let Some(connection) = connections.get(player_id) {
        let _ = connection.sender.send(ServerMessage::Ack {
            client_op_id,
            seq,
        });
    }

    for (id, connection) in connections.iter() {
        if id == player_id {
            continue;
        }
        let _ = connection.sender.send(ServerMessage::Applied {
            op: op.clone(),
            seq,
            origin_player_id: player_id.clone(),
            hash: hash.clone(),
        });
    }
}

/// Broadcast the current roster to every connected player.
fn broadcast_presence(connections: &HashMap<PlayerId, Connection>) {
    let players: Vec<PlayerSummary> = connections
        .iter()
        .map(|(id, connection)| PlayerSummary {
            player_id: id.clone(),
            avatar: connection.avatar.clone(),
        })
        .collect();

    for connection in connections.values() {
        let _ = connection.sender.send(ServerMessage::Presence {
            players: players.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Track;

    #[test]
    fn toggle_step_flips_the_bit() {
        let mut session = Session::new("s1");
        session.tracks.push(Track::new("t1", "kick", "909"));
        apply_mutation(&mut session, &Op::ToggleStep { track_id: "t1".into(), step: 0 }).unwrap();
        assert!(session.tracks[0].steps[0]);
        apply_mutation(&mut session, &Op::ToggleStep { track_id: "t1".into(), step: 0 }).unwrap();
        assert!(!session.tracks[0].steps[0]);
    }

    #[test]
    fn toggle_step_on_unknown_track_is_rejected() {
        let mut session = Session::new("s1");
        let result = apply_mutation(&mut session, &Op::ToggleStep { track_id: "ghost".into(), step: 0 });
        assert!(matches!(result, Err(MutationError::UnknownTrack(_))));
    }

    #[test]
    fn add_track_rejected_at_sixteen() {
        let mut session = Session::new("s1");
        for i in 0..MAX_TRACKS {
            session.tracks.push(Track::new(format!("t{i}"), "t", "s"));
        }
        let result = apply_mutation(
            &mut session,
            &Op::AddTrack { track: Track::new("overflow", "t", "s") },
        );
        assert!(matches!(result, Err(MutationError::TrackLimitReached { .. })));
    }

    #[test]
    fn clear_track_zeroes_all_128_slots_regardless_of_step_count() {
        let mut session = Session::new("s1");
        let mut track = Track::new("t1", "kick", "909");
        track.step_count = 16;
        track.steps[100] = true;
        session.tracks.push(track);
        apply_mutation(&mut session, &Op::ClearTrack { track_id: "t1".into() }).unwrap();
        assert!(session.tracks[0].steps.iter().all(|s| !*s));
    }

    #[test]
    fn copy_track_pattern_copies_all_128_slots() {
        let mut session = Session::new("s1");
        let mut source = Track::new("src", "src", "s");
        source.steps[127] = true;
        session.tracks.push(source);
        session.tracks.push(Track::new("dst", "dst", "s"));
        apply_mutation(&mut session, &Op::CopyTrackPattern { from_id: "src".into(), to_id: "dst".into() }).unwrap();
        assert!(session.track("dst").unwrap().steps[127]);
    }

    #[test]
    fn mismatch_tracker_requires_two_debounced_mismatches() {
        let mut tracker = MismatchTracker::default();
        let t0 = Instant::now();
        assert!(!tracker.record_mismatch(t0));
        // Too soon after the first — should not count toward the threshold.
        assert!(!tracker.record_mismatch(t0 + Duration::from_millis(500)));
        assert!(tracker.record_mismatch(t0 + Duration::from_secs(3)));
    }

    #[test]
    fn mismatch_tracker_resets_on_match() {
        let mut tracker = MismatchTracker::default();
        let t0 = Instant::now();
        tracker.record_mismatch(t0);
        tracker.record_match();
        assert!(!tracker.record_mismatch(t0 + Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn idle_query_reflects_live_connection_count() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = crate::persistence::Persistence::open(dir.path()).await.unwrap();
        let handle = spawn(Session::new("s1"), persistence);

        assert!(handle.is_idle().await);

        let (tx, _rx) = mpsc::unbounded_channel();
        handle
            .send(Command::Connect { player_id: PlayerId::generate(), sender: tx })
            .await;
        assert!(!handle.is_idle().await);

        handle.send(Command::Shutdown).await;
        assert!(handle.is_idle().await);
    }
}
