//! Local optimistic mirror and outbox (§4.5)
//!
//! Every local edit is applied to the mirror immediately (so the UI never
//! waits on a round trip) and queued in an outbox keyed by a client-chosen
//! `client_op_id`. An `ack` retires the matching outbox entry; a `nack`
//! rolls the mirror back to the state captured just before that entry was
//! applied and replays everything queued after it, so a rejected edit
//! never leaves stray descendants in the mirror. An `applied` broadcast
//! from another player's mutation is just applied directly — there is
//! nothing of ours to reconcile against it.
//!
//! Reuses [`crate::coordinator::apply_mutation`] for the actual apply step
//! so the client and coordinator can never disagree about what an `Op`
//! does — the whole point of a canonical hash depends on that.

use crate::coordinator::apply_mutation;
use crate::model::Session;
use crate::protocol::{ClientMessage, Op};

/// One mutation sent but not yet acked or nacked.
struct PendingOp {
    /// Id this outbox entry was submitted under.
    client_op_id: String,
    /// The operation itself, kept so it can be replayed during rollback.
    op: Op,
    /// Mirror state immediately before this op was applied.
    pre_state: Session,
}

/// Local mirror of session state plus its outbox of in-flight mutations.
pub struct Reducer {
    /// The client's local copy of session state.
    mirror: Session,
    /// Mutations submitted but not yet confirmed.
    pending: Vec<PendingOp>,
}

impl Reducer {
    /// Construct a reducer seeded from an initial snapshot.
    pub fn new(mirror: Session) -> Self {
        Reducer { mirror, pending: Vec::new() }
    }

    /// The current mirror, including unconfirmed local edits.
    pub fn mirror(&self) -> &Session {
        &self.mirror
    }

    /// Apply a local edit optimistically and return the `mutate` envelope
    /// to send over the wire. The caller is responsible for generating
    /// `client_op_id` (typically a fresh UUID) so retries after a
    /// reconnect can reuse the same id.
    pub fn apply_local(&mut self, op: Op, client_op_id: String) -> ClientMessage {
        let pre_state = self.mirror.clone();
        if apply_mutation(&mut self.mirror, &op).is_ok() {
            self.mirror.validate_and_repair();
        }
        self.pending.push(PendingOp { client_op_id: client_op_id.clone(), op: op.clone(), pre_state });
        ClientMessage::Mutate { op, client_op_id }
    }

    /// Retire a confirmed mutation and advance the mirror's seq.
    pub fn on_ack(&mut self, client_op_id: &str, seq: u64) {
        self.pending.retain(|p| p.client_op_id != client_op_id);
        self.mirror.state_seq = seq;
    }

    /// Apply a confirmed remote mutation (broadcast to everyone but its
    /// originator) and advance the mirror's seq.
    pub fn on_applied(&mut self, op: &Op, seq: u64) {
        if apply_mutation(&mut self.mirror, op).is_ok() {
            self.mirror.validate_and_repair();
        }
        self.mirror.state_seq = seq;
    }

    /// Roll back a rejected mutation: restore the mirror to how it looked
    /// just before the nacked op was applied, drop it from the outbox, and
    /// replay everything queued after it (each against a freshly captured
    /// pre-state, so a later nack can still roll back correctly).
    pub fn on_nack(&mut self, client_op_id: &str) {
        let Some(pos) = self.pending.iter().position(|p| p.client_op_id == client_op_id) else {
            return;
        };

        let rollback_to = self.pending[pos].pre_state.clone();
        let trailing = self.pending.split_off(pos + 1);
        self.pending.truncate(pos);
        self.mirror = rollback_to;

        for trailing_op in trailing {
            let pre_state = self.mirror.clone();
            if apply_mutation(&mut self.mirror, &trailing_op.op).is_ok() {
                self.mirror.validate_and_repair();
            }
            self.pending.push(PendingOp {
                client_op_id: trailing_op.client_op_id,
                op: trailing_op.op,
                pre_state,
            });
        }
    }

    /// Replace the mirror wholesale with a coordinator snapshot, clearing
    /// the outbox (a full resync supersedes anything still in flight).
    ///
    /// Local-only fields (`muted`, `soloed`) are never part of a snapshot
    /// — they're carried forward from the previous mirror by track id so
    /// a resync can never silently unmute a track a player muted for
    /// themselves ("my ears, my control").
    pub fn apply_snapshot(&mut self, mut state: Session) {
        for track in state.tracks.iter_mut() {
            if let Some(old) = self.mirror.track(&track.id) {
                track.muted = old.muted;
                track.soloed = old.soloed;
            }
        }
        self.mirror = state;
        self.pending.clear();
    }

    /// Outbox entries still awaiting an ack/nack, for replay on reconnect.
    pub fn pending_messages(&self) -> Vec<ClientMessage> {
        self.pending
            .iter()
            .map(|p| ClientMessage::Mutate { op: p.op.clone(), client_op_id: p.client_op_id.clone() })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Track;

    fn session_with_one_track() -> Session {
        let mut session = Session::new("s1");
        session.tracks.push(Track::new("t1", "kick", "909"));
        session
    }

    #[test]
    fn local_edit_applies_immediately() {
        let mut reducer = Reducer::new(session_with_one_track());
        reducer.apply_local(Op::ToggleStep { track_id: "t1".into(), step: 0 }, "op-1".into());
        assert!(reducer.mirror().tracks[0].steps[0]);
    }

    #[test]
    fn ack_retires_the_outbox_entry() {
        let mut reducer = Reducer::new(session_with_one_track());
        reducer.apply_local(Op::ToggleStep { track_id: "t1".into(), step: 0 }, "op-1".into());
        reducer.on_ack("op-1", 1);
        assert!(reducer.pending_messages().is_empty());
        assert_eq!(reducer.mirror().state_seq, 1);
    }

    #[test]
    fn nack_rolls_back_only_the_rejected_edit() {
        let mut reducer = Reducer::new(session_with_one_track());
        reducer.apply_local(Op::ToggleStep { track_id: "t1".into(), step: 0 }, "op-1".into());
        reducer.apply_local(Op::ToggleStep { track_id: "t1".into(), step: 1 }, "op-2".into());
        reducer.on_nack("op-1");
        // op-1's edit (step 0) is rolled back, but op-2's edit (step 1) survives.
        assert!(!reducer.mirror().tracks[0].steps[0]);
        assert!(reducer.mirror().tracks[0].steps[1]);
        assert_eq!(reducer.pending_messages().len(), 1);
    }

    #[test]
    fn snapshot_preserves_local_only_mute_and_solo() {
        let mut reducer = Reducer::new(session_with_one_track());
        reducer.mirror.tracks[0].muted = true;

        let mut incoming = session_with_one_track();
        incoming.tempo = 140.0;
        reducer.apply_snapshot(incoming);

        assert_eq!(reducer.mirror().tempo, 140.0);
        assert!(reducer.mirror().tracks[0].muted);
    }

    #[test]
    fn applied_from_another_player_advances_seq() {
        let mut reducer = Reducer::new(session_with_one_track());
        reducer.on_applied(&Op::SetTempo { bpm: 130.0 }, 5);
        assert_eq!(reducer.mirror().tempo, 130.0);
        assert_eq!(reducer.mirror().state_seq, 5);
    }
}
