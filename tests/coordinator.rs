//! End-to-end coordinator scenarios, driving the actor directly through
//! its command channel rather than through real sockets — the same
//! in-process approach the unit tests in `coordinator.rs` use, scaled up
//! to multi-connection scenarios.

use tokio::sync::mpsc;

use keyboardia::coordinator::{spawn, Command};
use keyboardia::id::PlayerId;
use keyboardia::model::{Session, Track};
use keyboardia::persistence::Persistence;
use keyboardia::protocol::{Op, ServerMessage};

async fn open_store() -> Persistence {
    let dir = tempfile::tempdir().unwrap();
    Persistence::open(dir.path()).await.unwrap()
}

#[tokio::test]
async fn concurrent_edits_from_two_players_serialize_and_broadcast_correctly() {
    let persistence = open_store().await;
    let mut session = Session::new("s1");
    session.tracks.push(Track::new("t1", "kick", "909"));
    let handle = spawn(session, persistence);

    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let player_a = PlayerId::generate();
    handle
        .send(Command::Connect { player_id: player_a.clone(), sender: tx_a })
        .await;
    assert!(matches!(rx_a.recv().await.unwrap(), ServerMessage::Snapshot { .. }));
    assert!(matches!(rx_a.recv().await.unwrap(), ServerMessage::Presence { .. })); // just a

    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    let player_b = PlayerId::generate();
    handle
        .send(Command::Connect { player_id: player_b.clone(), sender: tx_b })
        .await;
    assert!(matches!(rx_b.recv().await.unwrap(), ServerMessage::Snapshot { .. }));
    assert!(matches!(rx_b.recv().await.unwrap(), ServerMessage::Presence { .. })); // a + b
    assert!(matches!(rx_a.recv().await.unwrap(), ServerMessage::Presence { .. })); // a + b

    handle
        .send(Command::Mutate {
            player_id: player_a.clone(),
            client_op_id: "op-a".into(),
            op: Op::ToggleStep { track_id: "t1".into(), step: 0 },
        })
        .await;

    match rx_a.recv().await.unwrap() {
        ServerMessage::Ack { client_op_id, seq } => {
            assert_eq!(client_op_id, "op-a");
            assert_eq!(seq, 1);
        }
        other => panic!("expected ack, got {other:?}"),
    }
    match rx_b.recv().await.unwrap() {
        ServerMessage::Applied { seq, origin_player_id, .. } => {
            assert_eq!(seq, 1);
            assert_eq!(origin_player_id, player_a);
        }
        other => panic!("expected applied, got {other:?}"),
    }

    handle
        .send(Command::Mutate {
            player_id: player_b.clone(),
            client_op_id: "op-b".into(),
            op: Op::ToggleStep { track_id: "t1".into(), step: 1 },
        })
        .await;

    match rx_b.recv().await.unwrap() {
        ServerMessage::Ack { client_op_id, seq } => {
            assert_eq!(client_op_id, "op-b");
            assert_eq!(seq, 2);
        }
        other => panic!("expected ack, got {other:?}"),
    }
    match rx_a.recv().await.unwrap() {
        ServerMessage::Applied { seq, origin_player_id, .. } => {
            assert_eq!(seq, 2);
            assert_eq!(origin_player_id, player_b);
        }
        other => panic!("expected applied, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_track_mutation_is_nacked_and_does_not_advance_seq() {
    let persistence = open_store().await;
    let session = Session::new("s1");
    let handle = spawn(session, persistence);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let player = PlayerId::generate();
    handle
        .send(Command::Connect { player_id: player.clone(), sender: tx })
        .await;
    let _ = rx.recv().await; // snapshot
    let _ = rx.recv().await; // presence

    handle
        .send(Command::Mutate {
            player_id: player,
            client_op_id: "op-1".into(),
            op: Op::ToggleStep { track_id: "ghost".into(), step: 0 },
        })
        .await;

    match rx.recv().await.unwrap() {
        ServerMessage::Nack { client_op_id, .. } => assert_eq!(client_op_id, "op-1"),
        other => panic!("expected nack, got {other:?}"),
    }
}

#[tokio::test]
async fn reconnect_after_edits_receives_a_snapshot_reflecting_them() {
    let persistence = open_store().await;
    let mut session = Session::new("s1");
    session.tracks.push(Track::new("t1", "kick", "909"));
    let handle = spawn(session, persistence);

    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let player_a = PlayerId::generate();
    handle
        .send(Command::Connect { player_id: player_a.clone(), sender: tx_a })
        .await;
    let _ = rx_a.recv().await;
    let _ = rx_a.recv().await;

    handle
        .send(Command::Mutate {
            player_id: player_a.clone(),
            client_op_id: "op-1".into(),
            op: Op::SetTempo { bpm: 140.0 },
        })
        .await;
    let _ = rx_a.recv().await; // ack

    // Player disconnects, then reconnects under a new connection.
    handle.send(Command::Disconnect { player_id: player_a.clone() }).await;

    let (tx_reconnect, mut rx_reconnect) = mpsc::unbounded_channel();
    handle
        .send(Command::Connect { player_id: player_a.clone(), sender: tx_reconnect })
        .await;

    match rx_reconnect.recv().await.unwrap() {
        ServerMessage::Snapshot { state, seq, .. } => {
            assert_eq!(state.tempo, 140.0);
            assert_eq!(seq, 1);
        }
        other => panic!("expected snapshot, got {other:?}"),
    }
}

#[tokio::test]
async fn hash_mismatch_debounced_twice_triggers_an_unsolicited_snapshot() {
    let persistence = open_store().await;
    let session = Session::new("s1");
    let handle = spawn(session, persistence);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let player = PlayerId::generate();
    handle
        .send(Command::Connect { player_id: player.clone(), sender: tx })
        .await;
    let _ = rx.recv().await; // snapshot
    let _ = rx.recv().await; // presence

    handle
        .send(Command::HashChallenge { player_id: player.clone(), local_hash: "wrong".into(), at_seq: 0 })
        .await;
    match rx.recv().await.unwrap() {
        ServerMessage::HashResult { matched, .. } => assert!(!matched),
        other => panic!("expected hash_result, got {other:?}"),
    }

    // Too soon after the first mismatch; debounced and should not count.
    handle
        .send(Command::HashChallenge { player_id: player.clone(), local_hash: "wrong".into(), at_seq: 0 })
        .await;
    match rx.recv().await.unwrap() {
        ServerMessage::HashResult { matched, .. } => assert!(!matched),
        other => panic!("expected hash_result, got {other:?}"),
    }
    // No unsolicited snapshot yet — only two HashResults so far.

    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    handle
        .send(Command::HashChallenge { player_id: player.clone(), local_hash: "still-wrong".into(), at_seq: 0 })
        .await;
    match rx.recv().await.unwrap() {
        ServerMessage::HashResult { matched, .. } => assert!(!matched),
        other => panic!("expected hash_result, got {other:?}"),
    }
    match rx.recv().await.unwrap() {
        ServerMessage::Snapshot { .. } => {}
        other => panic!("expected unsolicited snapshot after debounced mismatch threshold, got {other:?}"),
    }
}
