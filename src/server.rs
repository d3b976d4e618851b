//! HTTP/WebSocket surface
//!
//! An axum upgrade handler hands the raw socket off to a per-connection
//! loop that pumps messages both ways between the socket and a
//! [`CoordinatorHandle`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::any;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tracing::{debug, error, info, warn};

use crate::coordinator::Command;
use crate::error::MutationError;
use crate::id::PlayerId;
use crate::protocol::{ClientMessage, ServerMessage, KNOWN_OP_TAGS};
use crate::registry::SessionRegistry;

/// Build the application router: a single WebSocket endpoint. Static asset
/// serving and a session-URL picker UX are out of scope here.
pub fn router(registry: SessionRegistry) -> Router {
    Router::new()
        .route("/session/{session_id}", any(session_websocket_handler))
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::default().include_headers(true)))
        .with_state(Arc::new(registry))
}

/// Upgrade an HTTP connection to a WebSocket bound to one session.
async fn session_websocket_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(registry): State<Arc<SessionRegistry>>,
) -> impl IntoResponse {
    info!(%session_id, %addr, "websocket upgrade requested");
    ws.on_upgrade(move |socket| connection_loop(socket, session_id, addr, registry))
}

/// Depth of the outbound channel from the coordinator back to this
/// connection's send half.
const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// Drive one connection end to end: register with the session's
/// coordinator, then pump inbound WebSocket frames into coordinator
/// commands and outbound coordinator messages back onto the socket,
/// concurrently, until either side closes.
async fn connection_loop(socket: WebSocket, session_id: String, addr: SocketAddr, registry: Arc<SessionRegistry>) {
    let handle = registry.get_or_spawn(&session_id).await;
    let player_id = PlayerId::generate();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();
    handle
        .send(Command::Connect {
            player_id: player_id.clone(),
            sender: outbound_tx,
        })
        .await;

    let (mut sink, mut stream) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(err) => {
                    error!(error = %err, "failed to encode outgoing message");
                    continue;
                }
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                handle_inbound_text(&handle, &player_id, &text).await;
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => { /* binary/ping/pong frames carry no protocol meaning here */ }
            Some(Err(err)) => {
                warn!(%session_id, %addr, error = %err, "websocket error; closing connection");
                break;
            }
        }
    }

    handle.send(Command::Disconnect { player_id }).await;
    send_task.abort();
    debug!(%session_id, %addr, "connection closed");
}

/// A loose mirror of `{"type": "mutate", "op": {"op": ..., "payload": ...},
/// "client_op_id": ...}`, used only to recover enough of a `mutate`
/// envelope to nack it when it fails to parse as [`ClientMessage`] (§6.2,
/// §7: unknown op / malformed payload never disconnects, but the client
/// needs a `client_op_id` back to know what was rejected).
#[derive(serde::Deserialize)]
struct RawMutateEnvelope {
    /// Expected to be `"mutate"`; anything else means this wasn't a
    /// mutate envelope to begin with.
    #[serde(rename = "type")]
    kind: String,
    /// Recovered verbatim so the rejection can be nacked against it.
    client_op_id: String,
    /// The `op` field, kept as a raw value since it may not match any
    /// known [`crate::protocol::Op`] shape.
    op: serde_json::Value,
}

/// Recover a `(client_op_id, reason)` nack pair from a `mutate` envelope
/// `text` that failed to parse as a full [`ClientMessage`]. Returns `None`
/// if `text` isn't even recognizable as a `mutate` envelope with a
/// `client_op_id` — there is nothing to nack against in that case, and the
/// caller falls back to silently dropping the frame.
fn recover_mutate_nack(text: &str) -> Option<(String, String)> {
    let raw: RawMutateEnvelope = serde_json::from_str(text).ok()?;
    if raw.kind != "mutate" {
        return None;
    }

    let op_tag = raw.op.get("op").and_then(serde_json::Value::as_str);
    let reason = match op_tag {
        None => MutationError::MalformedPayload {
            op: "mutate".into(),
            reason: "missing \"op\" discriminant".into(),
        }
        .to_string(),
        Some(tag) if !KNOWN_OP_TAGS.contains(&tag) => MutationError::UnknownOp(tag.to_string()).to_string(),
        Some(tag) => {
            let payload = raw.op.get("payload").cloned().unwrap_or(serde_json::Value::Null);
            let detail = serde_json::from_value::<crate::protocol::Op>(serde_json::json!({
                "op": tag,
                "payload": payload,
            }))
            .err()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "payload did not match op shape".into());
            MutationError::MalformedPayload { op: tag.to_string(), reason: detail }.to_string()
        }
    };

    Some((raw.client_op_id, reason))
}

/// Parse and dispatch a single inbound text frame.
async fn handle_inbound_text(handle: &crate::coordinator::CoordinatorHandle, player_id: &PlayerId, text: &str) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(err) => {
            match recover_mutate_nack(text) {
                Some((client_op_id, reason)) => {
                    warn!(%reason, "rejecting unparseable mutate envelope");
                    handle
                        .send(Command::RejectMutate { player_id: player_id.clone(), client_op_id, reason })
                        .await;
                }
                None => warn!(error = %err, "discarding malformed client message"),
            }
            return;
        }
    };

    match message {
        ClientMessage::Hello { .. } => {
            // Protocol-version negotiation has no behavior yet beyond
            // accepting the connection; kept as an explicit variant so a
            // future incompatible client can be rejected at this seam.
        }
        ClientMessage::Mutate { op, client_op_id } => {
            handle
                .send(Command::Mutate {
                    player_id: player_id.clone(),
                    client_op_id,
                    op,
                })
                .await;
        }
        ClientMessage::Ping { client_ts } => {
            handle
                .send(Command::Ping {
                    player_id: player_id.clone(),
                    client_ts,
                })
                .await;
        }
        ClientMessage::SnapshotRequest { known_seq } => {
            handle
                .send(Command::SnapshotRequest {
                    player_id: player_id.clone(),
                    known_seq,
                })
                .await;
        }
        ClientMessage::HashChallenge { local_hash, at_seq } => {
            handle
                .send(Command::HashChallenge {
                    player_id: player_id.clone(),
                    local_hash,
                    at_seq,
                })
                .await;
        }
        ClientMessage::Cursor { .. } => {
            // Accepted, not broadcast: no coordinator->client envelope for
            // remote cursors is defined on the wire. See DESIGN.md.
        }
    }
}
