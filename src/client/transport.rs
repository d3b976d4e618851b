//! WebSocket transport: connection lifecycle, reconnection, heartbeat
//!
//! A single `tokio::select!` loop multiplexes inbound frames, outbound
//! sends, and a periodic heartbeat timer over one `tokio-tungstenite`
//! WebSocket. Backoff is exponential with jitter rather than a flat retry
//! count, since a reconnect storm against one coordinator is a much
//! sharper failure mode than a single dropped connection.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use crate::coordinator::wall_clock_ms;
use crate::protocol::{ClientMessage, ServerMessage};

/// Connection lifecycle state, mirroring the browser `WebSocket` states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket, not attempting to connect.
    Closed,
    /// A connection attempt is in flight.
    Connecting,
    /// Connected and able to send/receive.
    Open,
    /// Closing deliberately (not a failure); will not auto-reconnect.
    Closing,
}

/// Base reconnect delay.
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Maximum reconnect delay.
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Jitter applied to each backoff delay, as a fraction of the delay.
const BACKOFF_JITTER: f64 = 0.25;

/// Heartbeat ping interval while connected.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a `pong` before treating the connection as dead.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

/// Exponential backoff with jitter for reconnect attempt `attempt` (0-based).
pub fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.min(8); // 2^8 * 1s already exceeds BACKOFF_MAX
    let base = BACKOFF_BASE.saturating_mul(1u32 << exponent).min(BACKOFF_MAX);
    let jitter_range = base.as_secs_f64() * BACKOFF_JITTER;
    let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
    Duration::from_secs_f64((base.as_secs_f64() + jitter).max(0.0))
}

/// Run the transport against `url` until `outbound` is closed by the
/// caller (i.e. the client is shutting down deliberately). Reconnects
/// with backoff on any failure; publishes lifecycle transitions on
/// `state_tx` and forwards every parsed [`ServerMessage`] to `inbound`.
///
/// Outbound [`ClientMessage`]s queued while disconnected are held by the
/// caller (typically replayed from [`crate::client::reducer::Reducer::pending_messages`]
/// once the socket reopens) — this function only drains what's already in
/// the channel at the moment it's connected.
pub async fn run(
    url: String,
    mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    inbound: mpsc::UnboundedSender<ServerMessage>,
    state_tx: watch::Sender<ConnectionState>,
) {
    let mut attempt: u32 = 0;

    loop {
        let _ = state_tx.send(ConnectionState::Connecting);
        let connected = tokio_tungstenite::connect_async(&url).await;

        let ws_stream = match connected {
            Ok((stream, _response)) => stream,
            Err(err) => {
                warn!(%url, error = %err, attempt, "failed to connect; backing off");
                let _ = state_tx.send(ConnectionState::Closed);
                tokio::time::sleep(backoff_delay(attempt)).await;
                attempt += 1;
                continue;
            }
        };

        info!(%url, "websocket connected");
        attempt = 0;
        let _ = state_tx.send(ConnectionState::Open);

        let (mut sink, mut stream) = ws_stream.split();
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        let mut last_pong = tokio::time::Instant::now();

        'connection: loop {
            tokio::select! {
                outgoing = outbound.recv() => {
                    match outgoing {
                        Some(message) => {
                            if send_message(&mut sink, &message).await.is_err() {
                                break 'connection;
                            }
                        }
                        None => {
                            let _ = state_tx.send(ConnectionState::Closing);
                            let _ = sink.close().await;
                            return;
                        }
                    }
                }

                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(WsMessage::Text(text))) => {
                            match serde_json::from_str::<ServerMessage>(&text) {
                                Ok(message) => {
                                    if matches!(message, ServerMessage::Pong { .. }) {
                                        last_pong = tokio::time::Instant::now();
                                    }
                                    if inbound.send(message).is_err() {
                                        debug!("inbound receiver dropped; stopping transport");
                                        return;
                                    }
                                }
                                Err(err) => warn!(error = %err, "discarding malformed server message"),
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            info!("server closed the connection");
                            break 'connection;
                        }
                        Some(Ok(_)) => { /* binary/ping/pong frames carry no protocol meaning */ }
                        Some(Err(err)) => {
                            warn!(error = %err, "websocket error; reconnecting");
                            break 'connection;
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    if last_pong.elapsed() > HEARTBEAT_INTERVAL + HEARTBEAT_TIMEOUT {
                        warn!("heartbeat timed out; reconnecting");
                        break 'connection;
                    }
                    let ping = ClientMessage::Ping { client_ts: wall_clock_ms() };
                    if send_message(&mut sink, &ping).await.is_err() {
                        break 'connection;
                    }
                }
            }
        }

        let _ = state_tx.send(ConnectionState::Closed);
        tokio::time::sleep(backoff_delay(attempt)).await;
        attempt += 1;
    }
}

/// Encode and send one client message over the socket.
async fn send_message<S>(sink: &mut S, message: &ClientMessage) -> Result<(), ()>
where
    S: futures::Sink<WsMessage> + Unpin,
{
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(err) => {
            error!(error = %err, "failed to encode outgoing message");
            return Err(());
        }
    };
    sink.send(WsMessage::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps_at_the_maximum() {
        let short = backoff_delay(0);
        assert!(short >= Duration::from_millis(750) && short <= Duration::from_millis(1250));

        let long = backoff_delay(20);
        assert!(long <= BACKOFF_MAX + Duration::from_secs(1));
    }

    #[test]
    fn backoff_is_monotonically_non_decreasing_in_expectation() {
        // Compare midpoints (jitter-free) rather than individual jittered
        // samples, which can cross due to randomness at adjacent attempts.
        let midpoint = |attempt: u32| {
            let exponent = attempt.min(8);
            BACKOFF_BASE.saturating_mul(1u32 << exponent).min(BACKOFF_MAX)
        };
        assert!(midpoint(0) < midpoint(3));
        assert!(midpoint(5) <= midpoint(10));
    }
}
