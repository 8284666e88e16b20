//! WebSocket upgrade handler and per-connection event loop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time;

use crate::auth::connect::ConnectRequest;
use crate::auth::identity::{Identity, VerifyError};
use crate::AppState;

use super::envelope::{Envelope, MessageKind};
use super::registry::{Connection, OutboundFrame, OUTBOUND_QUEUE_DEPTH};
use super::throttle::FlushFn;

/// Close codes (4000-range for application-level).
const CLOSE_PROTOCOL_ERROR: u16 = 4000;
const CLOSE_NOT_AUTHENTICATED: u16 = 4003;
const CLOSE_AUTH_FAILED: u16 = 4004;
const CLOSE_SESSION_TIMEOUT: u16 = 4009;

/// Timeout for receiving IDENTIFY after connection (seconds).
const IDENTIFY_TIMEOUT_SECS: u64 = 10;

/// Throttle key for fan-out of client chat traffic.
const CHAT_THROTTLE_KEY: &str = "chat";

pub fn router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let connect = ConnectRequest::from_upgrade(params.get("token").cloned(), &headers);
    ws.on_upgrade(move |socket| handle_connection(socket, state, connect))
}

async fn handle_connection(socket: WebSocket, state: AppState, mut connect: ConnectRequest) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Step 1: Wait for IDENTIFY within the timeout. Nothing else is
    // processed on an unadmitted connection.
    let identify_result = time::timeout(Duration::from_secs(IDENTIFY_TIMEOUT_SECS), async {
        while let Some(msg) = ws_rx.next().await {
            let msg = match msg {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!(?e, "ws read error during identify");
                    return Err("read error");
                }
            };

            let text = match msg {
                Message::Text(t) => t,
                Message::Close(_) => return Err("client closed"),
                Message::Ping(_) | Message::Pong(_) => continue,
                _ => continue,
            };

            let envelope: Envelope = match serde_json::from_str(&text) {
                Ok(e) => e,
                Err(_) => return Err("invalid JSON"),
            };

            if envelope.kind != MessageKind::Identify {
                return Err("expected identify");
            }
            let handshake_token = envelope
                .data
                .get("token")
                .and_then(|v| v.as_str())
                .map(|t| t.to_string());
            return Ok(handshake_token);
        }
        Err("connection closed before identify")
    })
    .await;

    connect.handshake_token = match identify_result {
        Ok(Ok(token)) => token,
        Ok(Err(reason)) => {
            tracing::debug!(%reason, "identify handshake failed");
            let _ = send_close(&mut ws_tx, CLOSE_PROTOCOL_ERROR, reason).await;
            return;
        }
        Err(_timeout) => {
            let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Handshake timeout").await;
            return;
        }
    };

    // Step 2: Resolve the credential and verify it against the identity
    // service. This is the sole admission gate.
    let Some(credential) = connect.credential() else {
        let _ = send_close(&mut ws_tx, CLOSE_NOT_AUTHENTICATED, "Missing credential").await;
        return;
    };

    let identity = match state.verifier.verify(credential).await {
        Ok(identity) => identity,
        Err(VerifyError::Rejected(reason)) => {
            tracing::debug!(%reason, "credential rejected");
            let _ = send_close(&mut ws_tx, CLOSE_AUTH_FAILED, "Invalid credential").await;
            return;
        }
        Err(VerifyError::Unavailable(reason)) => {
            tracing::error!(%reason, "identity service unavailable");
            let _ =
                send_close(&mut ws_tx, CLOSE_PROTOCOL_ERROR, "Identity service unavailable").await;
            return;
        }
    };

    // Step 3: Register the connection and greet the client.
    let connection_id = courier_common::id::prefixed_ulid("conn");
    let (sender, outbound_rx) = mpsc::channel::<OutboundFrame>(OUTBOUND_QUEUE_DEPTH);
    state.registry.add_client(Connection {
        connection_id: connection_id.clone(),
        identity: Some(identity.clone()),
        sender,
    });

    tracing::info!(
        connection_id = %connection_id,
        user_id = %identity.id,
        "gateway connection established"
    );

    let ready = Envelope::new(
        MessageKind::Ready,
        serde_json::json!({
            "connection_id": connection_id,
            "user": {
                "id": identity.id,
                "display_name": identity.display_name,
                "roles": identity.roles,
            },
            "heartbeat_interval_ms": state.config.heartbeat_interval_ms,
        }),
    );
    let ready_json = serde_json::to_string(&ready).unwrap();
    if ws_tx.send(Message::Text(ready_json.into())).await.is_err() {
        state.registry.remove_client(&connection_id);
        return;
    }

    // Step 4: Replay missed notifications in the background; the sends go
    // through the registry's outbound queue, so the live loop is unaffected.
    {
        let delivery = Arc::clone(&state.delivery);
        let user_id = identity.id.clone();
        tokio::spawn(async move {
            let mut already_pushed = HashSet::new();
            if let Err(err) = delivery.replay_recent_unread(&user_id, &mut already_pushed).await {
                tracing::warn!(user_id = %user_id, %err, "unread replay failed");
            }
        });
    }

    run_session(&state, &connection_id, &identity, ws_tx, ws_rx, outbound_rx).await;

    state.registry.remove_client(&connection_id);
    tracing::info!(
        connection_id = %connection_id,
        user_id = %identity.id,
        "gateway connection ended"
    );
}

/// Main session event loop: read client envelopes, drain the outbound queue.
async fn run_session(
    state: &AppState,
    connection_id: &str,
    identity: &Identity,
    mut ws_tx: futures_util::stream::SplitSink<WebSocket, Message>,
    mut ws_rx: futures_util::stream::SplitStream<WebSocket>,
    mut outbound_rx: mpsc::Receiver<OutboundFrame>,
) {
    loop {
        tokio::select! {
            // A frame queued for this connection by a push or broadcast.
            frame = outbound_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if ws_tx.send(Message::Text(frame.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    // Registry dropped our sender — the stale sweep
                    // reclaimed this connection.
                    None => {
                        let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Connection reclaimed").await;
                        break;
                    }
                }
            }

            // Client sends us a message.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let envelope: Envelope = match serde_json::from_str(&text) {
                            Ok(e) => e,
                            Err(_) => {
                                let _ = send_close(&mut ws_tx, CLOSE_PROTOCOL_ERROR, "Invalid JSON").await;
                                break;
                            }
                        };

                        match envelope.kind {
                            MessageKind::Ping => {
                                state.registry.update_heartbeat(connection_id);
                                let pong = serde_json::to_string(&Envelope::pong()).unwrap();
                                if ws_tx.send(Message::Text(pong.into())).await.is_err() {
                                    break;
                                }
                            }
                            MessageKind::ChatMessage => {
                                handle_chat(state, identity, envelope);
                            }
                            MessageKind::Identify => {
                                let _ = send_close(&mut ws_tx, CLOSE_PROTOCOL_ERROR, "Already identified").await;
                                break;
                            }
                            other => {
                                tracing::debug!(connection_id = %connection_id, kind = ?other, "unsupported inbound type");
                                let error = serde_json::to_string(&Envelope::error("Unsupported message type")).unwrap();
                                if ws_tx.send(Message::Text(error.into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(?e, connection_id = %connection_id, "ws read error");
                        break;
                    }
                    _ => continue,
                }
            }
        }
    }
}

/// Inbound chat: rate-limit, then batch through the throttler into a
/// broadcast. An over-limit message is dropped; the sender stays connected.
fn handle_chat(state: &AppState, identity: &Identity, envelope: Envelope) {
    if !state.limiter.check(&identity.id) {
        tracing::debug!(user_id = %identity.id, "inbound rate limit exceeded, dropping message");
        return;
    }

    let outbound = Envelope::new(
        MessageKind::ChatMessage,
        serde_json::json!({
            "from": identity.id,
            "body": envelope.data,
        }),
    );

    let registry = Arc::clone(&state.registry);
    let on_flush: FlushFn = Arc::new(move |batch| {
        for envelope in &batch {
            registry.broadcast_to_all(envelope);
        }
    });
    state.throttler.add(CHAT_THROTTLE_KEY, outbound, on_flush);
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(
    ws_tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    code: u16,
    reason: &str,
) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(axum::extract::ws::CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
