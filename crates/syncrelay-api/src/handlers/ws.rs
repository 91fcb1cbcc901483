//! WebSocket upgrade handler.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use syncrelay_core::error::{AppError, ErrorKind};
use syncrelay_realtime::connection::{CloseReason, ConnectionHandle, run_heartbeat};
use syncrelay_realtime::message::ServerFrame;

use crate::dto::request::WsQuery;
use crate::error::ApiResult;
use crate::extractors::{AuthUser, bearer_token};
use crate::state::AppState;

/// Close code sent when the instance is at its connection cap.
const CLOSE_TRY_AGAIN_LATER: u16 = 1013;
/// Close code sent when the instance is going away.
const CLOSE_GOING_AWAY: u16 = 1001;
/// How long the writer gets to flush after the reader ends.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// GET /ws: WebSocket upgrade
///
/// The token comes from `Authorization: Bearer` or, for browsers,
/// the `token` query parameter. Authentication happens before the upgrade.
pub async fn ws_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
) -> ApiResult<Response> {
    let token = bearer_token(&headers)
        .map(str::to_string)
        .or(query.token)
        .ok_or_else(|| AppError::unauthorized("Missing access token"))?;
    let auth = AuthUser::from_token(&state, &token)?;

    Ok(ws.on_upgrade(move |socket| handle_socket(state, auth, socket)))
}

/// Drives one established session until either side closes it.
async fn handle_socket(state: AppState, auth: AuthUser, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (handle, outbound) = match state.sync.register_connection(&auth.user_id).await {
        Ok(registered) => registered,
        Err(e) => {
            let code = if e.kind == ErrorKind::CapacityExceeded {
                CLOSE_TRY_AGAIN_LATER
            } else {
                CLOSE_GOING_AWAY
            };
            warn!(user_id = %auth.user_id, error = %e, "WebSocket session refused");
            let _ = ws_tx
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: e.message.into(),
                })))
                .await;
            return;
        }
    };

    info!(
        conn_id = %handle.id,
        user_id = %auth.user_id,
        "WebSocket connection established"
    );

    let pending_offline = match state.sync.offline_count(&auth.user_id).await {
        Ok(n) => n,
        Err(e) => {
            warn!(user_id = %auth.user_id, error = %e, "Offline count unavailable");
            0
        }
    };
    handle.send(ServerFrame::Connected {
        connection_id: handle.id,
        instance_id: state.sync.instance_id().to_string(),
        pending_offline,
    });

    let writer = tokio::spawn(write_frames(handle.clone(), outbound, ws_tx));
    let heartbeat = tokio::spawn(run_heartbeat(handle.clone(), state.sync.heartbeat_config()));
    let expiry = tokio::spawn(expire_on_token_ttl(
        handle.clone(),
        Duration::from_secs(auth.claims.remaining_ttl_seconds()),
    ));

    // ── Inbound ──
    let mut client_closed = false;
    loop {
        let next = tokio::select! {
            _ = handle.closed() => break,
            next = ws_rx.next() => next,
        };
        match next {
            Some(Ok(Message::Text(text))) => {
                state.sync.handle_inbound(&handle, text.as_str()).await;
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => handle.touch(),
            Some(Ok(Message::Binary(_))) => {
                handle.send(ServerFrame::error(
                    "INVALID_MESSAGE",
                    "Binary frames are not supported",
                ));
            }
            Some(Ok(Message::Close(_))) | None => {
                client_closed = true;
                break;
            }
            Some(Err(e)) => {
                debug!(conn_id = %handle.id, error = %e, "WebSocket read error");
                client_closed = true;
                break;
            }
        }
    }

    // ── Cleanup ──
    heartbeat.abort();
    expiry.abort();
    if client_closed {
        writer.abort();
    } else if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, writer).await.is_err() {
        debug!(conn_id = %handle.id, "Writer did not flush in time");
    }
    state.sync.unregister_connection(&handle.id).await;

    info!(
        conn_id = %handle.id,
        user_id = %auth.user_id,
        reason = handle.close_reason().map(CloseReason::as_str).unwrap_or("client closed"),
        "WebSocket connection closed"
    );
}

/// Forwards queued frames to the socket; sends a close frame once the
/// handle is closed by the server.
async fn write_frames(
    handle: Arc<ConnectionHandle>,
    mut outbound: mpsc::Receiver<ServerFrame>,
    mut ws_tx: SplitSink<WebSocket, Message>,
) {
    loop {
        tokio::select! {
            biased;
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(conn_id = %handle.id, error = %e, "Frame serialization failed");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
            _ = handle.closed() => break,
        }
    }

    if let Some(reason) = handle.close_reason() {
        let _ = ws_tx
            .send(Message::Close(Some(CloseFrame {
                code: reason.code(),
                reason: reason.as_str().into(),
            })))
            .await;
    }
    let _ = ws_tx.close().await;
}

/// Closes the session when the access token it authenticated with expires.
async fn expire_on_token_ttl(handle: Arc<ConnectionHandle>, ttl: Duration) {
    tokio::select! {
        _ = handle.closed() => {}
        _ = tokio::time::sleep(ttl) => {
            info!(conn_id = %handle.id, user_id = %handle.user_id, "Access token expired");
            handle.close(CloseReason::AuthExpired);
        }
    }
}
