//! WebSocket upgrade handlers for the channel endpoints
//!
//! Every channel claims a path whose final segment embeds the shared key
//! (`/VCPlog/VCP_Key=<key>`). The key is checked before the upgrade;
//! a mismatch is refused with 401 and never reaches the channel.

use super::AppState;
use crate::channels::distributed::DistributedToolChannel;
use crate::channels::hub::BroadcastHub;
use crate::channels::{parse_key_segment, Frame};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

/// Create the channel router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Broadcast shells
        .route("/VCPlog/:auth", get(log_channel))
        .route("/vcpinfo/:auth", get(info_channel))
        .route("/vcp-chrome-observer/:auth", get(chrome_channel))
        .route("/vcp-admin-panel/:auth", get(admin_channel))
        // Worker nodes
        .route("/vcp-distributed-server/:auth", get(distributed_channel))
        // Version
        .route("/version", get(get_version))
        .with_state(state)
}

/// Validate the `VCP_Key=<key>` path segment against the configured key.
fn check_key(state: &AppState, segment: &str) -> Result<(), StatusCode> {
    match parse_key_segment(segment) {
        Some(key) if key == state.config.access_key => Ok(()),
        _ => {
            tracing::warn!(segment, "rejecting websocket upgrade: bad channel key");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

async fn log_channel(
    ws: WebSocketUpgrade,
    Path(auth): Path<String>,
    State(state): State<AppState>,
) -> Response {
    broadcast_channel(ws, &auth, &state, state.log_hub.clone())
}

async fn info_channel(
    ws: WebSocketUpgrade,
    Path(auth): Path<String>,
    State(state): State<AppState>,
) -> Response {
    broadcast_channel(ws, &auth, &state, state.info_hub.clone())
}

async fn chrome_channel(
    ws: WebSocketUpgrade,
    Path(auth): Path<String>,
    State(state): State<AppState>,
) -> Response {
    broadcast_channel(ws, &auth, &state, state.chrome_hub.clone())
}

async fn admin_channel(
    ws: WebSocketUpgrade,
    Path(auth): Path<String>,
    State(state): State<AppState>,
) -> Response {
    broadcast_channel(ws, &auth, &state, state.admin_hub.clone())
}

fn broadcast_channel(
    ws: WebSocketUpgrade,
    auth: &str,
    state: &AppState,
    hub: Arc<BroadcastHub>,
) -> Response {
    if let Err(status) = check_key(state, auth) {
        return status.into_response();
    }
    ws.on_upgrade(move |socket| serve_broadcast(socket, hub))
}

/// Drive one broadcast-shell subscriber: ack, then fan frames out until
/// the socket closes. Inbound frames on these channels are ignored.
async fn serve_broadcast(socket: WebSocket, hub: Arc<BroadcastHub>) {
    let (mut sink, mut stream) = socket.split();
    let ack = Frame::new(
        "connection_ack",
        json!({"message": format!("{} channel ready", hub.name())}),
    );
    if sink.send(Message::Text(ack.to_text())).await.is_err() {
        return;
    }

    let mut frames = BroadcastStream::new(hub.subscribe());
    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(frame)) => {
                    if sink.send(Message::Text(frame.to_text())).await.is_err() {
                        break;
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    tracing::warn!(channel = hub.name(), skipped, "slow subscriber lagged");
                }
                None => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn distributed_channel(
    ws: WebSocketUpgrade,
    Path(auth): Path<String>,
    State(state): State<AppState>,
) -> Response {
    if let Err(status) = check_key(&state, &auth) {
        return status.into_response();
    }
    ws.on_upgrade(move |socket| serve_distributed(socket, state.channel.clone()))
}

/// Drive one worker session: a writer task serializes all socket writes,
/// the read loop feeds frames to the channel in arrival order, and the
/// session is torn down when the socket goes away.
async fn serve_distributed(socket: WebSocket, channel: Arc<DistributedToolChannel>) {
    let (mut sink, mut stream) = socket.split();
    let (outbound, mut outbound_rx) =
        mpsc::channel::<Frame>(DistributedToolChannel::outbound_capacity());

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if sink.send(Message::Text(frame.to_text())).await.is_err() {
                break;
            }
        }
    });

    let session_id = channel.open_session(outbound).await;

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => channel.handle_frame(&session_id, &text).await,
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Ok(Message::Binary(_)) => {
                tracing::warn!(session = %session_id, "ignoring binary frame from worker");
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::warn!(session = %session_id, error = %e, "worker socket error");
                break;
            }
        }
    }

    channel.close_session(&session_id).await;
    writer.abort();
}

async fn get_version() -> Json<serde_json::Value> {
    Json(json!({"version": env!("CARGO_PKG_VERSION")}))
}
