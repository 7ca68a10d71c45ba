//! WebSocket task channel and notification publishing

use crate::api::AppState;
use crate::auth::{
    middleware::{authenticate, bearer_token, query_token, CurrentUser},
    models::User,
    permissions::{authorize, verify_ownership, Scope},
};
use crate::error::{SessionError, SessionResult};
use crate::ws::broadcaster::{Channel, ConnectionId, Frame, SocketSink};
use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{HeaderMap, Uri},
    response::Response,
    Json,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Write half of an axum WebSocket
struct WsSink {
    id: ConnectionId,
    sink: Mutex<SplitSink<WebSocket, Message>>,
}

#[async_trait]
impl SocketSink for WsSink {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .context("WebSocket send failed")
    }

    async fn close(&self, code: u16, reason: &str) -> Result<()> {
        self.sink
            .lock()
            .await
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.to_string().into(),
            })))
            .await
            .context("WebSocket close failed")
    }
}

/// Task channel - GET /api/v1/ws/tasks
///
/// Credentials and permissions are resolved before the upgrade completes; a
/// rejected client still gets the upgrade, followed immediately by a 1008
/// close frame, so browsers see a reason instead of a failed handshake.
pub async fn ws_tasks_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let token = bearer_token(&headers).or_else(|| query_token(uri.query()));
    let admission = admit(&state, token).await;

    ws.on_upgrade(move |socket| async move {
        match admission {
            Ok((user, scope)) => handle_socket(socket, state, user, scope).await,
            Err(reason) => reject(socket, reason).await,
        }
    })
}

async fn admit(state: &AppState, token: Option<String>) -> Result<(User, Scope), String> {
    let token = token.ok_or_else(|| "missing token".to_string())?;
    let user = authenticate(state, &token)
        .await
        .map_err(|e| e.message().to_lowercase())?;

    let permissions = state
        .permissions
        .permissions_for(user.id)
        .await
        .map_err(|e| {
            warn!(user_id = %user.id, "Permission lookup failed for socket: {}", e);
            "permission lookup failed".to_string()
        })?;

    let scope = authorize(&permissions, "task", "read", true)
        .require()
        .map_err(|_| "insufficient permissions".to_string())?;

    Ok((user, scope))
}

async fn reject(mut socket: WebSocket, reason: String) {
    debug!("Rejecting socket: {}", reason);
    let frame = CloseFrame {
        code: close_code::POLICY,
        reason: reason.into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!("Failed to send policy close: {}", e);
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, user: User, scope: Scope) {
    let (sink, mut stream) = socket.split();
    let id = state.broadcaster.next_connection_id();
    let sink = Arc::new(WsSink {
        id,
        sink: Mutex::new(sink),
    });

    let owner = Channel::Owner(user.id);
    let mut channels = vec![owner];
    if scope == Scope::Any {
        channels.push(Channel::Wildcard);
    }

    // Deregisters on every exit path below.
    let _registration = state.broadcaster.register(sink.clone(), &channels);
    info!(
        user = %user.username,
        connection = id,
        scope = %scope,
        "🔌 Task socket connected"
    );

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let payload =
                    serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

                if payload.get("type").and_then(|t| t.as_str()) == Some("ping") {
                    let pong = json!({ "type": "pong", "data": payload.get("data") });
                    if sink.send_text(pong.to_string()).await.is_err() {
                        break;
                    }
                    continue;
                }

                let frame = Frame::new(owner, user.id, payload);
                if let Err(e) = state.broadcaster.broadcast_frame(&frame, Some(owner)).await {
                    warn!(connection = id, "Failed to encode frame: {}", e);
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(connection = id, "Socket read failed: {}", e);
                break;
            }
        }
    }

    info!(user = %user.username, connection = id, "Task socket disconnected");
}

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub payload: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishResponse {
    pub delivered: usize,
}

/// Publish to an owner's channel - POST /api/v1/notifications/:owner_id
pub async fn publish_notification(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(owner_id): Path<String>,
    Json(body): Json<PublishRequest>,
) -> SessionResult<Json<PublishResponse>> {
    let owner_id: Uuid = Channel::parse_owner(&owner_id)?;

    let permissions = state.permissions.permissions_for(user.id).await?;
    let scope = authorize(&permissions, "task", "update", true).require()?;
    verify_ownership(scope, owner_id, user.id)?;

    let channel = Channel::Owner(owner_id);
    let frame = Frame::new(channel, user.id, body.payload);
    let delivered = state
        .broadcaster
        .broadcast_frame(&frame, Some(channel))
        .await
        .map_err(SessionError::Internal)?;

    debug!(sender = %user.id, channel = %channel, delivered, "Notification published");
    Ok(Json(PublishResponse { delivered }))
}
