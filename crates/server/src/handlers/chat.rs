//! Chat endpoints: list/create/delete plus the streaming upgrade.

use std::sync::Arc;

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::info;

use crate::auth::AuthUser;
use crate::config::AppState;
use crate::error::{Error, Result};
use crate::models::ChatPairRequest;
use crate::session::{run_session, split_socket, ChatSession};

/// GET /chat/{chat_id}
///
/// Upgrade to a chat streaming session. Participant authorization happens
/// inside the session state machine, before anything is streamed.
pub async fn chat_ws(
    ws: WebSocketUpgrade,
    Path(chat_id): Path<i64>,
    user: AuthUser,
    State(state): State<AppState>,
) -> Response {
    info!(chat_id, user_id = user.0, "chat websocket upgrade");
    ws.on_upgrade(move |socket| async move {
        let domain = Arc::new(ChatSession::new(
            chat_id,
            user.0,
            state.chats.clone(),
            state.notifications.clone(),
            state.cache.clone(),
        ));
        let (tx, rx) = split_socket(socket);
        run_session(domain, state.cache.clone(), tx, rx).await;
    })
}

/// POST /chat
pub async fn create_chat(
    user: AuthUser,
    State(state): State<AppState>,
    Json(req): Json<ChatPairRequest>,
) -> Result<impl IntoResponse> {
    if req.first_id != user.0 && req.second_id != user.0 {
        return Err(Error::Unauthorized("You don't have access"));
    }

    let chat_id = state.chats.create_chat(req.first_id, req.second_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "Chat created", "chatId": chat_id })),
    ))
}

/// DELETE /chat
///
/// Symmetric: either participant removes the chat and its messages for both.
pub async fn delete_chat(
    user: AuthUser,
    State(state): State<AppState>,
    Json(req): Json<ChatPairRequest>,
) -> Result<impl IntoResponse> {
    if req.first_id != user.0 && req.second_id != user.0 {
        return Err(Error::Unauthorized("You don't have access"));
    }

    state.chats.delete_chat(req.first_id, req.second_id).await?;
    Ok(Json(json!({ "message": "Chat deleted" })))
}

/// GET /chats
pub async fn get_chats(
    user: AuthUser,
    State(state): State<AppState>,
) -> Result<impl IntoResponse> {
    let chats = state.chats.get_chats(user.0).await?;
    Ok(Json(json!({ "chats": chats })))
}
