//! Notification streaming endpoint.

use std::sync::Arc;

use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};
use tracing::info;

use crate::auth::AuthUser;
use crate::config::AppState;
use crate::session::{run_session, split_socket, NotificationSession};

/// GET /notifications
///
/// Upgrade to a notification streaming session scoped to the authenticated
/// user.
pub async fn notifications_ws(
    ws: WebSocketUpgrade,
    user: AuthUser,
    State(state): State<AppState>,
) -> Response {
    info!(user_id = user.0, "notification websocket upgrade");
    ws.on_upgrade(move |socket| async move {
        let domain = Arc::new(NotificationSession::new(
            user.0,
            state.notifications.clone(),
            state.cache.clone(),
            state.config.notification_cache_len,
            state.config.flowers_ttl,
        ));
        let (tx, rx) = split_socket(socket);
        run_session(domain, state.cache.clone(), tx, rx).await;
    })
}
