//! Session validation.
//!
//! Sessions are issued elsewhere (the sessions service owns login/logout);
//! this module only resolves a presented token to an authenticated user id
//! and injects it as a typed [`AuthUser`], so handlers never dig identities
//! out of an untyped request context.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts},
    middleware::Next,
    response::Response,
};
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tracing::debug;

use crate::cache::keys;
use crate::config::AppState;
use crate::error::{Error, Result};

/// The authenticated user id, available to every handler behind the
/// middleware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser(pub i64);

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        parts
            .extensions
            .get::<AuthUser>()
            .copied()
            .ok_or(Error::Unauthorized("You don't have access"))
    }
}

/// Looks up an externally-issued session token.
#[async_trait]
pub trait SessionValidator: Send + Sync {
    /// `Ok(None)` means the token is unknown or expired.
    async fn resolve(&self, token: &str) -> Result<Option<i64>>;
}

/// Reads the `session:{token}` keys the sessions service maintains in Redis.
pub struct RedisSessionValidator {
    conn: Arc<Mutex<MultiplexedConnection>>,
}

impl RedisSessionValidator {
    pub fn new(conn: Arc<Mutex<MultiplexedConnection>>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl SessionValidator for RedisSessionValidator {
    async fn resolve(&self, token: &str) -> Result<Option<i64>> {
        let mut conn = self.conn.lock().await;
        let value: Option<String> = redis::cmd("GET")
            .arg(keys::session(token))
            .query_async(&mut *conn)
            .await?;
        Ok(value.and_then(|raw| raw.parse().ok()))
    }
}

/// Require a valid session on every route behind this layer.
pub async fn mw_require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response> {
    let token = bearer_token(req.headers())
        .or_else(|| session_cookie(req.headers()))
        .ok_or(Error::Unauthorized("You don't have access"))?;

    let user_id = state
        .sessions
        .resolve(&token)
        .await?
        .ok_or(Error::Unauthorized("You don't have access"))?;

    debug!(user_id, "session resolved");
    req.extensions_mut().insert(AuthUser(user_id));
    Ok(next.run(req).await)
}

fn bearer_token(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

fn session_cookie(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get(header::COOKIE)?
        .to_str()
        .ok()?
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == "session_id").then(|| value.to_string())
        })
        .next()
}
