//! Error taxonomy for the realtime core.
//!
//! Session handlers convert every command-level error into a client-visible
//! `{"error": …}` frame; only transport failures tear the connection down.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Identity absent, or not a participant of the requested scope.
    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),

    /// Malformed frame or payload, id mismatch, self-chat, unknown action.
    #[error("{0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Read or write failure on the client connection. Fatal for a session.
    #[error("transport: {0}")]
    Transport(String),

    #[error("store: {0}")]
    Store(#[from] sqlx::Error),

    #[error("cache: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Whether a session must tear down instead of reporting and continuing.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    /// The stable string sent to the client in an `{"error": …}` frame.
    pub fn client_message(&self) -> &str {
        match self {
            Error::Unauthorized(_) => "You don't have access",
            Error::Validation(msg) => msg.as_str(),
            Error::NotFound(msg) => msg.as_str(),
            Error::Transport(_) => "Connection error",
            Error::Store(_) => "Internal storage error",
            Error::Cache(_) => "Internal cache error",
            Error::Serialization(_) => "Internal error",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Transport(_)
            | Error::Store(_)
            | Error::Cache(_)
            | Error::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": {
                "message": self.client_message()
            }
        }));

        (status, body).into_response()
    }
}
