use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use relay_protocol::ErrorCode;
use serde_json::json;

/// Internal error currency shared by Store, CredentialAuthority, and Router.
///
/// The HTTP handlers and WebSocket connection tasks are the only places this
/// gets translated to the wire taxonomy (`ErrorCode`) — nothing upstream of
/// those boundaries should format a string onto the wire directly.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("agent secret does not match the registered secret")]
    AgentSecretMismatch,
    #[error("pairing code is invalid or already consumed")]
    PairingInvalid,
    #[error("pairing code has expired")]
    PairingExpired,
    #[error("pairing code has exceeded its attempt limit")]
    PairingAttemptsExceeded,
    #[error("agent is not currently connected")]
    AgentOffline,
    #[error("agent has never completed pairing")]
    AgentNotPaired,
    #[error("message exceeds the maximum allowed size")]
    MessageTooLarge,
    #[error("message failed frame validation: {0}")]
    InvalidMessage(String),
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("free plan agent limit reached")]
    FreePlanLimit,
    #[error("access token is expired")]
    TokenExpired,
    #[error("access token is invalid")]
    TokenInvalid,
    #[error("unauthorized")]
    Unauthorized,
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RelayError::InvalidCredentials => ErrorCode::InvalidCredentials,
            RelayError::AgentSecretMismatch => ErrorCode::AgentSecretMismatch,
            RelayError::PairingInvalid => ErrorCode::PairingInvalid,
            RelayError::PairingExpired => ErrorCode::PairingExpired,
            RelayError::PairingAttemptsExceeded => ErrorCode::PairingAttemptsExceeded,
            RelayError::AgentOffline => ErrorCode::AgentOffline,
            RelayError::AgentNotPaired => ErrorCode::AgentNotPaired,
            RelayError::MessageTooLarge => ErrorCode::MessageTooLarge,
            RelayError::InvalidMessage(_) => ErrorCode::InvalidMessage,
            RelayError::RateLimited => ErrorCode::RateLimited,
            RelayError::FreePlanLimit => ErrorCode::FreePlanLimit,
            RelayError::TokenExpired => ErrorCode::TokenExpired,
            RelayError::TokenInvalid => ErrorCode::TokenInvalid,
            RelayError::Unauthorized => ErrorCode::Unauthorized,
            RelayError::Store(_) | RelayError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Message safe to put on the wire — internal errors never leak their detail.
    pub fn public_message(&self) -> String {
        match self {
            RelayError::Store(_) | RelayError::Internal(_) => {
                "internal error, please retry".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = http_status(self.code());
        let body = Json(json!({
            "error": self.code(),
            "message": self.public_message(),
        }));
        (status, body).into_response()
    }
}

fn http_status(code: ErrorCode) -> StatusCode {
    StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}
