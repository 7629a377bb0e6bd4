use serde::{Deserialize, Serialize};

/// Stable wire error codes, shared between HTTP bodies and WS `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unauthorized,
    TokenExpired,
    TokenInvalid,
    InvalidCredentials,
    PairingInvalid,
    PairingExpired,
    PairingAttemptsExceeded,
    AgentSecretMismatch,
    AgentOffline,
    AgentNotPaired,
    MessageTooLarge,
    InvalidMessage,
    RateLimited,
    FreePlanLimit,
    InternalError,
}

impl ErrorCode {
    /// HTTP status this code maps to when surfaced from an HTTP handler.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::Unauthorized
            | ErrorCode::TokenExpired
            | ErrorCode::TokenInvalid
            | ErrorCode::InvalidCredentials => 401,
            ErrorCode::PairingInvalid
            | ErrorCode::PairingExpired
            | ErrorCode::PairingAttemptsExceeded
            | ErrorCode::AgentNotPaired
            | ErrorCode::MessageTooLarge
            | ErrorCode::InvalidMessage => 400,
            ErrorCode::AgentSecretMismatch => 401,
            ErrorCode::RateLimited => 429,
            ErrorCode::FreePlanLimit => 402,
            ErrorCode::AgentOffline => 409,
            ErrorCode::InternalError => 500,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let json = serde_json::to_string(self).unwrap_or_default();
        write!(f, "{}", json.trim_matches('"'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::AgentSecretMismatch).unwrap();
        assert_eq!(json, "\"AGENT_SECRET_MISMATCH\"");
    }

    #[test]
    fn roundtrips_through_json() {
        for code in [
            ErrorCode::Unauthorized,
            ErrorCode::PairingAttemptsExceeded,
            ErrorCode::FreePlanLimit,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            let parsed: ErrorCode = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, code);
        }
    }
}
