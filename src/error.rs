#[derive(Debug, thiserror::Error)]
pub enum AuthlyError {
    #[error("Token has expired")]
    TokenExpired,

    #[error("Invalid token: {0}")]
    TokenInvalid(String),

    #[error("State mismatch during token exchange")]
    Csrf,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AuthlyError {
    /// Error code string for structured output.
    pub fn code(&self) -> &'static str {
        match self {
            AuthlyError::TokenExpired => "token_expired",
            AuthlyError::TokenInvalid(_) => "token_invalid",
            AuthlyError::Csrf => "csrf_error",
            AuthlyError::Protocol(_) => "protocol_error",
            AuthlyError::Configuration(_) => "config_error",
            AuthlyError::Storage(_) => "storage_error",
            AuthlyError::Http(_) => "http_error",
            AuthlyError::Io(_) => "io_error",
        }
    }

    /// Whether this error came out of token verification.
    pub fn is_token_error(&self) -> bool {
        matches!(
            self,
            AuthlyError::TokenExpired | AuthlyError::TokenInvalid(_)
        )
    }

    /// Produce a structured JSON error object.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        })
    }
}
