use thiserror::Error;

/// Unified error type for loadgate.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Auth failed: {0}")]
    AuthFailed(String),

    #[error("Group not found: {0}")]
    GroupNotFound(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("No active key available for group {0}")]
    NoActiveKey(String),

    #[error("No child group available for aggregate {0}")]
    NoChildGroupAvailable(String),

    #[error("Rate limited: {reason}")]
    RateLimited {
        reason: String,
        reset_at: chrono::DateTime<chrono::Utc>,
    },

    #[error("Model not allowed: {0}")]
    ModelNotAllowed(String),

    #[error("Upstream transient failure: {0}")]
    UpstreamTransient(String),

    #[error("Upstream permanent failure: status {0}")]
    UpstreamPermanent(u16),

    #[error("Invalid upstream key: {0}")]
    KeyInvalid(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Map to HTTP status code.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::Validation(_) => 400,
            GatewayError::AuthFailed(_) => 401,
            GatewayError::ModelNotAllowed(_) => 400,
            GatewayError::GroupNotFound(_) | GatewayError::KeyNotFound(_) => 404,
            GatewayError::RateLimited { .. } => 429,
            GatewayError::NoActiveKey(_) => 503,
            GatewayError::NoChildGroupAvailable(_) => 503,
            GatewayError::KeyInvalid(_) => 401,
            GatewayError::UpstreamTransient(_) => 502,
            GatewayError::UpstreamPermanent(status) => *status,
            _ => 500,
        }
    }

    /// True when the retry loop may try another key/upstream.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::UpstreamTransient(_) | GatewayError::KeyInvalid(_)
        )
    }

    /// JSON error body for proxy-side synthetic responses.
    pub fn to_json_body(&self) -> Vec<u8> {
        let status = self.status_code();
        serde_json::to_vec(&serde_json::json!({
            "error": self.to_string(),
            "status": status,
        }))
        .unwrap_or_else(|_| format!(r#"{{"error":"internal","status":{status}}}"#).into_bytes())
    }
}
