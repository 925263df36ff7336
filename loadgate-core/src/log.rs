use serde::{Deserialize, Serialize};

/// One proxied request, append-only. Produced by the proxy engine and
/// persisted in batches by the log pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLog {
    pub id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub group_id: i64,
    pub group_name: String,
    pub upstream_url: String,
    pub key_hash: String,
    /// Encrypted at rest, same scheme as `api_keys.key_value`.
    pub key_value: String,
    pub model: String,
    pub status_code: u16,
    pub duration_ms: i64,
    pub is_stream: bool,
    pub retries: u32,
    pub error_message: Option<String>,
}

impl RequestLog {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code) && self.error_message.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(status: u16, error: Option<&str>) -> RequestLog {
        RequestLog {
            id: "r1".into(),
            timestamp: chrono::Utc::now(),
            group_id: 1,
            group_name: "g1".into(),
            upstream_url: "https://api.openai.com".into(),
            key_hash: "abc".into(),
            key_value: String::new(),
            model: "gpt-4o".into(),
            status_code: status,
            duration_ms: 12,
            is_stream: false,
            retries: 0,
            error_message: error.map(str::to_string),
        }
    }

    #[test]
    fn test_success_classification() {
        assert!(log(200, None).is_success());
        assert!(log(204, None).is_success());
        assert!(!log(502, None).is_success());
        // stream that broke mid-body: 200 was written but it is a failure
        assert!(!log(200, Some("stream interrupted")).is_success());
    }
}
