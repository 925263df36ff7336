use serde::{Deserialize, Serialize};

/// A provider API key owned by exactly one group.
/// `key_value` is AES-256-GCM ciphertext at rest; `key_hash` is the
/// deterministic fingerprint used for dedup and log correlation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    #[serde(default)]
    pub id: i64,
    pub group_id: i64,
    pub key_value: String,
    pub key_hash: String,
    #[serde(default)]
    pub status: KeyStatus,
    #[serde(default)]
    pub failure_count: i64,
    #[serde(default)]
    pub last_used_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default = "chrono::Utc::now")]
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    #[default]
    Active,
    Invalid,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Invalid => "invalid",
        }
    }
}

impl std::str::FromStr for KeyStatus {
    type Err = crate::GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(KeyStatus::Active),
            "invalid" => Ok(KeyStatus::Invalid),
            other => Err(crate::GatewayError::Validation(format!(
                "unknown key status: {other}"
            ))),
        }
    }
}

/// Classification of an upstream failure, as reported to the pool.
/// Only attributable kinds count toward the blacklist threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network error, timeout, 408/429/5xx. Not the key's fault.
    Transient,
    /// 401/403 or a provider "invalid key" diagnostic.
    Auth,
    /// Provider-side quota exhausted for this key.
    Quota,
    /// Any other failure that provably follows the key.
    Permanent,
}

impl FailureKind {
    pub fn is_attributable(&self) -> bool {
        !matches!(self, FailureKind::Transient)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Auth => "auth",
            FailureKind::Quota => "quota",
            FailureKind::Permanent => "permanent",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        assert_eq!("active".parse::<KeyStatus>().unwrap(), KeyStatus::Active);
        assert_eq!("invalid".parse::<KeyStatus>().unwrap(), KeyStatus::Invalid);
        assert!("revoked".parse::<KeyStatus>().is_err());
        assert_eq!(KeyStatus::Active.as_str(), "active");
    }

    #[test]
    fn test_attributable_kinds() {
        assert!(!FailureKind::Transient.is_attributable());
        assert!(FailureKind::Auth.is_attributable());
        assert!(FailureKind::Quota.is_attributable());
        assert!(FailureKind::Permanent.is_attributable());
    }
}
