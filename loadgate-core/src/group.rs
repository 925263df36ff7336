use crate::group_config::GroupConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::OnceLock;

/// Tenant configuration. A group owns a pool of provider keys and the
/// routing/transform rules applied to requests addressed to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    #[serde(default)]
    pub id: i64,

    /// Unique lowercase name, addressable as `/proxy/{name}/...`.
    pub name: String,

    /// Registered channel adapter: openai | gemini | anthropic.
    pub channel_type: String,

    #[serde(default)]
    pub group_type: GroupType,

    /// Weighted provider endpoints. Empty for aggregate groups.
    #[serde(default)]
    pub upstreams: Vec<UpstreamTarget>,

    /// Model used by validation probes. `-` for aggregate groups.
    #[serde(default = "default_test_model")]
    pub test_model: String,

    /// Optional probe path override, e.g. `/v1/chat/completions`.
    #[serde(default)]
    pub validation_endpoint: Option<String>,

    /// Top-level JSON merged into request bodies; override wins.
    #[serde(default)]
    pub param_overrides: HashMap<String, serde_json::Value>,

    /// source model → target model substitution.
    #[serde(default)]
    pub model_redirect_rules: HashMap<String, String>,

    /// When true, models absent from the redirect map are rejected.
    #[serde(default)]
    pub model_redirect_strict: bool,

    /// Ordered header edits applied to the outbound request.
    #[serde(default)]
    pub header_rules: Vec<HeaderRule>,

    /// Whitespace/newline-separated client credentials.
    #[serde(default)]
    pub proxy_keys: String,

    /// Typed per-group overrides of the system defaults.
    #[serde(default)]
    pub config: GroupConfig,

    #[serde(default)]
    pub sort: i32,

    #[serde(default = "chrono::Utc::now")]
    pub created_at: chrono::DateTime<chrono::Utc>,

    #[serde(default = "chrono::Utc::now")]
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GroupType {
    #[default]
    Standard,
    Aggregate,
}

impl GroupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupType::Standard => "standard",
            GroupType::Aggregate => "aggregate",
        }
    }
}

impl std::str::FromStr for GroupType {
    type Err = crate::GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(GroupType::Standard),
            "aggregate" => Ok(GroupType::Aggregate),
            other => Err(crate::GatewayError::Validation(format!(
                "unknown group type: {other}"
            ))),
        }
    }
}

/// A real provider endpoint plus its selection weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamTarget {
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

/// Edge composing an aggregate group from child groups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSubGroup {
    pub parent_id: i64,
    pub sub_group_id: i64,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderAction {
    Set,
    Remove,
}

/// One header edit. Keys are canonicalised on validation so that
/// duplicate detection is case-insensitive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderRule {
    pub key: String,
    #[serde(default)]
    pub value: String,
    pub action: HeaderAction,
}

fn default_test_model() -> String {
    "-".to_string()
}

fn default_weight() -> u32 {
    1
}

fn name_pattern() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^[a-z0-9_-]{1,100}$").unwrap())
}

impl Group {
    pub fn is_aggregate(&self) -> bool {
        self.group_type == GroupType::Aggregate
    }

    /// Parsed client credential set.
    pub fn proxy_key_set(&self) -> HashSet<&str> {
        self.proxy_keys.split_whitespace().collect()
    }

    /// Upstreams eligible for selection (weight > 0).
    pub fn eligible_upstreams(&self) -> impl Iterator<Item = &UpstreamTarget> {
        self.upstreams.iter().filter(|u| u.weight > 0)
    }

    /// Invariant checks run on create/update at the admin surface.
    pub fn validate(&self) -> Result<(), crate::GatewayError> {
        if !name_pattern().is_match(&self.name) {
            return Err(crate::GatewayError::Validation(format!(
                "group name must match ^[a-z0-9_-]{{1,100}}$: {:?}",
                self.name
            )));
        }

        match self.group_type {
            GroupType::Standard => {
                if !self.upstreams.iter().any(|u| u.weight > 0) {
                    return Err(crate::GatewayError::Validation(
                        "standard group needs at least one upstream with weight > 0".into(),
                    ));
                }
                if self.test_model.is_empty() || self.test_model == "-" {
                    return Err(crate::GatewayError::Validation(
                        "standard group needs a test_model".into(),
                    ));
                }
            }
            GroupType::Aggregate => {
                if !self.upstreams.is_empty() {
                    return Err(crate::GatewayError::Validation(
                        "aggregate group must not define upstreams".into(),
                    ));
                }
                if self.test_model != "-" {
                    return Err(crate::GatewayError::Validation(
                        "aggregate group test_model must be \"-\"".into(),
                    ));
                }
            }
        }

        for u in &self.upstreams {
            if !(u.url.starts_with("http://") || u.url.starts_with("https://")) {
                return Err(crate::GatewayError::Validation(format!(
                    "upstream url must be absolute http(s): {}",
                    u.url
                )));
            }
        }

        if let Some(ep) = &self.validation_endpoint {
            if !ep.starts_with('/') || ep.contains("://") {
                return Err(crate::GatewayError::Validation(
                    "validation_endpoint must be a path starting with '/'".into(),
                ));
            }
        }

        let mut seen = HashSet::new();
        for rule in &self.header_rules {
            let canonical = http::header::HeaderName::from_bytes(rule.key.as_bytes())
                .map_err(|_| {
                    crate::GatewayError::Validation(format!("invalid header name: {}", rule.key))
                })?;
            if !seen.insert(canonical) {
                return Err(crate::GatewayError::Validation(format!(
                    "duplicate header rule: {}",
                    rule.key
                )));
            }
        }

        Ok(())
    }
}

/// Weighted random pick over `items`, skipping zero weights.
/// Uniform among equal weights; returns None when no weight is positive.
pub fn pick_weighted<'a, T>(items: &'a [T], weight_of: impl Fn(&T) -> u32) -> Option<&'a T> {
    use rand::Rng;

    let total: u64 = items.iter().map(|i| weight_of(i) as u64).sum();
    if total == 0 {
        return None;
    }
    let mut roll = rand::thread_rng().gen_range(0..total);
    for item in items {
        let w = weight_of(item) as u64;
        if roll < w {
            return Some(item);
        }
        roll -= w;
    }
    None
}
