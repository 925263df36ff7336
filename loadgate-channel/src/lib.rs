pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod probe;
pub mod rewrite;

use bytes::Bytes;
use loadgate_core::GatewayError;
use loadgate_core::group::Group;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub use probe::ProbeOutcome;

/// The request as it arrived at the proxy, already stripped of the
/// `/proxy/{group}` prefix.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: http::Method,
    /// Path below the group segment, with leading `/`.
    pub subpath: String,
    /// Raw query string, without the leading `?`.
    pub query: String,
    pub headers: http::HeaderMap,
    pub body: Bytes,
}

/// The fully rewritten request ready for one upstream attempt.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: http::Method,
    pub url: String,
    pub headers: http::HeaderMap,
    pub body: Bytes,
    /// Model after redirect rules, for logging.
    pub model: String,
}

/// Provider-specific transformer. Owns the URL shape, the credential
/// placement, streaming detection, and the validation probe for one
/// channel type.
#[async_trait::async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pull the client-side proxy credential out of the request,
    /// wherever this channel's native clients put it.
    fn extract_proxy_key(&self, req: &InboundRequest) -> Option<String>;

    /// Whether this request expects a streamed response.
    fn is_stream(&self, req: &InboundRequest) -> bool;

    /// Rewrite the request for `upstream` using the pooled `api_key`.
    fn prepare_request(
        &self,
        req: &InboundRequest,
        upstream: &str,
        api_key: &str,
        group: &Group,
    ) -> Result<OutboundRequest, GatewayError>;

    /// Minimal liveness probe for one key.
    async fn validate(
        &self,
        client: &reqwest::Client,
        upstream: &str,
        api_key: &str,
        group: &Group,
        timeout: Duration,
    ) -> ProbeOutcome;
}

/// Name-keyed adapter registry. Built once at startup, immutable
/// thereafter; every component holds a shared Arc.
pub struct ChannelRegistry {
    adapters: HashMap<&'static str, Arc<dyn ChannelAdapter>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        tracing::info!(channel = adapter.name(), "Registered channel adapter");
        self.adapters.insert(adapter.name(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ChannelAdapter>> {
        self.adapters.get(name)
    }

    pub fn list(&self) -> Vec<&'static str> {
        self.adapters.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Register the built-in adapters.
pub fn register_all(registry: &mut ChannelRegistry) {
    registry.register(Arc::new(openai::OpenAiChannel));
    registry.register(Arc::new(gemini::GeminiChannel));
    registry.register(Arc::new(anthropic::AnthropicChannel));
}

/// Join an upstream base with the request subpath and query.
pub(crate) fn join_url(upstream: &str, subpath: &str, query: &str) -> String {
    let base = upstream.trim_end_matches('/');
    let path = if subpath.starts_with('/') {
        subpath.to_string()
    } else {
        format!("/{subpath}")
    };
    if query.is_empty() {
        format!("{base}{path}")
    } else {
        format!("{base}{path}?{query}")
    }
}
