use crate::openai::{accepts_event_stream, body_stream_flag};
use crate::probe::{ProbeOutcome, run_probe};
use crate::rewrite::{apply_header_rules, forwardable_headers, rewrite_body};
use crate::{ChannelAdapter, InboundRequest, OutboundRequest, join_url};
use loadgate_core::GatewayError;
use loadgate_core::group::Group;
use std::time::Duration;

const DEFAULT_PROBE_PATH: &str = "/v1/messages";
const DEFAULT_API_VERSION: &str = "2023-06-01";

/// Anthropic channel: `x-api-key` credential plus a pinned
/// `anthropic-version` header; streaming via the body flag.
pub struct AnthropicChannel;

#[async_trait::async_trait]
impl ChannelAdapter for AnthropicChannel {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn extract_proxy_key(&self, req: &InboundRequest) -> Option<String> {
        req.headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    fn is_stream(&self, req: &InboundRequest) -> bool {
        body_stream_flag(&req.body) || accepts_event_stream(&req.headers)
    }

    fn prepare_request(
        &self,
        req: &InboundRequest,
        upstream: &str,
        api_key: &str,
        group: &Group,
    ) -> Result<OutboundRequest, GatewayError> {
        let (body, model) = rewrite_body(&req.body, group)?;
        let mut headers = forwardable_headers(&req.headers);
        headers.insert(
            "x-api-key",
            api_key
                .parse()
                .map_err(|_| GatewayError::Internal("unencodable api key".into()))?,
        );
        if !headers.contains_key("anthropic-version") {
            headers.insert("anthropic-version", DEFAULT_API_VERSION.parse().unwrap());
        }
        apply_header_rules(&mut headers, group);

        Ok(OutboundRequest {
            method: req.method.clone(),
            url: join_url(upstream, &req.subpath, &req.query),
            headers,
            body,
            model,
        })
    }

    async fn validate(
        &self,
        client: &reqwest::Client,
        upstream: &str,
        api_key: &str,
        group: &Group,
        timeout: Duration,
    ) -> ProbeOutcome {
        let path = group
            .validation_endpoint
            .as_deref()
            .unwrap_or(DEFAULT_PROBE_PATH);
        let request = client
            .post(join_url(upstream, path, ""))
            .header("x-api-key", api_key)
            .header("anthropic-version", DEFAULT_API_VERSION)
            .json(&serde_json::json!({
                "model": group.test_model,
                "max_tokens": 1,
                "messages": [{ "role": "user", "content": "ping" }],
            }));
        run_probe(request, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn group() -> Group {
        serde_json::from_value(serde_json::json!({
            "name": "g1",
            "channel_type": "anthropic",
            "upstreams": [{ "url": "https://api.anthropic.com", "weight": 1 }],
            "test_model": "claude-haiku-4-5"
        }))
        .unwrap()
    }

    fn request(body: &str) -> InboundRequest {
        let mut headers = http::HeaderMap::new();
        headers.insert("x-api-key", "proxy-123".parse().unwrap());
        InboundRequest {
            method: http::Method::POST,
            subpath: "/v1/messages".into(),
            query: String::new(),
            headers,
            body: Bytes::from(body.to_string()),
        }
    }

    #[test]
    fn test_extract_proxy_key_from_header() {
        let chan = AnthropicChannel;
        assert_eq!(
            chan.extract_proxy_key(&request("{}")).as_deref(),
            Some("proxy-123")
        );
    }

    #[test]
    fn test_prepare_request_sets_key_and_version() {
        let chan = AnthropicChannel;
        let out = chan
            .prepare_request(
                &request(r#"{"model":"claude-haiku-4-5","stream":true}"#),
                "https://api.anthropic.com",
                "sk-ant-real",
                &group(),
            )
            .unwrap();
        assert_eq!(out.url, "https://api.anthropic.com/v1/messages");
        assert_eq!(out.headers.get("x-api-key").unwrap(), "sk-ant-real");
        assert_eq!(out.headers.get("anthropic-version").unwrap(), DEFAULT_API_VERSION);
        assert_eq!(out.model, "claude-haiku-4-5");
    }

    #[test]
    fn test_client_pinned_version_wins() {
        let chan = AnthropicChannel;
        let mut req = request("{}");
        req.headers.insert("anthropic-version", "2024-10-22".parse().unwrap());
        let out = chan
            .prepare_request(&req, "https://api.anthropic.com", "sk-ant-real", &group())
            .unwrap();
        assert_eq!(out.headers.get("anthropic-version").unwrap(), "2024-10-22");
    }

    #[test]
    fn test_stream_detection_via_body() {
        let chan = AnthropicChannel;
        assert!(chan.is_stream(&request(r#"{"stream":true}"#)));
        assert!(!chan.is_stream(&request(r#"{"stream":false}"#)));
    }
}
