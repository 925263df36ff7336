use crate::probe::{ProbeOutcome, run_probe};
use crate::rewrite::{apply_header_rules, forwardable_headers, rewrite_body};
use crate::{ChannelAdapter, InboundRequest, OutboundRequest, join_url};
use loadgate_core::GatewayError;
use loadgate_core::group::Group;
use std::time::Duration;

const DEFAULT_PROBE_PATH: &str = "/v1/chat/completions";

/// OpenAI-compatible channel: bearer credential, `stream` flag in the
/// JSON body. Also fits the many OpenAI-clone providers.
pub struct OpenAiChannel;

fn bearer_token(headers: &http::HeaderMap) -> Option<String> {
    headers
        .get(http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

pub(crate) fn body_stream_flag(body: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("stream").and_then(|s| s.as_bool()))
        .unwrap_or(false)
}

pub(crate) fn accepts_event_stream(headers: &http::HeaderMap) -> bool {
    headers
        .get(http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"))
}

#[async_trait::async_trait]
impl ChannelAdapter for OpenAiChannel {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn extract_proxy_key(&self, req: &InboundRequest) -> Option<String> {
        bearer_token(&req.headers)
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
            http::header::AUTHORIZATION,
            format!("Bearer {api_key}")
                .parse()
                .map_err(|_| GatewayError::Internal("unencodable api key".into()))?,
        );
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
            .bearer_auth(api_key)
            .json(&serde_json::json!({
                "model": group.test_model,
                "max_tokens": 1,
                "messages": [{ "role": "user", "content": "ping" }],
            }));
        run_probe(request, timeout).await
    }
}
