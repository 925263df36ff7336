use crate::probe::{ProbeOutcome, run_probe};
use crate::rewrite::{apply_header_rules, forwardable_headers, rewrite_body};
use crate::{ChannelAdapter, InboundRequest, OutboundRequest, join_url};
use loadgate_core::GatewayError;
use loadgate_core::group::Group;
use std::time::Duration;

/// Gemini channel. The credential travels in the `key` query
/// parameter (or the `x-goog-api-key` header); streaming is selected
/// by the `:streamGenerateContent` method suffix or `alt=sse`.
pub struct GeminiChannel;

/// Value of one query parameter, if present.
fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == name).then_some(v)
    })
}

/// Rebuild the query without any client `key` parameter.
fn query_without_key(query: &str) -> String {
    query
        .split('&')
        .filter(|pair| !pair.is_empty() && !pair.starts_with("key="))
        .collect::<Vec<_>>()
        .join("&")
}

#[async_trait::async_trait]
impl ChannelAdapter for GeminiChannel {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn extract_proxy_key(&self, req: &InboundRequest) -> Option<String> {
        if let Some(key) = query_param(&req.query, "key") {
            return Some(key.to_string());
        }
        req.headers
            .get("x-goog-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    fn is_stream(&self, req: &InboundRequest) -> bool {
        req.subpath.contains(":streamGenerateContent")
            || query_param(&req.query, "alt") == Some("sse")
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
        apply_header_rules(&mut headers, group);

        // the pooled key replaces whatever `key` the client sent
        let mut query = query_without_key(&req.query);
        if query.is_empty() {
            query = format!("key={api_key}");
        } else {
            query = format!("{query}&key={api_key}");
        }

        // Gemini names the model in the path, not the body
        let model = if model.is_empty() {
            model_from_path(&req.subpath)
        } else {
            model
        };

        Ok(OutboundRequest {
            method: req.method.clone(),
            url: join_url(upstream, &req.subpath, &query),
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
        let path = match group.validation_endpoint.as_deref() {
            Some(path) => path.to_string(),
            None => format!("/v1beta/models/{}:generateContent", group.test_model),
        };
        let request = client
            .post(join_url(upstream, &path, &format!("key={api_key}")))
            .json(&serde_json::json!({
                "contents": [{ "parts": [{ "text": "ping" }] }],
                "generationConfig": { "maxOutputTokens": 1 },
            }));
        run_probe(request, timeout).await
    }
}

/// `/v1beta/models/gemini-2.0-flash:generateContent` → `gemini-2.0-flash`.
fn model_from_path(subpath: &str) -> String {
    subpath
        .rsplit('/')
        .next()
        .and_then(|segment| segment.split(':').next())
        .unwrap_or_default()
        .to_string()
}
