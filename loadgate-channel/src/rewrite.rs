use bytes::Bytes;
use http::HeaderMap;
use http::header::{HeaderName, HeaderValue};
use loadgate_core::GatewayError;
use loadgate_core::group::{Group, HeaderAction};

/// Headers that must never be copied to the upstream request: hop-by-hop
/// headers, the original Host/Content-Length, and every place a client
/// credential could hide. The adapter re-adds its own credential.
const STRIPPED: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
    "proxy-authorization",
    "proxy-authenticate",
    "authorization",
    "x-api-key",
    "x-goog-api-key",
];

/// Copy inbound headers minus the stripped set.
pub fn forwardable_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound {
        if STRIPPED.contains(&name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Apply the group's ordered header rules. `Host` and
/// `Content-Length` stay owned by the HTTP client regardless of what
/// the rules say.
pub fn apply_header_rules(headers: &mut HeaderMap, group: &Group) {
    for rule in &group.header_rules {
        let Ok(name) = HeaderName::from_bytes(rule.key.as_bytes()) else {
            continue;
        };
        if name == http::header::HOST || name == http::header::CONTENT_LENGTH {
            continue;
        }
        match rule.action {
            HeaderAction::Set => {
                if let Ok(value) = HeaderValue::from_str(&rule.value) {
                    headers.insert(name, value);
                }
            }
            HeaderAction::Remove => {
                headers.remove(name);
            }
        }
    }
}

/// Rewrite the JSON body: model redirect first, then top-level param
/// overrides (override wins). Non-JSON bodies pass through untouched.
///
/// Returns the body and the effective model name for logging.
pub fn rewrite_body(body: &Bytes, group: &Group) -> Result<(Bytes, String), GatewayError> {
    if body.is_empty() {
        return Ok((body.clone(), String::new()));
    }
    let Ok(serde_json::Value::Object(mut map)) = serde_json::from_slice(body) else {
        return Ok((body.clone(), String::new()));
    };

    let mut model = map
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    if !model.is_empty() {
        match group.model_redirect_rules.get(&model) {
            Some(target) => {
                model = target.clone();
                map.insert("model".into(), serde_json::Value::String(model.clone()));
            }
            None if group.model_redirect_strict => {
                return Err(GatewayError::ModelNotAllowed(model));
            }
            None => {}
        }
    }

    for (key, value) in &group.param_overrides {
        map.insert(key.clone(), value.clone());
        if key == "model" {
            if let Some(m) = value.as_str() {
                model = m.to_string();
            }
        }
    }

    let rewritten = serde_json::to_vec(&serde_json::Value::Object(map))?;
    Ok((Bytes::from(rewritten), model))
}
