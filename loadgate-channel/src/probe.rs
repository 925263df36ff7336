use std::time::Duration;

/// Result of a key validation probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// 2xx — the key works.
    Ok,
    /// Network error, timeout, 429 or 5xx. Try again next cycle.
    Retryable(String),
    /// 401/403, unknown model, schema error. The key (or its config)
    /// is bad until an operator intervenes.
    Permanent(String),
}

impl ProbeOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, ProbeOutcome::Ok)
    }
}

/// Shared status classification for all channels.
pub fn classify_status(status: u16, body_hint: &str) -> ProbeOutcome {
    match status {
        200..=299 => ProbeOutcome::Ok,
        429 | 500..=599 => ProbeOutcome::Retryable(format!("status {status}")),
        401 | 403 => ProbeOutcome::Permanent(format!("status {status}: {body_hint}")),
        _ => ProbeOutcome::Permanent(format!("status {status}: {body_hint}")),
    }
}

/// Run a prepared probe request and classify the result.
pub async fn run_probe(request: reqwest::RequestBuilder, timeout: Duration) -> ProbeOutcome {
    match request.timeout(timeout).send().await {
        Ok(resp) => {
            let status = resp.status().as_u16();
            if (200..300).contains(&status) {
                return ProbeOutcome::Ok;
            }
            let hint = resp
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(200)
                .collect::<String>();
            classify_status(status, &hint)
        }
        Err(e) => ProbeOutcome::Retryable(e.to_string()),
    }
}
