use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use futures_util::Stream;
use loadgate_core::log::RequestLog;
use loadgate_observability::LogSender;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Response headers that must not be copied back to the client.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
    "proxy-authenticate",
    "proxy-authorization",
];

fn copy_response_headers(
    upstream: &http::HeaderMap,
    builder: http::response::Builder,
) -> http::response::Builder {
    let mut builder = builder;
    for (name, value) in upstream {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
}

/// Relay a buffered upstream response byte-for-byte.
pub fn buffered_response(status: http::StatusCode, headers: &http::HeaderMap, body: Bytes) -> Response {
    let builder = Response::builder().status(status);
    copy_response_headers(headers, builder)
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// Relay a streaming upstream response chunk-by-chunk. The status
/// line and headers go out immediately; each chunk is flushed as it
/// arrives so SSE event boundaries reach the client promptly.
///
/// The request log is emitted when the stream finishes: clean end →
/// the prepared record as-is; mid-stream error or client disconnect →
/// the record gains an `error_message`. A broken stream is never
/// retried — the client has already seen bytes.
pub fn streaming_response(upstream: reqwest::Response, log: RequestLog, sender: LogSender) -> Response {
    let status = upstream.status();
    let headers = upstream.headers().clone();
    let builder = copy_response_headers(&headers, Response::builder().status(status));
    let relay = RelayStream {
        inner: Box::pin(upstream.bytes_stream()),
        log: Some(log),
        sender,
    };
    builder
        .body(Body::from_stream(relay))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

struct RelayStream {
    inner: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    /// Taken exactly once, on completion, error, or drop.
    log: Option<RequestLog>,
    sender: LogSender,
}

impl RelayStream {
    fn finish(&mut self, error: Option<String>) {
        if let Some(mut log) = self.log.take() {
            log.error_message = error;
            self.sender.send(log);
        }
    }
}

impl Stream for RelayStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(e))) => {
                self.finish(Some(format!("stream interrupted: {e}")));
                Poll::Ready(Some(Err(std::io::Error::other(e))))
            }
            Poll::Ready(None) => {
                self.finish(None);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RelayStream {
    fn drop(&mut self) {
        // reached only when the client went away mid-stream
        self.finish(Some("client disconnected before stream end".into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_list_is_lowercase() {
        // header names compare lowercased; the filter list must match
        assert!(HOP_BY_HOP.iter().all(|h| h.chars().all(|c| !c.is_ascii_uppercase())));
    }
}
