//! End-to-end dispatch tests against a scripted local upstream.

use axum::Router;
use axum::extract::{Request, State};
use axum::response::Response;
use bytes::Bytes;
use loadgate_channel::{ChannelRegistry, InboundRequest, register_all};
use loadgate_core::crypto::Encryptor;
use loadgate_core::group::Group;
use loadgate_core::key::KeyStatus;
use loadgate_core::stats::hour_bucket;
use loadgate_observability::{LogPipeline, Metrics};
use loadgate_pool::KeyPool;
use loadgate_proxy::limiter::RateLimiter;
use loadgate_proxy::{ProxyState, engine, routes};
use loadgate_store::db::connect_ephemeral;
use loadgate_store::groups::GroupRepo;
use loadgate_store::keys::KeyRepo;
use loadgate_store::kv::{KvStore, MemoryStore};
use loadgate_store::logs::LogRepo;
use loadgate_store::settings::Settings;
use loadgate_store::GroupCache;
use loadgate_store::stats::StatsRepo;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

// ── Scripted upstream ─────────────────────────────────────────

#[derive(Clone, Default)]
struct MockUpstream {
    /// api key → queued response statuses; missing/exhausted = 200.
    scripts: Arc<Mutex<HashMap<String, VecDeque<u16>>>>,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
}

#[derive(Debug, Clone)]
struct SeenRequest {
    path: String,
    bearer: Option<String>,
    body: String,
}

impl MockUpstream {
    fn script(&self, key: &str, statuses: &[u16]) {
        self.scripts
            .lock()
            .unwrap()
            .insert(key.to_string(), statuses.iter().copied().collect());
    }

    fn requests(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }
}

async fn mock_handler(State(upstream): State<MockUpstream>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let bearer = parts
        .headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);
    let body = axum::body::to_bytes(body, 1 << 20).await.unwrap_or_default();
    upstream.seen.lock().unwrap().push(SeenRequest {
        path: parts.uri.path().to_string(),
        bearer: bearer.clone(),
        body: String::from_utf8_lossy(&body).to_string(),
    });

    let status = bearer
        .and_then(|key| upstream.scripts.lock().unwrap().get_mut(&key).and_then(|q| q.pop_front()))
        .unwrap_or(200);

    if status == 200 && parts.uri.path().ends_with("/stream") {
        return Response::builder()
            .status(200)
            .header("content-type", "text/event-stream")
            .body(axum::body::Body::from("data: one\n\ndata: [DONE]\n\n"))
            .unwrap();
    }
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(format!(r#"{{"status":{status},"object":"chat.completion"}}"#)))
        .unwrap()
}

async fn start_upstream() -> (String, MockUpstream) {
    let upstream = MockUpstream::default();
    let app = Router::new()
        .fallback(mock_handler)
        .with_state(upstream.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), upstream)
}

// ── Fixture ───────────────────────────────────────────────────

struct Fixture {
    state: Arc<ProxyState>,
    pipeline: Arc<LogPipeline>,
    pool: Arc<KeyPool>,
    groups: GroupRepo,
    keys: KeyRepo,
    logs: LogRepo,
    stats: StatsRepo,
}

impl Fixture {
    async fn new() -> Self {
        let db = connect_ephemeral().await.unwrap();
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let groups = GroupRepo::new(db.clone());
        let keys = KeyRepo::new(db.clone());
        let logs = LogRepo::new(db.clone());
        let stats = StatsRepo::new(db.clone());
        let settings = Arc::new(Settings::load(db).await.unwrap());
        let pool = Arc::new(KeyPool::new(
            Arc::clone(&kv),
            keys.clone(),
            Encryptor::new("e2e-secret").unwrap(),
        ));
        let cache = Arc::new(GroupCache::new(groups.clone(), kv));
        let mut registry = ChannelRegistry::new();
        register_all(&mut registry);
        let metrics = Arc::new(Metrics::new());
        let pipeline = Arc::new(LogPipeline::new(
            logs.clone(),
            stats.clone(),
            Arc::clone(&metrics),
            1000,
            100,
            Duration::from_millis(20),
        ));

        let state = Arc::new(ProxyState {
            cache,
            pool: Arc::clone(&pool),
            registry: Arc::new(registry),
            settings: Arc::clone(&settings),
            limiter: RateLimiter::new(stats.clone(), settings),
            logs: pipeline.sender(),
            metrics,
            client: reqwest::Client::new(),
            concurrency: Arc::new(Semaphore::new(64)),
        });

        Self {
            state,
            pipeline,
            pool,
            groups,
            keys,
            logs,
            stats,
        }
    }

    async fn create_group(&self, name: &str, upstream: &str, config: serde_json::Value) -> i64 {
        let group: Group = serde_json::from_value(serde_json::json!({
            "name": name,
            "channel_type": "openai",
            "upstreams": [{ "url": upstream, "weight": 1 }],
            "test_model": "gpt-4o-mini",
            "proxy_keys": "proxy-123",
            "config": config
        }))
        .unwrap();
        self.groups.create(&group).await.unwrap()
    }

    fn request(&self, body: &str) -> InboundRequest {
        let mut headers = http::HeaderMap::new();
        headers.insert("authorization", "Bearer proxy-123".parse().unwrap());
        headers.insert("content-type", "application/json".parse().unwrap());
        InboundRequest {
            method: http::Method::POST,
            subpath: "/v1/chat/completions".into(),
            query: String::new(),
            headers,
            body: Bytes::from(body.to_string()),
        }
    }
}

async fn body_string(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
    String::from_utf8_lossy(&bytes).to_string()
}

// ── Scenarios ─────────────────────────────────────────────────

#[tokio::test]
async fn simple_openai_request_roundtrip() {
    let (upstream_url, upstream) = start_upstream().await;
    let fx = Fixture::new().await;
    let gid = fx.create_group("g1", &upstream_url, serde_json::json!({})).await;
    fx.pool.add_keys(gid, &["sk-AAA".into()]).await.unwrap();

    let body = r#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}]}"#;
    let response = engine::dispatch(&fx.state, "g1", fx.request(body)).await;
    assert_eq!(response.status(), 200);
    assert!(body_string(response).await.contains("chat.completion"));

    // the real key went upstream, body unchanged
    let seen = upstream.requests();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].path, "/v1/chat/completions");
    assert_eq!(seen[0].bearer.as_deref(), Some("sk-AAA"));
    assert_eq!(seen[0].body, body);

    // hourly success counted after a flush
    fx.pipeline.flush_once().await;
    let stat = fx
        .stats
        .hourly(gid, hour_bucket(chrono::Utc::now()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!((stat.success_count, stat.failure_count), (1, 0));
}

#[tokio::test]
async fn retry_walks_across_keys_until_success() {
    let (upstream_url, upstream) = start_upstream().await;
    let fx = Fixture::new().await;
    let gid = fx
        .create_group("g1", &upstream_url, serde_json::json!({ "max_retries": 3 }))
        .await;
    fx.pool
        .add_keys(gid, &["sk-K1".into(), "sk-K2".into(), "sk-K3".into()])
        .await
        .unwrap();
    upstream.script("sk-K1", &[429]);
    upstream.script("sk-K2", &[500]);

    let response = engine::dispatch(&fx.state, "g1", fx.request(r#"{"model":"gpt-4o"}"#)).await;
    assert_eq!(response.status(), 200);

    let seen = upstream.requests();
    assert_eq!(seen.len(), 3, "three upstream calls expected");
    assert_eq!(seen[2].bearer.as_deref(), Some("sk-K3"));

    fx.pipeline.flush_once().await;
    let (rows, _) = fx.logs.query(&Default::default()).await.unwrap();
    assert_eq!(rows.len(), 1, "one request, one log");
    assert_eq!(rows[0].retries, 2);
    assert_eq!(rows[0].status_code, 200);
}

#[tokio::test]
async fn key_demoted_after_threshold_401s() {
    let (upstream_url, upstream) = start_upstream().await;
    let fx = Fixture::new().await;
    let gid = fx
        .create_group(
            "g1",
            &upstream_url,
            serde_json::json!({ "max_retries": 2, "blacklist_threshold": 3 }),
        )
        .await;
    let key = fx.pool.add_keys(gid, &["sk-BAD".into()]).await.unwrap().remove(0);
    upstream.script("sk-BAD", &[401, 401, 401]);

    let response = engine::dispatch(&fx.state, "g1", fx.request(r#"{"model":"gpt-4o"}"#)).await;
    assert_eq!(response.status(), 502, "exhausted retries surface as 502");

    assert_eq!(fx.pool.active_count(gid).await.unwrap(), 0);
    assert_eq!(fx.pool.invalid_ids(gid).await.unwrap(), vec![key.id]);
    let stored = fx.keys.get(key.id).await.unwrap().unwrap();
    assert_eq!(stored.status, KeyStatus::Invalid);

    // next request has no active key left
    let response = engine::dispatch(&fx.state, "g1", fx.request(r#"{"model":"gpt-4o"}"#)).await;
    assert_eq!(response.status(), 503);
    assert!(body_string(response).await.contains("no_active_key"));
}

#[tokio::test]
async fn second_key_serves_after_first_demotes() {
    let (upstream_url, upstream) = start_upstream().await;
    let fx = Fixture::new().await;
    let gid = fx
        .create_group(
            "g1",
            &upstream_url,
            serde_json::json!({ "max_retries": 5, "blacklist_threshold": 3 }),
        )
        .await;
    fx.pool.add_keys(gid, &["sk-BAD".into(), "sk-OK".into()]).await.unwrap();
    upstream.script("sk-BAD", &[401, 401, 401, 401]);

    // rotation alternates BAD, OK — the second attempt succeeds
    let response = engine::dispatch(&fx.state, "g1", fx.request(r#"{"model":"gpt-4o"}"#)).await;
    assert_eq!(response.status(), 200);
    assert_eq!(fx.pool.active_count(gid).await.unwrap(), 2, "one 401 is below threshold");
}

#[tokio::test]
async fn zero_retries_means_single_attempt() {
    let (upstream_url, upstream) = start_upstream().await;
    let fx = Fixture::new().await;
    let gid = fx
        .create_group("g1", &upstream_url, serde_json::json!({ "max_retries": 0 }))
        .await;
    fx.pool.add_keys(gid, &["sk-K1".into(), "sk-K2".into()]).await.unwrap();
    upstream.script("sk-K1", &[503]);

    let response = engine::dispatch(&fx.state, "g1", fx.request(r#"{"model":"gpt-4o"}"#)).await;
    assert_eq!(response.status(), 502);
    assert_eq!(upstream.requests().len(), 1, "no rotation with a zero retry budget");
    let body = body_string(response).await;
    assert!(body.contains(r#""retries":0"#));
}

#[tokio::test]
async fn permanent_4xx_relayed_verbatim_without_demotion() {
    let (upstream_url, upstream) = start_upstream().await;
    let fx = Fixture::new().await;
    let gid = fx
        .create_group("g1", &upstream_url, serde_json::json!({ "max_retries": 3 }))
        .await;
    let key = fx.pool.add_keys(gid, &["sk-AAA".into()]).await.unwrap().remove(0);
    upstream.script("sk-AAA", &[404]);

    let response = engine::dispatch(&fx.state, "g1", fx.request(r#"{"model":"gone"}"#)).await;
    assert_eq!(response.status(), 404, "provider diagnostic must reach the client");
    assert!(body_string(response).await.contains(r#""status":404"#));

    assert_eq!(upstream.requests().len(), 1, "permanent failures are not retried");
    assert_eq!(fx.pool.active_count(gid).await.unwrap(), 1);
    let stored = fx.keys.get(key.id).await.unwrap().unwrap();
    assert_eq!(stored.status, KeyStatus::Active, "404 is not attributable to the key");

    fx.pipeline.flush_once().await;
    let (rows, _) = fx.logs.query(&Default::default()).await.unwrap();
    assert_eq!(rows[0].status_code, 404);
    assert!(rows[0].error_message.as_deref().unwrap().contains("404"));
}

#[tokio::test]
async fn aggregate_request_dispatches_to_child_pool() {
    let (upstream_url, upstream) = start_upstream().await;
    let fx = Fixture::new().await;
    let child = fx.create_group("child", &upstream_url, serde_json::json!({})).await;
    fx.pool.add_keys(child, &["sk-CHILD".into()]).await.unwrap();

    let agg: Group = serde_json::from_value(serde_json::json!({
        "name": "agg",
        "channel_type": "openai",
        "group_type": "aggregate",
        "proxy_keys": "proxy-123"
    }))
    .unwrap();
    let agg_id = fx.groups.create(&agg).await.unwrap();
    fx.groups
        .set_sub_groups(
            agg_id,
            &[loadgate_core::group::GroupSubGroup {
                parent_id: agg_id,
                sub_group_id: child,
                weight: 1,
            }],
        )
        .await
        .unwrap();

    let response = engine::dispatch(&fx.state, "agg", fx.request(r#"{"model":"gpt-4o"}"#)).await;
    assert_eq!(response.status(), 200);
    assert_eq!(upstream.requests()[0].bearer.as_deref(), Some("sk-CHILD"));

    fx.pipeline.flush_once().await;
    let (rows, _) = fx.logs.query(&Default::default()).await.unwrap();
    assert_eq!(rows[0].group_name, "child", "log is attributed to the serving child");
}

#[tokio::test]
async fn hourly_limit_denies_with_retry_after() {
    let (upstream_url, _upstream) = start_upstream().await;
    let fx = Fixture::new().await;
    let gid = fx
        .create_group("g1", &upstream_url, serde_json::json!({ "max_requests_per_hour": 10 }))
        .await;
    fx.pool.add_keys(gid, &["sk-AAA".into()]).await.unwrap();

    // 10 already used this hour
    fx.stats
        .bump_hourly(gid, hour_bucket(chrono::Utc::now()), 10, 0)
        .await
        .unwrap();

    let response = engine::dispatch(&fx.state, "g1", fx.request(r#"{"model":"gpt-4o"}"#)).await;
    assert_eq!(response.status(), 429);
    let retry_after: i64 = response
        .headers()
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((0..=3600).contains(&retry_after));
    assert!(body_string(response).await.contains("hourly_limit"));

    // denied requests are not counted
    fx.pipeline.flush_once().await;
    let stat = fx
        .stats
        .hourly(gid, hour_bucket(chrono::Utc::now()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stat.success_count + stat.failure_count, 10);
}

#[tokio::test]
async fn wrong_proxy_key_is_401() {
    let (upstream_url, upstream) = start_upstream().await;
    let fx = Fixture::new().await;
    let gid = fx.create_group("g1", &upstream_url, serde_json::json!({})).await;
    fx.pool.add_keys(gid, &["sk-AAA".into()]).await.unwrap();

    let mut request = fx.request(r#"{"model":"gpt-4o"}"#);
    request
        .headers
        .insert("authorization", "Bearer wrong".parse().unwrap());
    let response = engine::dispatch(&fx.state, "g1", request).await;
    assert_eq!(response.status(), 401);
    assert!(upstream.requests().is_empty(), "unauthorized requests never go upstream");
}

#[tokio::test]
async fn unknown_group_is_404() {
    let fx = Fixture::new().await;
    let response = engine::dispatch(&fx.state, "ghost", fx.request("{}")).await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn streaming_response_relays_bytes_and_logs_after_completion() {
    let (upstream_url, _upstream) = start_upstream().await;
    let fx = Fixture::new().await;
    let gid = fx.create_group("g1", &upstream_url, serde_json::json!({})).await;
    fx.pool.add_keys(gid, &["sk-AAA".into()]).await.unwrap();

    let mut request = fx.request(r#"{"model":"gpt-4o","stream":true}"#);
    request.subpath = "/v1/stream".into();
    let response = engine::dispatch(&fx.state, "g1", request).await;
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    let body = body_string(response).await;
    assert!(body.contains("data: one"));
    assert!(body.ends_with("data: [DONE]\n\n"), "byte-for-byte relay");

    fx.pipeline.flush_once().await;
    let (rows, _) = fx.logs.query(&Default::default()).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].is_stream);
    assert!(rows[0].error_message.is_none());
}

#[tokio::test]
async fn router_extracts_group_and_subpath() {
    use tower::util::ServiceExt;

    let (upstream_url, upstream) = start_upstream().await;
    let fx = Fixture::new().await;
    let gid = fx.create_group("g1", &upstream_url, serde_json::json!({})).await;
    fx.pool.add_keys(gid, &["sk-AAA".into()]).await.unwrap();

    let app = routes::proxy_router(Arc::clone(&fx.state));
    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/proxy/g1/v1/chat/completions")
        .header("authorization", "Bearer proxy-123")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(r#"{"model":"gpt-4o"}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(upstream.requests()[0].path, "/v1/chat/completions");
}
