use std::{collections::BTreeMap, convert::Infallible, net::SocketAddr, time::Instant};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    Method, Request, Response, StatusCode, Uri,
    body::Incoming,
    header::{self, HeaderValue},
    service::service_fn,
};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use serde_json::{Value, json};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
};

use mockrelay::{
    chaos::{ErrorInjectionConfig, LatencyConfig},
    config::Config,
    intercept, proxy,
    record::{BodyValue, RequestRecord, ResponseRecord, generate_id, now_unix_ms},
    routes::{RouteReply, handler},
    storage::{Storage, StorageBackend},
};

#[derive(Debug)]
struct CapturedRequest {
    uri: Uri,
    headers: hyper::HeaderMap,
    body: Bytes,
}

async fn spawn_upstream() -> (
    SocketAddr,
    mpsc::UnboundedReceiver<CapturedRequest>,
    oneshot::Sender<()>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let service = service_fn(move |req: Request<Incoming>| {
                            let tx = tx.clone();
                            async move {
                                let (parts, body) = req.into_parts();
                                let body = body.collect().await.unwrap().to_bytes();
                                let _ = tx.send(CapturedRequest {
                                    uri: parts.uri,
                                    headers: parts.headers,
                                    body,
                                });
                                let response = Response::builder()
                                    .status(StatusCode::OK)
                                    .header(header::CONTENT_TYPE, "application/json")
                                    .header("x-upstream", "yes")
                                    .header(header::CONTENT_ENCODING, "identity")
                                    .body(Full::new(Bytes::from_static(
                                        br#"{"name":"Test","source":"upstream"}"#,
                                    )))
                                    .unwrap();
                                Ok::<_, Infallible>(response)
                            }
                        });
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        let _ = builder.serve_connection(io, service).await;
                    });
                }
            }
        }
    });

    (addr, rx, shutdown_tx)
}

fn http_client() -> Client<HttpConnector, Full<Bytes>> {
    Client::builder(TokioExecutor::new()).build(HttpConnector::new())
}

async fn send(
    client: &Client<HttpConnector, Full<Bytes>>,
    method: Method,
    url: &str,
    body: Option<Value>,
) -> (StatusCode, hyper::HeaderMap, Bytes) {
    let mut builder = Request::builder().method(method).uri(url);
    let body_bytes = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Bytes::from(serde_json::to_vec(&value).unwrap())
        }
        None => Bytes::new(),
    };
    let req = builder.body(Full::new(body_bytes)).unwrap();
    let res = client.request(req).await.unwrap();
    let (parts, body) = res.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    (parts.status, parts.headers, body)
}

fn seed_request(method: &str, path: &str) -> RequestRecord {
    RequestRecord {
        method: method.to_owned(),
        url: path.to_owned(),
        path: path.to_owned(),
        query: BTreeMap::new(),
        headers: BTreeMap::new(),
        body: BodyValue::Absent,
        id: generate_id(),
        captured_at_unix_ms: now_unix_ms().unwrap(),
    }
}

fn mock_config(storage_path: &std::path::Path) -> Config {
    Config::from_yaml_str(&format!(
        r#"
server:
  port: 0
  mode: mock
storage:
  type: lowdb
  path: "{}"
"#,
        storage_path.display()
    ))
    .unwrap()
}

fn proxy_config(storage_path: &std::path::Path, upstream: SocketAddr, mode: &str) -> Config {
    Config::from_yaml_str(&format!(
        r#"
server:
  port: 0
  mode: {mode}
target:
  url: http://{upstream}
storage:
  type: lowdb
  path: "{}"
"#,
        storage_path.display()
    ))
    .unwrap()
}

#[tokio::test]
async fn mock_mode_replays_recorded_entry_with_smart_match() {
    let dir = tempfile::tempdir().unwrap();
    let storage_path = dir.path().join("db.json");

    let storage = Storage::open(StorageBackend::Journal, storage_path.clone()).unwrap();
    storage
        .save(
            seed_request("GET", "/api/users/123"),
            ResponseRecord::json(200, json!({"id": 123, "name": "Original"})),
        )
        .await
        .unwrap();

    let proxy = proxy::serve(&mock_config(&storage_path)).await.unwrap();
    let client = http_client();

    let (status, _headers, body) = send(
        &client,
        Method::GET,
        &format!("http://{}/api/users/999", proxy.listen_addr),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body, json!({"id": 123, "name": "Original"}));

    proxy.shutdown().await;
}

#[tokio::test]
async fn mock_mode_miss_returns_explanatory_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let storage_path = dir.path().join("db.json");

    let proxy = proxy::serve(&mock_config(&storage_path)).await.unwrap();
    let client = http_client();

    let (status, _headers, body) = send(
        &client,
        Method::GET,
        &format!("http://{}/api/unknown", proxy.listen_addr),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        body,
        json!({
            "error": "Not Found",
            "message": "No matching mock found for this request",
            "request": {"method": "GET", "path": "/api/unknown"},
        })
    );

    proxy.shutdown().await;
}

#[tokio::test]
async fn custom_route_outranks_replay_storage() {
    let dir = tempfile::tempdir().unwrap();
    let storage_path = dir.path().join("db.json");

    let storage = Storage::open(StorageBackend::Journal, storage_path.clone()).unwrap();
    storage
        .save(
            seed_request("GET", "/api/data"),
            ResponseRecord::json(200, json!({"source": "mock"})),
        )
        .await
        .unwrap();

    let proxy = proxy::serve(&mock_config(&storage_path)).await.unwrap();
    proxy
        .state()
        .routes
        .get("/api/data", handler(|_ctx| RouteReply::json(json!({"source": "custom"}))));

    let client = http_client();
    let (status, _headers, body) = send(
        &client,
        Method::GET,
        &format!("http://{}/api/data", proxy.listen_addr),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body, json!({"source": "custom"}));

    proxy.shutdown().await;
}

#[tokio::test]
async fn mode_switch_via_admin_replays_what_proxy_mode_recorded() {
    let (upstream_addr, mut upstream_rx, upstream_shutdown) = spawn_upstream().await;
    let dir = tempfile::tempdir().unwrap();
    let storage_path = dir.path().join("db.json");

    let proxy = proxy::serve(&proxy_config(&storage_path, upstream_addr, "proxy"))
        .await
        .unwrap();
    let client = http_client();

    let (status, _headers, body) = send(
        &client,
        Method::GET,
        &format!("http://{}/api/users", proxy.listen_addr),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let recorded_body: Value = serde_json::from_slice(&body).unwrap();
    let _captured = upstream_rx.recv().await.unwrap();

    // Upstream goes away; the switch to mock must serve from storage.
    let _ = upstream_shutdown.send(());
    let (status, _headers, _body) = send(
        &client,
        Method::POST,
        &format!("http://{}/__mode", proxy.listen_addr),
        Some(json!({"mode": "mock"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _headers, body) = send(
        &client,
        Method::GET,
        &format!("http://{}/api/users", proxy.listen_addr),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let replayed_body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(replayed_body, recorded_body);

    proxy.shutdown().await;
}

#[tokio::test]
async fn chaos_injects_configured_latency_and_error() {
    let dir = tempfile::tempdir().unwrap();
    let storage_path = dir.path().join("db.json");

    let proxy = proxy::serve(&mock_config(&storage_path)).await.unwrap();
    let chaos = &proxy.state().chaos;
    chaos.set_enabled(true);
    chaos
        .set_default_latency(Some(LatencyConfig { min: 50, max: 50 }))
        .unwrap();
    chaos
        .set_default_error(Some(ErrorInjectionConfig {
            rate: 100.0,
            status: 503,
            message: "injected".to_owned(),
            details: None,
        }))
        .unwrap();

    let client = http_client();
    let started = Instant::now();
    let (status, _headers, body) = send(
        &client,
        Method::GET,
        &format!("http://{}/api/anything", proxy.listen_addr),
        None,
    )
    .await;
    let elapsed = started.elapsed();

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(elapsed.as_millis() >= 50, "elapsed {elapsed:?}");
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"], "Service Unavailable");
    assert_eq!(body["injected"], true);

    let stats = chaos.stats();
    assert_eq!(stats.requests_processed, 1);
    assert_eq!(stats.errors_injected, 1);
    assert_eq!(stats.total_latency_added_ms, 50);

    proxy.shutdown().await;
}

#[tokio::test]
async fn admin_paths_bypass_chaos_entirely() {
    let dir = tempfile::tempdir().unwrap();
    let storage_path = dir.path().join("db.json");

    let proxy = proxy::serve(&mock_config(&storage_path)).await.unwrap();
    let chaos = &proxy.state().chaos;
    chaos.set_enabled(true);
    chaos
        .set_default_error(Some(ErrorInjectionConfig {
            rate: 100.0,
            status: 503,
            message: "injected".to_owned(),
            details: None,
        }))
        .unwrap();

    let client = http_client();
    let (status, _headers, body) = send(
        &client,
        Method::GET,
        &format!("http://{}/__health", proxy.listen_addr),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["mode"], "mock");
    assert_eq!(chaos.stats().requests_processed, 0);

    proxy.shutdown().await;
}

#[tokio::test]
async fn proxy_mode_forwards_records_and_strips_hop_by_hop_headers() {
    let (upstream_addr, mut upstream_rx, upstream_shutdown) = spawn_upstream().await;
    let dir = tempfile::tempdir().unwrap();
    let storage_path = dir.path().join("db.json");

    let proxy = proxy::serve(&proxy_config(&storage_path, upstream_addr, "proxy"))
        .await
        .unwrap();
    let client = http_client();

    let (status, headers, body) = send(
        &client,
        Method::POST,
        &format!("http://{}/api/items?x=1", proxy.listen_addr),
        Some(json!({"payload": true})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers.get("x-upstream"),
        Some(&HeaderValue::from_static("yes"))
    );
    assert!(headers.get(header::CONTENT_ENCODING).is_none());
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["name"], "Test");

    let captured = upstream_rx.recv().await.unwrap();
    assert_eq!(captured.uri.path(), "/api/items");
    assert_eq!(captured.uri.query(), Some("x=1"));
    assert_eq!(
        serde_json::from_slice::<Value>(&captured.body).unwrap(),
        json!({"payload": true})
    );
    // Host was rewritten to the upstream authority.
    assert_eq!(
        captured
            .headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok()),
        Some(upstream_addr.to_string().as_str())
    );

    let (_, _, status_body) = send(
        &client,
        Method::GET,
        &format!("http://{}/__status", proxy.listen_addr),
        None,
    )
    .await;
    let status_body: Value = serde_json::from_slice(&status_body).unwrap();
    assert_eq!(status_body["recordedEntries"], 1);
    assert_eq!(status_body["mode"], "proxy");

    proxy.shutdown().await;
    let _ = upstream_shutdown.send(());
}

#[tokio::test]
async fn intercept_mode_transforms_before_emitting_and_persisting() {
    let (upstream_addr, _upstream_rx, upstream_shutdown) = spawn_upstream().await;
    let dir = tempfile::tempdir().unwrap();
    let storage_path = dir.path().join("db.json");

    let proxy = proxy::serve(&proxy_config(&storage_path, upstream_addr, "intercept"))
        .await
        .unwrap();
    proxy.state().interceptors.add(
        "*",
        "/api/*",
        intercept::chain(vec![
            intercept::set_status(201),
            intercept::merge_headers(BTreeMap::from([("X-Test".to_owned(), "yes".to_owned())])),
            intercept::modify_body(|body| match body {
                BodyValue::Json(Value::Object(mut map)) => {
                    map.insert("chained".to_owned(), Value::Bool(true));
                    BodyValue::Json(Value::Object(map))
                }
                other => other,
            }),
        ]),
    );

    let client = http_client();
    let (status, headers, body) = send(
        &client,
        Method::GET,
        &format!("http://{}/api/things", proxy.listen_addr),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(headers.get("x-test"), Some(&HeaderValue::from_static("yes")));
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["chained"], true);
    assert_eq!(body["name"], "Test");

    // The persisted entry carries the transformed response.
    let entries = proxy.state().storage.list().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].response.status, 201);

    proxy.shutdown().await;
    let _ = upstream_shutdown.send(());
}

#[tokio::test]
async fn unreachable_upstream_maps_to_bad_gateway_without_persistence() {
    let dir = tempfile::tempdir().unwrap();
    let storage_path = dir.path().join("db.json");

    // Bind then immediately drop to get a port nothing listens on.
    let dead_addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let proxy = proxy::serve(&proxy_config(&storage_path, dead_addr, "proxy"))
        .await
        .unwrap();
    let client = http_client();

    let (status, _headers, body) = send(
        &client,
        Method::GET,
        &format!("http://{}/api/users", proxy.listen_addr),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"], "Bad Gateway");
    assert!(body.get("details").is_some());
    assert_eq!(proxy.state().storage.count().await.unwrap(), 0);

    proxy.shutdown().await;
}

#[tokio::test]
async fn cors_preflight_short_circuits_before_mode_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let storage_path = dir.path().join("db.json");

    let proxy = proxy::serve(&mock_config(&storage_path)).await.unwrap();
    let client = http_client();

    let req = Request::builder()
        .method(Method::OPTIONS)
        .uri(format!("http://{}/api/anything", proxy.listen_addr))
        .header(header::ORIGIN, "http://app.test")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let res = client.request(req).await.unwrap();

    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        res.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN),
        Some(&HeaderValue::from_static("*"))
    );
    assert!(res
        .headers()
        .get(header::ACCESS_CONTROL_ALLOW_METHODS)
        .is_some());

    proxy.shutdown().await;
}
