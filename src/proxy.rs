use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::Context as _;
use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    Method, Request, Response, StatusCode, Uri,
    body::Incoming,
    header::{self, HeaderName, HeaderValue},
    service::service_fn,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use serde_json::json;
use tokio::{net::TcpListener, sync::oneshot};

use crate::{
    admin,
    chaos::{ChaosEngine, ErrorInjectionConfig, LatencyConfig},
    config::{Config, CorsConfig, Mode},
    forward::{ForwardError, Forwarder, HttpClient, build_http_client},
    intercept::{InterceptContext, InterceptRegistry},
    matcher::{self, MatcherConfig},
    record::{BodyValue, RequestRecord, ResponseRecord},
    routes::{RouteContext, RouteRegistry, RouteReply},
    storage::Storage,
};

/// URL path prefix reserved for the in-band control plane. Requests under it
/// bypass chaos and the mode pipeline entirely.
pub const ADMIN_PREFIX: &str = "/__";

const CHAOS_CONFIG_ERROR_STATUS: u16 = 500;
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Headers never echoed back to the client from a recorded or upstream
/// response; bodies are re-framed from buffered content.
const HOP_BY_HOP_RESPONSE_HEADERS: [&str; 5] = [
    "transfer-encoding",
    "content-encoding",
    "content-length",
    "connection",
    "keep-alive",
];

pub type RequestHook = Arc<dyn Fn(&RequestRecord) + Send + Sync>;
pub type ResponseHook = Arc<dyn Fn(&RequestRecord, &ResponseRecord) + Send + Sync>;
pub type ErrorHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Lifecycle callbacks owned by the engine, settable programmatically.
#[derive(Clone, Default)]
pub struct EngineEvents {
    pub on_request: Option<RequestHook>,
    pub on_response: Option<ResponseHook>,
    pub on_error: Option<ErrorHook>,
}

/// Everything one running engine owns: the storage handle, the four
/// registries, the mutable mode/target cell, and counters.
pub struct EngineState {
    mode: RwLock<Mode>,
    target: RwLock<Option<Uri>>,
    pub storage: Storage,
    pub chaos: ChaosEngine,
    pub interceptors: InterceptRegistry,
    pub routes: RouteRegistry,
    pub matcher: RwLock<MatcherConfig>,
    cors: CorsConfig,
    client: HttpClient,
    upstream_timeout: Duration,
    events: RwLock<EngineEvents>,
    started_at: Instant,
    port: u16,
    requests_total: AtomicU64,
    replay_hits_total: AtomicU64,
    replay_misses_total: AtomicU64,
    active_connections: AtomicU64,
}

impl EngineState {
    pub fn from_config(config: &Config, port: u16) -> anyhow::Result<Arc<Self>> {
        config.validate()?;

        let storage = Storage::open(config.storage.backend, config.storage.path.as_str())
            .context("open storage")?;

        let chaos = ChaosEngine::new();
        chaos.set_enabled(config.chaos.enabled);
        if let Some(latency) = config.chaos.latency.as_ref() {
            chaos.set_default_latency(Some(LatencyConfig {
                min: latency.min,
                max: latency.max,
            }))?;
        }
        if let Some(rate) = config.chaos.error_rate {
            chaos.set_default_error(Some(ErrorInjectionConfig {
                rate,
                status: CHAOS_CONFIG_ERROR_STATUS,
                message: "Chaos-injected failure".to_owned(),
                details: None,
            }))?;
        }

        let mut matcher_config = MatcherConfig::with_strategy(config.matching.strategy);
        if let Some(headers) = config.matching.ignore_headers.as_ref() {
            matcher_config.ignored_headers = headers
                .iter()
                .map(|name| name.to_ascii_lowercase())
                .collect();
        }
        if let Some(params) = config.matching.ignore_query_params.as_ref() {
            matcher_config.ignored_query_params = params.iter().cloned().collect();
        }

        let target = match config.target.as_ref() {
            Some(target) => Some(
                target
                    .url
                    .parse::<Uri>()
                    .with_context(|| format!("parse target.url `{}`", target.url))?,
            ),
            None => None,
        };
        let upstream_timeout = Duration::from_millis(
            config
                .target
                .as_ref()
                .map(|target| target.timeout_ms)
                .unwrap_or(crate::config::DEFAULT_UPSTREAM_TIMEOUT_MS),
        );

        Ok(Arc::new(Self {
            mode: RwLock::new(config.server.mode),
            target: RwLock::new(target),
            storage,
            chaos,
            interceptors: InterceptRegistry::new(),
            routes: RouteRegistry::new(),
            matcher: RwLock::new(matcher_config),
            cors: config.cors.clone(),
            client: build_http_client()?,
            upstream_timeout,
            events: RwLock::new(EngineEvents::default()),
            started_at: Instant::now(),
            port,
            requests_total: AtomicU64::new(0),
            replay_hits_total: AtomicU64::new(0),
            replay_misses_total: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
        }))
    }

    pub fn mode(&self) -> Mode {
        *self
            .mode
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn target(&self) -> Option<Uri> {
        self.target
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Switches mode (and optionally target) in one step; the next forward
    /// rebuilds its forwarder from this snapshot.
    pub fn set_mode(&self, mode: Mode, target: Option<Uri>) {
        let mut mode_cell = self
            .mode
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(target) = target {
            *self
                .target
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(target);
        }
        *mode_cell = mode;
    }

    pub fn set_events(&self, events: EngineEvents) {
        *self
            .events
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = events;
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn requests_total(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn replay_hits_total(&self) -> u64 {
        self.replay_hits_total.load(Ordering::Relaxed)
    }

    pub fn replay_misses_total(&self) -> u64 {
        self.replay_misses_total.load(Ordering::Relaxed)
    }

    fn matcher_config(&self) -> MatcherConfig {
        self.matcher
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn events(&self) -> EngineEvents {
        self.events
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn forwarder(&self) -> Option<Forwarder> {
        self.target()
            .map(|target| Forwarder::new(self.client.clone(), target, self.upstream_timeout))
    }

    fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }
}

struct ActiveConnectionGuard {
    state: Arc<EngineState>,
}

impl ActiveConnectionGuard {
    fn new(state: Arc<EngineState>) -> Self {
        state.active_connections.fetch_add(1, Ordering::Relaxed);
        Self { state }
    }
}

impl Drop for ActiveConnectionGuard {
    fn drop(&mut self) {
        let _ = self.state.active_connections.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |value| value.checked_sub(1),
        );
    }
}

#[derive(Debug)]
pub struct ProxyHandle {
    pub listen_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
    state: Arc<EngineState>,
}

impl std::fmt::Debug for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineState")
            .field("mode", &self.mode())
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl ProxyHandle {
    pub fn state(&self) -> &Arc<EngineState> {
        &self.state
    }

    /// Stops accepting, waits for in-flight connections to drain, then
    /// releases storage.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;

        let deadline = Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
        while self.state.active_connections() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.state.storage.close();
    }
}

pub async fn serve(config: &Config) -> anyhow::Result<ProxyHandle> {
    let bind_addr = SocketAddr::from(([127, 0, 0, 1], config.server.port));
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("bind {bind_addr}"))?;
    let listen_addr = listener.local_addr().context("get local_addr")?;

    let state = EngineState::from_config(config, listen_addr.port())?;
    tracing::info!(
        addr = %listen_addr,
        mode = state.mode().as_str(),
        "engine listening"
    );

    let accept_state = Arc::clone(&state);
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let conn_state = Arc::clone(&accept_state);
                    tokio::spawn(async move {
                        let _connection_guard =
                            ActiveConnectionGuard::new(Arc::clone(&conn_state));
                        let service = service_fn(move |req| {
                            handle_request(req, Arc::clone(&conn_state))
                        });
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!("connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    Ok(ProxyHandle {
        listen_addr,
        shutdown_tx,
        join,
        state,
    })
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<EngineState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    state.requests_total.fetch_add(1, Ordering::Relaxed);

    // Control plane first: admin paths never see chaos or the mode pipeline.
    if req.uri().path().starts_with(ADMIN_PREFIX) {
        return Ok(admin::handle(req, state).await);
    }

    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    if state.cors.enabled && req.method() == Method::OPTIONS && origin.is_some() {
        return Ok(preflight_response(&state, req.headers(), origin.as_deref()));
    }

    let (parts, body) = req.into_parts();
    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            tracing::debug!("failed to read request body: {err}");
            return Ok(simple_json_response(
                StatusCode::BAD_REQUEST,
                json!({"error": "Bad Request", "message": "failed to read request body"}),
            ));
        }
    };

    let record = match RequestRecord::from_parts(&parts.method, &parts.uri, &parts.headers, &body_bytes)
    {
        Ok(record) => record,
        Err(err) => {
            tracing::debug!("failed to capture request record: {err:#}");
            return Ok(simple_json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "Internal Server Error", "message": "failed to capture request"}),
            ));
        }
    };

    let events = state.events();
    if let Some(on_request) = events.on_request.as_ref() {
        on_request(&record);
    }

    // Chaos gate: the drawn latency always applies; an injected error ends
    // the request here.
    if let Some(injected) = state.chaos.apply(&record.method, &record.path).await {
        tracing::debug!(
            method = %record.method,
            path = %record.path,
            status = injected.status,
            "chaos injected synthetic error"
        );
        if let Some(on_response) = events.on_response.as_ref() {
            on_response(&record, &injected);
        }
        return Ok(emit_response(&state, &injected, origin.as_deref()));
    }

    // Custom routes outrank storage and upstream.
    if let Some((handler, params)) = state.routes.find(&record.method, &record.path) {
        let ctx = RouteContext {
            params,
            query: record.query.clone(),
            headers: record.headers.clone(),
            body: record.body.clone(),
        };
        let response_record = match handler(ctx).await {
            Ok(reply) => reply_to_response(reply),
            Err(err) => {
                tracing::debug!("custom route handler failed: {err:#}");
                ResponseRecord::json(
                    500,
                    json!({"error": "Internal Server Error", "message": "custom route handler failed"}),
                )
            }
        };
        if let Some(on_response) = events.on_response.as_ref() {
            on_response(&record, &response_record);
        }
        return Ok(emit_response(&state, &response_record, origin.as_deref()));
    }

    let response_record = match state.mode() {
        Mode::Mock => replay_from_storage(&state, &record).await,
        mode @ (Mode::Proxy | Mode::Intercept) => {
            forward_and_record(&state, &events, &record, mode).await
        }
    };

    if let Some(on_response) = events.on_response.as_ref() {
        on_response(&record, &response_record);
    }
    Ok(emit_response(&state, &response_record, origin.as_deref()))
}

async fn replay_from_storage(state: &EngineState, record: &RequestRecord) -> ResponseRecord {
    let entries = match state.storage.list().await {
        Ok(entries) => entries,
        Err(err) => {
            tracing::debug!("failed to read storage for replay: {err:#}");
            return ResponseRecord::json(
                500,
                json!({"error": "Internal Server Error", "message": "failed to read storage"}),
            );
        }
    };

    let matcher_config = state.matcher_config();
    match matcher::best_match(record, &entries, &matcher_config) {
        Some(entry) => {
            state.replay_hits_total.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                method = %record.method,
                path = %record.path,
                entry = %entry.id,
                "replay hit"
            );
            entry.response.clone()
        }
        None => {
            state.replay_misses_total.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(method = %record.method, path = %record.path, "replay miss");
            ResponseRecord::json(
                404,
                json!({
                    "error": "Not Found",
                    "message": "No matching mock found for this request",
                    "request": {"method": record.method, "path": record.path},
                }),
            )
        }
    }
}

async fn forward_and_record(
    state: &EngineState,
    events: &EngineEvents,
    record: &RequestRecord,
    mode: Mode,
) -> ResponseRecord {
    let Some(forwarder) = state.forwarder() else {
        return ResponseRecord::json(
            502,
            json!({"error": "Bad Gateway", "message": "no upstream target configured"}),
        );
    };

    let mut response = match forwarder.forward(record).await {
        Ok(response) => response,
        Err(err) => {
            let message = err.to_string();
            tracing::debug!("upstream request failed: {message}");
            if let Some(on_error) = events.on_error.as_ref() {
                on_error(&message);
            }
            return match err {
                ForwardError::Timeout { after } => ResponseRecord::json(
                    504,
                    json!({
                        "error": "Gateway Timeout",
                        "message": format!(
                            "upstream did not respond within {}ms",
                            after.as_millis()
                        ),
                    }),
                ),
                ForwardError::Unreachable { .. } | ForwardError::Internal(_) => {
                    ResponseRecord::json(
                        502,
                        json!({
                            "error": "Bad Gateway",
                            "message": "upstream request failed",
                            "details": message,
                        }),
                    )
                }
            };
        }
    };

    // Transforms run before the client sees the response and before the
    // entry is persisted; a failing handler falls open to the upstream
    // response.
    if mode == Mode::Intercept
        && let Some((handler, params)) = state.interceptors.find(&record.method, &record.path)
    {
        let ctx = InterceptContext {
            request: record.clone(),
            params,
            query: record.query.clone(),
        };
        match handler(response.clone(), ctx).await {
            Ok(transformed) => response = transformed,
            Err(err) => {
                tracing::debug!("interceptor handler failed; serving pre-transform response: {err:#}");
            }
        }
    }

    if let Err(err) = state.storage.save(record.clone(), response.clone()).await {
        tracing::debug!("failed to persist entry: {err:#}");
    }

    response
}

fn reply_to_response(reply: RouteReply) -> ResponseRecord {
    let mut headers = std::collections::BTreeMap::new();
    for (name, value) in reply.headers {
        headers.insert(name.to_ascii_lowercase(), value);
    }
    if matches!(reply.body, BodyValue::Json(_)) && !headers.contains_key("content-type") {
        headers.insert("content-type".to_owned(), "application/json".to_owned());
    }
    ResponseRecord {
        status: reply.status.unwrap_or(200),
        headers,
        body: reply.body,
        captured_at_unix_ms: crate::record::now_unix_ms().unwrap_or(0),
    }
}

/// Serializes a response record to the wire, dropping hop-by-hop headers and
/// attaching the CORS allow-origin when configured.
fn emit_response(
    state: &EngineState,
    record: &ResponseRecord,
    origin: Option<&str>,
) -> Response<Full<Bytes>> {
    let body_bytes = match record.body.to_wire_bytes() {
        Ok(bytes) => bytes.unwrap_or_default(),
        Err(err) => {
            tracing::debug!("failed to serialize response body: {err:#}");
            Vec::new()
        }
    };

    let mut response = Response::new(Full::new(Bytes::from(body_bytes)));
    *response.status_mut() =
        StatusCode::from_u16(record.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    for (name, value) in &record.headers {
        if HOP_BY_HOP_RESPONSE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            tracing::debug!("skipping unserializable recorded header `{name}`");
            continue;
        };
        response.headers_mut().insert(name, value);
    }

    if matches!(record.body, BodyValue::Json(_))
        && !response.headers().contains_key(header::CONTENT_TYPE)
    {
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
    }

    if let Some(allowed) = cors_allow_origin(&state.cors, origin)
        && let Ok(value) = HeaderValue::from_str(&allowed)
    {
        response
            .headers_mut()
            .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
    }

    response
}

fn preflight_response(
    state: &EngineState,
    request_headers: &hyper::HeaderMap,
    origin: Option<&str>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::NO_CONTENT;

    if let Some(allowed) = cors_allow_origin(&state.cors, origin)
        && let Ok(value) = HeaderValue::from_str(&allowed)
    {
        response
            .headers_mut()
            .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
    }
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, PATCH, DELETE, OPTIONS"),
    );
    let allow_headers = request_headers
        .get(header::ACCESS_CONTROL_REQUEST_HEADERS)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("*");
    if let Ok(value) = HeaderValue::from_str(allow_headers) {
        response
            .headers_mut()
            .insert(header::ACCESS_CONTROL_ALLOW_HEADERS, value);
    }

    response
}

fn cors_allow_origin(cors: &CorsConfig, origin: Option<&str>) -> Option<String> {
    if !cors.enabled {
        return None;
    }
    if cors.origins.is_empty() {
        return Some("*".to_owned());
    }
    let origin = origin?;
    cors.origins
        .iter()
        .any(|allowed| allowed == origin)
        .then(|| origin.to_owned())
}

fn simple_json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    let raw = serde_json::to_vec(&body).unwrap_or_default();
    let mut response = Response::new(Full::new(Bytes::from(raw)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}
