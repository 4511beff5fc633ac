use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    Method, Request, Response, StatusCode,
    body::Incoming,
    header::{self, HeaderValue},
};
use serde::Serialize;
use serde_json::Value;

use crate::{config::Mode, proxy::EngineState};

const DASHBOARD_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>mockrelay</title>
</head>
<body>
  <h1>mockrelay</h1>
  <p>Control plane endpoints live under <code>/__</code>:</p>
  <ul>
    <li><code>GET /__health</code></li>
    <li><code>GET /__status</code></li>
    <li><code>GET /__mocks</code> / <code>DELETE /__mocks</code> / <code>DELETE /__mocks/:id</code></li>
    <li><code>POST /__mode</code></li>
    <li><code>GET /__chaos</code> / <code>POST /__chaos</code></li>
  </ul>
</body>
</html>
"#;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    mode: &'static str,
    uptime: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    recorded_entries: u64,
    port: u16,
    requests_handled: u64,
    replay_hits: u64,
    replay_misses: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MockSummary {
    id: String,
    method: String,
    path: String,
    status: u16,
    created_at: i64,
}

#[derive(Debug, Serialize)]
struct MocksResponse {
    count: u64,
    entries: Vec<MockSummary>,
}

#[derive(Debug, Serialize)]
struct SuccessResponse {
    success: bool,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChaosStatusResponse {
    enabled: bool,
    requests_processed: u64,
    errors_injected: u64,
    average_latency: f64,
}

pub async fn handle(req: Request<Incoming>, state: Arc<EngineState>) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    if path == "/__health" {
        if method == Method::GET {
            return health(&state);
        }
        return method_not_allowed();
    }
    if path == "/__status" {
        if method == Method::GET {
            return status(&state).await;
        }
        return method_not_allowed();
    }
    if path == "/__mocks" {
        if method == Method::GET {
            return list_mocks(&state).await;
        }
        if method == Method::DELETE {
            return clear_mocks(&state).await;
        }
        return method_not_allowed();
    }
    if let Some(id) = path.strip_prefix("/__mocks/")
        && !id.is_empty()
        && !id.contains('/')
    {
        if method == Method::DELETE {
            return delete_mock(&state, id).await;
        }
        return method_not_allowed();
    }
    if path == "/__mode" {
        if method == Method::POST {
            return set_mode(req, &state).await;
        }
        return method_not_allowed();
    }
    if path == "/__chaos" {
        if method == Method::GET {
            return chaos_status(&state);
        }
        if method == Method::POST {
            return set_chaos(req, &state).await;
        }
        return method_not_allowed();
    }
    if path == "/__admin" {
        if method == Method::GET {
            return dashboard();
        }
        return method_not_allowed();
    }

    not_found()
}

fn health(state: &EngineState) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::OK,
        &HealthResponse {
            status: "ok",
            mode: state.mode().as_str(),
            uptime: state.uptime_secs(),
        },
    )
}

async fn status(state: &EngineState) -> Response<Full<Bytes>> {
    let recorded_entries = match state.storage.count().await {
        Ok(count) => count,
        Err(err) => {
            tracing::debug!("failed to count entries for status: {err:#}");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to read storage",
            );
        }
    };

    json_response(
        StatusCode::OK,
        &StatusResponse {
            mode: state.mode().as_str(),
            target: state.target().map(|uri| uri.to_string()),
            recorded_entries,
            port: state.port(),
            requests_handled: state.requests_total(),
            replay_hits: state.replay_hits_total(),
            replay_misses: state.replay_misses_total(),
        },
    )
}

async fn list_mocks(state: &EngineState) -> Response<Full<Bytes>> {
    let entries = match state.storage.list().await {
        Ok(entries) => entries,
        Err(err) => {
            tracing::debug!("failed to list entries: {err:#}");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to read storage",
            );
        }
    };

    let summaries: Vec<MockSummary> = entries
        .into_iter()
        .map(|entry| MockSummary {
            id: entry.id,
            method: entry.request.method,
            path: entry.request.path,
            status: entry.response.status,
            created_at: entry.created_at_unix_ms,
        })
        .collect();

    json_response(
        StatusCode::OK,
        &MocksResponse {
            count: summaries.len() as u64,
            entries: summaries,
        },
    )
}

async fn clear_mocks(state: &EngineState) -> Response<Full<Bytes>> {
    match state.storage.clear().await {
        Ok(()) => json_response(
            StatusCode::OK,
            &SuccessResponse {
                success: true,
                message: "all recorded entries cleared".to_owned(),
            },
        ),
        Err(err) => {
            tracing::debug!("failed to clear entries: {err:#}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to clear storage",
            )
        }
    }
}

async fn delete_mock(state: &EngineState, id: &str) -> Response<Full<Bytes>> {
    match state.storage.delete(id).await {
        Ok(true) => json_response(
            StatusCode::OK,
            &SuccessResponse {
                success: true,
                message: format!("entry `{id}` deleted"),
            },
        ),
        Ok(false) => error_response(
            StatusCode::NOT_FOUND,
            format!("no entry with id `{id}`"),
        ),
        Err(err) => {
            tracing::debug!("failed to delete entry: {err:#}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to delete entry",
            )
        }
    }
}

/// `POST /__mode {mode, target?}`. Switching into a forward mode without any
/// known target is rejected; a provided target must parse with an authority.
async fn set_mode(req: Request<Incoming>, state: &EngineState) -> Response<Full<Bytes>> {
    let Some(body) = read_json_body(req).await else {
        return error_response(StatusCode::BAD_REQUEST, "invalid JSON body");
    };

    let Some(mode_str) = body.get("mode").and_then(Value::as_str) else {
        return error_response(StatusCode::BAD_REQUEST, "missing `mode` field");
    };
    let mode: Mode = match mode_str.parse() {
        Ok(mode) => mode,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, err.to_string()),
    };

    let target = match body.get("target").and_then(Value::as_str) {
        Some(raw) => match raw.parse::<hyper::Uri>() {
            Ok(uri) if uri.authority().is_some() => Some(uri),
            _ => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("invalid target URL `{raw}`"),
                );
            }
        },
        None => None,
    };

    if mode.requires_target() && target.is_none() && state.target().is_none() {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("mode `{}` requires a target upstream URL", mode.as_str()),
        );
    }

    state.set_mode(mode, target);
    tracing::info!(mode = mode.as_str(), "mode switched");
    json_response(
        StatusCode::OK,
        &SuccessResponse {
            success: true,
            message: format!("mode set to {}", mode.as_str()),
        },
    )
}

fn chaos_status(state: &EngineState) -> Response<Full<Bytes>> {
    let stats = state.chaos.stats();
    json_response(
        StatusCode::OK,
        &ChaosStatusResponse {
            enabled: state.chaos.is_enabled(),
            requests_processed: stats.requests_processed,
            errors_injected: stats.errors_injected,
            average_latency: stats.average_latency_ms,
        },
    )
}

/// `POST /__chaos {enabled}`. The field must be a literal boolean.
async fn set_chaos(req: Request<Incoming>, state: &EngineState) -> Response<Full<Bytes>> {
    let Some(body) = read_json_body(req).await else {
        return error_response(StatusCode::BAD_REQUEST, "invalid JSON body");
    };

    let Some(enabled) = body.get("enabled").and_then(Value::as_bool) else {
        return error_response(StatusCode::BAD_REQUEST, "`enabled` must be a boolean");
    };

    state.chaos.set_enabled(enabled);
    json_response(
        StatusCode::OK,
        &SuccessResponse {
            success: true,
            message: format!("chaos {}", if enabled { "enabled" } else { "disabled" }),
        },
    )
}

fn dashboard() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(DASHBOARD_HTML.as_bytes())));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response
}

fn not_found() -> Response<Full<Bytes>> {
    error_response(StatusCode::NOT_FOUND, "unknown admin endpoint")
}

fn method_not_allowed() -> Response<Full<Bytes>> {
    error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
}

async fn read_json_body(req: Request<Incoming>) -> Option<Value> {
    let body_bytes = req.into_body().collect().await.ok()?.to_bytes();
    serde_json::from_slice(&body_bytes).ok()
}

fn json_response<T: Serialize>(status: StatusCode, payload: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(payload) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            *response.status_mut() = status;
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(err) => {
            tracing::debug!("failed to serialize admin response: {err}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to serialize admin response",
            )
        }
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let payload = ErrorResponse {
        error: status.canonical_reason().unwrap_or("Error"),
        message: message.into(),
    };
    let body = serde_json::to_vec(&payload).unwrap_or_default();
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}
