// Axum front end. Exposes the worker to page sessions as a local HTTP proxy.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::{to_bytes, Body},
    extract::{Path, Request, State},
    http::{header::CONTENT_TYPE, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use parking_lot::Mutex;
use reqwest::Url;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::config::{OFFLINE_MARKER_HEADER, SESSION_HEADER};
use crate::engine::channel::{ClientMessage, SessionId, WorkerMessage};
use crate::engine::interceptor::{InterceptedResponse, Served};
use crate::engine::worker::ShellWorker;
use crate::error::EngineError;
use crate::source::http_source::is_hop_header;
use crate::source::traits::FetchRequest;

/// Upper bound on request bodies forwarded through the proxy (16 MB).
const MAX_FORWARD_BODY_BYTES: usize = 16 * 1024 * 1024;

type Outboxes = Mutex<HashMap<SessionId, mpsc::UnboundedReceiver<WorkerMessage>>>;

struct ServerState {
    worker: Arc<ShellWorker>,
    outboxes: Outboxes,
}

type SharedState = Arc<ServerState>;

pub struct ProxyServer {
    port: u16,
    worker: Arc<ShellWorker>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl ProxyServer {
    /// Start the proxy server on a random local port, returning a handle.
    pub async fn start(worker: Arc<ShellWorker>) -> Result<Self> {
        Self::start_on(worker, "127.0.0.1:0").await
    }

    pub async fn start_on(worker: Arc<ShellWorker>, addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let port = listener.local_addr()?.port();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let state = Arc::new(ServerState {
            worker: Arc::clone(&worker),
            outboxes: Mutex::new(HashMap::new()),
        });

        let app = Router::new()
            .route("/__worker/sessions", post(register_handler))
            .route("/__worker/sessions/{id}", delete(unregister_handler))
            .route(
                "/__worker/sessions/{id}/messages",
                post(message_handler).get(drain_handler),
            )
            .route("/__worker/stats", get(stats_handler))
            .fallback(intercept_handler)
            .with_state(state);

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Ok(Self {
            port,
            worker,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn worker(&self) -> &Arc<ShellWorker> {
        &self.worker
    }

    /// Shutdown the server gracefully.
    pub fn shutdown(mut self) {
        self.worker.shutdown();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterReply {
    id: SessionId,
    controlling_generation: Option<String>,
}

/// POST /__worker/sessions registers a freshly loaded page.
async fn register_handler(State(state): State<SharedState>) -> Response {
    let (id, rx) = state.worker.connect();
    state.outboxes.lock().insert(id, rx);
    let controlling_generation = state.worker.channel().controlling_generation(id);
    (
        StatusCode::CREATED,
        Json(RegisterReply {
            id,
            controlling_generation,
        }),
    )
        .into_response()
}

/// DELETE /__worker/sessions/{id} drops a closed page.
async fn unregister_handler(State(state): State<SharedState>, Path(id): Path<SessionId>) -> Response {
    state.outboxes.lock().remove(&id);
    if state.worker.disconnect(id) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        (StatusCode::NOT_FOUND, "session not found").into_response()
    }
}

/// POST /__worker/sessions/{id}/messages: inbound message, replied on the same transaction.
async fn message_handler(
    State(state): State<SharedState>,
    Path(id): Path<SessionId>,
    Json(message): Json<ClientMessage>,
) -> Response {
    match state.worker.handle_message(id, message) {
        Ok(Some(reply)) => Json(reply).into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(EngineError::UnknownSession(_)) => {
            (StatusCode::NOT_FOUND, "session not found").into_response()
        }
        Err(e) => {
            error!("message from session {} failed: {}", id, e);
            (StatusCode::INTERNAL_SERVER_ERROR, format!("error: {}", e)).into_response()
        }
    }
}

/// GET /__worker/sessions/{id}/messages: drain queued worker notifications.
async fn drain_handler(State(state): State<SharedState>, Path(id): Path<SessionId>) -> Response {
    let mut outboxes = state.outboxes.lock();
    let rx = match outboxes.get_mut(&id) {
        Some(rx) => rx,
        None => return (StatusCode::NOT_FOUND, "session not found").into_response(),
    };
    let mut pending = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        pending.push(msg);
    }
    Json(pending).into_response()
}

/// GET /__worker/stats
async fn stats_handler(State(state): State<SharedState>) -> Response {
    Json(state.worker.stats()).into_response()
}

/// Every other request goes through the interceptor.
async fn intercept_handler(State(state): State<SharedState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();

    let url = match target_url(&state.worker.config().origin, &parts.uri) {
        Some(u) => u,
        None => return (StatusCode::BAD_REQUEST, "invalid request target").into_response(),
    };
    let session = session_from_headers(&parts.headers);

    let body = match read_body(body).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };

    let request = FetchRequest {
        method: parts.method,
        url,
        headers: parts.headers,
        body,
    };
    debug!("proxy request method={} url={}", request.method, request.url);

    match state.worker.fetch(request, session).await {
        Ok(intercepted) => proxy_response(intercepted),
        Err(e) => {
            warn!("upstream failure propagated: {}", e);
            (StatusCode::BAD_GATEWAY, format!("error: {}", e)).into_response()
        }
    }
}

/// Rebuild the page-facing response. Uncached paths keep the origin's
/// end-to-end headers; cached and synthetic responses carry only their type.
fn proxy_response(intercepted: InterceptedResponse) -> Response {
    let served = intercepted.served;
    let upstream = intercepted.response;
    let status = StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::BAD_GATEWAY);

    let mut response = (status, upstream.body).into_response();
    let headers = response.headers_mut();
    if matches!(served, Served::PassThrough | Served::Bypassed) {
        for (name, value) in upstream.headers.iter() {
            if !is_hop_header(name.as_str()) {
                headers.append(name.clone(), value.clone());
            }
        }
    }
    match HeaderValue::from_str(&upstream.content_type) {
        Ok(value) => {
            headers.insert(CONTENT_TYPE, value);
        }
        Err(e) => debug!("dropping unrepresentable content-type: {}", e),
    }
    headers.insert(OFFLINE_MARKER_HEADER, HeaderValue::from_static(served_marker(served)));
    response
}

/// Resolve the request target against the worker origin. Absolute-form targets
/// (proxy requests) are used as-is.
fn target_url(origin: &str, uri: &axum::http::Uri) -> Option<Url> {
    if uri.scheme().is_some() {
        return Url::parse(&uri.to_string()).ok();
    }
    let path_and_query = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    Url::parse(origin).ok()?.join(path_and_query).ok()
}

fn session_from_headers(headers: &HeaderMap) -> Option<SessionId> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

async fn read_body(body: Body) -> std::result::Result<Option<bytes::Bytes>, Response> {
    match to_bytes(body, MAX_FORWARD_BODY_BYTES).await {
        Ok(b) if b.is_empty() => Ok(None),
        Ok(b) => Ok(Some(b)),
        Err(e) => Err((StatusCode::PAYLOAD_TOO_LARGE, format!("error: {}", e)).into_response()),
    }
}

fn served_marker(served: Served) -> &'static str {
    match served {
        Served::Network => "network",
        Served::Cache => "cache",
        Served::OfflineDocument => "offline-document",
        Served::Unavailable => "unavailable",
        Served::Bypassed => "bypassed",
        Served::PassThrough => "pass-through",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::traits::FetchResponse;
    use axum::http::Uri;

    #[test]
    fn test_target_url_origin_form() {
        let uri: Uri = "/styles.css?v=2".parse().unwrap();
        let url = target_url("http://127.0.0.1:8080", &uri).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8080/styles.css?v=2");
    }

    #[test]
    fn test_target_url_absolute_form() {
        let uri: Uri = "https://fcm.googleapis.com/fcm/send".parse().unwrap();
        let url = target_url("http://127.0.0.1:8080", &uri).unwrap();
        assert_eq!(url.host_str(), Some("fcm.googleapis.com"));
    }

    #[test]
    fn test_bypassed_response_keeps_origin_headers() {
        let mut origin_headers = HeaderMap::new();
        origin_headers.insert("cache-control", HeaderValue::from_static("no-store"));
        origin_headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        let upstream = FetchResponse::new(200, "application/json", "{}").with_headers(origin_headers);

        let resp = proxy_response(InterceptedResponse {
            response: upstream.clone(),
            served: Served::Bypassed,
        });
        assert_eq!(resp.headers().get("cache-control").unwrap(), "no-store");
        assert!(resp.headers().get("transfer-encoding").is_none());
        assert_eq!(resp.headers().get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(resp.headers().get(OFFLINE_MARKER_HEADER).unwrap(), "bypassed");

        let resp = proxy_response(InterceptedResponse {
            response: upstream,
            served: Served::Network,
        });
        assert!(resp.headers().get("cache-control").is_none());
        assert_eq!(resp.headers().get(OFFLINE_MARKER_HEADER).unwrap(), "network");
    }

    #[test]
    fn test_session_header_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(session_from_headers(&headers), None);
        headers.insert(SESSION_HEADER, HeaderValue::from_static(" 42 "));
        assert_eq!(session_from_headers(&headers), Some(42));
        headers.insert(SESSION_HEADER, HeaderValue::from_static("abc"));
        assert_eq!(session_from_headers(&headers), None);
    }
}
