// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use opentelemetry::{global, KeyValue};
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    set_header::SetResponseHeaderLayer,
    trace::{DefaultOnFailure, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn};

use relay_api::{BroadcasterFrame, CreateSessionResponse, Role, StopSessionResponse, TeardownReason};
use relay_core::SessionError;

use crate::config::Config;
use crate::file_security;
use crate::state::AppState;
use crate::upgrade_gate::{self, GateRejection, UpgradeRequest};
use crate::websocket;

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Supports wildcard patterns in origins:
/// - `*` - allow all origins
/// - `http://localhost:*` - match any port on localhost
/// - an exact origin like `https://example.com`
fn origin_matches_pattern(origin: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    if let Some(prefix_without_port) = pattern.strip_suffix(":*") {
        let Some(rest) = origin.strip_prefix(prefix_without_port) else {
            return false;
        };
        let Some(port_str) = rest.strip_prefix(':') else {
            return false;
        };
        return !port_str.is_empty() && port_str.chars().all(|c| c.is_ascii_digit());
    }

    origin == pattern
}

/// Best-effort Origin enforcement for browser clients. Not authentication:
/// a defense-in-depth measure against cross-site requests driving the API
/// from an unexpected page.
async fn origin_guard_middleware(
    State(app_state): State<Arc<AppState>>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    use axum::http::Method;

    let path = req.uri().path();
    let method = req.method().clone();
    let is_api = path.starts_with("/api/");
    let is_mutating = matches!(method, Method::POST | Method::PUT | Method::PATCH | Method::DELETE);

    if is_api && is_mutating {
        if let Some(origin) = req.headers().get(header::ORIGIN).and_then(|v| v.to_str().ok()) {
            let allowed = app_state
                .config
                .server
                .cors
                .allowed_origins
                .iter()
                .any(|p| origin_matches_pattern(origin, p));

            if !allowed {
                warn!(origin = %origin, method = %method, path = %path, "rejected request: origin not allowed");
                return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
            }
        }
    }

    next.run(req).await
}

fn create_cors_layer(config: &crate::config::CorsConfig) -> CorsLayer {
    use axum::http::{HeaderValue, Method};

    if config.allowed_origins.iter().any(|o| o == "*") {
        info!("CORS configured to allow all origins (permissive mode)");
        return CorsLayer::permissive();
    }

    if config.allowed_origins.is_empty() {
        info!("CORS configured with no allowed origins (most restrictive)");
        return CorsLayer::new();
    }

    let patterns: Vec<String> = config.allowed_origins.clone();
    info!(allowed_origins = ?patterns, "CORS configured with origin allowlist");

    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _request_parts| {
        let Ok(origin_str) = origin.to_str() else {
            return false;
        };
        patterns.iter().any(|pattern| origin_matches_pattern(origin_str, pattern))
    });

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers(Any)
}


async fn metrics_middleware(req: axum::http::Request<axum::body::Body>, next: Next) -> Response {
    static HTTP_METRICS: OnceLock<(
        opentelemetry::metrics::Counter<u64>,
        opentelemetry::metrics::Histogram<f64>,
    )> = OnceLock::new();

    let start = Instant::now();
    let method = req.method().clone();
    let path = req
        .extensions()
        .get::<axum::extract::MatchedPath>()
        .map_or_else(|| req.uri().path().to_owned(), |matched| matched.as_str().to_owned());

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let (counter, histogram) = HTTP_METRICS
        .get_or_init(|| {
            let meter = global::meter("relay_server");
            (meter.u64_counter("http.server.requests").build(), meter.f64_histogram("http.server.duration").build())
        })
        .clone();

    let labels =
        [KeyValue::new("http.method", method.to_string()), KeyValue::new("http.route", path), KeyValue::new("http.status_code", status)];
    counter.add(1, &labels);
    histogram.record(latency, &labels);

    response
}

#[derive(Debug)]
enum ApiError {
    Session(SessionError),
    NotFound(String),
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, msg) = match self {
            Self::Session(SessionError::NotFound | SessionError::SessionNotLive) => {
                (StatusCode::NOT_FOUND, "session not found".to_string())
            }
            Self::Session(e) => (StatusCode::CONFLICT, e.to_string()),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
        };
        (status, msg).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        Self::Session(e)
    }
}

/// `POST /api/session/create`: allocates a new broadcast session.
async fn create_session_handler(
    State(app_state): State<Arc<AppState>>,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    let session = app_state
        .session_store
        .create()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let response = CreateSessionResponse {
        session_id: session.id.clone(),
        token: session.token.clone(),
        listen_url: format!("/listener.html?sid={}&t={}", session.id, session.token),
        expires_at: session.expires_at_rfc3339(),
    };

    info!(session_id = %session.id, "session created via HTTP");
    Ok(Json(response))
}

/// `POST /api/session/{id}/stop`: ends a session early, as if the
/// broadcaster disconnected.
async fn stop_session_handler(
    State(app_state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<StopSessionResponse>, ApiError> {
    let session = app_state
        .session_store
        .get(&session_id)
        .await
        .ok_or(SessionError::NotFound)?;

    let recording = session
        .recording_path()
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    session.teardown(TeardownReason::StoppedByBroadcaster).await;

    Ok(Json(StopSessionResponse { ok: true, recording }))
}

/// `GET /api/recording/{file}`: streams a finished recording back by its
/// basename. Rejects any name that isn't a direct child of the recordings
/// directory.
async fn get_recording_handler(
    State(app_state): State<Arc<AppState>>,
    Path(file_name): Path<String>,
) -> Result<Response, ApiError> {
    let recordings_dir = std::path::Path::new(&app_state.config.recordings.dir);
    let path = file_security::resolve_recording_path(recordings_dir, &file_name)
        .map_err(ApiError::BadRequest)?;

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| ApiError::NotFound(format!("recording '{file_name}' not found")))?;

    Ok(([(header::CONTENT_TYPE, "audio/webm")], bytes).into_response())
}

/// `GET /?sid=<id>&role=<broadcaster|listener>[&t=<token>]`: the one
/// WebSocket endpoint, admitting broadcaster and listener sockets alike.
async fn relay_ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(app_state): State<Arc<AppState>>,
) -> Response {
    let pairs: Vec<(&str, &str)> = params.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

    let Some(request) = UpgradeRequest::from_query_pairs(pairs) else {
        return (StatusCode::BAD_REQUEST, "missing or invalid sid/role").into_response();
    };

    let session = match upgrade_gate::admit(&app_state.session_store, &request).await {
        Ok(session) => session,
        Err(GateRejection::SessionNotFound) => return StatusCode::NOT_FOUND.into_response(),
        Err(GateRejection::BadToken) => return StatusCode::FORBIDDEN.into_response(),
        Err(GateRejection::CapacityExceeded) => return StatusCode::SERVICE_UNAVAILABLE.into_response(),
        Err(GateRejection::MissingParameters) => return StatusCode::BAD_REQUEST.into_response(),
    };

    match request.role {
        Role::Broadcaster => ws.on_upgrade(move |socket| async move {
            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            match session.attach_broadcaster(cmd_tx).await {
                Ok(()) => websocket::handle_broadcaster_socket(socket, session, cmd_rx).await,
                Err(e) => reject_after_upgrade(socket, &e.to_string()).await,
            }
        }),
        Role::Listener => ws.on_upgrade(move |socket| async move {
            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            match session.attach_listener(cmd_tx).await {
                Ok((listener_id, chunk_rx, cached_init, broadcast_already_live)) => {
                    websocket::handle_listener_socket(
                        socket,
                        session,
                        listener_id,
                        chunk_rx,
                        cached_init,
                        broadcast_already_live,
                        cmd_rx,
                    )
                    .await;
                }
                Err(e) => reject_after_upgrade(socket, &e.to_string()).await,
            }
        }),
    }
}

/// A rejection discovered only after the WebSocket handshake already
/// completed (e.g. a second broadcaster attaching): reported as a JSON
/// error frame on the broadcaster wire shape, then the socket is closed.
async fn reject_after_upgrade(mut socket: axum::extract::ws::WebSocket, message: &str) {
    let frame = BroadcasterFrame::Error { message: message.to_string() };
    if let Ok(json) = serde_json::to_string(&frame) {
        let _ = socket.send(axum::extract::ws::Message::Text(json.into())).await;
    }
    let _ = socket.send(axum::extract::ws::Message::Close(None)).await;
}

/// Builds the Axum application and its shared state.
pub fn create_app(config: Config) -> (Router, Arc<AppState>) {
    let config = Arc::new(config);
    let session_store = crate::session::SessionStore::new(Arc::clone(&config));
    let app_state = Arc::new(AppState { session_store, config: Arc::clone(&config) });

    let cors_layer = create_cors_layer(&config.server.cors);

    let router = Router::new()
        .route("/", get(relay_ws_handler))
        .route("/healthz", get(health_handler))
        .route("/health", get(health_handler))
        .route("/api/session/create", post(create_session_handler))
        .route("/api/session/{id}/stop", post(stop_session_handler))
        .route("/api/recording/{file}", get(get_recording_handler))
        .with_state(Arc::clone(&app_state))
        .layer(middleware::from_fn_with_state(Arc::clone(&app_state), origin_guard_middleware))
        .layer(ServiceBuilder::new().layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let route = request
                        .extensions()
                        .get::<axum::extract::MatchedPath>()
                        .map_or_else(|| request.uri().path(), |matched| matched.as_str());
                    tracing::info_span!("http_request", http_method = %request.method(), http_route = %route)
                })
                .on_response(DefaultOnResponse::new().level(tracing::Level::DEBUG))
                .on_failure(DefaultOnFailure::new().level(tracing::Level::WARN)),
        ))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            header::HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("referrer-policy"),
            header::HeaderValue::from_static("no-referrer"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_FRAME_OPTIONS,
            header::HeaderValue::from_static("SAMEORIGIN"),
        ))
        .layer(cors_layer);

    (router, app_state)
}

/// Starts the HTTP/WebSocket server and blocks until a graceful shutdown
/// signal arrives, tearing down every live session before returning.
pub async fn start_server(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let (app, app_state) = create_app(config.clone());

    let addr: SocketAddr = config.server.bind_address().parse()?;

    let shutdown_signal = async {
        let ctrl_c = async {
            #[allow(clippy::expect_used)]
            tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            #[allow(clippy::expect_used)]
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => info!("received CTRL-C signal, initiating graceful shutdown"),
            () = terminate => info!("received SIGTERM signal, initiating graceful shutdown"),
        }
    };

    info!(address = %addr, "starting relay server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let result = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal)
        .await;

    crate::lifecycle::shutdown_all_sessions(&app_state.session_store).await;

    result.map_err(|e| {
        error!(error = %e, "relay server error");
        e.into()
    })
}
