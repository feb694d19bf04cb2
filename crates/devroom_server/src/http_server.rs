//! HTTP server with Axum
//!
//! Admission endpoints (room existence and creation), the real-time `/ws`
//! channel, health and metrics.

use anyhow::Result;
use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket},
        ConnectInfo, Path, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::StatusHint;
use crate::hub::{Connection, Flow, RoomHub};
use crate::metrics::METRICS;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::shutdown::ShutdownCoordinator;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<RoomHub>,
    pub shutdown: ShutdownCoordinator,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RoomExistsResponse {
    pub exists: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomResponse {
    pub success: bool,
    pub room_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.message })).into_response()
    }
}

fn status_for(hint: StatusHint) -> StatusCode {
    match hint {
        StatusHint::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        StatusHint::Malformed => StatusCode::BAD_REQUEST,
        StatusHint::Conflict => StatusCode::CONFLICT,
        StatusHint::AtCapacity => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Bind `config.http_bind` and serve until shutdown.
pub async fn run_server(hub: Arc<RoomHub>, shutdown: ShutdownCoordinator) -> Result<()> {
    let bind_addr = hub.config().http_bind;
    let listener = TcpListener::bind(bind_addr).await?;
    info!("Starting HTTP server on {}", bind_addr);

    serve(listener, hub, shutdown).await
}

/// Serve on an already bound listener until shutdown.
pub async fn serve(listener: TcpListener, hub: Arc<RoomHub>, shutdown: ShutdownCoordinator) -> Result<()> {
    let mut stop = shutdown.subscribe();
    let app = create_router(AppState { hub, shutdown });

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            let _ = stop.recv().await;
            info!("HTTP server shutdown signal received");
        })
        .await?;

    Ok(())
}

pub fn create_router(state: AppState) -> Router {
    let config = state.hub.config();
    let edge = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(config))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("SAMEORIGIN"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::REFERRER_POLICY,
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_DNS_PREFETCH_CONTROL,
            HeaderValue::from_static("off"),
        ));

    Router::new()
        // Health and metrics
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/metrics/json", get(metrics_json_handler))
        // Admission
        .route("/room-exists/:room_id", get(room_exists))
        .route("/create-room", post(create_room))
        // Real-time channel
        .route("/ws", get(websocket_handler))
        .layer(RequestBodyLimitLayer::new(config.max_body_bytes))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(edge)
        .with_state(state)
}

fn cors_layer(config: &Config) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    if config.allowed_origin == "*" {
        return cors.allow_origin(Any);
    }
    match HeaderValue::from_str(&config.allowed_origin) {
        Ok(origin) => cors.allow_origin(origin),
        Err(e) => {
            warn!(origin = %config.allowed_origin, error = %e, "Unusable allowed origin, CORS disabled");
            cors
        }
    }
}

/// Rate-limit key for a request: the last `X-Forwarded-For` hop when a proxy
/// is trusted, else the socket peer address. Earlier hops come from the
/// client and are ignored.
pub fn caller_key(headers: &HeaderMap, peer: SocketAddr, trust_proxy: bool) -> String {
    let forwarded = if trust_proxy {
        headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    } else {
        None
    };

    match forwarded {
        Some(hop) => normalize_caller(hop),
        None => normalize_caller(&peer.ip().to_string()),
    }
}

/// Strip the IPv4-mapped IPv6 prefix so both forms share one key.
pub fn normalize_caller(raw: &str) -> String {
    raw.strip_prefix("::ffff:").unwrap_or(raw).to_string()
}

fn origin_allowed(headers: &HeaderMap, allowed: &str) -> bool {
    match headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) {
        // Non-browser clients send no Origin
        None => true,
        Some(origin) => allowed == "*" || origin == allowed,
    }
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "message": "DevRoom server running!",
        "rooms": state.hub.rooms().len(),
        "clients": state.hub.connection_count(),
    }))
}

async fn metrics_handler() -> impl IntoResponse {
    match METRICS.encode() {
        Ok(metrics) => (StatusCode::OK, metrics),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        ),
    }
}

async fn metrics_json_handler() -> impl IntoResponse {
    match METRICS.as_json() {
        Ok(metrics) => (StatusCode::OK, Json(metrics)),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": format!("Failed to encode metrics: {}", e)})),
        ),
    }
}

async fn room_exists(State(state): State<AppState>, Path(room_id): Path<String>) -> impl IntoResponse {
    METRICS
        .http_requests
        .with_label_values(&["/room-exists", "200"])
        .inc();
    Json(RoomExistsResponse {
        exists: state.hub.room_exists(&room_id),
    })
}

async fn create_room(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let caller = caller_key(&headers, peer, state.hub.config().trust_proxy);

    // Unparseable bodies fall through to the format check after rate limiting.
    let raw_room_id = body
        .ok()
        .and_then(|Json(value)| value.get("roomId").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default();

    let response = match state.hub.create_room(&raw_room_id, &caller) {
        Ok(room_id) => (
            StatusCode::OK,
            Json(CreateRoomResponse {
                success: true,
                room_id,
            }),
        )
            .into_response(),
        Err(e) => {
            debug!(caller = %caller, error = %e, "Room creation rejected");
            ApiError {
                status: status_for(e.status_hint()),
                message: e.to_string(),
            }
            .into_response()
        }
    };

    METRICS
        .http_requests
        .with_label_values(&["/create-room", response.status().as_str()])
        .inc();
    response
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let config = state.hub.config();
    if !origin_allowed(&headers, &config.allowed_origin) {
        warn!(peer = %peer, "WebSocket upgrade from disallowed origin");
        return StatusCode::FORBIDDEN.into_response();
    }

    let caller = caller_key(&headers, peer, config.trust_proxy);
    ws.max_message_size(config.max_frame_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state, caller))
}

async fn handle_socket(socket: WebSocket, state: AppState, caller: String) {
    let (mut sender, mut receiver) = socket.split();
    let hub = state.hub;

    let Connection { id, mut outbound } = match hub.connect(&caller) {
        Ok(connection) => connection,
        Err(err) => {
            let event = ServerEvent::JoinError {
                reason: err.reason().to_string(),
                message: err.to_string(),
            };
            if let Ok(json) = event.to_json() {
                let _ = sender.send(Message::Text(json)).await;
            }
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    info!(connection = %id, caller = %caller, "WebSocket connection established");

    // Writer: serializes outbound events in queue order. Ends once the hub
    // drops the connection's sender and the queue is drained.
    let mut writer = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            match event.to_json() {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!(connection = %id, error = %e, "Failed to serialize event"),
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    let mut stop = state.shutdown.subscribe();
    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let flow = match ClientEvent::decode(&text) {
                            Ok(event) => hub.dispatch(id, event),
                            Err(e) => hub.reject_frame(id, &e),
                        };
                        if flow == Flow::Close {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(connection = %id, error = %e, "WebSocket receive error");
                        break;
                    }
                }
            }
            _ = stop.recv() => break,
        }
    }

    // Cleanup runs however the loop ended.
    hub.disconnect(id);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }

    info!(connection = %id, "WebSocket connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_app(config: Config) -> (Router, Arc<RoomHub>) {
        let hub = Arc::new(RoomHub::new(Arc::new(config)));
        let state = AppState {
            hub: hub.clone(),
            shutdown: ShutdownCoordinator::new(),
        };
        let app = create_router(state).layer(MockConnectInfo(SocketAddr::from(([10, 0, 0, 1], 4000))));
        (app, hub)
    }

    fn create_request(body: &str) -> Request<Body> {
        Request::post("/create-room")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CONTENT_LENGTH, body.len())
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_create_room_then_exists() {
        let (app, _hub) = test_app(Config::default());

        let response = app.clone().oneshot(create_request(r#"{"roomId":"  Team-7 "}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["roomId"], "team-7");

        let response = app
            .oneshot(Request::get("/room-exists/TEAM-7").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(json_body(response).await["exists"], true);
    }

    #[tokio::test]
    async fn test_create_room_status_codes() {
        let mut config = Config::default();
        config.max_total_rooms = 1;
        let (app, _hub) = test_app(config);

        let ok = app.clone().oneshot(create_request(r#"{"roomId":"one"}"#)).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);

        let dup = app.clone().oneshot(create_request(r#"{"roomId":"one"}"#)).await.unwrap();
        assert_eq!(dup.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(dup).await["error"], "Room already exists.");

        let bad = app.clone().oneshot(create_request(r#"{"roomId":"no_way"}"#)).await.unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let missing = app.clone().oneshot(create_request("not json")).await.unwrap();
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

        let full = app.oneshot(create_request(r#"{"roomId":"two"}"#)).await.unwrap();
        assert_eq!(full.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_create_room_rate_limited() {
        let mut config = Config::default();
        config.room_creation_limit.max = 1;
        let (app, _hub) = test_app(config);

        let first = app.clone().oneshot(create_request(r#"{"roomId":"aaa"}"#)).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let second = app.oneshot(create_request(r#"{"roomId":"bbb"}"#)).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    fn forwarded_create(room: &str, forwarded: &str) -> Request<Body> {
        let mut request = create_request(&format!(r#"{{"roomId":"{room}"}}"#));
        request
            .headers_mut()
            .insert("x-forwarded-for", HeaderValue::from_str(forwarded).unwrap());
        request
    }

    #[tokio::test]
    async fn test_spoofed_forwarded_hops_share_one_limit() {
        let mut config = Config::default();
        config.room_creation_limit.max = 1;
        config.trust_proxy = true;
        let (app, _hub) = test_app(config);

        let first = app
            .clone()
            .oneshot(forwarded_create("aaa", "spoof-1, 198.51.100.7"))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let second = app
            .clone()
            .oneshot(forwarded_create("bbb", "spoof-2, 198.51.100.7"))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);

        let other = app.oneshot(forwarded_create("ccc", "198.51.100.8")).await.unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_forwarded_header_ignored_without_trusted_proxy() {
        let mut config = Config::default();
        config.room_creation_limit.max = 1;
        let (app, _hub) = test_app(config);

        let first = app.clone().oneshot(forwarded_create("aaa", "203.0.113.1")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let second = app.oneshot(forwarded_create("bbb", "203.0.113.2")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_security_headers_present() {
        let (app, _hub) = test_app(Config::default());

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let headers = response.headers();
        assert_eq!(headers[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
        assert_eq!(headers[header::X_FRAME_OPTIONS], "SAMEORIGIN");
        assert_eq!(headers[header::REFERRER_POLICY], "no-referrer");
        assert_eq!(headers[header::X_DNS_PREFETCH_CONTROL], "off");
    }

    #[tokio::test]
    async fn test_health_reports_counts() {
        let (app, hub) = test_app(Config::default());
        hub.create_room("abc", "ip").unwrap();

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["rooms"], 1);
        assert_eq!(body["clients"], 0);
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let (app, _hub) = test_app(Config::default());
        let body = format!(r#"{{"roomId":"{}"}}"#, "a".repeat(20 * 1024));

        let response = app.oneshot(create_request(&body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn test_caller_key() {
        let peer = SocketAddr::from(([127, 0, 0, 1], 1));
        let mut headers = HeaderMap::new();
        assert_eq!(caller_key(&headers, peer, true), "127.0.0.1");

        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.2, ::ffff:203.0.113.9"));
        assert_eq!(caller_key(&headers, peer, true), "203.0.113.9");
        assert_eq!(caller_key(&headers, peer, false), "127.0.0.1");

        headers.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.7"));
        assert_eq!(caller_key(&headers, peer, true), "198.51.100.7");

        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4, "));
        assert_eq!(caller_key(&headers, peer, true), "127.0.0.1");

        let mapped: SocketAddr = "[::ffff:192.0.2.1]:80".parse().unwrap();
        assert_eq!(caller_key(&HeaderMap::new(), mapped, false), "192.0.2.1");
    }

    #[test]
    fn test_origin_check() {
        let mut headers = HeaderMap::new();
        assert!(origin_allowed(&headers, "http://localhost:3000"));

        headers.insert(header::ORIGIN, HeaderValue::from_static("http://evil.example"));
        assert!(!origin_allowed(&headers, "http://localhost:3000"));
        assert!(origin_allowed(&headers, "*"));
    }
}
