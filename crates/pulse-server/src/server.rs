//! `PulseServer` — Axum HTTP + WebSocket gateway.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use tracing::{info, instrument, warn};

use pulse_hub::{
    BroadcastScheduler, ChangeDetector, ConnectionRegistry, DetectorConfig, MemoryHistory,
    MessageRouter, SchedulerConfig, SystemSampler,
};
use pulse_core::{MessageType, Priority, ServerEvent};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::session::run_session;
use crate::shutdown::ShutdownCoordinator;
use crate::sweep::spawn_sweeper;

/// Generates UUIDv7 request IDs.
#[derive(Clone)]
struct UuidV7RequestId;

impl MakeRequestId for UuidV7RequestId {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        let id = uuid::Uuid::now_v7().to_string();
        axum::http::HeaderValue::from_str(&id)
            .ok()
            .map(RequestId::new)
    }
}

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub scheduler: Arc<BroadcastScheduler>,
    pub router: Arc<MessageRouter>,
    pub sampler: Arc<SystemSampler>,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub start_time: Instant,
    pub config: ServerConfig,
    pub metrics_handle: Arc<PrometheusHandle>,
}

/// The gateway process: owns the hub pieces and their timers.
pub struct PulseServer {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    scheduler: Arc<BroadcastScheduler>,
    router: Arc<MessageRouter>,
    detector: Arc<ChangeDetector>,
    sampler: Arc<SystemSampler>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics_handle: Arc<PrometheusHandle>,
    start_time: Instant,
}

impl PulseServer {
    /// Wire the registry, scheduler, router, and detector from config.
    pub fn new(config: ServerConfig, metrics_handle: PrometheusHandle) -> Self {
        let hub = &config.hub;
        let registry = Arc::new(ConnectionRegistry::new(
            hub.max_total_connections,
            hub.max_connections_per_user,
        ));
        let history = Arc::new(MemoryHistory::new(hub.default_history_limit.max(100)));
        let scheduler = BroadcastScheduler::new(
            Arc::clone(&registry),
            SchedulerConfig {
                max_queue_size: hub.max_queue_size,
                batch_size: hub.broadcast_batch_size,
                flush_interval: Duration::from_millis(hub.broadcast_flush_interval_ms),
            },
            Some(Arc::clone(&history)),
        );
        let router = Arc::new(MessageRouter::new(
            Arc::clone(&registry),
            history,
            hub.default_history_limit,
            hub.max_message_size,
        ));
        let sampler = Arc::new(SystemSampler::new(Arc::clone(&registry)));
        let detector = ChangeDetector::new(
            Arc::clone(&sampler) as Arc<dyn pulse_hub::Sampler>,
            Arc::clone(&scheduler),
            DetectorConfig::default(),
        );

        let shutdown = Arc::new(ShutdownCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&scheduler),
            Arc::clone(&detector),
        ));

        Self {
            config,
            registry,
            scheduler,
            router,
            detector,
            sampler,
            shutdown,
            metrics_handle: Arc::new(metrics_handle),
            start_time: Instant::now(),
        }
    }

    /// Build the Axum router with all routes and middleware.
    pub fn router(&self) -> Router {
        let state = AppState {
            registry: Arc::clone(&self.registry),
            scheduler: Arc::clone(&self.scheduler),
            router: Arc::clone(&self.router),
            sampler: Arc::clone(&self.sampler),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
            config: self.config.clone(),
            metrics_handle: Arc::clone(&self.metrics_handle),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(ws_upgrade_handler))
            .route("/api/stats", get(stats_handler))
            .route("/api/queue", get(queue_handler))
            .route("/api/broadcast", post(broadcast_handler))
            .with_state(state)
            // Outermost layers execute first on request, last on response.
            .layer(CatchPanicLayer::new())
            .layer(RequestBodyLimitLayer::new(1024 * 1024)) // 1 MB
            .layer(SetRequestIdLayer::x_request_id(UuidV7RequestId))
            .layer(PropagateRequestIdLayer::x_request_id())
    }

    /// Bind, start the background timers, and serve. Returns the bound
    /// address and a join handle for the server task.
    #[instrument(skip_all, fields(host = %self.config.host, port = self.config.port))]
    pub async fn listen(
        &self,
    ) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), std::io::Error> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let bound_addr = listener.local_addr()?;

        // Three independent tickers: flush, sweep, detect.
        self.shutdown.register_task(self.scheduler.start());
        self.shutdown.register_task(self.detector.start());
        self.shutdown.register_task(spawn_sweeper(
            Arc::clone(&self.registry),
            Duration::from_millis(self.config.hub.heartbeat_timeout_ms),
            Duration::from_secs(self.config.sweep_interval_secs),
            self.shutdown.token(),
        ));

        info!(addr = %bound_addr, "server started");

        let router = self.router();
        let shutdown_token = self.shutdown.token();

        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    shutdown_token.cancelled().await;
                    info!("server shutdown initiated");
                })
                .await;
            info!("server shutdown complete");
        });

        Ok((bound_addr, handle))
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<BroadcastScheduler> {
        &self.scheduler
    }

    pub fn detector(&self) -> &Arc<ChangeDetector> {
        &self.detector
    }

    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let resp = health::health_check(
        state.start_time,
        state.registry.total(),
        state.scheduler.queue_stats().length,
    );
    Json(resp)
}

/// GET /metrics — Prometheus text format.
async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics_handle.render()
}

/// GET /api/stats — registry counters.
async fn stats_handler(State(state): State<AppState>) -> Json<Value> {
    state.sampler.record_request();
    let stats = state.registry.stats();
    Json(json!({
        "totalConnections": stats.total,
        "uniqueUsers": stats.unique_identities,
        "averageSubscriptions": stats.average_subscriptions,
    }))
}

/// GET /api/queue — scheduler counters.
async fn queue_handler(State(state): State<AppState>) -> Json<Value> {
    state.sampler.record_request();
    let stats = state.scheduler.queue_stats();
    Json(json!({
        "length": stats.length,
        "isProcessing": stats.is_processing,
    }))
}

#[derive(Debug, Deserialize)]
struct BroadcastRequest {
    #[serde(rename = "type")]
    kind: MessageType,
    event: ServerEvent,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    priority: Priority,
}

/// POST /api/broadcast — privileged write path (shared-secret bearer).
async fn broadcast_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<BroadcastRequest>,
) -> impl IntoResponse {
    state.sampler.record_request();

    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let secret = state.config.shared_secret.as_str();
    if secret.is_empty() || presented != Some(secret) {
        warn!("rejected unauthenticated broadcast request");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "code": "UNAUTHORIZED", "message": "invalid bearer token" })),
        );
    }

    let queued = state.scheduler.broadcast(
        request.kind,
        request.event,
        request.data,
        request.priority,
    );
    (StatusCode::OK, Json(json!({ "queued": queued })))
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    identity: Option<String>,
}

/// GET /ws — WebSocket upgrade handler.
///
/// The identity is an opaque string the hub never interprets; admission
/// (and its 1008 policy close) happens inside the session so the client
/// sees a proper close frame rather than a failed upgrade.
async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let identity = params
        .identity
        .filter(|i| !i.is_empty())
        .unwrap_or_else(|| "anonymous".to_owned());
    let max_message_size = state.config.hub.max_message_size;

    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| run_session(socket, identity, state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tower::ServiceExt;

    fn make_server() -> PulseServer {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        PulseServer::new(ServerConfig::default(), handle)
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let server = make_server();
        let app = server.router();

        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 0);
    }

    #[tokio::test]
    async fn stats_endpoint_shape() {
        let server = make_server();
        let app = server.router();

        let req = Request::builder()
            .uri("/api/stats")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["totalConnections"], 0);
        assert_eq!(parsed["uniqueUsers"], 0);
        assert!(parsed["averageSubscriptions"].is_number());
    }

    #[tokio::test]
    async fn queue_endpoint_shape() {
        let server = make_server();
        let app = server.router();

        let req = Request::builder()
            .uri("/api/queue")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["length"], 0);
        assert_eq!(parsed["isProcessing"], false);
    }

    #[tokio::test]
    async fn broadcast_requires_bearer_secret() {
        let config = ServerConfig {
            shared_secret: "hunter2".into(),
            ..ServerConfig::default()
        };
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let server = PulseServer::new(config, handle);
        let app = server.router();

        let body = json!({ "type": "config", "event": "status_update", "data": {} }).to_string();

        // No token.
        let req = Request::builder()
            .method("POST")
            .uri("/api/broadcast")
            .header("content-type", "application/json")
            .body(Body::from(body.clone()))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        // Wrong token.
        let req = Request::builder()
            .method("POST")
            .uri("/api/broadcast")
            .header("content-type", "application/json")
            .header("authorization", "Bearer wrong")
            .body(Body::from(body.clone()))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        // Correct token.
        let req = Request::builder()
            .method("POST")
            .uri("/api/broadcast")
            .header("content-type", "application/json")
            .header("authorization", "Bearer hunter2")
            .body(Body::from(body))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["queued"], true);
        assert_eq!(server.scheduler().queue_stats().length, 1);
    }

    #[tokio::test]
    async fn broadcast_disabled_without_configured_secret() {
        let server = make_server();
        let app = server.router();

        let req = Request::builder()
            .method("POST")
            .uri("/api/broadcast")
            .header("content-type", "application/json")
            .header("authorization", "Bearer ")
            .body(Body::from(
                json!({ "type": "config", "event": "status_update" }).to_string(),
            ))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn ws_endpoint_requires_upgrade() {
        let server = make_server();
        let app = server.router();

        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_ne!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server();
        let app = server.router();

        let req = Request::builder()
            .uri("/nonexistent")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn server_listen_binds_and_shuts_down() {
        let server = make_server();
        let (addr, handle) = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);

        server.shutdown().shutdown();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("shutdown timed out")
            .expect("join error");
    }
}
