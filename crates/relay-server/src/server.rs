//! Axum router, WebSocket accept path and server lifecycle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use relay_core::analysis::Summarizer;
use relay_core::messages::RelayMessage;

use crate::api;
use crate::auth::{self, BearerAuth};
use crate::cache::DataCaches;
use crate::client::{self, ClientRegistry, InboundFrame};
use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::pending::PendingRequests;
use crate::relay::Relay;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub clients: Arc<ClientRegistry>,
    pub pending: Arc<PendingRequests>,
    pub caches: Arc<DataCaches>,
    pub auth: Arc<BearerAuth>,
    /// Feeds the single dispatcher task.
    pub inbound_tx: mpsc::Sender<InboundFrame>,
    pub heartbeat_interval: Duration,
    pub started_at: Instant,
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Build the shared state. The returned receiver is the dispatcher's end
    /// of the inbound channel.
    pub fn new(config: &ServerConfig) -> (Self, mpsc::Receiver<InboundFrame>) {
        let clients = Arc::new(ClientRegistry::new(
            config.max_send_queue,
            config.client_timeout(),
        ));
        let pending = Arc::new(PendingRequests::new());
        let relay = Arc::new(Relay::new(
            Arc::clone(&clients),
            Arc::clone(&pending),
            config.request_timeout(),
        ));
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue.max(1));

        let state = Self {
            relay,
            clients,
            pending,
            caches: Arc::new(DataCaches::new()),
            auth: Arc::new(BearerAuth::new(config.auth_token.clone())),
            inbound_tx,
            heartbeat_interval: config.heartbeat_interval(),
            started_at: Instant::now(),
            shutdown: CancellationToken::new(),
        };
        (state, inbound_rx)
    }

    pub fn dispatcher(&self, summarizer: Option<Arc<dyn Summarizer>>) -> Dispatcher {
        Dispatcher::new(
            Arc::clone(&self.clients),
            Arc::clone(&self.pending),
            Arc::clone(&self.caches),
            summarizer,
        )
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let commands = Router::new()
        .route("/create", post(api::create))
        .route("/selection", get(api::latest_selection))
        .route("/variables", get(api::latest_variables))
        .route("/cache", get(api::cache_dump))
        .route("/selection/request", post(api::request_selection))
        .route("/nodes/update", post(api::update_node))
        .route("/nodes/replace-child", post(api::replace_child))
        .route("/nodes/insert-child", post(api::insert_child))
        .route("/nodes/delete", post(api::delete_node))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.auth),
            auth::require_bearer,
        ));

    Router::new()
        .route("/health", get(api::health))
        .route("/ws", get(ws_handler))
        .merge(commands)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind, spawn the dispatcher and cleanup tasks, and start serving.
pub async fn start(
    config: ServerConfig,
    summarizer: Option<Arc<dyn Summarizer>>,
) -> Result<ServerHandle, std::io::Error> {
    let (state, inbound_rx) = AppState::new(&config);

    if !state.auth.is_enabled() {
        warn!("no auth token configured, command routes are unauthenticated");
    }
    if summarizer.is_none() {
        info!("no summarizer configured, analyze requests will be refused");
    }

    let dispatcher = Arc::new(state.dispatcher(summarizer));
    let dispatch_task = tokio::spawn(dispatcher.run(inbound_rx));
    let cleanup_task =
        client::start_cleanup_task(Arc::clone(&state.clients), config.cleanup_interval());

    let router = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let local_addr = listener.local_addr()?;

    info!(
        addr = %local_addr,
        request_timeout_ms = config.request_timeout_ms,
        "relay server started"
    );

    let token = state.shutdown.clone();
    let server_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
        {
            warn!(error = %e, "server error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        state,
        server_task,
        dispatch_task,
        cleanup_task,
    })
}

/// Handle returned by [`start`]; owns the background tasks.
pub struct ServerHandle {
    pub port: u16,
    state: AppState,
    server_task: JoinHandle<()>,
    dispatch_task: JoinHandle<()>,
    cleanup_task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.state.clients
    }

    pub fn pending(&self) -> &Arc<PendingRequests> {
        &self.state.pending
    }

    pub fn caches(&self) -> &Arc<DataCaches> {
        &self.state.caches
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// Stop accepting, close every socket, and wait for the HTTP server to
    /// drain (bounded).
    pub async fn shutdown(self) {
        self.state.shutdown.cancel();
        info!(
            open_connections = self.state.clients.open_count(),
            pending_requests = self.state.pending.len(),
            "shutting down"
        );
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.server_task)
            .await
            .is_err()
        {
            warn!("shutdown timed out after {SHUTDOWN_TIMEOUT:?}");
        }
        self.cleanup_task.abort();
        self.dispatch_task.abort();
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Own one plugin connection from accept to disconnect cleanup.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (client_id, rx) = state.clients.register();
    info!(client_id = %client_id, "plugin connected");

    // Queued before the writer starts, so it is always the first frame.
    let mut ack = RelayMessage::connected(&client_id);
    ack.stamp();
    if let Err(e) = state.clients.send_message(&client_id, &ack) {
        warn!(client_id = %client_id, error = %e, "failed to encode connected ack");
    }

    tokio::select! {
        () = client::handle_ws_connection(
            socket,
            client_id.clone(),
            rx,
            Arc::clone(&state.clients),
            state.inbound_tx.clone(),
            state.heartbeat_interval,
        ) => {}
        () = state.shutdown.cancelled() => {}
    }

    let _ = state.clients.unregister(&client_id);
    state.caches.evict_client(&client_id);
    info!(
        client_id = %client_id,
        open_connections = state.clients.open_count(),
        "plugin disconnected"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use relay_core::RequestId;
    use secrecy::SecretString;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn state_with(config: ServerConfig) -> AppState {
        AppState::new(&config).0
    }

    fn state() -> AppState {
        state_with(ServerConfig::default())
    }

    fn open_client(state: &AppState) -> mpsc::Receiver<Arc<str>> {
        let (id, rx) = state.clients.register();
        state.clients.mark_open(&id);
        rx
    }

    async fn call(state: &AppState, req: Request<Body>) -> (StatusCode, Value) {
        let resp = build_router(state.clone()).oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 1 << 20)
            .await
            .unwrap();
        let parsed = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, parsed)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_reports_counts() {
        let state = state();
        let _rx = open_client(&state);
        let (_id, _rx2) = state.clients.register();

        let (status, body) = call(&state, get_req("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 2);
        assert_eq!(body["openConnections"], 1);
        assert_eq!(body["pendingRequests"], 0);
        assert_eq!(body["droppedFrames"], 0);
        assert!(body["uptimeSecs"].is_number());
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let (status, _) = call(&state(), get_req("/nonexistent")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn token_guards_commands_but_not_health() {
        let state = state_with(ServerConfig {
            auth_token: Some(SecretString::from("tok".to_string())),
            ..Default::default()
        });

        let (status, body) = call(&state, get_req("/selection")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "UNAUTHORIZED");

        let authed = Request::builder()
            .uri("/selection")
            .header(header::AUTHORIZATION, "Bearer tok")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(&state, authed).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NO_DATA");

        let (status, _) = call(&state, get_req("/health")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn create_without_clients_reports_zero() {
        let state = state();
        let (status, body) = call(&state, post_json("/create", json!({"spec": {"type": "FRAME"}}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["sentTo"], 0);
    }

    #[tokio::test]
    async fn create_requires_spec() {
        let (status, body) = call(&state(), post_json("/create", json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_PARAMS");
    }

    #[tokio::test]
    async fn create_fans_out_spec() {
        let state = state();
        let mut rx = open_client(&state);
        let (status, body) = call(&state, post_json("/create", json!({"spec": {"type": "TEXT"}}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sentTo"], 1);
        let frame: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame["kind"], "create");
        assert_eq!(frame["spec"]["type"], "TEXT");
    }

    #[tokio::test]
    async fn create_keeps_caller_timestamp() {
        let state = state();
        let mut rx = open_client(&state);
        let body = json!({"spec": {"type": "TEXT"}, "timestamp": 1_700_000_000_000_i64});
        let (status, _) = call(&state, post_json("/create", body)).await;
        assert_eq!(status, StatusCode::OK);
        let frame: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame["timestamp"], 1_700_000_000_000_i64);
    }

    #[tokio::test]
    async fn missing_fields_are_400_before_relaying() {
        let state = state();
        let mut rx = open_client(&state);
        let cases = [
            ("/nodes/update", json!({"properties": {}})),
            ("/nodes/update", json!({"targetId": "1:1"})),
            ("/nodes/replace-child", json!({"parentId": "1:1", "spec": {}})),
            ("/nodes/insert-child", json!({"spec": {}})),
            ("/nodes/insert-child", json!({"parentId": "1:1", "spec": {}, "index": -1})),
            ("/nodes/delete", json!({})),
        ];
        for (uri, body) in cases {
            let (status, resp) = call(&state, post_json(uri, body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(resp["error"]["code"], "INVALID_PARAMS");
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn awaiting_route_without_clients_is_503() {
        let state = state();
        let (status, body) = call(&state, post_json("/nodes/delete", json!({"targetId": "1:1"}))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["code"], "NO_CLIENTS");
        assert_eq!(body["error"]["retryable"], true);
        assert!(state.pending.is_empty());
    }

    #[tokio::test]
    async fn awaiting_route_returns_reply() {
        let state = state();
        let mut rx = open_client(&state);
        let task_state = state.clone();
        let request = tokio::spawn(async move {
            call(
                &task_state,
                post_json(
                    "/nodes/update",
                    json!({"targetId": "1:1", "properties": {"name": "Title"}}),
                ),
            )
            .await
        });

        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["kind"], "update-node");
        assert_eq!(frame["properties"]["name"], "Title");
        let id = RequestId::from_raw(frame["requestId"].as_str().unwrap());
        state.pending.resolve(&id, json!({"success": true, "nodeId": "1:1"}));

        let (status, body) = request.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["result"]["nodeId"], "1:1");
    }

    #[tokio::test]
    async fn timeout_override_maps_to_504() {
        let state = state();
        let mut rx = open_client(&state);
        let (status, body) = call(
            &state,
            post_json("/selection/request", json!({"timeoutMs": 20})),
        )
        .await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["error"]["code"], "TIMEOUT");

        let frame: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame["kind"], "get-selection");
        assert!(frame.get("timeoutMs").is_none());
    }

    #[tokio::test]
    async fn remote_rejection_maps_to_502() {
        let state = state();
        let mut rx = open_client(&state);
        let task_state = state.clone();
        let request = tokio::spawn(async move {
            call(
                &task_state,
                post_json("/nodes/insert-child", json!({"parentId": "1:1", "spec": {}, "index": 0})),
            )
            .await
        });

        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        let id = RequestId::from_raw(frame["requestId"].as_str().unwrap());
        state
            .pending
            .reject(&id, relay_core::RelayError::Rejected("parent is not a frame".into()));

        let (status, body) = request.await.unwrap();
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"]["code"], "REMOTE_REJECTED");
        assert_eq!(body["error"]["message"], "parent is not a frame");
        assert_eq!(body["error"]["retryable"], false);
    }

    #[tokio::test]
    async fn cached_selection_is_served() {
        let state = state();
        let (id, _rx) = state.clients.register();
        state.caches.selection.store(&id, json!([{"id": "2:3"}]), 1);

        let (status, body) = call(&state, get_req("/selection")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["clientId"], id.as_str());
        assert_eq!(body["result"]["count"], 1);

        let (status, body) = call(&state, get_req("/cache")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["selection"].as_array().unwrap().len(), 1);
        assert!(body["variables"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn variables_empty_is_404() {
        let (status, body) = call(&state(), get_req("/variables")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NO_DATA");
    }

    #[tokio::test]
    async fn start_binds_ephemeral_port_and_shuts_down() {
        let handle = start(
            ServerConfig {
                port: 0,
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let token = handle.shutdown_token();
        handle.shutdown().await;
        assert!(token.is_cancelled());
    }
}
