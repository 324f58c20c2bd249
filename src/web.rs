use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::alerts::VolumeAlertRecord;
use crate::cache::CacheStats;
use crate::error::{Error, Result};
use crate::pipeline::{shutdown_signal, Pipeline};
use crate::registry::{ConnectionRegistry, RegistryStats, Transport};
use crate::resilience::BreakerState;
use crate::service::ServiceStatus;
use crate::types::{normalize_symbol, ClientMessage, ServerMessage, SubscriberId};

struct AppState {
    pipeline: Arc<Pipeline>,
}

/// Push transport over one websocket's write half.
struct WsTransport {
    subscriber_id: SubscriberId,
    sink: tokio::sync::Mutex<SplitSink<WebSocket, Message>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, payload: &str) -> Result<()> {
        self.sink
            .lock()
            .await
            .send(Message::Text(payload.to_string()))
            .await
            .map_err(|e| Error::Transport { subscriber_id: self.subscriber_id, reason: e.to_string() })
    }
}

pub fn router(pipeline: Arc<Pipeline>) -> Router {
    let state = Arc::new(AppState { pipeline });
    Router::new()
        .route("/ws/:subscriber_id", get(ws_handler))
        .route("/stats", get(stats))
        .route("/cache/stats", get(cache_stats))
        .route("/health", get(health))
        .route("/alerts", get(alerts))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until ctrl-c or until `duration` seconds elapse (0 = no limit),
/// then stop the polling loops.
pub async fn run(pipeline: Arc<Pipeline>, port: u16, duration: u64) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let sweeper = pipeline.start();
    let app = router(pipeline.clone());

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "push endpoint at ws://localhost:{port}/ws/<subscriber_id>");
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(duration)).await?;

    pipeline.service.shutdown().await;
    sweeper.abort();
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(subscriber_id): Path<SubscriberId>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, subscriber_id, state))
}

async fn handle_socket(socket: WebSocket, subscriber_id: SubscriberId, state: Arc<AppState>) {
    let registry = &state.pipeline.registry;
    let send_timeout = state.pipeline.config.service.push_send_timeout;
    let (sink, mut stream) = socket.split();
    let transport = Arc::new(WsTransport { subscriber_id, sink: tokio::sync::Mutex::new(sink) });

    let session = match registry.connect(subscriber_id, transport.clone()).await {
        Ok(session) => session,
        Err(err) => {
            warn!(subscriber_id, error = %err, "websocket handshake failed");
            return;
        }
    };

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!(subscriber_id, error = %err, "websocket read failed");
                break;
            }
        };

        let reply = handle_client_message(registry, subscriber_id, &text);
        let sent = match reply.to_json() {
            Ok(payload) => tokio::time::timeout(send_timeout, transport.send(&payload))
                .await
                .unwrap_or_else(|_| {
                    Err(Error::Transport { subscriber_id, reason: format!("reply timed out after {send_timeout:?}") })
                }),
            Err(err) => Err(err),
        };
        if let Err(err) = sent {
            debug!(subscriber_id, error = %err, "websocket reply failed");
            break;
        }
    }

    registry.disconnect_session(subscriber_id, session.session_id);
}

/// Apply one inbound client message and build its acknowledgement.
pub fn handle_client_message(registry: &ConnectionRegistry, subscriber_id: SubscriberId, raw: &str) -> ServerMessage {
    let message = match serde_json::from_str::<ClientMessage>(raw) {
        Ok(message) => message,
        Err(err) => return ServerMessage::Error { message: format!("invalid message: {err}") },
    };

    match message {
        ClientMessage::Subscribe { symbol } => {
            let symbol = normalize_symbol(&symbol);
            if symbol.is_empty() {
                return ServerMessage::Error { message: "symbol must not be empty".to_string() };
            }
            if registry.subscribe(subscriber_id, &symbol) {
                ServerMessage::Subscribed { message: format!("Subscribed to {symbol}"), symbol }
            } else {
                ServerMessage::Error { message: "no active session".to_string() }
            }
        }
        ClientMessage::Unsubscribe { symbol } => {
            let symbol = normalize_symbol(&symbol);
            if registry.unsubscribe(subscriber_id, &symbol) {
                ServerMessage::Unsubscribed { message: format!("Unsubscribed from {symbol}"), symbol }
            } else {
                ServerMessage::Error { message: "no active session".to_string() }
            }
        }
        ClientMessage::Ping => ServerMessage::Pong { message: "pong".to_string() },
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    total_connections: usize,
    total_subscriptions: usize,
    active_symbols: Vec<String>,
    service: ServiceStatus,
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let pipeline = &state.pipeline;
    let RegistryStats { total_connections, total_subscriptions, .. } = pipeline.registry.stats();
    Json(StatsResponse {
        total_connections,
        total_subscriptions,
        active_symbols: pipeline.registry.active_symbols(),
        service: pipeline.service.status(),
    })
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<CacheStats> {
    Json(state.pipeline.cache.stats())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    running: bool,
    breaker: BreakerState,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let breaker = state.pipeline.market.breaker_state();
    let status = match breaker {
        BreakerState::Closed => "ok",
        BreakerState::HalfOpen | BreakerState::Open => "degraded",
    };
    Json(HealthResponse { status, running: state.pipeline.service.is_running(), breaker })
}

#[derive(Deserialize)]
struct AlertsQuery {
    limit: Option<usize>,
}

async fn alerts(State(state): State<Arc<AppState>>, Query(query): Query<AlertsQuery>) -> Json<Vec<VolumeAlertRecord>> {
    let limit = query.limit.unwrap_or(50).min(200);
    Json(state.pipeline.alerts.lock().recent(limit))
}
