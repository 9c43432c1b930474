mod distributor;
mod hub;

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use common::config::Config;
use common::queue::{consumer::Consumer, producer::Producer};
use common::storage::{postgres::PostgresStore, EventStore};

use crate::distributor::EventDistributor;
use crate::hub::HubHandle;

const CONSUMER_NAME: &str = "api-events";
const READINESS_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone)]
struct AppState {
    db: Arc<PostgresStore>,
    consumer: Consumer,
    hub: HubHandle,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::load(&Config::path_from_args())?;
    telemetry::logging::init(&cfg.logging.level, &cfg.logging.format);

    info!(port = cfg.server.port, "starting facewatch event distributor");

    let db = Arc::new(PostgresStore::connect(&cfg.database).await?);
    db.run_migrations().await?;

    // The producer half only ensures the streams exist before the
    // durable consumer binds to them.
    let producer = Producer::connect(&cfg.nats.url).await?;
    if let Err(e) = producer.ensure_streams().await {
        warn!(error = %e, "ensure jetstream streams");
    }

    let (hub, handle) = hub::hub();
    tokio::spawn(hub.run());

    let consumer = Consumer::connect(&cfg.nats.url).await?;
    let token = CancellationToken::new();

    if let Err(e) = consumer
        .consume_events(
            token.clone(),
            CONSUMER_NAME,
            Arc::new(EventDistributor::new(
                Arc::clone(&db) as Arc<dyn EventStore>,
                handle.clone(),
            )),
        )
        .await
    {
        warn!(error = %e, "start event consumer");
    }

    let state = AppState {
        db,
        consumer,
        hub: handle,
    };

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(|| async { r#"{"status":"ok"}"# }))
        .route("/readyz", get(readyz))
        .route("/metrics", get(|| async { telemetry::metrics::render() }))
        .with_state(state);

    let listener = TcpListener::bind(("0.0.0.0", cfg.server.port)).await?;
    info!(port = cfg.server.port, "event distributor listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down event distributor");
    token.cancel();
    // let the in-flight event batch ack or nak
    tokio::time::sleep(Duration::from_secs(1)).await;
    info!("event distributor stopped");
    Ok(())
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    stream_id: Option<Uuid>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub, query.stream_id))
}

async fn handle_socket(socket: WebSocket, hub: HubHandle, filter: Option<Uuid>) {
    let (mut sender, mut receiver) = socket.split();
    let (client_id, mut rx) = hub.join(filter).await;

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if sender.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
    });

    // the read side exists to detect disconnection
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    hub.leave(client_id).await;
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let database = tokio::time::timeout(READINESS_TIMEOUT, state.db.ping())
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false);
    let nats = state.consumer.is_connected();

    let status = if database && nats {
        StatusCode::OK
    } else {
        error!(database, nats, "readiness check failed");
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(serde_json::json!({ "database": database, "nats": nats })),
    )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C signal"),
        _ = terminate => info!("received terminate signal"),
    }
}
