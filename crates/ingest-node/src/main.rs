mod cleanup;
mod extractor;
mod manager;
mod resolver;

use anyhow::Result;
use axum::{routing::get, Router};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use common::config::Config;
use common::models::StreamCommand;
use common::queue::{producer::Producer, FramePublisher};
use common::storage::{blob::BlobStore, postgres::PostgresStore, ObjectStore, StreamStatusStore};

use crate::extractor::FfmpegExtractor;
use crate::manager::StreamManager;
use crate::resolver::YtDlpResolver;

const OPS_ADDR: &str = "0.0.0.0:8081";

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::load(&Config::path_from_args())?;
    telemetry::logging::init(&cfg.logging.level, &cfg.logging.format);

    info!("starting facewatch ingest node");

    let db = Arc::new(PostgresStore::connect(&cfg.database).await?);
    let blobs = Arc::new(BlobStore::connect(&cfg.blob).await?);
    blobs.ensure_bucket().await;

    let producer = Arc::new(Producer::connect(&cfg.nats.url).await?);
    if let Err(e) = producer.ensure_streams().await {
        warn!(error = %e, "ensure jetstream streams");
    }

    let manager = Arc::new(StreamManager::new(
        Arc::clone(&producer) as Arc<dyn FramePublisher>,
        Arc::clone(&blobs) as Arc<dyn ObjectStore>,
        Arc::clone(&db) as Arc<dyn StreamStatusStore>,
        Arc::new(FfmpegExtractor::new()),
        Arc::new(YtDlpResolver),
        cfg.vision.frame_width,
        cfg.vision.default_fps as i32,
    ));

    let token = CancellationToken::new();

    // Control commands arrive on the raw (non-JetStream) subject.
    let mut control = producer.subscribe_control().await?;
    {
        let manager = Arc::clone(&manager);
        let token = token.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = token.cancelled() => break,
                    msg = control.next() => msg,
                };
                let Some(msg) = msg else { break };

                let cmd = match StreamCommand::parse(&msg.payload) {
                    Ok(cmd) => cmd,
                    Err(e) => {
                        error!(error = %e, "parse control command");
                        continue;
                    }
                };
                info!(action = %cmd.action, stream_id = %cmd.stream_id, "received command");
                let action = cmd.action.clone();
                let stream_id = cmd.stream_id.clone();
                if let Err(e) = manager.handle_command(cmd).await {
                    error!(action = %action, stream_id = %stream_id, error = %e, "handle command");
                }
            }
        });
    }

    if cfg.storage.frame_retention > 0 {
        info!(retention = cfg.storage.frame_retention, "frame cleanup enabled");
        tokio::spawn(cleanup::run_cleanup_loop(
            token.clone(),
            Arc::clone(&db),
            Arc::clone(&blobs) as Arc<dyn ObjectStore>,
            cfg.storage.frame_retention,
        ));
    }

    tokio::spawn(serve_ops());

    shutdown_signal().await;

    info!("shutting down ingest node");
    token.cancel();
    manager.stop_all().await;

    // give extraction loops time to kill their subprocesses and report
    tokio::time::sleep(Duration::from_secs(2)).await;
    info!("ingest node stopped");
    Ok(())
}

async fn serve_ops() {
    let app = Router::new()
        .route("/metrics", get(|| async { telemetry::metrics::render() }))
        .route("/healthz", get(|| async { r#"{"status":"ok"}"# }));

    match TcpListener::bind(OPS_ADDR).await {
        Ok(listener) => {
            info!(addr = OPS_ADDR, "ingest metrics listening");
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "metrics server error");
            }
        }
        Err(e) => error!(addr = OPS_ADDR, error = %e, "bind metrics server"),
    }
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
