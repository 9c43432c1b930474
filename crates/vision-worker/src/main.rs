mod attributes;
mod detector;
mod embedder;
mod imaging;
mod onnx;
mod pipeline;
mod tracker;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{routing::get, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use common::config::Config;
use common::models::FrameTask;
use common::queue::{
    consumer::Consumer, producer::Producer, Disposition, EventPublisher, MessageHandler,
};
use common::storage::{blob::BlobStore, postgres::PostgresStore, FaceIndex, ObjectStore};
use telemetry::metrics::QUEUE_DEPTH;

use crate::pipeline::Pipeline;

const OPS_ADDR: &str = "0.0.0.0:8082";
const CONSUMER_NAME: &str = "vision-workers";
const QUEUE_DEPTH_INTERVAL: Duration = Duration::from_secs(10);

struct FrameHandler {
    pipeline: Arc<Pipeline>,
}

#[async_trait]
impl MessageHandler for FrameHandler {
    async fn handle(&self, payload: &[u8]) -> Disposition {
        let task: FrameTask = match serde_json::from_slice(payload) {
            Ok(task) => task,
            Err(e) => {
                // a malformed payload never becomes valid; drop it
                error!(error = %e, "unmarshal frame task");
                return Disposition::Ack;
            }
        };

        match self.pipeline.process_frame(&task).await {
            Ok(()) => Disposition::Ack,
            Err(e) => {
                error!(frame_id = %task.frame_id, stream_id = %task.stream_id, error = %e, "process frame");
                Disposition::Retry
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::load(&Config::path_from_args())?;
    telemetry::logging::init(&cfg.logging.level, &cfg.logging.format);

    info!(
        workers = cfg.vision.worker_count,
        cpu_cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        "starting facewatch vision worker"
    );

    // Process-wide ONNX Runtime environment; sessions must not outlive it.
    ort::init()
        .with_name("facewatch-worker")
        .commit()
        .context("init onnx runtime")?;

    let db = Arc::new(PostgresStore::connect(&cfg.database).await?);
    let blobs = Arc::new(BlobStore::connect(&cfg.blob).await?);

    let producer = Arc::new(Producer::connect(&cfg.nats.url).await?);
    if let Err(e) = producer.ensure_streams().await {
        warn!(error = %e, "ensure jetstream streams");
    }

    let pipeline = Arc::new(Pipeline::new(
        cfg.vision.clone(),
        cfg.tracking.clone(),
        Arc::clone(&db) as Arc<dyn FaceIndex>,
        Arc::clone(&blobs) as Arc<dyn ObjectStore>,
        Arc::clone(&producer) as Arc<dyn EventPublisher>,
    )?);

    let consumer = Consumer::connect(&cfg.nats.url).await?;
    let token = CancellationToken::new();

    consumer
        .consume_frames(
            token.clone(),
            CONSUMER_NAME,
            cfg.vision.worker_count,
            Arc::new(FrameHandler {
                pipeline: Arc::clone(&pipeline),
            }),
        )
        .await
        .context("start frame consumer")?;

    // Periodic queue-depth gauge.
    {
        let producer = Arc::clone(&producer);
        let token = token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(QUEUE_DEPTH_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                if let Ok(depth) = producer.queue_depth().await {
                    QUEUE_DEPTH.set(depth as i64);
                }
            }
        });
    }

    tokio::spawn(serve_ops());

    shutdown_signal().await;

    info!("shutting down vision worker");
    token.cancel();
    // in-flight handlers finish their current frame
    tokio::time::sleep(Duration::from_secs(2)).await;
    info!("vision worker stopped");
    Ok(())
}

async fn serve_ops() {
    let app = Router::new()
        .route("/metrics", get(|| async { telemetry::metrics::render() }))
        .route("/healthz", get(|| async { r#"{"status":"ok"}"# }));

    match TcpListener::bind(OPS_ADDR).await {
        Ok(listener) => {
            info!(addr = OPS_ADDR, "worker metrics listening");
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
