//! Stream lifecycle: start/stop commands, the per-stream extraction loop
//! with exponential backoff, and the frame sink that uploads and
//! publishes each extracted JPEG.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use common::models::{FrameTask, StreamCommand, StreamStatus, StreamType};
use common::queue::FramePublisher;
use common::storage::{ObjectStore, StreamStatusStore};
use telemetry::metrics::{ACTIVE_STREAMS, FRAMES_PROCESSED};

use crate::extractor::{ExtractError, FrameSink, StreamExtractor};
use crate::resolver::UrlResolver;

const MAX_RETRIES: u32 = 3;
const EXHAUSTED_MESSAGE: &str = "stream failed after retries";

struct ActiveStream {
    token: CancellationToken,
}

/// Owns the `stream-id -> extraction loop` registry. At most one
/// extractor is active per stream id.
pub struct StreamManager {
    publisher: Arc<dyn FramePublisher>,
    blobs: Arc<dyn ObjectStore>,
    statuses: Arc<dyn StreamStatusStore>,
    extractor: Arc<dyn StreamExtractor>,
    resolver: Arc<dyn UrlResolver>,
    frame_width: u32,
    default_fps: i32,
    streams: Arc<RwLock<HashMap<String, ActiveStream>>>,
}

impl StreamManager {
    pub fn new(
        publisher: Arc<dyn FramePublisher>,
        blobs: Arc<dyn ObjectStore>,
        statuses: Arc<dyn StreamStatusStore>,
        extractor: Arc<dyn StreamExtractor>,
        resolver: Arc<dyn UrlResolver>,
        frame_width: u32,
        default_fps: i32,
    ) -> Self {
        Self {
            publisher,
            blobs,
            statuses,
            extractor,
            resolver,
            frame_width,
            default_fps,
            streams: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn handle_command(&self, cmd: StreamCommand) -> Result<()> {
        match cmd.action.as_str() {
            "start" => self.start_stream(cmd).await,
            "stop" => self.stop_stream(&cmd.stream_id).await,
            other => bail!("unknown action: {other}"),
        }
    }

    async fn start_stream(&self, cmd: StreamCommand) -> Result<()> {
        {
            let streams = self.streams.read().await;
            if streams.contains_key(&cmd.stream_id) {
                bail!("stream {} already running", cmd.stream_id);
            }
        }

        let stream_uuid = Uuid::parse_str(&cmd.stream_id).context("parse stream id")?;
        let youtube = cmd.stream_type == Some(StreamType::Youtube);

        let mut url = cmd.url.clone();
        if youtube {
            url = match self.resolver.resolve(&cmd.url).await {
                Ok(resolved) => resolved,
                Err(e) => {
                    self.set_status(stream_uuid, StreamStatus::Error, &e.to_string())
                        .await;
                    return Err(e.context("resolve youtube url"));
                }
            };
            info!(stream_id = %cmd.stream_id, "resolved youtube url");
        }

        let fps = if cmd.fps <= 0 { self.default_fps } else { cmd.fps };
        let token = CancellationToken::new();

        {
            let mut streams = self.streams.write().await;
            if streams.contains_key(&cmd.stream_id) {
                bail!("stream {} already running", cmd.stream_id);
            }
            streams.insert(
                cmd.stream_id.clone(),
                ActiveStream {
                    token: token.clone(),
                },
            );
        }

        ACTIVE_STREAMS.inc();
        self.set_status(stream_uuid, StreamStatus::Running, "").await;
        info!(stream_id = %cmd.stream_id, url = %cmd.url, fps, "starting stream ingestion");

        let job = ExtractionJob {
            stream_id: cmd.stream_id.clone(),
            stream_uuid,
            source_url: cmd.url,
            resolved_url: url,
            youtube,
            fps,
            width: self.frame_width,
            collection_id: cmd.collection_id,
        };

        let extractor = Arc::clone(&self.extractor);
        let resolver = Arc::clone(&self.resolver);
        let publisher = Arc::clone(&self.publisher);
        let blobs = Arc::clone(&self.blobs);
        let statuses = Arc::clone(&self.statuses);
        let streams = Arc::clone(&self.streams);
        let stream_id = cmd.stream_id;

        tokio::spawn(async move {
            run_extraction_loop(token, job, extractor, resolver, publisher, blobs, statuses).await;
            streams.write().await.remove(&stream_id);
            ACTIVE_STREAMS.dec();
            info!(stream_id = %stream_id, "stream ingestion stopped");
        });

        Ok(())
    }

    /// Idempotent: stopping an unknown or already-stopping stream is Ok.
    /// Cleanup (registry removal, final status) is left to the
    /// extraction loop's exit path.
    pub async fn stop_stream(&self, stream_id: &str) -> Result<()> {
        let streams = self.streams.read().await;
        if let Some(active) = streams.get(stream_id) {
            active.token.cancel();
            info!(stream_id = %stream_id, "stop signalled");
        }
        Ok(())
    }

    pub async fn stop_all(&self) {
        let streams = self.streams.read().await;
        for active in streams.values() {
            active.token.cancel();
        }
    }

    pub async fn active_count(&self) -> usize {
        self.streams.read().await.len()
    }

    async fn set_status(&self, id: Uuid, status: StreamStatus, message: &str) {
        update_status(self.statuses.as_ref(), id, status, message).await;
    }
}

struct ExtractionJob {
    stream_id: String,
    stream_uuid: Uuid,
    /// URL as configured (the page URL for indirect streams).
    source_url: String,
    /// URL handed to ffmpeg (resolved for indirect streams).
    resolved_url: String,
    youtube: bool,
    fps: i32,
    width: u32,
    collection_id: Option<Uuid>,
}

/// Runs up to MAX_RETRIES+1 extraction attempts with 2s/4s/8s backoff.
/// Indirect URLs are re-resolved before each retry (they expire).
async fn run_extraction_loop(
    token: CancellationToken,
    mut job: ExtractionJob,
    extractor: Arc<dyn StreamExtractor>,
    resolver: Arc<dyn UrlResolver>,
    publisher: Arc<dyn FramePublisher>,
    blobs: Arc<dyn ObjectStore>,
    statuses: Arc<dyn StreamStatusStore>,
) {
    let sink = IngestSink {
        publisher,
        blobs,
        stream_id: job.stream_id.clone(),
        stream_uuid: job.stream_uuid,
        width: job.width,
        collection_id: job.collection_id,
    };

    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << attempt);
            warn!(
                stream_id = %job.stream_id,
                attempt,
                delay_secs = delay.as_secs(),
                "retrying stream extraction"
            );
            tokio::select! {
                _ = token.cancelled() => {
                    update_status(statuses.as_ref(), job.stream_uuid, StreamStatus::Stopped, "").await;
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            if job.youtube {
                match resolver.resolve(&job.source_url).await {
                    Ok(resolved) => job.resolved_url = resolved,
                    Err(e) => {
                        warn!(stream_id = %job.stream_id, error = %e, "youtube re-resolve failed");
                        continue;
                    }
                }
            }
        }

        match extractor
            .run(token.clone(), &job.resolved_url, job.fps, job.width, &sink)
            .await
        {
            Ok(()) | Err(ExtractError::Cancelled) => {
                // clean EOF or operator stop
                update_status(statuses.as_ref(), job.stream_uuid, StreamStatus::Stopped, "").await;
                return;
            }
            Err(e) => {
                if token.is_cancelled() {
                    update_status(statuses.as_ref(), job.stream_uuid, StreamStatus::Stopped, "")
                        .await;
                    return;
                }
                error!(stream_id = %job.stream_id, attempt, error = %e, "stream extraction failed");
            }
        }
    }

    update_status(
        statuses.as_ref(),
        job.stream_uuid,
        StreamStatus::Error,
        EXHAUSTED_MESSAGE,
    )
    .await;
}

async fn update_status(
    statuses: &dyn StreamStatusStore,
    id: Uuid,
    status: StreamStatus,
    message: &str,
) {
    if let Err(e) = statuses.update_stream_status(id, status, message).await {
        error!(stream_id = %id, error = %e, "update stream status");
    }
}

/// Per-frame callback: upload the JPEG, publish the frame task.
struct IngestSink {
    publisher: Arc<dyn FramePublisher>,
    blobs: Arc<dyn ObjectStore>,
    stream_id: String,
    stream_uuid: Uuid,
    width: u32,
    collection_id: Option<Uuid>,
}

#[async_trait]
impl FrameSink for IngestSink {
    async fn on_frame(&self, frame: Vec<u8>) -> Result<()> {
        let frame_id = Uuid::new_v4();
        let key = format!("frames/{}/{}.jpg", self.stream_id, frame_id);

        self.blobs
            .put_object(&key, frame, "image/jpeg")
            .await
            .context("upload frame")?;

        let task = FrameTask {
            stream_id: self.stream_uuid,
            frame_id,
            timestamp: Utc::now(),
            frame_ref: key,
            width: self.width,
            height: 0,
            collection_id: self.collection_id,
        };
        self.publisher
            .publish_frame(&self.stream_id, &task)
            .await
            .context("publish frame task")?;

        FRAMES_PROCESSED.with_label_values(&[&self.stream_id]).inc();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    struct NullPublisher;

    #[async_trait]
    impl FramePublisher for NullPublisher {
        async fn publish_frame(&self, _stream_id: &str, _task: &FrameTask) -> Result<()> {
            Ok(())
        }
    }

    struct NullBlobs;

    #[async_trait]
    impl ObjectStore for NullBlobs {
        async fn put_object(&self, _key: &str, _data: Vec<u8>, _ct: &str) -> Result<()> {
            Ok(())
        }
        async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
            bail!("no object {key}")
        }
        async fn delete_objects(&self, _keys: &[String]) -> Result<()> {
            Ok(())
        }
        async fn list_objects(&self, _prefix: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingStatuses {
        updates: StdMutex<Vec<(Uuid, StreamStatus, String)>>,
    }

    impl RecordingStatuses {
        fn last(&self) -> Option<(Uuid, StreamStatus, String)> {
            self.updates.lock().unwrap().last().cloned()
        }
    }

    #[async_trait]
    impl StreamStatusStore for RecordingStatuses {
        async fn update_stream_status(
            &self,
            id: Uuid,
            status: StreamStatus,
            error_message: &str,
        ) -> Result<()> {
            self.updates
                .lock()
                .unwrap()
                .push((id, status, error_message.to_string()));
            Ok(())
        }
    }

    /// Fails every attempt immediately, counting invocations.
    #[derive(Default)]
    struct FailingExtractor {
        calls: AtomicU32,
    }

    #[async_trait]
    impl StreamExtractor for FailingExtractor {
        async fn run(
            &self,
            _token: CancellationToken,
            _url: &str,
            _fps: i32,
            _width: u32,
            _sink: &dyn FrameSink,
        ) -> Result<(), ExtractError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ExtractError::NoFrames(5.0))
        }
    }

    /// Blocks until cancelled, like a healthy long-lived stream.
    struct BlockingExtractor;

    #[async_trait]
    impl StreamExtractor for BlockingExtractor {
        async fn run(
            &self,
            token: CancellationToken,
            _url: &str,
            _fps: i32,
            _width: u32,
            _sink: &dyn FrameSink,
        ) -> Result<(), ExtractError> {
            token.cancelled().await;
            Err(ExtractError::Cancelled)
        }
    }

    struct StaticResolver;

    #[async_trait]
    impl UrlResolver for StaticResolver {
        async fn resolve(&self, _url: &str) -> Result<String> {
            Ok("https://resolved.example/stream".to_string())
        }
    }

    struct FailingResolver;

    #[async_trait]
    impl UrlResolver for FailingResolver {
        async fn resolve(&self, _url: &str) -> Result<String> {
            bail!("yt-dlp failed: unavailable")
        }
    }

    fn manager_with(
        extractor: Arc<dyn StreamExtractor>,
        resolver: Arc<dyn UrlResolver>,
        statuses: Arc<RecordingStatuses>,
    ) -> StreamManager {
        StreamManager::new(
            Arc::new(NullPublisher),
            Arc::new(NullBlobs),
            statuses,
            extractor,
            resolver,
            640,
            5,
        )
    }

    fn start_cmd(stream_id: Uuid) -> StreamCommand {
        StreamCommand {
            action: "start".to_string(),
            stream_id: stream_id.to_string(),
            url: "rtsp://cam/live".to_string(),
            stream_type: Some(StreamType::Rtsp),
            mode: None,
            fps: 5,
            collection_id: None,
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("condition not reached");
    }

    /// The extraction loop writes its final status just before the
    /// registry entry is removed; give the wrapper task time to finish.
    async fn wait_until_idle(manager: &StreamManager) {
        for _ in 0..200 {
            if manager.active_count().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("manager never went idle");
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_start_is_rejected() {
        let statuses = Arc::new(RecordingStatuses::default());
        let manager = manager_with(
            Arc::new(BlockingExtractor),
            Arc::new(StaticResolver),
            statuses,
        );
        let id = Uuid::new_v4();

        manager.handle_command(start_cmd(id)).await.unwrap();
        let err = manager.handle_command(start_cmd(id)).await.unwrap_err();
        assert!(err.to_string().contains("already running"));
        assert_eq!(manager.active_count().await, 1);

        manager.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent() {
        let statuses = Arc::new(RecordingStatuses::default());
        let manager = manager_with(
            Arc::new(BlockingExtractor),
            Arc::new(StaticResolver),
            Arc::clone(&statuses),
        );
        let id = Uuid::new_v4();

        // stopping a never-started stream is fine
        manager.stop_stream(&id.to_string()).await.unwrap();

        manager.handle_command(start_cmd(id)).await.unwrap();
        manager.stop_stream(&id.to_string()).await.unwrap();
        manager.stop_stream(&id.to_string()).await.unwrap();

        let statuses_for_wait = Arc::clone(&statuses);
        wait_for(move || {
            matches!(
                statuses_for_wait.last(),
                Some((_, StreamStatus::Stopped, _))
            )
        })
        .await;
        wait_until_idle(&manager).await;
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exhaust_into_error_status() {
        let statuses = Arc::new(RecordingStatuses::default());
        let extractor = Arc::new(FailingExtractor::default());
        let manager = manager_with(
            Arc::clone(&extractor) as Arc<dyn StreamExtractor>,
            Arc::new(StaticResolver),
            Arc::clone(&statuses),
        );
        let id = Uuid::new_v4();

        let started = tokio::time::Instant::now();
        manager.handle_command(start_cmd(id)).await.unwrap();

        let statuses_for_wait = Arc::clone(&statuses);
        wait_for(move || matches!(statuses_for_wait.last(), Some((_, StreamStatus::Error, _))))
            .await;

        // initial attempt + 3 retries, backoff 2s + 4s + 8s
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 4);
        assert!(started.elapsed() >= Duration::from_secs(14));
        let (sid, status, message) = statuses.last().unwrap();
        assert_eq!(sid, id);
        assert_eq!(status, StreamStatus::Error);
        assert_eq!(message, EXHAUSTED_MESSAGE);
        wait_until_idle(&manager).await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_reports_stopped() {
        let statuses = Arc::new(RecordingStatuses::default());
        let extractor = Arc::new(FailingExtractor::default());
        let manager = manager_with(
            Arc::clone(&extractor) as Arc<dyn StreamExtractor>,
            Arc::new(StaticResolver),
            Arc::clone(&statuses),
        );
        let id = Uuid::new_v4();

        manager.handle_command(start_cmd(id)).await.unwrap();

        // let the first attempt fail and the loop enter backoff
        let extractor_for_wait = Arc::clone(&extractor);
        wait_for(move || extractor_for_wait.calls.load(Ordering::SeqCst) >= 1).await;
        manager.stop_stream(&id.to_string()).await.unwrap();

        let statuses_for_wait = Arc::clone(&statuses);
        wait_for(move || {
            matches!(
                statuses_for_wait.last(),
                Some((_, StreamStatus::Stopped, _))
            )
        })
        .await;
        wait_until_idle(&manager).await;
    }

    #[tokio::test]
    async fn youtube_resolve_failure_fails_start() {
        let statuses = Arc::new(RecordingStatuses::default());
        let manager = manager_with(
            Arc::new(BlockingExtractor),
            Arc::new(FailingResolver),
            Arc::clone(&statuses),
        );
        let id = Uuid::new_v4();

        let mut cmd = start_cmd(id);
        cmd.stream_type = Some(StreamType::Youtube);
        cmd.url = "https://youtube.example/watch?v=abc".to_string();

        let err = manager.handle_command(cmd).await.unwrap_err();
        assert!(err.to_string().contains("resolve youtube url"));
        assert_eq!(manager.active_count().await, 0);
        let (_, status, message) = statuses.last().unwrap();
        assert_eq!(status, StreamStatus::Error);
        assert!(message.contains("yt-dlp failed"));
    }
}
