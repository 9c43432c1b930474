//! Orchestrates the full vision pass over one frame task:
//! detect -> track -> embed -> attributes -> match -> emit event.

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use common::config::{TrackingConfig, VisionConfig};
use common::models::{DetectionEvent, FrameTask};
use common::queue::EventPublisher;
use common::storage::{FaceIndex, ObjectStore};
use telemetry::metrics::{FACES_DETECTED, FACES_RECOGNIZED, INFERENCE_DURATION};

use crate::attributes::AttributePredictor;
use crate::detector::Detector;
use crate::embedder::Embedder;
use crate::imaging::{self, ATTR_NORM, DETECT_NORM, EMBED_NORM};
use crate::tracker::Tracker;

const SNAPSHOT_MIN_SIDE: u32 = 100;
const SNAPSHOT_JPEG_QUALITY: u8 = 90;

pub struct Pipeline {
    detector: Detector,
    embedder: Embedder,
    attributes: AttributePredictor,
    /// Per-stream trackers, created lazily on first frame and kept for
    /// the worker process's lifetime. The outer lock is held only for
    /// lookup; each tracker's own lock is held for the whole frame.
    trackers: StdMutex<HashMap<Uuid, Arc<AsyncMutex<Tracker>>>>,
    faces: Arc<dyn FaceIndex>,
    blobs: Arc<dyn ObjectStore>,
    events: Arc<dyn EventPublisher>,
    cfg: VisionConfig,
    tracking: TrackingConfig,
}

impl Pipeline {
    /// Load all three ONNX sessions. Sessions live until the pipeline is
    /// dropped.
    pub fn new(
        cfg: VisionConfig,
        tracking: TrackingConfig,
        faces: Arc<dyn FaceIndex>,
        blobs: Arc<dyn ObjectStore>,
        events: Arc<dyn EventPublisher>,
    ) -> Result<Self> {
        let models = Path::new(&cfg.models_dir);
        let det_path = models.join("det_10g.onnx");
        let emb_path = models.join("w600k_r50.onnx");
        let attr_path = models.join("genderage.onnx");

        info!(
            path = %det_path.display(),
            intra_op_threads = cfg.intra_op_threads,
            inter_op_threads = cfg.inter_op_threads,
            "loading detection model"
        );
        let detector = Detector::new(
            &det_path.to_string_lossy(),
            cfg.detection_threshold,
            cfg.intra_op_threads,
            cfg.inter_op_threads,
        )
        .context("load detector")?;

        info!(path = %emb_path.display(), "loading embedding model");
        let embedder = Embedder::new(
            &emb_path.to_string_lossy(),
            cfg.intra_op_threads,
            cfg.inter_op_threads,
        )
        .context("load embedder")?;

        info!(path = %attr_path.display(), "loading attribute model");
        let attributes = AttributePredictor::new(
            &attr_path.to_string_lossy(),
            cfg.intra_op_threads,
            cfg.inter_op_threads,
        )
        .context("load attributes")?;

        info!("vision pipeline ready");

        Ok(Self {
            detector,
            embedder,
            attributes,
            trackers: StdMutex::new(HashMap::new()),
            faces,
            blobs,
            events,
            cfg,
            tracking,
        })
    }

    /// Process one frame task. Errors returned here are retryable (the
    /// message is nack'd); per-track failures only abort that track.
    pub async fn process_frame(&self, task: &FrameTask) -> Result<()> {
        let frame_data = self
            .blobs
            .get_object(&task.frame_ref)
            .await
            .context("load frame")?;

        let img = image::load_from_memory(&frame_data)
            .context("decode jpeg")?
            .to_rgb8();
        let (orig_w, orig_h) = img.dimensions();

        let start = Instant::now();
        let (det_w, det_h) = self.detector.input_size();
        let det_input = imaging::preprocess_chw(&img, det_w, det_h, &DETECT_NORM);
        INFERENCE_DURATION
            .with_label_values(&["preprocess"])
            .observe(start.elapsed().as_secs_f64());

        let start = Instant::now();
        let mut detections = self
            .detector
            .detect(det_input, orig_w, orig_h)
            .context("detect")?;
        INFERENCE_DURATION
            .with_label_values(&["detect"])
            .observe(start.elapsed().as_secs_f64());

        if detections.is_empty() {
            return Ok(());
        }

        let min_size = self.cfg.min_face_size as f32;
        if min_size > 0.0 {
            detections.retain(|d| {
                d.bbox[2] - d.bbox[0] >= min_size && d.bbox[3] - d.bbox[1] >= min_size
            });
            if detections.is_empty() {
                return Ok(());
            }
        }

        let stream_label = task.stream_id.to_string();
        FACES_DETECTED
            .with_label_values(&[&stream_label])
            .inc_by(detections.len() as u64);

        let tracker = self.tracker_for(task.stream_id);
        let mut tracker = tracker.lock().await;
        let updates = tracker.update(&detections);

        for update in updates {
            let interval = self.tracking.re_recognize_interval();
            if !update.is_new && !tracker.should_recognize(&update.id, interval, Instant::now()) {
                continue;
            }

            let Some(bbox) = tracker.get(&update.id).map(|t| t.bbox) else {
                continue;
            };
            let Some(face) = imaging::crop_face(&img, &bbox) else {
                continue;
            };

            let start = Instant::now();
            let (emb_w, emb_h) = self.embedder.input_size();
            let emb_input = imaging::preprocess_chw(&*face, emb_w, emb_h, &EMBED_NORM);
            let embedding = match self.embedder.extract(emb_input) {
                Ok(embedding) => embedding,
                Err(e) => {
                    warn!(track = %update.id, error = %e, "embed error");
                    continue;
                }
            };
            INFERENCE_DURATION
                .with_label_values(&["embed"])
                .observe(start.elapsed().as_secs_f64());
            tracker.record_recognition(&update.id, embedding.clone(), Instant::now());

            let start = Instant::now();
            let (attr_w, attr_h) = self.attributes.input_size();
            let attr_input = imaging::preprocess_chw(&*face, attr_w, attr_h, &ATTR_NORM);
            match self.attributes.predict(attr_input) {
                Ok(attributes) => tracker.set_attributes(&update.id, attributes),
                // attributes are best-effort; keep the embedding
                Err(e) => warn!(track = %update.id, error = %e, "attributes error"),
            }
            INFERENCE_DURATION
                .with_label_values(&["attrs"])
                .observe(start.elapsed().as_secs_f64());

            let start = Instant::now();
            match self
                .faces
                .search_faces(
                    &embedding,
                    task.collection_id,
                    self.cfg.recognition_threshold,
                    1,
                )
                .await
            {
                Ok(matches) => {
                    if let Some(m) = matches.first() {
                        tracker.set_match(&update.id, m.person_id, m.score);
                        FACES_RECOGNIZED.with_label_values(&[&stream_label]).inc();
                    }
                }
                Err(e) => warn!(error = %e, "search error"),
            }
            INFERENCE_DURATION
                .with_label_values(&["match"])
                .observe(start.elapsed().as_secs_f64());

            // Snapshot only on first sighting; re-recognitions reuse the
            // stored key.
            if update.is_new {
                let key = format!(
                    "snapshots/{}/{}_{}.jpg",
                    task.stream_id,
                    update.id,
                    Utc::now().format("%Y%m%d_%H%M%S")
                );
                let snapshot = imaging::upscale_face(&*face, SNAPSHOT_MIN_SIDE);
                match imaging::encode_jpeg(&snapshot, SNAPSHOT_JPEG_QUALITY) {
                    Ok(data) => match self.blobs.put_object(&key, data, "image/jpeg").await {
                        Ok(()) => tracker.set_snapshot_key(&update.id, key),
                        Err(e) => warn!(track = %update.id, error = %e, "save snapshot"),
                    },
                    Err(e) => warn!(track = %update.id, error = %e, "encode snapshot"),
                }
            }

            let Some(track) = tracker.get(&update.id) else {
                continue;
            };
            let event = DetectionEvent {
                stream_id: task.stream_id,
                track_id: track.id.clone(),
                timestamp: task.timestamp,
                bbox: track.bbox,
                gender: track
                    .attributes
                    .as_ref()
                    .map(|a| a.gender.clone())
                    .unwrap_or_default(),
                gender_confidence: track
                    .attributes
                    .as_ref()
                    .map(|a| a.gender_confidence)
                    .unwrap_or_default(),
                age: track.attributes.as_ref().map(|a| a.age).unwrap_or_default(),
                age_range: track
                    .attributes
                    .as_ref()
                    .map(|a| a.age_range.clone())
                    .unwrap_or_default(),
                confidence: track.confidence,
                embedding,
                matched_person_id: track.person_id,
                match_score: track.match_score,
                snapshot_key: track.snapshot_key.clone(),
                frame_key: task.frame_ref.clone(),
            };

            if let Err(e) = self.events.publish_event(&stream_label, &event).await {
                error!(track = %event.track_id, error = %e, "publish event");
            }
        }

        Ok(())
    }

    fn tracker_for(&self, stream_id: Uuid) -> Arc<AsyncMutex<Tracker>> {
        let mut trackers = self.trackers.lock().unwrap();
        trackers
            .entry(stream_id)
            .or_insert_with(|| {
                Arc::new(AsyncMutex::new(Tracker::new(
                    stream_id.to_string(),
                    self.tracking.max_age,
                    self.tracking.min_hits,
                )))
            })
            .clone()
    }
}
