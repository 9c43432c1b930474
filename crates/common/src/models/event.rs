use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One unit of work: a single extracted JPEG waiting in the blob store.
/// Published on `frames.<stream-id>` and immutable once sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameTask {
    pub stream_id: Uuid,
    pub frame_id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Blob key of the JPEG (`frames/<stream>/<frame>.jpg`).
    pub frame_ref: String,
    pub width: u32,
    /// 0 until the worker decodes the frame.
    pub height: u32,
    /// Stream's collection binding, scoping recognition search.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<Uuid>,
}

/// Durable pipeline output for one tracked face at a moment in time.
/// Published on `events.<stream-id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub stream_id: Uuid,
    pub track_id: String,
    pub timestamp: DateTime<Utc>,
    /// x1, y1, x2, y2 in pixels of the original frame.
    pub bbox: [f32; 4],
    pub gender: String,
    pub gender_confidence: f32,
    pub age: i32,
    pub age_range: String,
    pub confidence: f32,
    /// L2-normalised 512-dim ArcFace embedding.
    pub embedding: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_person_id: Option<Uuid>,
    #[serde(default)]
    pub match_score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_key: Option<String>,
    pub frame_key: String,
}

impl DetectionEvent {
    pub fn parse(data: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(data).map_err(|e| anyhow::anyhow!("parse detection event: {e}"))
    }
}

/// Persisted event row. The embedding column is written on insert but
/// excluded from reads (similarity queries go through SQL).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Event {
    pub id: Uuid,
    pub stream_id: Uuid,
    pub track_id: String,
    pub timestamp: DateTime<Utc>,
    pub gender: String,
    pub gender_confidence: f32,
    pub age: i32,
    pub age_range: String,
    pub confidence: f32,
    pub matched_person_id: Option<Uuid>,
    pub match_score: Option<f32>,
    pub snapshot_key: String,
    pub frame_key: String,
    pub created_at: DateTime<Utc>,
}

/// Filters for historical event queries. Results are always ordered by
/// the event's own `timestamp` (the queue may store out of order).
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub person_id: Option<Uuid>,
    /// Only events with no matched person.
    pub unknown_only: bool,
    pub limit: i64,
    pub offset: i64,
}
