//! Store clients and the capability traits the pipeline loops depend on.
//! The traits keep the core (stream manager, vision pipeline, cleanup)
//! testable against in-memory fakes.

pub mod blob;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{DetectionEvent, Event, FaceMatch, StreamStatus};

/// Blob-store capability: JPEG frames and face snapshots.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<()>;
    async fn get_object(&self, key: &str) -> Result<Vec<u8>>;
    async fn delete_objects(&self, keys: &[String]) -> Result<()>;
    /// Keys under `prefix`, in the order the store lists them.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>>;
    async fn ping(&self) -> Result<()>;
}

/// Persisted stream lifecycle transitions driven by the ingest node.
#[async_trait]
pub trait StreamStatusStore: Send + Sync {
    async fn update_stream_status(
        &self,
        id: Uuid,
        status: StreamStatus,
        error_message: &str,
    ) -> Result<()>;
}

/// Vector-similarity search over the face-embedding library.
#[async_trait]
pub trait FaceIndex: Send + Sync {
    async fn search_faces(
        &self,
        embedding: &[f32],
        collection_id: Option<Uuid>,
        threshold: f32,
        limit: i64,
    ) -> Result<Vec<FaceMatch>>;
}

/// Durable event persistence, fed by the event distributor.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist a detection event, returning the stored row.
    async fn insert_event(&self, event: &DetectionEvent) -> Result<Event>;
}
