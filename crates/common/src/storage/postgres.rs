//! Relational store over sqlx runtime queries.
//!
//! The `embedding` columns use pgvector's `vector(512)` type. Because we
//! use runtime queries (no compile-time sqlx macros), embeddings are
//! passed as bracketed text literals and cast with `::vector` in SQL.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, QueryBuilder, Row};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::models::{
    Collection, DetectionEvent, Event, EventQuery, FaceEmbedding, FaceMatch, Person, Stream,
    StreamStatus,
};
use crate::storage::{EventStore, FaceIndex, StreamStatusStore};

/// Column list for `events` reads (excludes the `embedding` vector).
const EVENT_COLUMNS: &str = "id, stream_id, track_id, timestamp, gender, gender_confidence, \
     age, age_range, confidence, matched_person_id, match_score, snapshot_key, frame_key, created_at";

/// Column list for `streams` reads.
const STREAM_COLUMNS: &str =
    "id, url, stream_type, mode, fps, status, collection_id, config, error_message, \
     created_at, updated_at";

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(cfg: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_conns)
            .connect(&cfg.dsn())
            .await
            .context("connect to postgres")?;
        let store = Self { pool };
        store.ping().await.context("ping postgres")?;
        Ok(store)
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("run migrations")
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // --- Collections / persons / face embeddings ---

    pub async fn create_collection(&self, name: &str, description: &str) -> Result<Collection> {
        sqlx::query_as::<_, Collection>(
            "INSERT INTO collections (id, name, description) VALUES ($1, $2, $3) \
             RETURNING id, name, description, created_at, updated_at",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(description)
        .fetch_one(&self.pool)
        .await
        .context("create collection")
    }

    pub async fn create_person(
        &self,
        collection_id: Uuid,
        name: &str,
        metadata: serde_json::Value,
    ) -> Result<Person> {
        sqlx::query_as::<_, Person>(
            "INSERT INTO persons (id, collection_id, name, metadata) VALUES ($1, $2, $3, $4) \
             RETURNING id, collection_id, name, metadata, created_at, updated_at",
        )
        .bind(Uuid::new_v4())
        .bind(collection_id)
        .bind(name)
        .bind(metadata)
        .fetch_one(&self.pool)
        .await
        .context("create person")
    }

    pub async fn add_face_embedding(
        &self,
        person_id: Uuid,
        embedding: &[f32],
        quality: f32,
        source_key: &str,
    ) -> Result<FaceEmbedding> {
        sqlx::query_as::<_, FaceEmbedding>(
            "INSERT INTO face_embeddings (id, person_id, embedding, quality, source_key) \
             VALUES ($1, $2, $3::vector, $4, $5) \
             RETURNING id, person_id, quality, source_key, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(person_id)
        .bind(vector_literal(embedding))
        .bind(quality)
        .bind(source_key)
        .fetch_one(&self.pool)
        .await
        .context("add face embedding")
    }

    // --- Streams ---

    pub async fn create_stream(
        &self,
        url: &str,
        stream_type: &str,
        mode: &str,
        fps: i32,
        collection_id: Option<Uuid>,
    ) -> Result<Stream> {
        let query = format!(
            "INSERT INTO streams (id, url, stream_type, mode, fps, status, collection_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {STREAM_COLUMNS}"
        );
        sqlx::query_as::<_, Stream>(&query)
            .bind(Uuid::new_v4())
            .bind(url)
            .bind(stream_type)
            .bind(mode)
            .bind(fps)
            .bind(StreamStatus::Stopped.as_str())
            .bind(collection_id)
            .fetch_one(&self.pool)
            .await
            .context("create stream")
    }

    pub async fn get_stream(&self, id: Uuid) -> Result<Option<Stream>> {
        let query = format!("SELECT {STREAM_COLUMNS} FROM streams WHERE id = $1");
        sqlx::query_as::<_, Stream>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("get stream")
    }

    pub async fn list_streams(&self) -> Result<Vec<Stream>> {
        let query = format!("SELECT {STREAM_COLUMNS} FROM streams ORDER BY created_at DESC");
        sqlx::query_as::<_, Stream>(&query)
            .fetch_all(&self.pool)
            .await
            .context("list streams")
    }

    // --- Events ---

    /// Historical event query for one stream, newest first by the event's
    /// own timestamp. Returns the page and the total match count.
    pub async fn query_events(
        &self,
        stream_id: Uuid,
        filter: &EventQuery,
    ) -> Result<(Vec<Event>, i64)> {
        let limit = match filter.limit {
            n if n <= 0 => 50,
            n if n > 500 => 500,
            n => n,
        };

        let mut count = QueryBuilder::new("SELECT COUNT(*) FROM events WHERE stream_id = ");
        count.push_bind(stream_id);
        push_event_filters(&mut count, filter);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .context("count events")?;

        let mut query =
            QueryBuilder::new(format!("SELECT {EVENT_COLUMNS} FROM events WHERE stream_id = "));
        query.push_bind(stream_id);
        push_event_filters(&mut query, filter);
        query.push(" ORDER BY timestamp DESC LIMIT ");
        query.push_bind(limit);
        query.push(" OFFSET ");
        query.push_bind(filter.offset.max(0));

        let events = query
            .build_query_as::<Event>()
            .fetch_all(&self.pool)
            .await
            .context("query events")?;

        Ok((events, total))
    }
}

#[async_trait]
impl EventStore for PostgresStore {
    async fn insert_event(&self, event: &DetectionEvent) -> Result<Event> {
        let id = Uuid::new_v4();
        let embedding = if event.embedding.is_empty() {
            None
        } else {
            Some(vector_literal(&event.embedding))
        };
        let row = sqlx::query(
            "INSERT INTO events (id, stream_id, track_id, timestamp, gender, gender_confidence, \
                age, age_range, confidence, embedding, matched_person_id, match_score, \
                snapshot_key, frame_key) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10::vector, $11, $12, $13, $14) \
             RETURNING created_at",
        )
        .bind(id)
        .bind(event.stream_id)
        .bind(&event.track_id)
        .bind(event.timestamp)
        .bind(&event.gender)
        .bind(event.gender_confidence)
        .bind(event.age)
        .bind(&event.age_range)
        .bind(event.confidence)
        .bind(embedding)
        .bind(event.matched_person_id)
        .bind(event.match_score)
        .bind(event.snapshot_key.as_deref().unwrap_or(""))
        .bind(&event.frame_key)
        .fetch_one(&self.pool)
        .await
        .context("insert event")?;

        Ok(Event {
            id,
            stream_id: event.stream_id,
            track_id: event.track_id.clone(),
            timestamp: event.timestamp,
            gender: event.gender.clone(),
            gender_confidence: event.gender_confidence,
            age: event.age,
            age_range: event.age_range.clone(),
            confidence: event.confidence,
            matched_person_id: event.matched_person_id,
            match_score: Some(event.match_score),
            snapshot_key: event.snapshot_key.clone().unwrap_or_default(),
            frame_key: event.frame_key.clone(),
            created_at: row.get("created_at"),
        })
    }
}

fn push_event_filters(qb: &mut QueryBuilder<'_, sqlx::Postgres>, filter: &EventQuery) {
    if let Some(from) = filter.from {
        qb.push(" AND timestamp >= ");
        qb.push_bind(from);
    }
    if let Some(to) = filter.to {
        qb.push(" AND timestamp <= ");
        qb.push_bind(to);
    }
    if let Some(person_id) = filter.person_id {
        qb.push(" AND matched_person_id = ");
        qb.push_bind(person_id);
    }
    if filter.unknown_only {
        qb.push(" AND matched_person_id IS NULL");
    }
}

#[async_trait]
impl StreamStatusStore for PostgresStore {
    async fn update_stream_status(
        &self,
        id: Uuid,
        status: StreamStatus,
        error_message: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE streams SET status = $1, error_message = $2, updated_at = $3 WHERE id = $4",
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("update stream status")?;
        Ok(())
    }
}

#[async_trait]
impl FaceIndex for PostgresStore {
    /// Cosine-similarity search scored as `1 - (a <=> b)`; only rows at
    /// or above `threshold`, closest first.
    async fn search_faces(
        &self,
        embedding: &[f32],
        collection_id: Option<Uuid>,
        threshold: f32,
        limit: i64,
    ) -> Result<Vec<FaceMatch>> {
        let limit = if limit <= 0 { 5 } else { limit };
        let vec = vector_literal(embedding);

        let matches = if let Some(collection_id) = collection_id {
            sqlx::query_as::<_, FaceMatch>(
                "SELECT fe.person_id, p.name, \
                        (1 - (fe.embedding <=> $1::vector))::float4 AS score \
                 FROM face_embeddings fe \
                 JOIN persons p ON p.id = fe.person_id \
                 WHERE p.collection_id = $2 \
                   AND 1 - (fe.embedding <=> $1::vector) >= $3 \
                 ORDER BY fe.embedding <=> $1::vector \
                 LIMIT $4",
            )
            .bind(&vec)
            .bind(collection_id)
            .bind(threshold as f64)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, FaceMatch>(
                "SELECT fe.person_id, p.name, \
                        (1 - (fe.embedding <=> $1::vector))::float4 AS score \
                 FROM face_embeddings fe \
                 JOIN persons p ON p.id = fe.person_id \
                 WHERE 1 - (fe.embedding <=> $1::vector) >= $2 \
                 ORDER BY fe.embedding <=> $1::vector \
                 LIMIT $3",
            )
            .bind(&vec)
            .bind(threshold as f64)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        };

        matches.context("search faces")
    }
}

/// pgvector text literal: `[v1,v2,...]`.
fn vector_literal(embedding: &[f32]) -> String {
    let mut out = String::with_capacity(embedding.len() * 12 + 2);
    out.push('[');
    for (i, v) in embedding.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&v.to_string());
    }
    out.push(']');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_literal_format() {
        assert_eq!(vector_literal(&[]), "[]");
        assert_eq!(vector_literal(&[1.0, -0.5, 0.25]), "[1,-0.5,0.25]");
    }
}
