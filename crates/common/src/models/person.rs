use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Named set of persons; streams may bind to one to scope matching.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Collection {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Person {
    pub id: Uuid,
    pub collection_id: Uuid,
    pub name: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Face embedding row metadata. The vector itself stays in SQL; it is
/// written on insert and only ever read through similarity queries.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FaceEmbedding {
    pub id: Uuid,
    pub person_id: Uuid,
    pub quality: f32,
    pub source_key: String,
    pub created_at: DateTime<Utc>,
}

/// Result of a vector-similarity search over face embeddings.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FaceMatch {
    pub person_id: Uuid,
    pub name: String,
    /// Cosine similarity in [-1, 1]; higher is closer.
    pub score: f32,
}
