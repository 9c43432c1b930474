use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of video source a stream points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Rtsp,
    Http,
    /// Resolved to a direct media URL via yt-dlp before extraction.
    Youtube,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    All,
    Identify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Stopped,
    Starting,
    Running,
    Error,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamStatus::Stopped => "stopped",
            StreamStatus::Starting => "starting",
            StreamStatus::Running => "running",
            StreamStatus::Error => "error",
        }
    }
}

/// Stream row as stored in Postgres. Type/mode/status travel as text
/// columns; the typed enums above cover the wire formats.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Stream {
    pub id: Uuid,
    pub url: String,
    pub stream_type: String,
    pub mode: String,
    pub fps: i32,
    pub status: String,
    pub collection_id: Option<Uuid>,
    pub config: serde_json::Value,
    pub error_message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Start/stop command published on the `stream.control` subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamCommand {
    pub action: String,
    pub stream_id: String,
    #[serde(default)]
    pub url: String,
    #[serde(rename = "type", default)]
    pub stream_type: Option<StreamType>,
    #[serde(default)]
    pub mode: Option<StreamMode>,
    #[serde(default)]
    pub fps: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<Uuid>,
}

impl StreamCommand {
    pub fn parse(data: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(data).map_err(|e| anyhow::anyhow!("parse command: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trip() {
        let raw = r#"{"action":"start","stream_id":"a6f0e9d2-0000-0000-0000-000000000001",
            "url":"rtsp://cam/live","type":"rtsp","mode":"all","fps":5}"#;
        let cmd = StreamCommand::parse(raw.as_bytes()).unwrap();
        assert_eq!(cmd.action, "start");
        assert_eq!(cmd.stream_type, Some(StreamType::Rtsp));
        assert_eq!(cmd.fps, 5);
        assert!(cmd.collection_id.is_none());
    }

    #[test]
    fn stop_command_tolerates_missing_fields() {
        let cmd = StreamCommand::parse(br#"{"action":"stop","stream_id":"s1"}"#).unwrap();
        assert_eq!(cmd.action, "stop");
        assert!(cmd.url.is_empty());
        assert!(cmd.stream_type.is_none());
    }
}
