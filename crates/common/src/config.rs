use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Top-level service configuration, loaded from a YAML file with
/// `FW_*` environment-variable overrides for the deployment-sensitive
/// subset (hosts, ports, credentials, URLs).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub nats: NatsConfig,
    pub blob: BlobConfig,
    pub vision: VisionConfig,
    pub tracking: TrackingConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Empty string disables API-key auth on the admin surface.
    pub api_key: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub max_conns: u32,
}

impl DatabaseConfig {
    pub fn dsn(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.name
        )
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            name: "facewatch".to_string(),
            user: "facewatch".to_string(),
            password: String::new(),
            max_conns: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    pub url: String,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
        }
    }
}

/// S3-compatible object store (MinIO in the reference deployment).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub region: String,
    pub use_ssl: bool,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            endpoint: "localhost:9000".to_string(),
            access_key: String::new(),
            secret_key: String::new(),
            bucket: "facewatch".to_string(),
            region: "us-east-1".to_string(),
            use_ssl: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub models_dir: String,
    pub detection_threshold: f32,
    pub recognition_threshold: f32,
    /// Applied when a start command carries fps <= 0.
    pub default_fps: u32,
    pub worker_count: usize,
    pub frame_width: u32,
    /// Detections narrower or shorter than this are dropped. 0 disables.
    pub min_face_size: u32,
    /// ONNX Runtime thread caps per session. 0 leaves the runtime default.
    pub intra_op_threads: usize,
    pub inter_op_threads: usize,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            models_dir: "models".to_string(),
            detection_threshold: 0.5,
            recognition_threshold: 0.4,
            default_fps: 5,
            worker_count: 6,
            frame_width: 640,
            min_face_size: 0,
            intra_op_threads: 0,
            inter_op_threads: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Frames without a matched detection before a track is evicted.
    pub max_age: u32,
    /// Consecutive detections before a track is confirmed.
    pub min_hits: u32,
    pub re_recognize_interval_secs: u64,
}

impl TrackingConfig {
    pub fn re_recognize_interval(&self) -> Duration {
        Duration::from_secs(self.re_recognize_interval_secs)
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            max_age: 30,
            min_hits: 3,
            re_recognize_interval_secs: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Newest N frame blobs to keep per stream. 0 disables cleanup.
    pub frame_retention: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { frame_retention: 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl Config {
    /// Read the YAML file at `path` and apply environment overrides.
    pub fn load(path: &str) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {path}"))?;
        let mut cfg: Config = serde_yaml::from_str(&data).context("parse config")?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// Config path from the first CLI argument, falling back to the
    /// conventional location.
    pub fn path_from_args() -> String {
        env::args()
            .nth(1)
            .unwrap_or_else(|| "configs/config.yaml".to_string())
    }

    fn apply_env_overrides(&mut self) {
        override_parse("FW_SERVER_PORT", &mut self.server.port);
        override_str("FW_API_KEY", &mut self.server.api_key);
        override_str("FW_DB_HOST", &mut self.database.host);
        override_parse("FW_DB_PORT", &mut self.database.port);
        override_str("FW_DB_NAME", &mut self.database.name);
        override_str("FW_DB_USER", &mut self.database.user);
        override_str("FW_DB_PASSWORD", &mut self.database.password);
        override_str("FW_NATS_URL", &mut self.nats.url);
        override_str("FW_BLOB_ENDPOINT", &mut self.blob.endpoint);
        override_str("FW_BLOB_ACCESS_KEY", &mut self.blob.access_key);
        override_str("FW_BLOB_SECRET_KEY", &mut self.blob.secret_key);
        override_str("FW_BLOB_BUCKET", &mut self.blob.bucket);
        override_str("FW_MODELS_DIR", &mut self.vision.models_dir);
        override_parse("FW_WORKER_COUNT", &mut self.vision.worker_count);
    }
}

fn override_str(key: &str, target: &mut String) {
    if let Ok(v) = env::var(key) {
        if !v.is_empty() {
            *target = v;
        }
    }
}

fn override_parse<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(v) = env::var(key) {
        if let Ok(parsed) = v.parse::<T>() {
            *target = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_deployment() {
        let cfg = Config::default();
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.database.port, 5432);
        assert_eq!(cfg.database.max_conns, 20);
        assert_eq!(cfg.vision.detection_threshold, 0.5);
        assert_eq!(cfg.vision.recognition_threshold, 0.4);
        assert_eq!(cfg.vision.worker_count, 6);
        assert_eq!(cfg.vision.frame_width, 640);
        assert_eq!(cfg.tracking.max_age, 30);
        assert_eq!(cfg.tracking.min_hits, 3);
        assert_eq!(
            cfg.tracking.re_recognize_interval(),
            Duration::from_secs(3)
        );
        assert_eq!(cfg.storage.frame_retention, 0);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn partial_yaml_keeps_defaults_elsewhere() {
        let yaml = r#"
server:
  port: 9090
vision:
  worker_count: 2
  min_face_size: 24
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.server.port, 9090);
        assert_eq!(cfg.vision.worker_count, 2);
        assert_eq!(cfg.vision.min_face_size, 24);
        // untouched sections keep their defaults
        assert_eq!(cfg.database.max_conns, 20);
        assert_eq!(cfg.tracking.min_hits, 3);
    }

    #[test]
    fn dsn_includes_all_parts() {
        let db = DatabaseConfig {
            host: "db".into(),
            port: 5433,
            name: "fw".into(),
            user: "u".into(),
            password: "p".into(),
            max_conns: 5,
        };
        assert_eq!(db.dsn(), "postgres://u:p@db:5433/fw");
    }

    #[test]
    fn env_overrides_apply() {
        env::set_var("FW_NATS_URL", "nats://other:4222");
        env::set_var("FW_WORKER_COUNT", "3");
        let mut cfg = Config::default();
        cfg.apply_env_overrides();
        assert_eq!(cfg.nats.url, "nats://other:4222");
        assert_eq!(cfg.vision.worker_count, 3);
        env::remove_var("FW_NATS_URL");
        env::remove_var("FW_WORKER_COUNT");
    }
}
