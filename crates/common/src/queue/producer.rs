use anyhow::{Context, Result};
use async_nats::jetstream::{
    self,
    stream::{Config as StreamConfig, DiscardPolicy, RetentionPolicy, StorageType},
};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

use crate::models::{DetectionEvent, FrameTask};
use crate::queue::{
    event_subject, frame_subject, EventPublisher, FramePublisher, CONTROL_SUBJECT,
    EVENTS_STREAM, EVENTS_SUBJECT_BASE, FRAMES_STREAM, FRAMES_SUBJECT_BASE,
};

#[derive(Clone)]
pub struct Producer {
    client: async_nats::Client,
    js: jetstream::Context,
}

impl Producer {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::ConnectOptions::new()
            .retry_on_initial_connect()
            .connect(url)
            .await
            .context("connect to nats")?;
        let js = jetstream::new(client.clone());
        Ok(Self { client, js })
    }

    /// Create the FRAMES and EVENTS streams if they don't exist. Retries
    /// up to 30 times (1 s apart) to ride out fabric startup.
    pub async fn ensure_streams(&self) -> Result<()> {
        let configs = [
            StreamConfig {
                name: FRAMES_STREAM.to_string(),
                description: Some("Frame tasks for vision workers".to_string()),
                subjects: vec![format!("{FRAMES_SUBJECT_BASE}.>")],
                retention: RetentionPolicy::WorkQueue,
                max_age: Duration::from_secs(5 * 60),
                max_messages: 100_000,
                max_bytes: 1024 * 1024 * 1024,
                storage: StorageType::File,
                discard: DiscardPolicy::Old,
                duplicate_window: Duration::from_secs(30),
                ..Default::default()
            },
            StreamConfig {
                name: EVENTS_STREAM.to_string(),
                description: Some("Detection/recognition events".to_string()),
                subjects: vec![format!("{EVENTS_SUBJECT_BASE}.>")],
                retention: RetentionPolicy::Interest,
                max_age: Duration::from_secs(24 * 60 * 60),
                max_messages: 1_000_000,
                storage: StorageType::File,
                ..Default::default()
            },
        ];

        const MAX_ATTEMPTS: u32 = 30;
        for attempt in 1..=MAX_ATTEMPTS {
            let mut all_ok = true;
            for cfg in &configs {
                let name = cfg.name.clone();
                match self.js.get_or_create_stream(cfg.clone()).await {
                    Ok(_) => info!(name = %name, "ensured jetstream stream"),
                    Err(e) => {
                        all_ok = false;
                        if attempt == MAX_ATTEMPTS {
                            return Err(anyhow::anyhow!(
                                "create stream {name}: {e} (after {MAX_ATTEMPTS} attempts)"
                            ));
                        }
                        warn!(name = %name, attempt, error = %e, "ensure jetstream stream (retrying)");
                        break;
                    }
                }
            }
            if all_ok {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Ok(())
    }

    /// Number of pending messages in the FRAMES stream.
    pub async fn queue_depth(&self) -> Result<u64> {
        let mut stream = self
            .js
            .get_stream(FRAMES_STREAM)
            .await
            .context("get frames stream")?;
        let info = stream.info().await.context("frames stream info")?;
        Ok(info.state.messages)
    }

    /// Raw (non-JetStream) subscription to the stream control subject.
    pub async fn subscribe_control(&self) -> Result<async_nats::Subscriber> {
        self.client
            .subscribe(CONTROL_SUBJECT)
            .await
            .context("subscribe to control subject")
    }

    pub fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }
}

#[async_trait]
impl FramePublisher for Producer {
    async fn publish_frame(&self, stream_id: &str, task: &FrameTask) -> Result<()> {
        let payload = serde_json::to_vec(task).context("marshal frame task")?;
        self.js
            .publish(frame_subject(stream_id), payload.into())
            .await
            .context("publish frame")?
            .await
            .context("frame publish ack")?;
        Ok(())
    }
}

#[async_trait]
impl EventPublisher for Producer {
    async fn publish_event(&self, stream_id: &str, event: &DetectionEvent) -> Result<()> {
        let payload = serde_json::to_vec(event).context("marshal event")?;
        self.js
            .publish(event_subject(stream_id), payload.into())
            .await
            .context("publish event")?
            .await
            .context("event publish ack")?;
        Ok(())
    }
}
