use anyhow::{Context, Result};
use async_nats::jetstream::{
    self,
    consumer::{pull::Config as PullConfig, AckPolicy, DeliverPolicy, PullConsumer},
    AckKind,
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::queue::{
    Disposition, MessageHandler, EVENTS_STREAM, EVENTS_SUBJECT_BASE, FRAMES_STREAM,
    FRAMES_SUBJECT_BASE,
};

const FETCH_WAIT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct Consumer {
    client: async_nats::Client,
    js: jetstream::Context,
}

impl Consumer {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::ConnectOptions::new()
            .retry_on_initial_connect()
            .connect(url)
            .await
            .context("connect to nats")?;
        let js = jetstream::new(client.clone());
        Ok(Self { client, js })
    }

    pub fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }

    /// Start consuming frame tasks: one fetch loop feeding a bounded
    /// channel (2 × worker_count) drained by worker_count pipeline tasks.
    /// Cancellation stops the fetch loop; in-flight handlers finish their
    /// current frame (ack or nak) before the workers exit.
    ///
    /// With worker_count > 1, frames of one stream may be processed out
    /// of capture order; run a single worker where strict order matters.
    pub async fn consume_frames(
        &self,
        token: CancellationToken,
        consumer_name: &str,
        worker_count: usize,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let stream = self
            .js
            .get_stream(FRAMES_STREAM)
            .await
            .with_context(|| format!("get stream {FRAMES_STREAM}"))?;

        let consumer: PullConsumer = stream
            .get_or_create_consumer(
                consumer_name,
                PullConfig {
                    durable_name: Some(consumer_name.to_string()),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: Duration::from_secs(30),
                    max_deliver: 3,
                    filter_subject: format!("{FRAMES_SUBJECT_BASE}.>"),
                    ..Default::default()
                },
            )
            .await
            .with_context(|| format!("create consumer {consumer_name}"))?;

        let (tx, rx) = mpsc::channel::<jetstream::Message>(worker_count * 2);
        let rx = Arc::new(Mutex::new(rx));

        let fetch_token = token.clone();
        let batch_size = worker_count.max(1);
        tokio::spawn(async move {
            loop {
                if fetch_token.is_cancelled() {
                    break;
                }
                let batch = tokio::select! {
                    _ = fetch_token.cancelled() => break,
                    res = consumer
                        .fetch()
                        .max_messages(batch_size)
                        .expires(FETCH_WAIT)
                        .messages() => res,
                };
                let mut messages = match batch {
                    Ok(messages) => messages,
                    Err(e) => {
                        warn!(error = %e, "fetch frames error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                while let Some(msg) = messages.next().await {
                    match msg {
                        Ok(msg) => {
                            if tx.send(msg).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(error = %e, "frame batch message error"),
                    }
                }
            }
            // tx drops here; workers drain the channel and exit.
        });

        for worker_id in 0..batch_size {
            let rx = Arc::clone(&rx);
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                loop {
                    let msg = { rx.lock().await.recv().await };
                    let Some(msg) = msg else { break };
                    match handler.handle(&msg.payload).await {
                        Disposition::Ack => {
                            if let Err(e) = msg.ack().await {
                                warn!(worker = worker_id, error = %e, "ack failed");
                            }
                        }
                        Disposition::Retry => {
                            error!(worker = worker_id, subject = %msg.subject, "frame processing failed, scheduling redelivery");
                            if let Err(e) = msg.ack_with(AckKind::Nak(None)).await {
                                warn!(worker = worker_id, error = %e, "nak failed");
                            }
                        }
                    }
                }
            });
        }

        info!(consumer = consumer_name, workers = batch_size, "frame consumer started");
        Ok(())
    }

    /// Start consuming detection events with a single durable consumer
    /// that only sees new events; the handler runs inline.
    pub async fn consume_events(
        &self,
        token: CancellationToken,
        consumer_name: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let stream = self
            .js
            .get_stream(EVENTS_STREAM)
            .await
            .with_context(|| format!("get stream {EVENTS_STREAM}"))?;

        let consumer: PullConsumer = stream
            .get_or_create_consumer(
                consumer_name,
                PullConfig {
                    durable_name: Some(consumer_name.to_string()),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: Duration::from_secs(10),
                    max_deliver: 3,
                    filter_subject: format!("{EVENTS_SUBJECT_BASE}.>"),
                    deliver_policy: DeliverPolicy::New,
                    ..Default::default()
                },
            )
            .await
            .with_context(|| format!("create consumer {consumer_name}"))?;

        tokio::spawn(async move {
            loop {
                if token.is_cancelled() {
                    break;
                }
                let batch = tokio::select! {
                    _ = token.cancelled() => break,
                    res = consumer.fetch().max_messages(10).expires(FETCH_WAIT).messages() => res,
                };
                let mut messages = match batch {
                    Ok(messages) => messages,
                    Err(e) => {
                        warn!(error = %e, "fetch events error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                while let Some(msg) = messages.next().await {
                    let msg = match msg {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!(error = %e, "event batch message error");
                            continue;
                        }
                    };
                    match handler.handle(&msg.payload).await {
                        Disposition::Ack => {
                            if let Err(e) = msg.ack().await {
                                warn!(error = %e, "event ack failed");
                            }
                        }
                        Disposition::Retry => {
                            error!(subject = %msg.subject, "event processing failed, scheduling redelivery");
                            if let Err(e) = msg.ack_with(AckKind::Nak(None)).await {
                                warn!(error = %e, "event nak failed");
                            }
                        }
                    }
                }
            }
        });

        info!(consumer = consumer_name, "event consumer started");
        Ok(())
    }
}
