//! Event consumer handler: persist each detection event, then fan it
//! out to live subscribers.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

use common::models::{DetectionEvent, Event};
use common::queue::{Disposition, MessageHandler};
use common::storage::EventStore;

use crate::hub::HubHandle;

pub const EVENT_TYPE_DETECTED: &str = "face_detected";
pub const EVENT_TYPE_RECOGNIZED: &str = "face_recognized";

/// Live-wire envelope pushed to subscribers.
#[derive(Debug, Serialize)]
pub struct WsEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub stream_id: Uuid,
    pub data: Event,
}

pub struct EventDistributor {
    store: Arc<dyn EventStore>,
    hub: HubHandle,
}

impl EventDistributor {
    pub fn new(store: Arc<dyn EventStore>, hub: HubHandle) -> Self {
        Self { store, hub }
    }
}

#[async_trait]
impl MessageHandler for EventDistributor {
    async fn handle(&self, payload: &[u8]) -> Disposition {
        let event = match DetectionEvent::parse(payload) {
            Ok(event) => event,
            Err(e) => {
                // a malformed payload never becomes valid; drop it
                warn!(error = %e, "dropping undecodable event");
                return Disposition::Ack;
            }
        };

        // Persistence failure must not prevent the live broadcast.
        let stored = match self.store.insert_event(&event).await {
            Ok(row) => row,
            Err(e) => {
                error!(stream_id = %event.stream_id, track = %event.track_id, error = %e, "store event");
                unstored_row(&event)
            }
        };

        let event_type = if event.matched_person_id.is_some() {
            EVENT_TYPE_RECOGNIZED
        } else {
            EVENT_TYPE_DETECTED
        };

        let envelope = WsEvent {
            event_type: event_type.to_string(),
            stream_id: event.stream_id,
            data: stored,
        };
        match serde_json::to_string(&envelope) {
            Ok(payload) => self.hub.broadcast(event.stream_id, payload).await,
            Err(e) => error!(error = %e, "marshal ws event"),
        }

        Disposition::Ack
    }
}

/// Row-shaped view of an event whose insert failed; the live path still
/// gets the payload, just with a transient id.
fn unstored_row(event: &DetectionEvent) -> Event {
    Event {
        id: Uuid::new_v4(),
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
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{bail, Result};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use crate::hub;

    struct FakeStore {
        inserted: Mutex<Vec<DetectionEvent>>,
        fail: AtomicBool,
    }

    impl FakeStore {
        fn new() -> Self {
            Self {
                inserted: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl EventStore for FakeStore {
        async fn insert_event(&self, event: &DetectionEvent) -> Result<Event> {
            if self.fail.load(Ordering::SeqCst) {
                bail!("database unavailable");
            }
            self.inserted.lock().unwrap().push(event.clone());
            Ok(unstored_row(event))
        }
    }

    fn sample_event(matched: Option<Uuid>) -> DetectionEvent {
        DetectionEvent {
            stream_id: Uuid::new_v4(),
            track_id: "s_1".to_string(),
            timestamp: Utc::now(),
            bbox: [10.0, 10.0, 50.0, 50.0],
            gender: "female".to_string(),
            gender_confidence: 0.8,
            age: 30,
            age_range: "30-35".to_string(),
            confidence: 0.95,
            embedding: vec![0.1; 4],
            matched_person_id: matched,
            match_score: matched.map(|_| 0.9).unwrap_or_default(),
            snapshot_key: None,
            frame_key: "frames/s/f.jpg".to_string(),
        }
    }

    #[tokio::test]
    async fn persists_then_broadcasts_face_detected() {
        let (hub, handle) = hub::hub();
        tokio::spawn(hub.run());

        let store = Arc::new(FakeStore::new());
        let distributor = EventDistributor::new(store.clone(), handle.clone());

        let event = sample_event(None);
        let (_, mut rx) = handle.join(Some(event.stream_id)).await;

        let payload = serde_json::to_vec(&event).unwrap();
        assert_eq!(distributor.handle(&payload).await, Disposition::Ack);

        assert_eq!(store.inserted.lock().unwrap().len(), 1);
        let pushed = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&pushed).unwrap();
        assert_eq!(parsed["type"], EVENT_TYPE_DETECTED);
        assert_eq!(parsed["stream_id"], event.stream_id.to_string());
        // the live payload never carries the embedding
        assert!(parsed["data"].get("embedding").is_none());
    }

    #[tokio::test]
    async fn match_produces_face_recognized() {
        let (hub, handle) = hub::hub();
        tokio::spawn(hub.run());

        let distributor =
            EventDistributor::new(Arc::new(FakeStore::new()), handle.clone());
        let event = sample_event(Some(Uuid::new_v4()));
        let (_, mut rx) = handle.join(None).await;

        let payload = serde_json::to_vec(&event).unwrap();
        distributor.handle(&payload).await;

        let pushed = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&pushed).unwrap();
        assert_eq!(parsed["type"], EVENT_TYPE_RECOGNIZED);
    }

    #[tokio::test]
    async fn malformed_payload_is_acked_and_dropped() {
        let (hub, handle) = hub::hub();
        tokio::spawn(hub.run());

        let store = Arc::new(FakeStore::new());
        let distributor = EventDistributor::new(store.clone(), handle.clone());
        let (_, mut rx) = handle.join(None).await;

        assert_eq!(distributor.handle(b"{not json").await, Disposition::Ack);
        assert!(store.inserted.lock().unwrap().is_empty());

        // nothing was broadcast; a later valid event comes through first
        let event = sample_event(None);
        distributor
            .handle(&serde_json::to_vec(&event).unwrap())
            .await;
        let pushed = rx.recv().await.unwrap();
        assert!(pushed.contains(&event.stream_id.to_string()));
    }

    #[tokio::test]
    async fn insert_failure_still_broadcasts() {
        let (hub, handle) = hub::hub();
        tokio::spawn(hub.run());

        let store = Arc::new(FakeStore::new());
        store.fail.store(true, Ordering::SeqCst);
        let distributor = EventDistributor::new(store.clone(), handle.clone());
        let event = sample_event(None);
        let (_, mut rx) = handle.join(None).await;

        let disposition = distributor
            .handle(&serde_json::to_vec(&event).unwrap())
            .await;
        assert_eq!(disposition, Disposition::Ack);
        assert!(rx.recv().await.unwrap().contains("face_detected"));
    }
}
