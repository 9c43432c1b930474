//! Frame-retention sweep: keeps only the newest N frame blobs per
//! stream. Best effort — keys are UUID-named, so "oldest" follows the
//! blob store's listing order.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use common::storage::{postgres::PostgresStore, ObjectStore};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub async fn run_cleanup_loop(
    token: CancellationToken,
    db: Arc<PostgresStore>,
    blobs: Arc<dyn ObjectStore>,
    retention: usize,
) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let streams = match db.list_streams().await {
            Ok(streams) => streams,
            Err(e) => {
                warn!(error = %e, "cleanup: list streams");
                continue;
            }
        };

        for stream in streams {
            match sweep_stream_frames(blobs.as_ref(), stream.id, retention).await {
                Ok(0) => {}
                Ok(deleted) => {
                    info!(stream_id = %stream.id, deleted, remaining = retention, "deleted old frames");
                }
                Err(e) => warn!(stream_id = %stream.id, error = %e, "cleanup: sweep frames"),
            }
        }
    }
}

pub(crate) async fn sweep_stream_frames(
    blobs: &dyn ObjectStore,
    stream_id: Uuid,
    retention: usize,
) -> anyhow::Result<usize> {
    let prefix = format!("frames/{stream_id}/");
    let keys = blobs.list_objects(&prefix).await?;
    if keys.len() <= retention {
        return Ok(0);
    }
    let to_delete = &keys[..keys.len() - retention];
    blobs.delete_objects(to_delete).await?;
    Ok(to_delete.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeBlobs {
        keys: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ObjectStore for FakeBlobs {
        async fn put_object(&self, key: &str, _data: Vec<u8>, _ct: &str) -> Result<()> {
            self.keys.lock().unwrap().push(key.to_string());
            Ok(())
        }
        async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
            anyhow::bail!("no object {key}")
        }
        async fn delete_objects(&self, keys: &[String]) -> Result<()> {
            self.keys.lock().unwrap().retain(|k| !keys.contains(k));
            Ok(())
        }
        async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
            Ok(self
                .keys
                .lock()
                .unwrap()
                .iter()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect())
        }
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn keeps_newest_retention_keys() {
        let stream_id = Uuid::new_v4();
        let keys: Vec<String> = (0..10)
            .map(|i| format!("frames/{stream_id}/frame-{i:02}.jpg"))
            .collect();
        let blobs = FakeBlobs {
            keys: Mutex::new(keys),
        };

        let deleted = sweep_stream_frames(&blobs, stream_id, 3).await.unwrap();
        assert_eq!(deleted, 7);

        let remaining = blobs
            .list_objects(&format!("frames/{stream_id}/"))
            .await
            .unwrap();
        assert_eq!(remaining.len(), 3);
        // tail of the listing order survives
        assert!(remaining[0].ends_with("frame-07.jpg"));
    }

    #[tokio::test]
    async fn under_retention_is_a_no_op() {
        let stream_id = Uuid::new_v4();
        let blobs = FakeBlobs {
            keys: Mutex::new(vec![format!("frames/{stream_id}/only.jpg")]),
        };
        let deleted = sweep_stream_frames(&blobs, stream_id, 5).await.unwrap();
        assert_eq!(deleted, 0);
    }
}
