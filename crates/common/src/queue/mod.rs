//! JetStream queue layer: frame tasks ride the FRAMES work-queue stream,
//! detection events the interest-retention EVENTS stream, and control
//! commands a raw pub-sub subject.

pub mod consumer;
pub mod producer;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{DetectionEvent, FrameTask};

pub const FRAMES_STREAM: &str = "FRAMES";
pub const FRAMES_SUBJECT_BASE: &str = "frames";
pub const EVENTS_STREAM: &str = "EVENTS";
pub const EVENTS_SUBJECT_BASE: &str = "events";
pub const CONTROL_SUBJECT: &str = "stream.control";

pub fn frame_subject(stream_id: &str) -> String {
    format!("{FRAMES_SUBJECT_BASE}.{stream_id}")
}

pub fn event_subject(stream_id: &str) -> String {
    format!("{EVENTS_SUBJECT_BASE}.{stream_id}")
}

/// What a handler wants done with the message it was given. Parse
/// failures must be `Ack` (the payload cannot become valid by retrying);
/// processing failures are `Retry` and ride the redelivery limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Retry,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: &[u8]) -> Disposition;
}

#[async_trait]
pub trait FramePublisher: Send + Sync {
    async fn publish_frame(&self, stream_id: &str, task: &FrameTask) -> Result<()>;
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_event(&self, stream_id: &str, event: &DetectionEvent) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subjects_are_keyed_by_stream_id() {
        assert_eq!(frame_subject("abc"), "frames.abc");
        assert_eq!(event_subject("abc"), "events.abc");
    }
}
