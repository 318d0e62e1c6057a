//! Progress broadcaster: best-effort realtime events keyed by matter.
//!
//! The job store remains the source of truth; consumers must tolerate
//! duplicates and re-ordering.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

use crate::models::JobStatus;

/// Event published on a matter's channel whenever job state or progress
/// changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProgressEvent {
    pub job_id: String,
    pub matter_id: String,
    pub document_id: Option<String>,
    pub status: JobStatus,
    pub stage: Option<String>,
    pub progress_pct: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Channel name for a matter's progress events.
pub fn matter_channel(matter_id: &str) -> String {
    format!("matter:{matter_id}")
}

/// Opaque realtime transport.
#[async_trait]
pub trait Broadcast: Send + Sync {
    /// Best-effort publish; failures are logged by implementations, never
    /// propagated into job state.
    async fn publish(&self, channel: &str, event: JobProgressEvent);
}

/// In-process fan-out over tokio broadcast channels, one per matter channel.
///
/// Slow subscribers drop events (bounded ring); that matches the
/// delivery-is-best-effort contract.
pub struct ChannelBroadcast {
    channels: RwLock<HashMap<String, tokio::sync::broadcast::Sender<JobProgressEvent>>>,
    capacity: usize,
}

impl ChannelBroadcast {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Subscribe to a channel, creating it on first use.
    pub fn subscribe(&self, channel: &str) -> tokio::sync::broadcast::Receiver<JobProgressEvent> {
        let mut channels = self.channels.write().expect("broadcast lock poisoned");
        channels
            .entry(channel.to_string())
            .or_insert_with(|| tokio::sync::broadcast::channel(self.capacity).0)
            .subscribe()
    }
}

impl Default for ChannelBroadcast {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Broadcast for ChannelBroadcast {
    async fn publish(&self, channel: &str, event: JobProgressEvent) {
        let sender = {
            let channels = self.channels.read().expect("broadcast lock poisoned");
            channels.get(channel).cloned()
        };
        match sender {
            Some(sender) => {
                // Err means no live subscribers; fine for best-effort delivery.
                let _ = sender.send(event);
            }
            None => {
                debug!(channel, "progress event dropped: no subscribers");
            }
        }
    }
}

/// No-op broadcaster for CLI one-shots and tests.
pub struct NullBroadcast;

#[async_trait]
impl Broadcast for NullBroadcast {
    async fn publish(&self, _channel: &str, _event: JobProgressEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let broadcast = ChannelBroadcast::default();
        let channel = matter_channel("m-1");
        let mut rx = broadcast.subscribe(&channel);

        broadcast
            .publish(
                &channel,
                JobProgressEvent {
                    job_id: "j-1".into(),
                    matter_id: "m-1".into(),
                    document_id: None,
                    status: JobStatus::Processing,
                    stage: Some("ocr".into()),
                    progress_pct: 10,
                    error_message: None,
                },
            )
            .await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.job_id, "j-1");
        assert_eq!(event.progress_pct, 10);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let broadcast = ChannelBroadcast::default();
        broadcast
            .publish(
                &matter_channel("nobody"),
                JobProgressEvent {
                    job_id: "j".into(),
                    matter_id: "nobody".into(),
                    document_id: None,
                    status: JobStatus::Queued,
                    stage: None,
                    progress_pct: 0,
                    error_message: None,
                },
            )
            .await;
    }
}
