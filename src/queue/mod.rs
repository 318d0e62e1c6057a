//! Durable-queue seam: task types, queue trait, and the in-process
//! implementation the single-node deployment runs on.

pub mod worker;

pub use worker::{PoolWorkerCount, TaskDispatcher, WorkerPool};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

/// One unit of background work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Task {
    /// Run the next pipeline stage for a document (the entry task).
    ProcessDocument { document_id: String },
    /// One OCR fan-out unit. `attempt` counts prior tries of this chunk.
    OcrChunk {
        chunk_id: String,
        #[serde(default)]
        attempt: u32,
    },
    /// Run a single stage of a job; `force` bypasses already-done
    /// short-circuits.
    StageTask {
        job_id: String,
        stage: String,
        force: bool,
    },
    // Maintenance
    RecoverStaleJobs,
    DispatchStuckQueued { stale_minutes: i64 },
    SyncStaleJobStatus { stale_minutes: i64 },
    CleanupStaleChunks { retention_hours: i64 },
}

/// The queue workers consume from. Dispatch never blocks the caller beyond
/// queue backpressure; the countdown delays visibility, not the call.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn dispatch(&self, task: Task, countdown: Duration);
    /// Next task, or None when the queue is closed.
    async fn recv(&self) -> Option<Task>;
}

/// Bounded in-process queue. Countdowns ride on timer tasks; the bounded
/// channel is the backpressure surface.
pub struct MemoryTaskQueue {
    tx: mpsc::Sender<Task>,
    rx: Mutex<mpsc::Receiver<Task>>,
    depth: AtomicUsize,
}

impl MemoryTaskQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(capacity);
        Arc::new(Self {
            tx,
            rx: Mutex::new(rx),
            depth: AtomicUsize::new(0),
        })
    }

    /// Tasks enqueued and not yet received.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn dispatch(&self, task: Task, countdown: Duration) {
        self.depth.fetch_add(1, Ordering::SeqCst);
        if countdown.is_zero() {
            if self.tx.send(task).await.is_err() {
                self.depth.fetch_sub(1, Ordering::SeqCst);
                warn!("task queue closed; task dropped");
            }
            return;
        }
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(countdown).await;
            if tx.send(task).await.is_err() {
                warn!("task queue closed; delayed task dropped");
            }
        });
    }

    async fn recv(&self) -> Option<Task> {
        let task = self.rx.lock().await.recv().await;
        if task.is_some() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        task
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dispatch_and_recv() {
        let queue = MemoryTaskQueue::new(8);
        queue
            .dispatch(
                Task::ProcessDocument {
                    document_id: "doc-1".into(),
                },
                Duration::ZERO,
            )
            .await;
        assert_eq!(queue.depth(), 1);

        let task = queue.recv().await.unwrap();
        assert_eq!(
            task,
            Task::ProcessDocument {
                document_id: "doc-1".into()
            }
        );
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_delays_visibility() {
        let queue = MemoryTaskQueue::new(8);
        queue
            .dispatch(Task::RecoverStaleJobs, Duration::from_secs(5))
            .await;

        // Nothing visible until the countdown elapses.
        tokio::time::sleep(Duration::from_secs(1)).await;
        let quick = tokio::time::timeout(Duration::from_millis(1), queue.recv()).await;
        assert!(quick.is_err());

        tokio::time::sleep(Duration::from_secs(5)).await;
        let task = queue.recv().await.unwrap();
        assert_eq!(task, Task::RecoverStaleJobs);
    }

    #[test]
    fn test_task_serde_round_trip() {
        let task = Task::StageTask {
            job_id: "j-1".into(),
            stage: "embedding".into(),
            force: true,
        };
        let json = serde_json::to_string(&task).unwrap();
        assert_eq!(serde_json::from_str::<Task>(&json).unwrap(), task);
    }
}
