use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::daemon::executor::Executor;
use crate::errors::PipelineError;
use crate::models::{JobId, Stage};

/// What travels over the queue. Everything else is read from the status
/// store when the message is consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskMessage {
    pub task_id: Uuid,
    pub job_id: JobId,
    pub stage: Stage,
}

/// Transport between the dispatcher and the workers. Delivery is
/// at-least-once; consumers tolerate duplicates.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn publish(&self, message: TaskMessage) -> Result<()>;
}

/// In-process queue backed by a bounded mpsc channel.
pub struct ChannelQueue {
    tx: mpsc::Sender<TaskMessage>,
}

/// Consuming side of a [`ChannelQueue`], shared by every worker.
pub struct TaskReceiver {
    rx: Mutex<mpsc::Receiver<TaskMessage>>,
}

impl TaskReceiver {
    pub async fn recv(&self) -> Option<TaskMessage> {
        self.rx.lock().await.recv().await
    }
}

pub fn channel_queue(capacity: usize) -> (ChannelQueue, TaskReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        ChannelQueue { tx },
        TaskReceiver {
            rx: Mutex::new(rx),
        },
    )
}

#[async_trait]
impl TaskQueue for ChannelQueue {
    async fn publish(&self, message: TaskMessage) -> Result<()> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(m) => PipelineError::Resource(format!(
                "Task queue is full; {} task for job '{}' not accepted",
                m.stage, m.job_id
            )),
            mpsc::error::TrySendError::Closed(_) => {
                PipelineError::Internal("Task queue is closed".to_string())
            }
        })?;
        Ok(())
    }
}

/// Start `count` workers pulling from the shared receiver. Each worker runs
/// one task at a time.
pub fn spawn_workers(
    count: usize,
    receiver: Arc<TaskReceiver>,
    executor: Arc<Executor>,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|worker| {
            let receiver = Arc::clone(&receiver);
            let executor = Arc::clone(&executor);
            tokio::spawn(async move {
                tracing::debug!("Worker {} started", worker);
                while let Some(message) = receiver.recv().await {
                    executor.execute(message).await;
                }
                tracing::debug!("Worker {} stopped: queue closed", worker);
            })
        })
        .collect()
}
