use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::daemon::queue::{TaskMessage, TaskQueue};
use crate::errors::PipelineError;
use crate::models::{ErrorKind, JobId, Stage, StageParams, TaskError, TaskRecord, TaskState};
use crate::storage::{JobLayout, StatusStore};

/// Returned on submission; enough for a caller to poll the record.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TaskHandle {
    pub task_id: Uuid,
    pub job_id: JobId,
    pub stage: Stage,
    pub attempt: u32,
    pub status_url: String,
}

/// Accepts stage submissions and hands them to the queue. It never runs
/// anything itself.
pub struct Dispatcher {
    layout: JobLayout,
    store: Arc<dyn StatusStore>,
    queue: Arc<dyn TaskQueue>,
    // Serializes the check-then-create sequence with other submissions and
    // with retention deletes.
    admission: Arc<Mutex<()>>,
}

impl Dispatcher {
    pub fn new(
        layout: JobLayout,
        store: Arc<dyn StatusStore>,
        queue: Arc<dyn TaskQueue>,
        admission: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            layout,
            store,
            queue,
            admission,
        }
    }

    /// Mint a job id and create its directory tree.
    pub async fn create_job(&self) -> Result<JobId> {
        let job_id = JobId::mint();
        tokio::fs::create_dir_all(self.layout.uploads_dir(&job_id))
            .await
            .map_err(PipelineError::from)?;
        tracing::info!("Created job {}", job_id);
        Ok(job_id)
    }

    pub async fn job_exists(&self, job_id: &JobId) -> bool {
        tokio::fs::metadata(self.layout.job_dir(job_id))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    pub async fn submit(&self, job_id: &JobId, params: StageParams) -> Result<TaskHandle> {
        params.validate()?;
        let stage = params.stage();
        let _guard = self.admission.lock().await;

        if !self.job_exists(job_id).await {
            return Err(PipelineError::NotFound(format!("Job '{}' does not exist", job_id)).into());
        }

        let uploads = self.layout.uploads_dir(job_id);
        for name in params.referenced_uploads() {
            if !tokio::fs::try_exists(uploads.join(name)).await.unwrap_or(false) {
                return Err(PipelineError::InvalidRequest(format!(
                    "Upload '{}' not found for job '{}'",
                    name, job_id
                ))
                .into());
            }
        }

        if let Some(previous) = stage.previous() {
            let prior = self.store.get(job_id, previous).await?;
            match prior.as_ref().map(|r| r.state) {
                Some(TaskState::Succeeded) => {}
                Some(state) => {
                    return Err(PipelineError::Conflict(format!(
                        "{} requires {} to have succeeded; it is {}",
                        stage, previous, state
                    ))
                    .into());
                }
                None => {
                    return Err(PipelineError::Conflict(format!(
                        "{} requires {} to have succeeded; it was never submitted",
                        stage, previous
                    ))
                    .into());
                }
            }
        }

        if let Some(active) = self
            .store
            .list_for_job(job_id)
            .await?
            .into_iter()
            .find(|r| r.state.is_active())
        {
            return Err(PipelineError::Conflict(format!(
                "Job '{}' already has {} task {} in state {}",
                job_id, active.stage, active.task_id, active.state
            ))
            .into());
        }

        let record = self.store.create(job_id, params).await?;
        let message = TaskMessage {
            task_id: record.task_id,
            job_id: job_id.clone(),
            stage,
        };
        if let Err(e) = self.queue.publish(message).await {
            let error = TaskError::new(ErrorKind::Resource, format!("Could not enqueue task: {:#}", e));
            if let Err(store_err) = self
                .store
                .fail_pending(job_id, stage, record.task_id, error)
                .await
            {
                tracing::error!(
                    "Failed to record enqueue failure for task {}: {:#}",
                    record.task_id,
                    store_err
                );
            }
            return Err(e);
        }

        tracing::info!(
            "Submitted {} for job {} as task {} (attempt {})",
            stage,
            job_id,
            record.task_id,
            record.attempt
        );
        Ok(handle_for(&record))
    }

    pub async fn abandon(&self, job_id: &JobId, stage: Stage) -> Result<TaskRecord> {
        let record = self.store.mark_abandoned(job_id, stage).await?;
        tracing::info!("Task {} marked abandoned ({})", record.task_id, record.state);
        Ok(record)
    }

    pub async fn status(&self, job_id: &JobId, stage: Stage) -> Result<TaskRecord> {
        self.store.get(job_id, stage).await?.ok_or_else(|| {
            PipelineError::NotFound(format!("No {} task for job '{}'", stage, job_id)).into()
        })
    }

    pub async fn job_status(&self, job_id: &JobId) -> Result<Vec<TaskRecord>> {
        if !self.job_exists(job_id).await {
            return Err(PipelineError::NotFound(format!("Job '{}' does not exist", job_id)).into());
        }
        self.store.list_for_job(job_id).await
    }

    /// Publish every PENDING record again. Used at startup, since the
    /// in-process queue does not survive a restart. A record the queue will
    /// not take is failed with `Resource` so its job can be resubmitted.
    pub async fn requeue_pending(&self) -> Result<usize> {
        let mut count = 0;
        for record in self.store.list_all().await? {
            if record.state != TaskState::Pending {
                continue;
            }
            let message = TaskMessage {
                task_id: record.task_id,
                job_id: record.job_id.clone(),
                stage: record.stage,
            };
            match self.queue.publish(message).await {
                Ok(()) => count += 1,
                Err(e) => {
                    tracing::warn!(
                        "Task {} ({} for job {}) could not be re-queued: {:#}",
                        record.task_id,
                        record.stage,
                        record.job_id,
                        e
                    );
                    let error = TaskError::new(
                        ErrorKind::Resource,
                        format!("Could not re-queue task after restart: {:#}", e),
                    );
                    self.store
                        .fail_pending(&record.job_id, record.stage, record.task_id, error)
                        .await?;
                }
            }
        }
        if count > 0 {
            tracing::info!("Re-queued {} pending tasks", count);
        }
        Ok(count)
    }
}

fn handle_for(record: &TaskRecord) -> TaskHandle {
    TaskHandle {
        task_id: record.task_id,
        job_id: record.job_id.clone(),
        stage: record.stage,
        attempt: record.attempt,
        status_url: format!("/api/jobs/{}/stages/{}", record.job_id, record.stage),
    }
}
