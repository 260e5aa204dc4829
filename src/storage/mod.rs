pub mod layout;
pub mod status;

pub use layout::JobLayout;
pub use status::JsonStatusStore;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{JobId, Stage, StageParams, TaskError, TaskOutcome, TaskRecord};

/// Proof that the holder moved a task out of PENDING. Only the holder may
/// write to the record until it is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimToken {
    pub job_id: JobId,
    pub stage: Stage,
    pub task_id: Uuid,
    pub claim: Uuid,
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn get(&self, job_id: &JobId, stage: Stage) -> Result<Option<TaskRecord>>;
    async fn list_for_job(&self, job_id: &JobId) -> Result<Vec<TaskRecord>>;
    async fn list_all(&self) -> Result<Vec<TaskRecord>>;
    /// Insert a PENDING record, replacing a terminal one. Fails with
    /// `Conflict` while the pair has a PENDING or RUNNING record.
    async fn create(&self, job_id: &JobId, params: StageParams) -> Result<TaskRecord>;
    async fn claim(&self, job_id: &JobId, stage: Stage, task_id: Uuid) -> Result<ClaimToken>;
    async fn report_progress(&self, token: &ClaimToken, message: &str) -> Result<TaskRecord>;
    async fn finish(&self, token: &ClaimToken, outcome: TaskOutcome) -> Result<TaskRecord>;
    async fn fail_pending(
        &self,
        job_id: &JobId,
        stage: Stage,
        task_id: Uuid,
        error: TaskError,
    ) -> Result<TaskRecord>;
    async fn mark_abandoned(&self, job_id: &JobId, stage: Stage) -> Result<TaskRecord>;
    /// Forget every record of a job. The files go with the job directory.
    async fn remove_job(&self, job_id: &JobId) -> Result<usize>;
    async fn recover_interrupted(&self) -> Result<Vec<TaskRecord>>;
}
