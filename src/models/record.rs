use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{JobId, Stage, StageParams};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "PENDING",
            TaskState::Running => "RUNNING",
            TaskState::Succeeded => "SUCCEEDED",
            TaskState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Classification carried by every FAILED record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorKind {
    ToolFailure,
    Timeout,
    Resource,
    Abandoned,
    Interrupted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
    /// Tail of the tool's combined output, already truncated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            diagnostics: None,
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: String) -> Self {
        if !diagnostics.is_empty() {
            self.diagnostics = Some(diagnostics);
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageResult {
    pub output_dir: PathBuf,
    pub output_files: Vec<String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, u64>,
    pub exit_code: i32,
    pub duration_secs: f64,
}

/// How a claimed task ended; the store turns it into a terminal record.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Succeeded(StageResult),
    Failed(TaskError),
}

/// Status of one (job_id, stage) pair, persisted as the stage's `status.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub task_id: Uuid,
    pub job_id: JobId,
    pub stage: Stage,
    pub state: TaskState,
    pub params: StageParams,
    pub attempt: u32,
    /// Bumped on every write; stale writers are rejected by the store.
    pub version: u64,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StageResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    #[serde(default)]
    pub abandoned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim: Option<Uuid>,
}

impl TaskRecord {
    pub fn pending(
        job_id: JobId,
        params: StageParams,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: Uuid::now_v7(),
            job_id,
            stage: params.stage(),
            state: TaskState::Pending,
            params,
            attempt,
            version: 1,
            message: "Queued".to_string(),
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            abandoned: false,
            claim: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DetectParams;

    fn make_record() -> TaskRecord {
        TaskRecord::pending(
            JobId::parse("abc123").expect("job id"),
            StageParams::DetectPockets(DetectParams::default()),
            1,
            Utc::now(),
        )
    }

    #[test]
    fn test_pending_record_defaults() {
        let record = make_record();
        assert_eq!(record.state, TaskState::Pending);
        assert_eq!(record.stage, Stage::DetectPockets);
        assert_eq!(record.version, 1);
        assert!(record.claim.is_none());
        assert!(record.error.is_none());
    }

    #[test]
    fn test_task_state_serde_uses_upper_case() {
        let json = serde_json::to_string(&TaskState::Succeeded).expect("serialize");
        assert_eq!(json, "\"SUCCEEDED\"");
        let state: TaskState = serde_json::from_str("\"RUNNING\"").expect("deserialize");
        assert_eq!(state, TaskState::Running);
        assert_eq!(state.to_string(), "RUNNING");
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::Failed.is_terminal());
    }

    #[test]
    fn test_record_serde_roundtrip_with_error() {
        let mut record = make_record();
        record.state = TaskState::Failed;
        record.error = Some(
            TaskError::new(ErrorKind::Timeout, "exceeded 3600s").with_diagnostics("tail".into()),
        );
        let json = serde_json::to_string(&record).expect("serialize");
        let back: TaskRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, record);
        assert!(!json.contains("\"result\""));
    }

    #[test]
    fn test_empty_diagnostics_are_dropped() {
        let err = TaskError::new(ErrorKind::ToolFailure, "exit 1").with_diagnostics(String::new());
        assert!(err.diagnostics.is_none());
    }
}
