use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::errors::PipelineError;
use crate::models::{
    Clock, ErrorKind, JobId, Stage, StageParams, TaskError, TaskOutcome, TaskRecord, TaskState,
};
use crate::storage::{ClaimToken, JobLayout, StatusStore};

type Key = (JobId, Stage);

/// Status records kept as one `status.json` per stage directory, mirrored in
/// memory. Writes to one job are serialized by that job's lock, so
/// transitions on a key are totally ordered; different jobs write in
/// parallel.
pub struct JsonStatusStore {
    layout: JobLayout,
    clock: Arc<dyn Clock>,
    cache: RwLock<HashMap<Key, TaskRecord>>,
    job_locks: std::sync::Mutex<HashMap<JobId, Arc<Mutex<()>>>>,
}

impl JsonStatusStore {
    /// Load every status file under the layout root, creating the root.
    ///
    /// A file that does not parse, or that describes a different job or
    /// stage than its location, is moved to `status.json.bak` and skipped.
    pub async fn new(layout: JobLayout, clock: Arc<dyn Clock>) -> Result<Self> {
        tokio::fs::create_dir_all(layout.root())
            .await
            .context("Failed to create job storage root")?;
        Self::load(layout, clock, true).await
    }

    /// Load every status file without touching the tree. Unreadable files
    /// are skipped in place and a missing root reads as empty.
    pub async fn open_read_only(layout: JobLayout, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::load(layout, clock, false).await
    }

    async fn load(layout: JobLayout, clock: Arc<dyn Clock>, quarantine: bool) -> Result<Self> {
        let mut records = HashMap::new();
        for job_id in layout
            .list_job_ids()
            .context("Failed to list job directories")?
        {
            for stage in Stage::ALL {
                let path = layout.status_file(&job_id, stage);
                let content = match tokio::fs::read_to_string(&path).await {
                    Ok(content) => content,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => {
                        return Err(e)
                            .with_context(|| format!("Failed to read {}", path.display()))
                    }
                };
                let problem = match serde_json::from_str::<TaskRecord>(&content) {
                    Ok(record) if record.job_id == job_id && record.stage == stage => {
                        records.insert((job_id.clone(), stage), record);
                        continue;
                    }
                    Ok(_) => "belongs to another job or stage".to_string(),
                    Err(e) => format!("is corrupted ({})", e),
                };
                if quarantine {
                    tracing::warn!("{} {}, moving it aside", path.display(), problem);
                    backup_corrupt(&path).await;
                } else {
                    tracing::warn!("{} {}, skipping it", path.display(), problem);
                }
            }
        }

        tracing::debug!("Loaded {} status records", records.len());

        Ok(Self {
            layout,
            clock,
            cache: RwLock::new(records),
            job_locks: std::sync::Mutex::new(HashMap::new()),
        })
    }

    fn job_lock(&self, job_id: &JobId) -> Arc<Mutex<()>> {
        let mut locks = self.job_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(job_id.clone()).or_default())
    }

    /// Atomically write one record to its stage directory.
    async fn persist(&self, record: &TaskRecord) -> Result<()> {
        let path = self.layout.status_file(&record.job_id, record.stage);
        let tmp_path = path.with_extension("json.tmp");

        let json = serde_json::to_string_pretty(record).context("Failed to serialize record")?;

        tokio::fs::write(&tmp_path, json.as_bytes())
            .await
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;

        tokio::fs::rename(&tmp_path, &path)
            .await
            .with_context(|| format!("Failed to rename {}", tmp_path.display()))?;

        Ok(())
    }

    /// Apply `f` to a copy of the record, persist it, then publish it to the
    /// cache. The cache never holds a state that failed to reach disk.
    async fn update<F>(&self, job_id: &JobId, stage: Stage, f: F) -> Result<TaskRecord>
    where
        F: FnOnce(&mut TaskRecord) -> Result<()> + Send,
    {
        let key = (job_id.clone(), stage);
        let lock = self.job_lock(job_id);
        let _guard = lock.lock().await;
        let mut next = self
            .cache
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| not_found(job_id, stage))?;

        f(&mut next)?;
        next.version += 1;
        next.updated_at = self.clock.now();

        self.persist(&next).await?;
        self.cache.write().await.insert(key, next.clone());
        Ok(next)
    }
}

async fn backup_corrupt(path: &Path) {
    let backup = path.with_extension("json.bak");
    if let Err(e) = tokio::fs::rename(path, &backup).await {
        tracing::error!("Failed to move aside {}: {}", path.display(), e);
    }
}

fn not_found(job_id: &JobId, stage: Stage) -> anyhow::Error {
    PipelineError::NotFound(format!("No {} task for job '{}'", stage, job_id)).into()
}

fn check_claim(record: &TaskRecord, token: &ClaimToken) -> Result<()> {
    if record.task_id != token.task_id
        || record.state != TaskState::Running
        || record.claim != Some(token.claim)
    {
        return Err(PipelineError::Conflict(format!(
            "Stale claim on {} task {} for job '{}'",
            token.stage, token.task_id, token.job_id
        ))
        .into());
    }
    Ok(())
}

#[async_trait]
impl StatusStore for JsonStatusStore {
    async fn get(&self, job_id: &JobId, stage: Stage) -> Result<Option<TaskRecord>> {
        let cache = self.cache.read().await;
        Ok(cache.get(&(job_id.clone(), stage)).cloned())
    }

    async fn list_for_job(&self, job_id: &JobId) -> Result<Vec<TaskRecord>> {
        let cache = self.cache.read().await;
        let mut records: Vec<TaskRecord> = Stage::ALL
            .iter()
            .filter_map(|stage| cache.get(&(job_id.clone(), *stage)).cloned())
            .collect();
        records.sort_by_key(|r| r.stage);
        Ok(records)
    }

    async fn list_all(&self) -> Result<Vec<TaskRecord>> {
        let cache = self.cache.read().await;
        let mut records: Vec<TaskRecord> = cache.values().cloned().collect();
        records.sort_by(|a, b| a.job_id.cmp(&b.job_id).then(a.stage.cmp(&b.stage)));
        Ok(records)
    }

    async fn create(&self, job_id: &JobId, params: StageParams) -> Result<TaskRecord> {
        let stage = params.stage();
        let key = (job_id.clone(), stage);
        let lock = self.job_lock(job_id);
        let _guard = lock.lock().await;

        let existing = self.cache.read().await.get(&key).cloned();
        let attempt = match existing {
            Some(existing) if existing.state.is_active() => {
                return Err(PipelineError::Conflict(format!(
                    "Job '{}' already has a {} {} task ({})",
                    job_id, existing.state, stage, existing.task_id
                ))
                .into());
            }
            Some(existing) => existing.attempt + 1,
            None => 1,
        };

        let record = TaskRecord::pending(job_id.clone(), params, attempt, self.clock.now());

        tokio::fs::create_dir_all(self.layout.stage_dir(job_id, stage))
            .await
            .context("Failed to create stage directory")?;
        self.persist(&record).await?;
        self.cache.write().await.insert(key, record.clone());

        Ok(record)
    }

    async fn claim(&self, job_id: &JobId, stage: Stage, task_id: Uuid) -> Result<ClaimToken> {
        let claim = Uuid::now_v7();
        let now = self.clock.now();
        self.update(job_id, stage, |record| {
            if record.task_id != task_id {
                return Err(PipelineError::Conflict(format!(
                    "Task {} was superseded by {}",
                    task_id, record.task_id
                ))
                .into());
            }
            if record.state != TaskState::Pending {
                return Err(PipelineError::Conflict(format!(
                    "Task {} is already {}",
                    task_id, record.state
                ))
                .into());
            }
            record.state = TaskState::Running;
            record.claim = Some(claim);
            record.started_at = Some(now);
            record.message = "Running".to_string();
            Ok(())
        })
        .await?;

        Ok(ClaimToken {
            job_id: job_id.clone(),
            stage,
            task_id,
            claim,
        })
    }

    async fn report_progress(&self, token: &ClaimToken, message: &str) -> Result<TaskRecord> {
        self.update(&token.job_id, token.stage, |record| {
            check_claim(record, token)?;
            record.message = message.to_string();
            Ok(())
        })
        .await
    }

    async fn finish(&self, token: &ClaimToken, outcome: TaskOutcome) -> Result<TaskRecord> {
        let now = self.clock.now();
        self.update(&token.job_id, token.stage, |record| {
            check_claim(record, token)?;
            match outcome {
                TaskOutcome::Succeeded(result) => {
                    record.state = TaskState::Succeeded;
                    record.message = "Completed".to_string();
                    record.result = Some(result);
                }
                TaskOutcome::Failed(mut error) => {
                    if error.message.trim().is_empty() {
                        error.message = format!("{:?} with no further detail", error.kind);
                    }
                    record.state = TaskState::Failed;
                    record.message = error.message.clone();
                    record.error = Some(error);
                }
            }
            record.finished_at = Some(now);
            record.claim = None;
            Ok(())
        })
        .await
    }

    async fn fail_pending(
        &self,
        job_id: &JobId,
        stage: Stage,
        task_id: Uuid,
        error: TaskError,
    ) -> Result<TaskRecord> {
        let now = self.clock.now();
        self.update(job_id, stage, |record| {
            if record.task_id != task_id || record.state != TaskState::Pending {
                return Err(PipelineError::Conflict(format!(
                    "Task {} is no longer pending",
                    task_id
                ))
                .into());
            }
            record.state = TaskState::Failed;
            record.message = error.message.clone();
            record.error = Some(error);
            record.finished_at = Some(now);
            Ok(())
        })
        .await
    }

    async fn mark_abandoned(&self, job_id: &JobId, stage: Stage) -> Result<TaskRecord> {
        self.update(job_id, stage, |record| {
            if record.state.is_terminal() {
                return Err(PipelineError::Conflict(format!(
                    "Task {} already finished as {}",
                    record.task_id, record.state
                ))
                .into());
            }
            record.abandoned = true;
            record.message = format!("{} (abandoned)", record.message);
            Ok(())
        })
        .await
    }

    async fn remove_job(&self, job_id: &JobId) -> Result<usize> {
        let lock = self.job_lock(job_id);
        let _guard = lock.lock().await;
        let removed = {
            let mut cache = self.cache.write().await;
            let before = cache.len();
            cache.retain(|(id, _), _| id != job_id);
            before - cache.len()
        };
        let mut locks = self.job_locks.lock().unwrap_or_else(|e| e.into_inner());
        if Arc::strong_count(&lock) == 2 {
            locks.remove(job_id);
        }
        Ok(removed)
    }

    async fn recover_interrupted(&self) -> Result<Vec<TaskRecord>> {
        let running: Vec<Key> = {
            let cache = self.cache.read().await;
            cache
                .iter()
                .filter(|(_, r)| r.state == TaskState::Running)
                .map(|(k, _)| k.clone())
                .collect()
        };

        let now = self.clock.now();
        let mut recovered = Vec::with_capacity(running.len());
        for (job_id, stage) in running {
            let record = self
                .update(&job_id, stage, |record| {
                    if record.state != TaskState::Running {
                        return Ok(());
                    }
                    let error = TaskError::new(
                        ErrorKind::Interrupted,
                        "Daemon stopped while the task was running",
                    );
                    record.state = TaskState::Failed;
                    record.message = error.message.clone();
                    record.error = Some(error);
                    record.finished_at = Some(now);
                    record.claim = None;
                    Ok(())
                })
                .await?;
            recovered.push(record);
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FakeClock;
    use crate::models::{DetectParams, StageResult};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn job(id: &str) -> JobId {
        JobId::parse(id).expect("job id")
    }

    fn detect() -> StageParams {
        StageParams::DetectPockets(DetectParams::default())
    }

    async fn setup_store() -> (JsonStatusStore, Arc<FakeClock>, TempDir) {
        let tmp_dir = TempDir::new().expect("create temp dir");
        let clock = Arc::new(FakeClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        ));
        let store = JsonStatusStore::new(JobLayout::new(tmp_dir.path()), clock.clone())
            .await
            .expect("create store");
        (store, clock, tmp_dir)
    }

    fn success() -> TaskOutcome {
        TaskOutcome::Succeeded(StageResult {
            output_dir: "out".into(),
            output_files: vec!["pockets.csv".to_string()],
            metrics: BTreeMap::new(),
            exit_code: 0,
            duration_secs: 1.0,
        })
    }

    #[tokio::test]
    async fn test_create_writes_pending_record() {
        let (store, _clock, tmp) = setup_store().await;
        let record = store.create(&job("abc123"), detect()).await.expect("create");
        assert_eq!(record.state, TaskState::Pending);
        assert_eq!(record.attempt, 1);
        assert!(tmp
            .path()
            .join("abc123/detect_pockets/status.json")
            .exists());

        let fetched = store
            .get(&job("abc123"), Stage::DetectPockets)
            .await
            .expect("get")
            .expect("found");
        assert_eq!(fetched, record);
    }

    #[tokio::test]
    async fn test_create_rejects_active_duplicate() {
        let (store, _clock, _tmp) = setup_store().await;
        let first = store.create(&job("abc123"), detect()).await.expect("create");
        let err = store.create(&job("abc123"), detect()).await.unwrap_err();
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::Conflict(msg)) => {
                assert!(msg.contains(&first.task_id.to_string()))
            }
            other => panic!("Expected Conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_after_terminal_starts_fresh() {
        let (store, _clock, _tmp) = setup_store().await;
        let first = store.create(&job("abc123"), detect()).await.expect("create");
        let token = store
            .claim(&job("abc123"), Stage::DetectPockets, first.task_id)
            .await
            .expect("claim");
        store.finish(&token, success()).await.expect("finish");

        let second = store.create(&job("abc123"), detect()).await.expect("recreate");
        assert_ne!(second.task_id, first.task_id);
        assert_eq!(second.attempt, 2);
        assert_eq!(second.state, TaskState::Pending);
        assert!(second.result.is_none());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let (store, _clock, _tmp) = setup_store().await;
        let record = store.create(&job("abc123"), detect()).await.expect("create");
        store
            .claim(&job("abc123"), Stage::DetectPockets, record.task_id)
            .await
            .expect("first claim");
        let second = store
            .claim(&job("abc123"), Stage::DetectPockets, record.task_id)
            .await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_claim_rejects_superseded_task() {
        let (store, _clock, _tmp) = setup_store().await;
        store.create(&job("abc123"), detect()).await.expect("create");
        let result = store
            .claim(&job("abc123"), Stage::DetectPockets, Uuid::now_v7())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_stale_token_cannot_write() {
        let (store, _clock, _tmp) = setup_store().await;
        let record = store.create(&job("abc123"), detect()).await.expect("create");
        let token = store
            .claim(&job("abc123"), Stage::DetectPockets, record.task_id)
            .await
            .expect("claim");
        let forged = ClaimToken {
            claim: Uuid::now_v7(),
            ..token.clone()
        };
        assert!(store.report_progress(&forged, "hijack").await.is_err());
        assert!(store.finish(&forged, success()).await.is_err());

        let updated = store
            .report_progress(&token, "frame 10")
            .await
            .expect("progress");
        assert_eq!(updated.message, "frame 10");
    }

    #[tokio::test]
    async fn test_versions_and_timestamps_advance() {
        let (store, clock, _tmp) = setup_store().await;
        let record = store.create(&job("abc123"), detect()).await.expect("create");
        clock.advance(chrono::Duration::seconds(30));
        let token = store
            .claim(&job("abc123"), Stage::DetectPockets, record.task_id)
            .await
            .expect("claim");
        clock.advance(chrono::Duration::seconds(30));
        let done = store.finish(&token, success()).await.expect("finish");

        assert_eq!(done.version, record.version + 2);
        assert!(done.updated_at > record.updated_at);
        assert!(done.finished_at.is_some());
        assert!(done.claim.is_none());
        assert!(store.report_progress(&token, "late").await.is_err());
    }

    #[tokio::test]
    async fn test_failure_gets_non_empty_message() {
        let (store, _clock, _tmp) = setup_store().await;
        let record = store.create(&job("abc123"), detect()).await.expect("create");
        let token = store
            .claim(&job("abc123"), Stage::DetectPockets, record.task_id)
            .await
            .expect("claim");
        let done = store
            .finish(
                &token,
                TaskOutcome::Failed(TaskError::new(ErrorKind::ToolFailure, "")),
            )
            .await
            .expect("finish");
        assert_eq!(done.state, TaskState::Failed);
        assert!(!done.error.expect("error").message.is_empty());
    }

    #[tokio::test]
    async fn test_records_survive_reload() {
        let (store, clock, tmp) = setup_store().await;
        let record = store.create(&job("abc123"), detect()).await.expect("create");
        drop(store);

        let reloaded = JsonStatusStore::new(JobLayout::new(tmp.path()), clock)
            .await
            .expect("reload");
        let fetched = reloaded
            .get(&job("abc123"), Stage::DetectPockets)
            .await
            .expect("get")
            .expect("found");
        assert_eq!(fetched, record);
    }

    #[tokio::test]
    async fn test_corrupt_status_file_is_moved_aside() {
        let tmp = TempDir::new().expect("create temp dir");
        let stage_dir = tmp.path().join("abc123/docking");
        std::fs::create_dir_all(&stage_dir).expect("mkdir");
        std::fs::write(stage_dir.join("status.json"), b"{not json").expect("write");

        let store = JsonStatusStore::new(
            JobLayout::new(tmp.path()),
            Arc::new(FakeClock::new(Utc::now())),
        )
        .await
        .expect("load");
        assert!(store.list_all().await.expect("list").is_empty());
        assert!(stage_dir.join("status.json.bak").exists());
        assert!(!stage_dir.join("status.json").exists());
    }

    #[tokio::test]
    async fn test_fail_pending_and_abandon() {
        let (store, _clock, _tmp) = setup_store().await;
        let record = store.create(&job("abc123"), detect()).await.expect("create");

        let abandoned = store
            .mark_abandoned(&job("abc123"), Stage::DetectPockets)
            .await
            .expect("abandon");
        assert!(abandoned.abandoned);
        assert_eq!(abandoned.state, TaskState::Pending);

        let failed = store
            .fail_pending(
                &job("abc123"),
                Stage::DetectPockets,
                record.task_id,
                TaskError::new(ErrorKind::Abandoned, "Abandoned before start"),
            )
            .await
            .expect("fail");
        assert_eq!(failed.state, TaskState::Failed);
        assert!(store
            .mark_abandoned(&job("abc123"), Stage::DetectPockets)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_recover_interrupted_fails_running_only() {
        let (store, _clock, _tmp) = setup_store().await;
        let running = store.create(&job("job-a"), detect()).await.expect("create");
        store
            .claim(&job("job-a"), Stage::DetectPockets, running.task_id)
            .await
            .expect("claim");
        store.create(&job("job-b"), detect()).await.expect("create");

        let recovered = store.recover_interrupted().await.expect("recover");
        assert_eq!(recovered.len(), 1);
        assert_eq!(
            recovered[0].error.as_ref().map(|e| e.kind),
            Some(ErrorKind::Interrupted)
        );
        let pending = store
            .get(&job("job-b"), Stage::DetectPockets)
            .await
            .expect("get")
            .expect("found");
        assert_eq!(pending.state, TaskState::Pending);
    }

    #[tokio::test]
    async fn test_remove_job_drops_only_that_job() {
        let (store, _clock, _tmp) = setup_store().await;
        store.create(&job("job-a"), detect()).await.expect("create");
        store.create(&job("job-b"), detect()).await.expect("create");
        assert_eq!(store.remove_job(&job("job-a")).await.expect("remove"), 1);
        let all = store.list_all().await.expect("list");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].job_id, job("job-b"));
    }

    #[tokio::test]
    async fn test_concurrent_progress_on_one_job_is_serialized() {
        let (store, _clock, _tmp) = setup_store().await;
        let store = Arc::new(store);
        let record = store.create(&job("abc123"), detect()).await.expect("create");
        let token = store
            .claim(&job("abc123"), Stage::DetectPockets, record.task_id)
            .await
            .expect("claim");
        let other = store.create(&job("def456"), detect()).await.expect("create");

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                store
                    .report_progress(&token, &format!("frame {}", i))
                    .await
                    .expect("progress")
                    .version
            }));
        }
        let mut versions = Vec::new();
        for handle in handles {
            versions.push(handle.await.expect("join"));
        }
        versions.sort();
        versions.dedup();
        assert_eq!(versions.len(), 16);

        let current = store
            .get(&job("abc123"), Stage::DetectPockets)
            .await
            .expect("get")
            .expect("found");
        assert_eq!(current.version, record.version + 17);
        let untouched = store
            .get(&job("def456"), Stage::DetectPockets)
            .await
            .expect("get")
            .expect("found");
        assert_eq!(untouched, other);
    }

    #[tokio::test]
    async fn test_read_only_open_leaves_tree_alone() {
        let tmp = TempDir::new().expect("create temp dir");
        let good = {
            let store = JsonStatusStore::new(
                JobLayout::new(tmp.path()),
                Arc::new(FakeClock::new(Utc::now())),
            )
            .await
            .expect("load");
            store.create(&job("abc123"), detect()).await.expect("create")
        };
        let bad_dir = tmp.path().join("def456/docking");
        std::fs::create_dir_all(&bad_dir).expect("mkdir");
        std::fs::write(bad_dir.join("status.json"), b"{not json").expect("write");

        let store = JsonStatusStore::open_read_only(
            JobLayout::new(tmp.path()),
            Arc::new(FakeClock::new(Utc::now())),
        )
        .await
        .expect("load");
        assert_eq!(store.list_all().await.expect("list"), vec![good]);
        assert!(bad_dir.join("status.json").exists());
        assert!(!bad_dir.join("status.json.bak").exists());

        let missing = tmp.path().join("never-created");
        let empty = JsonStatusStore::open_read_only(
            JobLayout::new(&missing),
            Arc::new(FakeClock::new(Utc::now())),
        )
        .await
        .expect("load");
        assert!(empty.list_all().await.expect("list").is_empty());
        assert!(!missing.exists());
    }
}
