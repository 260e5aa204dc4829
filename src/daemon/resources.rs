use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use walkdir::WalkDir;

use crate::errors::PipelineError;
use crate::models::{Clock, JobId, PipelineConfig};
use crate::storage::layout::{STAGING_PREFIX, TRASH_PREFIX};
use crate::storage::{JobLayout, StatusStore};

/// Staging directories younger than this may belong to an upload in flight.
const STALE_STAGING_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UsageLevel {
    Ok,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UsageReport {
    pub used_bytes: u64,
    pub quota_bytes: u64,
    pub usage_pct: f64,
    pub job_count: usize,
    pub file_count: u64,
    /// Free space on the filesystem holding the job root, when it can be read.
    pub available_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JobAge {
    pub job_id: JobId,
    pub age_days: u64,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CleanupFailure {
    pub job_id: JobId,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CleanupReport {
    pub dry_run: bool,
    /// Jobs deleted, or that would be deleted on a dry run.
    pub reclaimed: Vec<JobId>,
    pub skipped_active: Vec<JobId>,
    pub failed: Vec<CleanupFailure>,
    pub reclaimed_bytes: u64,
    pub scratch_removed: usize,
}

/// Disk accounting and retention for the job storage root.
///
/// Tree walks run on the blocking pool so a sweep never stalls request
/// handling. Sweeps are serialized with each other. The decision to delete a
/// job and the rename that retires it happen under the admission lock the
/// dispatcher holds while submitting.
pub struct ResourceManager {
    layout: JobLayout,
    store: Arc<dyn StatusStore>,
    clock: Arc<dyn Clock>,
    retention_days: u64,
    quota_bytes: u64,
    warning_pct: f64,
    critical_pct: f64,
    reclaim_active: bool,
    sweep_lock: Mutex<()>,
    admission: Arc<Mutex<()>>,
}

fn to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

/// Size and file count of a tree. Entries that vanish mid-walk are skipped.
fn tree_size(path: &Path) -> (u64, u64) {
    let mut bytes = 0;
    let mut files = 0;
    for entry in WalkDir::new(path).follow_links(false).into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(meta) = entry.metadata() {
            bytes += meta.len();
            files += 1;
        }
    }
    (bytes, files)
}

fn remove_tree(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

impl ResourceManager {
    pub fn new(
        layout: JobLayout,
        store: Arc<dyn StatusStore>,
        config: &PipelineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            layout,
            store,
            clock,
            retention_days: config.cleanup_after_days,
            quota_bytes: config.quota_bytes(),
            warning_pct: config.usage_warning_pct,
            critical_pct: config.usage_critical_pct,
            reclaim_active: config.reclaim_active_jobs,
            sweep_lock: Mutex::new(()),
            admission: Arc::new(Mutex::new(())),
        }
    }

    /// Lock shared with the dispatcher so a job cannot gain a task while it
    /// is being retired.
    pub fn admission(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.admission)
    }

    pub fn retention_days(&self) -> u64 {
        self.retention_days
    }

    pub fn classify(&self, usage_pct: f64) -> UsageLevel {
        if usage_pct > self.critical_pct {
            UsageLevel::Critical
        } else if usage_pct > self.warning_pct {
            UsageLevel::Warning
        } else {
            UsageLevel::Ok
        }
    }

    pub async fn usage_report(&self) -> Result<UsageReport> {
        let root = self.layout.root().to_path_buf();
        let quota_bytes = self.quota_bytes;

        tokio::task::spawn_blocking(move || -> Result<UsageReport> {
            let meta = std::fs::metadata(&root).map_err(|e| {
                PipelineError::Resource(format!(
                    "Job storage root {} is unreachable: {}",
                    root.display(),
                    e
                ))
            })?;
            if !meta.is_dir() {
                return Err(PipelineError::Resource(format!(
                    "Job storage root {} is not a directory",
                    root.display()
                ))
                .into());
            }

            let (used_bytes, file_count) = tree_size(&root);
            let job_count = JobLayout::new(&root).list_job_ids()?.len();
            let available_bytes = fs4::available_space(&root).ok();
            let usage_pct = if quota_bytes > 0 {
                used_bytes as f64 / quota_bytes as f64 * 100.0
            } else {
                0.0
            };

            Ok(UsageReport {
                used_bytes,
                quota_bytes,
                usage_pct,
                job_count,
                file_count,
                available_bytes,
            })
        })
        .await
        .context("Usage walk panicked")?
    }

    /// Jobs by age in whole days, oldest first; ties broken by job id.
    pub async fn oldest_jobs(&self, count: usize) -> Result<Vec<JobAge>> {
        let mut ages = self.job_ages().await?;
        ages.truncate(count);
        Ok(ages)
    }

    async fn job_ages(&self) -> Result<Vec<JobAge>> {
        let layout = self.layout.clone();
        let now = self.clock.now();

        let mut ages = tokio::task::spawn_blocking(move || -> Result<Vec<JobAge>> {
            let mut ages = Vec::new();
            for job_id in layout.list_job_ids()? {
                let modified = match std::fs::metadata(layout.job_dir(&job_id))
                    .and_then(|m| m.modified())
                {
                    Ok(t) => to_utc(t),
                    Err(e) => {
                        tracing::warn!("Cannot read age of job {}: {}", job_id, e);
                        continue;
                    }
                };
                let age_days = (now - modified).num_days().max(0) as u64;
                ages.push(JobAge {
                    job_id,
                    age_days,
                    modified_at: modified,
                });
            }
            Ok(ages)
        })
        .await
        .context("Job age scan panicked")??;

        ages.sort_by(|a, b| {
            b.age_days
                .cmp(&a.age_days)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        Ok(ages)
    }

    /// Whether a job has a task that may still be running. Records whose
    /// last update is older than the retention window count as dead.
    async fn has_live_task(&self, job_id: &JobId) -> Result<bool> {
        let window = chrono::Duration::days(self.retention_days as i64);
        let now = self.clock.now();
        let records = self.store.list_for_job(job_id).await?;
        Ok(records
            .iter()
            .any(|r| r.state.is_active() && now - r.updated_at <= window))
    }

    /// Reclaim every job older than the retention period.
    ///
    /// A dry run only reads. Otherwise each job directory is renamed out of
    /// the job namespace and its records are forgotten, then the renamed
    /// tree is removed. A directory that is already gone counts as reclaimed.
    pub async fn cleanup_old_jobs(&self, dry_run: bool) -> Result<CleanupReport> {
        let _guard = self.sweep_lock.lock().await;
        let mut report = CleanupReport {
            dry_run,
            ..Default::default()
        };

        if !dry_run {
            report.scratch_removed = self.purge_scratch().await?;
        }

        let expired: Vec<JobAge> = self
            .job_ages()
            .await?
            .into_iter()
            .filter(|a| a.age_days > self.retention_days)
            .collect();

        for age in expired {
            let job_id = age.job_id;

            if dry_run {
                if !self.reclaim_active && self.has_live_task(&job_id).await? {
                    report.skipped_active.push(job_id);
                    continue;
                }
                let job_dir = self.layout.job_dir(&job_id);
                let (bytes, _) = tokio::task::spawn_blocking(move || tree_size(&job_dir))
                    .await
                    .context("Size walk panicked")?;
                tracing::info!(
                    "[DRY RUN] Would delete job {} ({} days old, {} bytes)",
                    job_id,
                    age.age_days,
                    bytes
                );
                report.reclaimed_bytes += bytes;
                report.reclaimed.push(job_id);
                continue;
            }

            let retired = {
                let _admission = self.admission.lock().await;
                if !self.reclaim_active && self.has_live_task(&job_id).await? {
                    None
                } else {
                    Some(self.retire_job(&job_id).await)
                }
            };

            match retired {
                None => {
                    tracing::info!(
                        "Skipping job {} ({} days old): a task is still active",
                        job_id,
                        age.age_days
                    );
                    report.skipped_active.push(job_id);
                }
                Some(Ok(trash)) => {
                    let bytes = match trash {
                        Some(trash) => self.remove_retired(&job_id, trash).await?,
                        None => 0,
                    };
                    tracing::info!(
                        "Deleted job {} ({} days old, {} bytes)",
                        job_id,
                        age.age_days,
                        bytes
                    );
                    report.reclaimed_bytes += bytes;
                    report.reclaimed.push(job_id);
                }
                Some(Err(e)) => {
                    tracing::error!("Failed to delete job {}: {:#}", job_id, e);
                    report.failed.push(CleanupFailure {
                        job_id,
                        error: format!("{:#}", e),
                    });
                }
            }
        }

        tracing::info!(
            "Cleanup {}: {} reclaimed, {} skipped, {} failed, {} bytes",
            if dry_run { "dry run" } else { "complete" },
            report.reclaimed.len(),
            report.skipped_active.len(),
            report.failed.len(),
            report.reclaimed_bytes
        );
        Ok(report)
    }

    /// Rename the job directory out of the job namespace and forget its
    /// records. Returns the renamed path, or `None` if the directory was
    /// already gone.
    async fn retire_job(&self, job_id: &JobId) -> Result<Option<PathBuf>> {
        let job_dir = self.layout.job_dir(job_id);
        let trash = self.layout.trash_dir(job_id);

        let renamed = tokio::task::spawn_blocking(move || -> std::io::Result<Option<PathBuf>> {
            match std::fs::rename(&job_dir, &trash) {
                Ok(()) => Ok(Some(trash)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await
        .context("Rename task panicked")?
        .with_context(|| format!("Failed to retire job directory for {}", job_id))?;

        self.store.remove_job(job_id).await?;
        Ok(renamed)
    }

    /// Remove a retired tree. A failure leaves it for the next scratch purge.
    async fn remove_retired(&self, job_id: &JobId, trash: PathBuf) -> Result<u64> {
        let job_id = job_id.clone();
        tokio::task::spawn_blocking(move || {
            let (bytes, _) = tree_size(&trash);
            if let Err(e) = remove_tree(&trash) {
                tracing::warn!(
                    "Job {} is retired but {} could not be removed yet: {}",
                    job_id,
                    trash.display(),
                    e
                );
            }
            bytes
        })
        .await
        .context("Delete task panicked")
    }

    /// Remove leftovers of interrupted deletions and abandoned upload staging.
    async fn purge_scratch(&self) -> Result<usize> {
        let root = self.layout.root().to_path_buf();
        let now = SystemTime::now();

        tokio::task::spawn_blocking(move || -> Result<usize> {
            let entries = match std::fs::read_dir(&root) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
                Err(e) => return Err(e.into()),
            };
            let mut removed = 0;
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                let path: PathBuf = entry.path();
                let stale = if name.starts_with(TRASH_PREFIX) {
                    true
                } else if name.starts_with(STAGING_PREFIX) {
                    entry
                        .metadata()
                        .and_then(|m| m.modified())
                        .ok()
                        .and_then(|t| now.duration_since(t).ok())
                        .is_some_and(|age| age.as_secs() >= STALE_STAGING_SECS)
                } else {
                    false
                };
                if !stale {
                    continue;
                }
                match remove_tree(&path) {
                    Ok(()) => {
                        tracing::info!("Removed scratch directory {}", name);
                        removed += 1;
                    }
                    Err(e) => tracing::warn!("Failed to remove scratch {}: {}", name, e),
                }
            }
            Ok(removed)
        })
        .await
        .context("Scratch purge panicked")?
    }

    /// Refuse work that would push the job root past its quota or the
    /// filesystem past full.
    pub async fn ensure_capacity(&self, bytes: u64) -> Result<()> {
        let report = self.usage_report().await?;
        if report.used_bytes.saturating_add(bytes) > report.quota_bytes {
            return Err(PipelineError::Resource(format!(
                "Disk quota exceeded: {} bytes used of {} bytes, {} more requested",
                report.used_bytes, report.quota_bytes, bytes
            ))
            .into());
        }
        if let Some(available) = report.available_bytes {
            if bytes > available {
                return Err(PipelineError::Resource(format!(
                    "Insufficient disk space: {} bytes requested, {} bytes available",
                    bytes, available
                ))
                .into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FakeClock;
    use crate::models::{DetectParams, StageParams};
    use crate::storage::JsonStatusStore;
    use std::time::Duration;
    use tempfile::TempDir;

    const DAY: Duration = Duration::from_secs(86_400);

    struct Fixture {
        manager: ResourceManager,
        store: Arc<JsonStatusStore>,
        clock: Arc<FakeClock>,
        layout: JobLayout,
        _tmp: TempDir,
    }

    async fn setup(config: PipelineConfig) -> Fixture {
        let tmp = TempDir::new().expect("create temp dir");
        let layout = JobLayout::new(tmp.path().join("jobs"));
        let clock = Arc::new(FakeClock::new(Utc::now()));
        let store = Arc::new(
            JsonStatusStore::new(layout.clone(), clock.clone())
                .await
                .expect("store"),
        );
        let manager = ResourceManager::new(layout.clone(), store.clone(), &config, clock.clone());
        Fixture {
            manager,
            store,
            clock,
            layout,
            _tmp: tmp,
        }
    }

    fn job(id: &str) -> JobId {
        JobId::parse(id).expect("job id")
    }

    /// Create a job directory holding `bytes` bytes, last modified `age` ago.
    fn make_job(layout: &JobLayout, id: &str, bytes: usize, age: Duration) {
        let dir = layout.uploads_dir(&job(id));
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(dir.join("traj.xtc"), vec![7u8; bytes]).expect("write");
        set_age(&layout.job_dir(&job(id)), age);
    }

    /// Ages get an extra minute so whole-day boundaries are not crossed by
    /// the time the test itself takes.
    fn set_age(path: &Path, age: Duration) {
        let when = SystemTime::now() - age - Duration::from_secs(60);
        std::fs::File::open(path)
            .expect("open dir")
            .set_modified(when)
            .expect("set mtime");
    }

    #[tokio::test]
    async fn test_usage_report_counts_bytes_and_jobs() {
        let fx = setup(PipelineConfig {
            max_disk_usage_gb: 1,
            ..Default::default()
        })
        .await;
        make_job(&fx.layout, "job-a", 1000, Duration::ZERO);
        make_job(&fx.layout, "job-b", 24, Duration::ZERO);

        let report = fx.manager.usage_report().await.expect("report");
        assert_eq!(report.used_bytes, 1024);
        assert_eq!(report.file_count, 2);
        assert_eq!(report.job_count, 2);
        assert_eq!(report.quota_bytes, 1_073_741_824);
        assert!(report.usage_pct > 0.0 && report.usage_pct < 0.001);
    }

    #[tokio::test]
    async fn test_usage_report_unreachable_root() {
        let fx = setup(PipelineConfig::default()).await;
        std::fs::remove_dir_all(fx.layout.root()).expect("remove root");
        let err = fx.manager.usage_report().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Resource(_))
        ));
    }

    #[tokio::test]
    async fn test_classify_thresholds() {
        let fx = setup(PipelineConfig::default()).await;
        assert_eq!(fx.manager.classify(10.0), UsageLevel::Ok);
        assert_eq!(fx.manager.classify(75.0), UsageLevel::Ok);
        assert_eq!(fx.manager.classify(80.0), UsageLevel::Warning);
        assert_eq!(fx.manager.classify(90.5), UsageLevel::Critical);
    }

    #[tokio::test]
    async fn test_oldest_jobs_orders_by_age_then_id() {
        let fx = setup(PipelineConfig::default()).await;
        make_job(&fx.layout, "young", 1, DAY);
        make_job(&fx.layout, "old", 1, DAY * 40);
        make_job(&fx.layout, "mid", 1, DAY * 10);

        let oldest = fx.manager.oldest_jobs(2).await.expect("oldest");
        let ids: Vec<&str> = oldest.iter().map(|a| a.job_id.as_str()).collect();
        assert_eq!(ids, vec!["old", "mid"]);
        assert_eq!(oldest[0].age_days, 40);

        assert!(fx.manager.oldest_jobs(0).await.expect("oldest").is_empty());
        assert_eq!(fx.manager.oldest_jobs(10).await.expect("oldest").len(), 3);
    }

    #[tokio::test]
    async fn test_job_31_days_old_is_reclaimed() {
        let fx = setup(PipelineConfig {
            cleanup_after_days: 30,
            ..Default::default()
        })
        .await;
        make_job(&fx.layout, "abc123", 10, DAY * 31);
        make_job(&fx.layout, "fresh", 10, DAY * 29);

        let oldest = fx.manager.oldest_jobs(1).await.expect("oldest");
        assert_eq!(oldest[0].job_id, job("abc123"));
        assert_eq!(oldest[0].age_days, 31);

        let report = fx.manager.cleanup_old_jobs(false).await.expect("cleanup");
        assert_eq!(report.reclaimed, vec![job("abc123")]);
        assert_eq!(report.reclaimed_bytes, 10);
        assert!(!fx.layout.job_dir(&job("abc123")).exists());
        assert!(fx.layout.job_dir(&job("fresh")).exists());

        let again = fx.manager.cleanup_old_jobs(false).await.expect("cleanup");
        assert!(again.reclaimed.is_empty());
    }

    #[tokio::test]
    async fn test_exactly_threshold_age_is_kept() {
        let fx = setup(PipelineConfig {
            cleanup_after_days: 30,
            ..Default::default()
        })
        .await;
        make_job(&fx.layout, "edge", 1, DAY * 30 + Duration::from_secs(600));
        let report = fx.manager.cleanup_old_jobs(false).await.expect("cleanup");
        assert!(report.reclaimed.is_empty());
        assert!(fx.layout.job_dir(&job("edge")).exists());
    }

    #[tokio::test]
    async fn test_dry_run_never_mutates() {
        let fx = setup(PipelineConfig::default()).await;
        make_job(&fx.layout, "old", 100, DAY * 60);
        std::fs::create_dir_all(fx.layout.trash_dir(&job("gone"))).expect("mkdir trash");

        let report = fx.manager.cleanup_old_jobs(true).await.expect("dry run");
        assert!(report.dry_run);
        assert_eq!(report.reclaimed, vec![job("old")]);
        assert_eq!(report.reclaimed_bytes, 100);
        assert_eq!(report.scratch_removed, 0);
        assert!(fx.layout.job_dir(&job("old")).exists());
        let scratch = std::fs::read_dir(fx.layout.root())
            .expect("read root")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(TRASH_PREFIX))
            .count();
        assert_eq!(scratch, 1);
    }

    #[tokio::test]
    async fn test_cleanup_removes_records_and_trash() {
        let fx = setup(PipelineConfig::default()).await;
        make_job(&fx.layout, "old", 1, Duration::ZERO);
        let record = fx
            .store
            .create(&job("old"), StageParams::DetectPockets(DetectParams::default()))
            .await
            .expect("create");
        let token = fx
            .store
            .claim(&job("old"), record.stage, record.task_id)
            .await
            .expect("claim");
        fx.store
            .finish(
                &token,
                crate::models::TaskOutcome::Failed(crate::models::TaskError::new(
                    crate::models::ErrorKind::ToolFailure,
                    "exit 1",
                )),
            )
            .await
            .expect("finish");
        set_age(&fx.layout.job_dir(&job("old")), DAY * 45);
        std::fs::create_dir_all(fx.layout.trash_dir(&job("gone"))).expect("mkdir trash");

        let report = fx.manager.cleanup_old_jobs(false).await.expect("cleanup");
        assert_eq!(report.reclaimed, vec![job("old")]);
        assert_eq!(report.scratch_removed, 1);
        assert!(fx.store.list_for_job(&job("old")).await.expect("list").is_empty());
        assert_eq!(std::fs::read_dir(fx.layout.root()).expect("read").count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_records_dropped_when_tree_removal_fails() {
        use std::os::unix::fs::PermissionsExt;

        let fx = setup(PipelineConfig::default()).await;
        make_job(&fx.layout, "old", 1, Duration::ZERO);
        let locked = fx.layout.uploads_dir(&job("old")).join("locked");
        std::fs::create_dir_all(&locked).expect("mkdir");
        std::fs::write(locked.join("frame.pdb"), b"ATOM").expect("write");
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555))
            .expect("chmod");
        fx.store
            .create(&job("old"), StageParams::DetectPockets(DetectParams::default()))
            .await
            .expect("create");
        fx.clock.advance(chrono::Duration::days(31));
        set_age(&fx.layout.job_dir(&job("old")), DAY * 45);

        let report = fx.manager.cleanup_old_jobs(false).await.expect("cleanup");
        assert_eq!(report.reclaimed, vec![job("old")]);
        assert!(report.failed.is_empty());
        assert!(fx.store.list_for_job(&job("old")).await.expect("list").is_empty());
        assert!(!fx.layout.job_dir(&job("old")).exists());

        for entry in walkdir::WalkDir::new(fx.layout.root()).into_iter().flatten() {
            if entry.file_type().is_dir() {
                let _ = std::fs::set_permissions(
                    entry.path(),
                    std::fs::Permissions::from_mode(0o755),
                );
            }
        }
    }

    #[tokio::test]
    async fn test_cleanup_waits_for_admission() {
        let fx = setup(PipelineConfig::default()).await;
        make_job(&fx.layout, "old", 1, DAY * 45);

        let admission = fx.manager.admission();
        let held = admission.lock().await;
        let blocked =
            tokio::time::timeout(Duration::from_millis(200), fx.manager.cleanup_old_jobs(false))
                .await;
        assert!(blocked.is_err());
        assert!(fx.layout.job_dir(&job("old")).exists());

        drop(held);
        let report = fx.manager.cleanup_old_jobs(false).await.expect("cleanup");
        assert_eq!(report.reclaimed, vec![job("old")]);
        assert!(!fx.layout.job_dir(&job("old")).exists());
    }

    #[tokio::test]
    async fn test_cleanup_skips_job_with_live_task() {
        let fx = setup(PipelineConfig::default()).await;
        make_job(&fx.layout, "busy", 1, Duration::ZERO);
        fx.store
            .create(&job("busy"), StageParams::DetectPockets(DetectParams::default()))
            .await
            .expect("create");
        set_age(&fx.layout.job_dir(&job("busy")), DAY * 45);

        let report = fx.manager.cleanup_old_jobs(false).await.expect("cleanup");
        assert!(report.reclaimed.is_empty());
        assert_eq!(report.skipped_active, vec![job("busy")]);
        assert!(fx.layout.job_dir(&job("busy")).exists());

        // A pending record untouched for longer than the window is dead.
        fx.clock.advance(chrono::Duration::days(31));
        let report = fx.manager.cleanup_old_jobs(false).await.expect("cleanup");
        assert_eq!(report.reclaimed, vec![job("busy")]);
    }

    #[tokio::test]
    async fn test_reclaim_active_jobs_ignores_live_tasks() {
        let fx = setup(PipelineConfig {
            reclaim_active_jobs: true,
            ..Default::default()
        })
        .await;
        make_job(&fx.layout, "busy", 1, Duration::ZERO);
        fx.store
            .create(&job("busy"), StageParams::DetectPockets(DetectParams::default()))
            .await
            .expect("create");
        set_age(&fx.layout.job_dir(&job("busy")), DAY * 45);

        let report = fx.manager.cleanup_old_jobs(false).await.expect("cleanup");
        assert_eq!(report.reclaimed, vec![job("busy")]);
    }

    #[tokio::test]
    async fn test_ensure_capacity_against_quota() {
        let fx = setup(PipelineConfig {
            max_disk_usage_gb: 1,
            ..Default::default()
        })
        .await;
        make_job(&fx.layout, "job-a", 1000, Duration::ZERO);
        assert!(fx.manager.ensure_capacity(1024).await.is_ok());
        let err = fx
            .manager
            .ensure_capacity(1_073_741_824)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Resource(_))
        ));
    }
}
