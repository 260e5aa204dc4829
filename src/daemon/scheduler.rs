use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::daemon::resources::{ResourceManager, UsageLevel, UsageReport};
use crate::models::{Clock, PipelineConfig};

// ---------------------------------------------------------------------------
// compute_next_run
// ---------------------------------------------------------------------------

/// Next firing of a cron schedule strictly after `after`, evaluated in UTC.
pub fn compute_next_run(schedule: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let cron = croner::Cron::from_str(schedule)
        .map_err(|e| anyhow::anyhow!("Invalid cron expression '{}': {}", schedule, e))?;
    cron.find_next_occurrence(&after, false)
        .map_err(|e| anyhow::anyhow!("Cron next occurrence error: {}", e))
}

// ---------------------------------------------------------------------------
// Maintenance jobs
// ---------------------------------------------------------------------------

#[async_trait]
pub trait MaintenanceJob: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self) -> Result<()>;
}

/// Daily retention sweep.
pub struct CleanupSweep {
    resources: Arc<ResourceManager>,
}

impl CleanupSweep {
    pub fn new(resources: Arc<ResourceManager>) -> Self {
        Self { resources }
    }
}

#[async_trait]
impl MaintenanceJob for CleanupSweep {
    fn name(&self) -> &str {
        "cleanup"
    }

    async fn run(&self) -> Result<()> {
        let report = self.resources.cleanup_old_jobs(false).await?;
        if let Ok(usage) = self.resources.usage_report().await {
            tracing::info!(
                "Cleanup sweep removed {} jobs; disk usage now {:.1}%",
                report.reclaimed.len(),
                usage.usage_pct
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UsageSignal {
    pub level: UsageLevel,
    pub report: UsageReport,
}

/// Measure usage and emit a log line at the severity matching its level.
/// Never deletes anything.
pub async fn check_usage(resources: &ResourceManager) -> Result<UsageSignal> {
    let report = match resources.usage_report().await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!("Disk usage check failed: {:#}", e);
            return Err(e);
        }
    };
    let level = resources.classify(report.usage_pct);
    let gib = |b: u64| b as f64 / 1_073_741_824.0;
    match level {
        UsageLevel::Critical => tracing::error!(
            "CRITICAL: disk usage at {:.1}% ({:.2} GiB of {:.2} GiB)",
            report.usage_pct,
            gib(report.used_bytes),
            gib(report.quota_bytes)
        ),
        UsageLevel::Warning => tracing::warn!(
            "WARNING: disk usage at {:.1}% ({:.2} GiB of {:.2} GiB)",
            report.usage_pct,
            gib(report.used_bytes),
            gib(report.quota_bytes)
        ),
        UsageLevel::Ok => tracing::info!(
            "Disk usage: {:.1}% ({:.2} GiB of {:.2} GiB)",
            report.usage_pct,
            gib(report.used_bytes),
            gib(report.quota_bytes)
        ),
    }
    Ok(UsageSignal { level, report })
}

/// Periodic disk usage check.
pub struct UsageCheck {
    resources: Arc<ResourceManager>,
}

impl UsageCheck {
    pub fn new(resources: Arc<ResourceManager>) -> Self {
        Self { resources }
    }
}

#[async_trait]
impl MaintenanceJob for UsageCheck {
    fn name(&self) -> &str {
        "usage-check"
    }

    async fn run(&self) -> Result<()> {
        check_usage(&self.resources).await.map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// Trigger loop
// ---------------------------------------------------------------------------

/// Fires one maintenance job on a cron schedule, independent of the task
/// queue. Runs are sequential, so a slow sweep delays its own next firing
/// rather than overlapping it.
pub struct MaintenanceTrigger {
    schedule: String,
    job: Arc<dyn MaintenanceJob>,
    clock: Arc<dyn Clock>,
}

impl MaintenanceTrigger {
    pub fn new(schedule: &str, job: Arc<dyn MaintenanceJob>, clock: Arc<dyn Clock>) -> Result<Self> {
        compute_next_run(schedule, clock.now())?;
        Ok(Self {
            schedule: schedule.to_string(),
            job,
            clock,
        })
    }

    /// Runs until the task is aborted.
    pub async fn run(&self) -> Result<()> {
        loop {
            let now = self.clock.now();
            let next = compute_next_run(&self.schedule, now)?;
            let sleep_duration = (next - now).to_std().unwrap_or(Duration::ZERO);

            tokio::time::sleep(sleep_duration).await;

            if self.clock.now() < next {
                continue;
            }
            tracing::debug!("Running maintenance job '{}'", self.job.name());
            if let Err(e) = self.job.run().await {
                tracing::error!("Maintenance job '{}' failed: {:#}", self.job.name(), e);
            }
        }
    }
}

/// Start the cleanup and usage-check triggers. The caller aborts the
/// handles on shutdown.
pub fn spawn_maintenance(
    config: &PipelineConfig,
    resources: Arc<ResourceManager>,
    clock: Arc<dyn Clock>,
) -> Result<Vec<JoinHandle<()>>> {
    let triggers = [
        MaintenanceTrigger::new(
            &config.cleanup_schedule,
            Arc::new(CleanupSweep::new(resources.clone())),
            clock.clone(),
        )?,
        MaintenanceTrigger::new(
            &config.usage_check_schedule,
            Arc::new(UsageCheck::new(resources)),
            clock,
        )?,
    ];

    Ok(triggers
        .into_iter()
        .map(|trigger| {
            tokio::spawn(async move {
                if let Err(e) = trigger.run().await {
                    tracing::error!("Maintenance trigger stopped: {:#}", e);
                }
            })
        })
        .collect())
}

// ===========================================================================
// Tests
// ===========================================================================
