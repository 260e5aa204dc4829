// CLI resource commands: usage, oldest, cleanup. These work on the storage
// root directly and do not need a running daemon.

use std::path::Path;

use anyhow::Result;

use super::format_bytes;
use crate::daemon::{self, open_services, OpenMode, PidFile, Services};

async fn services(
    config: Option<&Path>,
    data_dir: Option<&Path>,
    mode: OpenMode,
) -> Result<Services> {
    let config = daemon::resolve_config(config, data_dir)?;
    config.validate()?;
    open_services(config, mode).await
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// pocketd usage
pub async fn cmd_usage(config: Option<&Path>, data_dir: Option<&Path>, json: bool) -> Result<()> {
    let services = services(config, data_dir, OpenMode::ReadOnly).await?;
    let report = services.resources.usage_report().await?;
    let level = services.resources.classify(report.usage_pct);

    if json {
        return print_json(&serde_json::json!({ "level": level, "report": report }));
    }
    println!("Root:      {}", services.layout.root().display());
    println!(
        "Used:      {} of {} ({:.1}%)",
        format_bytes(report.used_bytes),
        format_bytes(report.quota_bytes),
        report.usage_pct
    );
    println!("Level:     {:?}", level);
    println!("Jobs:      {}", report.job_count);
    println!("Files:     {}", report.file_count);
    if let Some(available) = report.available_bytes {
        println!("Available: {}", format_bytes(available));
    }
    Ok(())
}

/// pocketd oldest
pub async fn cmd_oldest(
    config: Option<&Path>,
    data_dir: Option<&Path>,
    count: usize,
    json: bool,
) -> Result<()> {
    let services = services(config, data_dir, OpenMode::ReadOnly).await?;
    let jobs = services.resources.oldest_jobs(count).await?;

    if json {
        return print_json(&jobs);
    }
    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }
    println!("{:<36} {:>8}  LAST MODIFIED", "JOB", "AGE (d)");
    for job in &jobs {
        println!(
            "{:<36} {:>8}  {}",
            job.job_id,
            job.age_days,
            job.modified_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

/// pocketd cleanup
pub async fn cmd_cleanup(
    config: Option<&Path>,
    data_dir: Option<&Path>,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let resolved = daemon::resolve_config(config, data_dir)?;
    let root = daemon::resolve_data_dir(resolved.data_dir.as_deref());
    if !dry_run && PidFile::for_data_dir(&root).is_alive() {
        anyhow::bail!(
            "A daemon is running on {}; use the daemon's cleanup endpoint or pass --dry-run",
            root.display()
        );
    }

    let mode = if dry_run {
        OpenMode::ReadOnly
    } else {
        OpenMode::ReadWrite
    };
    let services = services(config, data_dir, mode).await?;
    let report = services.resources.cleanup_old_jobs(dry_run).await?;

    if json {
        return print_json(&report);
    }
    let verb = if dry_run { "Would delete" } else { "Deleted" };
    println!(
        "{} {} job(s) older than {} days ({})",
        verb,
        report.reclaimed.len(),
        services.resources.retention_days(),
        format_bytes(report.reclaimed_bytes)
    );
    for job_id in &report.reclaimed {
        println!("  {}", job_id);
    }
    for job_id in &report.skipped_active {
        println!("  {} skipped: task still active", job_id);
    }
    for failure in &report.failed {
        eprintln!("  {} failed: {}", failure.job_id, failure.error);
    }
    if report.failed.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("{} job(s) could not be deleted", report.failed.len())
    }
}
