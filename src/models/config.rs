use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;
use crate::models::Stage;

const GIB: u64 = 1_073_741_824;

/// How one stage's external tool is invoked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub timeout_secs: u64,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl ToolConfig {
    fn pockethunter(subcommand: &str, timeout_secs: u64) -> Self {
        Self {
            program: "python".to_string(),
            args: vec![
                "PocketHunter/pockethunter.py".to_string(),
                subcommand.to_string(),
            ],
            timeout_secs,
            working_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    #[serde(default = "default_extract_tool")]
    pub extract_frames: ToolConfig,
    #[serde(default = "default_detect_tool")]
    pub detect_pockets: ToolConfig,
    #[serde(default = "default_cluster_tool")]
    pub cluster_pockets: ToolConfig,
    #[serde(default = "default_docking_tool")]
    pub docking: ToolConfig,
}

impl ToolsConfig {
    pub fn for_stage(&self, stage: Stage) -> &ToolConfig {
        match stage {
            Stage::ExtractFrames => &self.extract_frames,
            Stage::DetectPockets => &self.detect_pockets,
            Stage::ClusterPockets => &self.cluster_pockets,
            Stage::Docking => &self.docking,
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            extract_frames: default_extract_tool(),
            detect_pockets: default_detect_tool(),
            cluster_pockets: default_cluster_tool(),
            docking: default_docking_tool(),
        }
    }
}

fn default_extract_tool() -> ToolConfig {
    ToolConfig::pockethunter("extract_to_pdb", 1800)
}

fn default_detect_tool() -> ToolConfig {
    ToolConfig::pockethunter("detect_pockets", 3600)
}

fn default_cluster_tool() -> ToolConfig {
    ToolConfig::pockethunter("cluster_pockets", 1800)
}

fn default_docking_tool() -> ToolConfig {
    ToolConfig {
        program: "python".to_string(),
        args: vec!["dock_ensemble.py".to_string()],
        timeout_secs: 7200,
        working_dir: None,
    }
}

/// Per-client sliding windows on the upload and submission routes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_uploads")]
    pub max_uploads: usize,
    #[serde(default = "default_rate_window_secs")]
    pub upload_window_secs: u64,
    #[serde(default = "default_max_submissions")]
    pub max_submissions: usize,
    #[serde(default = "default_rate_window_secs")]
    pub submission_window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_uploads: default_max_uploads(),
            upload_window_secs: default_rate_window_secs(),
            max_submissions: default_max_submissions(),
            submission_window_secs: default_rate_window_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_uploads() -> usize {
    10
}

fn default_max_submissions() -> usize {
    20
}

fn default_rate_window_secs() -> u64 {
    60
}

/// Immutable daemon configuration, injected into every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,
    #[serde(default = "default_max_archive_size")]
    pub max_archive_size: u64,
    #[serde(default = "default_max_compression_ratio")]
    pub max_compression_ratio: u64,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,

    #[serde(default = "default_cleanup_after_days")]
    pub cleanup_after_days: u64,
    #[serde(default = "default_max_disk_usage_gb")]
    pub max_disk_usage_gb: u64,
    #[serde(default = "default_usage_warning_pct")]
    pub usage_warning_pct: f64,
    #[serde(default = "default_usage_critical_pct")]
    pub usage_critical_pct: f64,
    #[serde(default = "default_cleanup_schedule")]
    pub cleanup_schedule: String,
    #[serde(default = "default_usage_check_schedule")]
    pub usage_check_schedule: String,
    #[serde(default)]
    pub reclaim_active_jobs: bool,

    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_progress_interval_secs")]
    pub progress_interval_secs: u64,
    #[serde(default = "default_diagnostics_limit")]
    pub diagnostics_limit: usize,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8640
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_upload_size() -> u64 {
    524_288_000 // 500 MiB
}

fn default_max_archive_size() -> u64 {
    GIB
}

fn default_max_compression_ratio() -> u64 {
    100
}

fn default_allowed_extensions() -> Vec<String> {
    ["xtc", "pdb", "gro", "csv", "zip", "sdf", "pdbqt"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_cleanup_after_days() -> u64 {
    30
}

fn default_max_disk_usage_gb() -> u64 {
    100
}

fn default_usage_warning_pct() -> f64 {
    75.0
}

fn default_usage_critical_pct() -> f64 {
    90.0
}

fn default_cleanup_schedule() -> String {
    "0 2 * * *".to_string()
}

fn default_usage_check_schedule() -> String {
    "*/30 * * * *".to_string()
}

fn default_worker_count() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    256
}

fn default_progress_interval_secs() -> u64 {
    5
}

fn default_diagnostics_limit() -> usize {
    4096
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: None,
            log_level: default_log_level(),
            max_upload_size: default_max_upload_size(),
            max_archive_size: default_max_archive_size(),
            max_compression_ratio: default_max_compression_ratio(),
            allowed_extensions: default_allowed_extensions(),
            cleanup_after_days: default_cleanup_after_days(),
            max_disk_usage_gb: default_max_disk_usage_gb(),
            usage_warning_pct: default_usage_warning_pct(),
            usage_critical_pct: default_usage_critical_pct(),
            cleanup_schedule: default_cleanup_schedule(),
            usage_check_schedule: default_usage_check_schedule(),
            reclaim_active_jobs: false,
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            progress_interval_secs: default_progress_interval_secs(),
            diagnostics_limit: default_diagnostics_limit(),
            rate_limit: RateLimitConfig::default(),
            tools: ToolsConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn quota_bytes(&self) -> u64 {
        self.max_disk_usage_gb.saturating_mul(GIB)
    }

    /// Directory holding one subdirectory per job.
    ///
    /// Falls back to a relative `jobs/` when no data dir has been resolved,
    /// which only happens in tests that build configs by hand.
    pub fn jobs_root(&self) -> PathBuf {
        match self.data_dir {
            Some(ref d) => d.join("jobs"),
            None => PathBuf::from("jobs"),
        }
    }

    /// Check every limit and schedule, reporting all problems at once.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let mut errors = Vec::new();

        if self.max_upload_size == 0 {
            errors.push("max_upload_size must be positive".to_string());
        }
        if self.max_archive_size == 0 {
            errors.push("max_archive_size must be positive".to_string());
        }
        if self.max_archive_size < self.max_upload_size {
            errors.push(format!(
                "max_archive_size ({}) must not be smaller than max_upload_size ({})",
                self.max_archive_size, self.max_upload_size
            ));
        }
        if self.max_compression_ratio == 0 {
            errors.push("max_compression_ratio must be positive".to_string());
        }
        if self.allowed_extensions.is_empty() {
            errors.push("allowed_extensions must not be empty".to_string());
        }
        if self.cleanup_after_days == 0 {
            errors.push("cleanup_after_days must be positive".to_string());
        }
        if self.max_disk_usage_gb == 0 {
            errors.push("max_disk_usage_gb must be positive".to_string());
        }
        if !(self.usage_warning_pct > 0.0 && self.usage_warning_pct < self.usage_critical_pct) {
            errors.push(format!(
                "usage_warning_pct ({}) must be positive and below usage_critical_pct ({})",
                self.usage_warning_pct, self.usage_critical_pct
            ));
        }
        if self.worker_count == 0 {
            errors.push("worker_count must be at least 1".to_string());
        }
        if self.queue_capacity == 0 {
            errors.push("queue_capacity must be at least 1".to_string());
        }
        if self.progress_interval_secs == 0 {
            errors.push("progress_interval_secs must be positive".to_string());
        }
        if self.rate_limit.enabled {
            let limits = &self.rate_limit;
            if limits.max_uploads == 0 || limits.upload_window_secs == 0 {
                errors.push("rate_limit upload window and count must be positive".to_string());
            }
            if limits.max_submissions == 0 || limits.submission_window_secs == 0 {
                errors.push("rate_limit submission window and count must be positive".to_string());
            }
        }
        for (name, schedule) in [
            ("cleanup_schedule", &self.cleanup_schedule),
            ("usage_check_schedule", &self.usage_check_schedule),
        ] {
            if let Err(e) = croner::Cron::from_str(schedule) {
                errors.push(format!("{} '{}' is invalid: {}", name, schedule, e));
            }
        }
        let level = self.log_level.to_ascii_lowercase();
        if !["trace", "debug", "info", "warn", "error"].contains(&level.as_str()) {
            errors.push(format!("Invalid log_level '{}'", self.log_level));
        }
        for stage in Stage::ALL {
            let tool = self.tools.for_stage(stage);
            if tool.program.trim().is_empty() {
                errors.push(format!("tools.{}.program must not be empty", stage));
            }
            if tool.timeout_secs == 0 {
                errors.push(format!("tools.{}.timeout_secs must be positive", stage));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::InvalidRequest(format!(
                "Configuration validation failed: {}",
                errors.join("; ")
            )))
        }
    }
}
