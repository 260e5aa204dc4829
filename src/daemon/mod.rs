pub mod dispatcher;
pub mod executor;
pub mod queue;
pub mod resources;
pub mod scheduler;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};

use crate::daemon::dispatcher::Dispatcher;
use crate::daemon::executor::Executor;
use crate::daemon::queue::{channel_queue, spawn_workers, TaskReceiver};
use crate::daemon::resources::ResourceManager;
use crate::daemon::scheduler::spawn_maintenance;
use crate::models::{Clock, SystemClock};
use crate::models::PipelineConfig;
use crate::server::rate_limit::RateLimits;
use crate::server::{self, AppState};
use crate::storage::{JobLayout, JsonStatusStore, StatusStore};
use crate::validation::UploadPolicy;

const APP_DIR: &str = "pocket-pipeline";
const PID_FILE: &str = "pocketd.pid";
const MAX_LOG_FILES: usize = 14;

// ---------------------------------------------------------------------------
// PidFile
// ---------------------------------------------------------------------------

/// Exclusive PID file. A live holder means a daemon owns the data directory.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn for_data_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(PID_FILE))
    }

    /// Create the file exclusively and write our PID. A stale file left by a
    /// dead process is replaced.
    pub fn acquire(&self) -> Result<()> {
        if self.path.exists() {
            let content =
                std::fs::read_to_string(&self.path).context("Failed to read existing PID file")?;
            let existing_pid: u32 = content
                .trim()
                .parse()
                .context("Failed to parse PID from PID file")?;

            if is_process_alive(existing_pid) {
                return Err(anyhow::anyhow!(
                    "Daemon is already running (PID {existing_pid}). PID file: {}",
                    self.path.display()
                ));
            }

            tracing::warn!(
                "Removing stale PID file (PID {} is no longer running)",
                existing_pid
            );
            std::fs::remove_file(&self.path).context("Failed to remove stale PID file")?;
        }

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .context("Failed to create PID file")?;
        let pid = std::process::id();
        write!(file, "{}", pid).context("Failed to write PID file")?;
        file.flush().context("Failed to flush PID file")?;

        tracing::info!("PID file acquired: {} (PID {})", self.path.display(), pid);
        Ok(())
    }

    pub fn release(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path).context("Failed to remove PID file")?;
            tracing::info!("PID file released: {}", self.path.display());
        }
        Ok(())
    }

    pub fn is_alive(&self) -> bool {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|content| content.trim().parse::<u32>().ok())
            .is_some_and(is_process_alive)
    }
}

/// kill(pid, 0) tests existence without delivering a signal.
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // SAFETY: signal 0 performs only the permission and existence check.
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

fn read_config(path: &Path) -> Result<PipelineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: PipelineConfig = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    tracing::info!("Loaded config from: {}", path.display());
    Ok(config)
}

/// Resolution order: explicit path, `POCKETD_CONFIG_DIR`, the platform config
/// dir, `<data_dir>/config.json`, then built-in defaults.
pub fn load_config(config_path: Option<&Path>) -> Result<PipelineConfig> {
    if let Some(path) = config_path {
        if path.exists() {
            return read_config(path);
        }
        return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
    }

    if let Ok(config_dir) = std::env::var("POCKETD_CONFIG_DIR") {
        let path = PathBuf::from(config_dir).join("config.json");
        if path.exists() {
            return read_config(&path);
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let path = config_dir.join(APP_DIR).join("config.json");
        if path.exists() {
            return read_config(&path);
        }
    }

    let path = resolve_data_dir(None).join("config.json");
    if path.exists() {
        return read_config(&path);
    }

    tracing::info!("No config file found, using defaults");
    Ok(PipelineConfig::default())
}

/// Data directory from an explicit override, `POCKETD_DATA_DIR`, or the
/// platform data dir.
pub fn resolve_data_dir(override_dir: Option<&Path>) -> PathBuf {
    if let Some(dir) = override_dir {
        return dir.to_path_buf();
    }
    if let Ok(d) = std::env::var("POCKETD_DATA_DIR") {
        return PathBuf::from(d);
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Load the config and pin its data directory: CLI flag, then the config
/// file's own `data_dir`, then the environment and platform defaults.
pub fn resolve_config(
    config_path: Option<&Path>,
    data_dir_override: Option<&Path>,
) -> Result<PipelineConfig> {
    let mut config = load_config(config_path)?;
    let data_dir = match (data_dir_override, config.data_dir.as_deref()) {
        (Some(d), _) => d.to_path_buf(),
        (None, Some(d)) => d.to_path_buf(),
        (None, None) => resolve_data_dir(None),
    };
    config.data_dir = Some(data_dir);
    Ok(config)
}

// ---------------------------------------------------------------------------
// Component wiring
// ---------------------------------------------------------------------------

/// Storage-side components, shared by the daemon and the offline CLI commands.
pub struct Services {
    pub config: Arc<PipelineConfig>,
    pub layout: JobLayout,
    pub store: Arc<JsonStatusStore>,
    pub resources: Arc<ResourceManager>,
    pub clock: Arc<dyn Clock>,
}

/// How the storage root is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Create the root and move corrupt status files aside.
    ReadWrite,
    /// Leave the tree exactly as found. Used by reporting commands.
    ReadOnly,
}

pub async fn open_services(config: PipelineConfig, mode: OpenMode) -> Result<Services> {
    let config = Arc::new(config);
    let layout = JobLayout::new(config.jobs_root());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let store = match mode {
        OpenMode::ReadWrite => {
            tokio::fs::create_dir_all(layout.root()).await.with_context(|| {
                format!("Failed to create job root {}", layout.root().display())
            })?;
            JsonStatusStore::new(layout.clone(), Arc::clone(&clock)).await?
        }
        OpenMode::ReadOnly => {
            JsonStatusStore::open_read_only(layout.clone(), Arc::clone(&clock)).await?
        }
    };
    let store = Arc::new(store);
    let resources = Arc::new(ResourceManager::new(
        layout.clone(),
        store.clone(),
        &config,
        Arc::clone(&clock),
    ));
    Ok(Services {
        config,
        layout,
        store,
        resources,
        clock,
    })
}

/// Everything the HTTP layer and the worker pool need, not yet running.
pub struct Runtime {
    pub state: Arc<AppState>,
    pub receiver: Arc<TaskReceiver>,
    pub executor: Arc<Executor>,
    pub clock: Arc<dyn Clock>,
}

/// Wire the components. RUNNING records left by a previous process are
/// failed as interrupted here, before any worker exists.
pub async fn build_runtime(config: PipelineConfig) -> Result<Runtime> {
    let services = open_services(config, OpenMode::ReadWrite).await?;
    let config = services.config;

    let interrupted = services.store.recover_interrupted().await?;
    for record in &interrupted {
        tracing::warn!(
            "Task {} ({} for job {}) was interrupted by a restart",
            record.task_id,
            record.stage,
            record.job_id
        );
    }

    let (queue, receiver) = channel_queue(config.queue_capacity);
    let store: Arc<dyn StatusStore> = services.store;
    let executor = Arc::new(Executor::new(
        services.layout.clone(),
        Arc::clone(&store),
        Arc::clone(&services.resources),
        &config,
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        services.layout.clone(),
        Arc::clone(&store),
        Arc::new(queue),
        services.resources.admission(),
    ));

    let state = Arc::new(AppState {
        policy: UploadPolicy::from_config(&config),
        limits: RateLimits::from_config(&config.rate_limit),
        config,
        layout: services.layout,
        dispatcher,
        resources: services.resources,
        start_time: Instant::now(),
    });

    Ok(Runtime {
        state,
        receiver: Arc::new(receiver),
        executor,
        clock: services.clock,
    })
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Stderr plus a daily-rotated file under `<data_dir>/logs`. The returned
/// guard flushes the file writer and must live as long as the daemon.
fn init_tracing(
    config: &PipelineConfig,
    data_dir: &Path,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log_level.as_str().into());
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let log_dir = data_dir.join("logs");
    let appender = std::fs::create_dir_all(&log_dir)
        .map_err(|e| e.to_string())
        .and_then(|_| {
            tracing_appender::rolling::Builder::new()
                .rotation(tracing_appender::rolling::Rotation::DAILY)
                .filename_prefix("pocketd")
                .filename_suffix("log")
                .max_log_files(MAX_LOG_FILES)
                .build(&log_dir)
                .map_err(|e| e.to_string())
        });

    match appender {
        Ok(appender) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false);
            let result = tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .with(file_layer)
                .try_init();
            if result.is_ok() {
                tracing::info!("Logging to stderr and {}", log_dir.display());
            }
            Some(guard)
        }
        Err(e) => {
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .try_init();
            tracing::warn!("File logging unavailable ({}); logging to stderr only", e);
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Daemon bootstrap
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl+C signal"),
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM signal"),
                }
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Received Ctrl+C signal");
    }
}

/// Run the daemon until Ctrl+C or SIGTERM.
pub async fn start_daemon(
    config_path: Option<&Path>,
    data_dir_override: Option<&Path>,
    host_override: Option<&str>,
    port_override: Option<u16>,
) -> Result<()> {
    let mut config = resolve_config(config_path, data_dir_override)?;
    if let Some(h) = host_override {
        config.host = h.to_string();
    }
    if let Some(p) = port_override {
        config.port = p;
    }
    let data_dir = resolve_data_dir(config.data_dir.as_deref());
    tokio::fs::create_dir_all(&data_dir)
        .await
        .context("Failed to create data directory")?;

    let _log_guard = init_tracing(&config, &data_dir);
    tracing::info!("Data directory: {}", data_dir.display());
    config.validate()?;

    let pid_file = PidFile::for_data_dir(&data_dir);
    pid_file.acquire()?;

    let result = serve(config).await;

    if let Err(e) = pid_file.release() {
        tracing::error!("Failed to release PID file: {}", e);
    }
    result
}

async fn serve(config: PipelineConfig) -> Result<()> {
    let bind_addr = format!("{}:{}", config.host, config.port);
    let worker_count = config.worker_count;
    let runtime = build_runtime(config).await?;

    let mut handles = spawn_workers(
        worker_count,
        Arc::clone(&runtime.receiver),
        Arc::clone(&runtime.executor),
    );
    runtime.state.dispatcher.requeue_pending().await?;
    handles.extend(spawn_maintenance(
        &runtime.state.config,
        Arc::clone(&runtime.state.resources),
        Arc::clone(&runtime.clock),
    )?);

    let router = server::create_router(Arc::clone(&runtime.state));
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;
    tracing::info!(
        "Daemon started with {} workers. Listening on http://{}",
        worker_count,
        bind_addr
    );

    let served = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("HTTP server failed");

    // Running tools are killed with their worker; their records are failed
    // as interrupted on the next start.
    for handle in handles {
        handle.abort();
    }
    tracing::info!("Daemon exited.");
    served
}

// ===========================================================================
// Tests
// ===========================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExtractParams, StageParams, TaskState};
    use tempfile::TempDir;

    #[test]
    fn test_pidfile_acquire_creates_file() {
        let tmp_dir = TempDir::new().expect("create temp dir");
        let pid_path = tmp_dir.path().join("test.pid");

        let pid_file = PidFile::new(pid_path.clone());
        pid_file.acquire().expect("acquire should succeed");

        let content = std::fs::read_to_string(&pid_path).expect("read PID file");
        let written_pid: u32 = content.trim().parse().expect("parse PID");
        assert_eq!(written_pid, std::process::id());
        assert!(pid_file.is_alive());

        pid_file.release().expect("release");
        assert!(!pid_path.exists());
        assert!(!pid_file.is_alive());
    }

    #[test]
    fn test_pidfile_acquire_fails_if_held_by_live_process() {
        let tmp_dir = TempDir::new().expect("create temp dir");
        let pid_path = tmp_dir.path().join("test.pid");
        std::fs::write(&pid_path, format!("{}", std::process::id())).expect("write PID file");

        let result = PidFile::new(pid_path).acquire();
        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("already running"), "got: {}", err_msg);
    }

    #[test]
    fn test_pidfile_acquire_replaces_stale_file() {
        let tmp_dir = TempDir::new().expect("create temp dir");
        let pid_path = tmp_dir.path().join("test.pid");
        std::fs::write(&pid_path, "4000000").expect("write stale PID file");

        let pid_file = PidFile::new(pid_path.clone());
        pid_file.acquire().expect("stale PID file should be replaced");
        let content = std::fs::read_to_string(&pid_path).expect("read PID file");
        assert_eq!(content.trim(), std::process::id().to_string());
        pid_file.release().expect("release");
    }

    #[test]
    fn test_explicit_config_path_must_exist() {
        let tmp_dir = TempDir::new().expect("create temp dir");
        let err = load_config(Some(&tmp_dir.path().join("nope.json"))).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn test_explicit_config_is_merged_with_defaults() {
        let tmp_dir = TempDir::new().expect("create temp dir");
        let path = tmp_dir.path().join("config.json");
        std::fs::write(&path, r#"{"cleanup_after_days": 7, "port": 9000}"#).expect("write");

        let config = load_config(Some(&path)).expect("load");
        assert_eq!(config.cleanup_after_days, 7);
        assert_eq!(config.port, 9000);
        assert_eq!(config.max_compression_ratio, 100);
    }

    #[test]
    fn test_data_dir_flag_wins_over_config() {
        let tmp_dir = TempDir::new().expect("create temp dir");
        let path = tmp_dir.path().join("config.json");
        std::fs::write(&path, r#"{"data_dir": "/from/config"}"#).expect("write");

        let config = resolve_config(Some(&path), Some(Path::new("/from/flag"))).expect("resolve");
        assert_eq!(config.data_dir, Some(PathBuf::from("/from/flag")));

        let config = resolve_config(Some(&path), None).expect("resolve");
        assert_eq!(config.data_dir, Some(PathBuf::from("/from/config")));
    }

    #[tokio::test]
    async fn test_build_runtime_fails_interrupted_tasks() {
        let tmp_dir = TempDir::new().expect("create temp dir");
        let config = PipelineConfig {
            data_dir: Some(tmp_dir.path().to_path_buf()),
            ..Default::default()
        };

        let runtime = build_runtime(config.clone()).await.expect("runtime");
        let job_id = runtime.state.dispatcher.create_job().await.expect("job");
        let uploads = runtime.state.layout.uploads_dir(&job_id);
        std::fs::write(uploads.join("traj.xtc"), b"x").expect("write");
        std::fs::write(uploads.join("top.pdb"), b"x").expect("write");
        let handle = runtime
            .state
            .dispatcher
            .submit(
                &job_id,
                StageParams::ExtractFrames(ExtractParams {
                    trajectory: "traj.xtc".to_string(),
                    topology: "top.pdb".to_string(),
                    stride: 1,
                }),
            )
            .await
            .expect("submit");
        drop(runtime);
        let store = JsonStatusStore::new(JobLayout::new(config.jobs_root()), Arc::new(SystemClock))
            .await
            .expect("store");
        store
            .claim(&job_id, handle.stage, handle.task_id)
            .await
            .expect("claim");
        drop(store);

        let restarted = build_runtime(config).await.expect("runtime");
        let record = restarted
            .state
            .dispatcher
            .status(&job_id, handle.stage)
            .await
            .expect("status");
        assert_eq!(record.state, TaskState::Failed);
    }

    #[tokio::test]
    async fn test_read_only_services_do_not_create_root() {
        let tmp_dir = TempDir::new().expect("create temp dir");
        let data_dir = tmp_dir.path().join("fresh");
        let config = PipelineConfig {
            data_dir: Some(data_dir.clone()),
            ..Default::default()
        };

        let services = open_services(config.clone(), OpenMode::ReadOnly)
            .await
            .expect("services");
        assert!(services.store.list_all().await.expect("list").is_empty());
        assert!(!data_dir.exists());

        open_services(config.clone(), OpenMode::ReadWrite)
            .await
            .expect("services");
        assert!(config.jobs_root().is_dir());
    }
}
