use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::daemon::queue::TaskMessage;
use crate::daemon::resources::ResourceManager;
use crate::models::{
    ErrorKind, ExpectedOutput, PipelineConfig, Stage, StageResult, TaskError,
    TaskOutcome, TaskRecord, TaskState, ToolsConfig,
};
use crate::storage::{ClaimToken, JobLayout, StatusStore};

/// Bounded tail of a tool's combined output, kept for the error payload.
struct OutputTail {
    buf: VecDeque<u8>,
    limit: usize,
    truncated: bool,
}

impl OutputTail {
    fn new(limit: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(limit.min(64 * 1024)),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, data: &[u8]) {
        self.buf.extend(data);
        let excess = self.buf.len().saturating_sub(self.limit);
        if excess > 0 {
            self.buf.drain(..excess);
            self.truncated = true;
        }
    }

    fn text(&self) -> String {
        let bytes: Vec<u8> = self.buf.iter().copied().collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn render(&self) -> String {
        if self.truncated {
            format!("[truncated to last {} bytes]\n{}", self.limit, self.text())
        } else {
            self.text()
        }
    }

    fn last_line(&self) -> Option<String> {
        self.text()
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(|l| l.chars().take(200).collect())
    }
}

/// How long output is still collected after the tool has exited.
const OUTPUT_GRACE: Duration = Duration::from_millis(500);

/// How the subprocess ended, before outputs are checked.
enum ProcessEnd {
    Exited(i32),
    Signalled,
    TimedOut,
}

/// Runs claimed stage tasks: one external tool invocation per task.
pub struct Executor {
    layout: JobLayout,
    store: Arc<dyn StatusStore>,
    resources: Arc<ResourceManager>,
    tools: ToolsConfig,
    progress_interval: Duration,
    diagnostics_limit: usize,
}

impl Executor {
    pub fn new(
        layout: JobLayout,
        store: Arc<dyn StatusStore>,
        resources: Arc<ResourceManager>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            layout,
            store,
            resources,
            tools: config.tools.clone(),
            progress_interval: Duration::from_secs(config.progress_interval_secs.max(1)),
            diagnostics_limit: config.diagnostics_limit,
        }
    }

    /// Consume one queue message. Never fails: store errors are logged, and
    /// duplicate or stale deliveries are dropped.
    pub async fn execute(&self, message: TaskMessage) {
        if let Err(e) = self.try_execute(&message).await {
            tracing::error!(
                "Task {} ({} for job {}) could not be recorded: {:#}",
                message.task_id,
                message.stage,
                message.job_id,
                e
            );
        }
    }

    async fn try_execute(&self, message: &TaskMessage) -> Result<()> {
        let TaskMessage {
            task_id,
            job_id,
            stage,
        } = message;

        let record = match self.store.get(job_id, *stage).await? {
            Some(r) if r.task_id == *task_id && r.state == TaskState::Pending => r,
            _ => {
                tracing::debug!(
                    "Dropping delivery of task {}: no longer pending",
                    task_id
                );
                return Ok(());
            }
        };

        if record.abandoned {
            self.store
                .fail_pending(
                    job_id,
                    *stage,
                    *task_id,
                    TaskError::new(ErrorKind::Abandoned, "Task was abandoned before it started"),
                )
                .await?;
            tracing::info!("Task {} abandoned before start", task_id);
            return Ok(());
        }

        let token = match self.store.claim(job_id, *stage, *task_id).await {
            Ok(token) => token,
            Err(e) => {
                tracing::debug!("Task {} not claimed: {:#}", task_id, e);
                return Ok(());
            }
        };
        tracing::info!("Task {} claimed: {} for job {}", task_id, stage, job_id);

        let started = Instant::now();
        let outcome = self.run_stage(&token, &record).await;
        let elapsed = started.elapsed().as_secs_f64();

        let finished = self.store.finish(&token, outcome).await?;
        match (&finished.state, &finished.error) {
            (TaskState::Succeeded, _) => tracing::info!(
                "Task {} succeeded: {} for job {} in {:.1}s",
                task_id,
                stage,
                job_id,
                elapsed
            ),
            (_, Some(error)) => tracing::warn!(
                "Task {} failed: {} for job {} ({:?}: {})",
                task_id,
                stage,
                job_id,
                error.kind,
                error.message
            ),
            _ => {}
        }
        Ok(())
    }

    async fn run_stage(&self, token: &ClaimToken, record: &TaskRecord) -> TaskOutcome {
        let job_id = &token.job_id;
        let stage = token.stage;
        let input = self.layout.input_dir(job_id, stage);
        let output = self.layout.output_dir(job_id, stage);

        if !tokio::fs::try_exists(&input).await.unwrap_or(false) {
            return failed(
                ErrorKind::ToolFailure,
                format!("Input directory {} does not exist", input.display()),
            );
        }

        if let Err(e) = self.resources.ensure_capacity(0).await {
            return failed(ErrorKind::Resource, format!("{:#}", e));
        }

        if let Err(e) = reset_dir(&output).await {
            return failed(
                ErrorKind::Resource,
                format!("Cannot prepare {}: {}", output.display(), e),
            );
        }

        let tool = self.tools.for_stage(stage);
        let mut cmd = Command::new(&tool.program);
        cmd.args(&tool.args)
            .arg("--input")
            .arg(&input)
            .arg("--outfolder")
            .arg(&output)
            .args(record.params.to_flags(&self.layout.uploads_dir(job_id)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = tool.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let log_path = self.layout.tool_log(job_id, stage);
        let header = format!("$ {}\n", describe(&cmd));

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return failed(
                    ErrorKind::ToolFailure,
                    format!("Failed to spawn '{}': {}", tool.program, e),
                );
            }
        };

        let started = Instant::now();
        let timeout = Duration::from_secs(tool.timeout_secs);
        let (end, tail) = self
            .supervise(token, child, timeout, &log_path, header)
            .await;
        let duration_secs = started.elapsed().as_secs_f64();
        let diagnostics = tail.render();

        let exit_code = match end {
            ProcessEnd::TimedOut => {
                return TaskOutcome::Failed(
                    TaskError::new(
                        ErrorKind::Timeout,
                        format!("{} exceeded its timeout of {}s", stage, tool.timeout_secs),
                    )
                    .with_diagnostics(diagnostics),
                );
            }
            ProcessEnd::Signalled => {
                return TaskOutcome::Failed(
                    TaskError::new(ErrorKind::ToolFailure, "Tool was terminated by a signal")
                        .with_diagnostics(diagnostics),
                );
            }
            ProcessEnd::Exited(code) if code != 0 => {
                return TaskOutcome::Failed(
                    TaskError::new(
                        ErrorKind::ToolFailure,
                        format!("Tool exited with code {}", code),
                    )
                    .with_diagnostics(diagnostics),
                );
            }
            ProcessEnd::Exited(code) => code,
        };

        let missing = missing_outputs(&output, stage).await;
        if !missing.is_empty() {
            return TaskOutcome::Failed(
                TaskError::new(
                    ErrorKind::ToolFailure,
                    format!("Missing or empty expected output: {}", missing.join(", ")),
                )
                .with_diagnostics(diagnostics),
            );
        }

        let output_files = list_files(&output).await;
        let metrics = collect_metrics(&output, stage, &output_files).await;
        TaskOutcome::Succeeded(StageResult {
            output_dir: output,
            output_files,
            metrics,
            exit_code,
            duration_secs,
        })
    }

    /// Pump the tool's output into its log and tail, post progress, and
    /// enforce the deadline. The run ends when the tool itself exits; output
    /// still arriving is drained for a short grace period, then the whole
    /// process group is killed so no descendant outlives the task.
    async fn supervise(
        &self,
        token: &ClaimToken,
        mut child: Child,
        timeout: Duration,
        log_path: &Path,
        header: String,
    ) -> (ProcessEnd, OutputTail) {
        // Captured up front: the id is gone once the child has been reaped.
        let group = child.id();
        let (output_tx, mut output_rx) = mpsc::channel::<Vec<u8>>(256);
        let mut readers: Vec<JoinHandle<()>> = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(pump(stdout, output_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(pump(stderr, output_tx.clone()));
        }
        drop(output_tx);

        // Log writer task, mirroring every chunk into tool.log.
        let (log_tx, mut log_rx) = mpsc::channel::<Vec<u8>>(256);
        let log_path = log_path.to_path_buf();
        let log_writer = tokio::spawn(async move {
            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .await
            {
                Ok(f) => Some(f),
                Err(e) => {
                    tracing::error!("Failed to open {}: {}", log_path.display(), e);
                    None
                }
            };
            if let Err(e) = append_log(&mut file, header.as_bytes()).await {
                tracing::error!("Failed to append tool log: {}", e);
            }
            while let Some(data) = log_rx.recv().await {
                if let Err(e) = append_log(&mut file, &data).await {
                    tracing::error!("Failed to append tool log: {}", e);
                    file = None;
                }
            }
        });

        let mut tail = OutputTail::new(self.diagnostics_limit);
        let started = Instant::now();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut progress = tokio::time::interval_at(
            tokio::time::Instant::now() + self.progress_interval,
            self.progress_interval,
        );
        let mut output_open = true;

        let exited = loop {
            tokio::select! {
                chunk = output_rx.recv(), if output_open => {
                    match chunk {
                        Some(data) => {
                            tail.push(&data);
                            let _ = log_tx.send(data).await;
                        }
                        None => output_open = false,
                    }
                }
                status = child.wait() => {
                    break Some(match status {
                        Ok(status) => match status.code() {
                            Some(code) => ProcessEnd::Exited(code),
                            None => ProcessEnd::Signalled,
                        },
                        Err(e) => {
                            tracing::error!("Failed to wait for tool of task {}: {}", token.task_id, e);
                            ProcessEnd::Signalled
                        }
                    });
                }
                _ = progress.tick() => {
                    let mut message = format!("Running ({}s elapsed)", started.elapsed().as_secs());
                    if let Some(line) = tail.last_line() {
                        message.push_str(": ");
                        message.push_str(&line);
                    }
                    if let Err(e) = self.store.report_progress(token, &message).await {
                        tracing::warn!("Progress update for task {} failed: {:#}", token.task_id, e);
                    }
                }
                _ = &mut deadline => break None,
            }
        };

        let end = match exited {
            Some(end) => {
                // A descendant may still hold the pipes open.
                let grace = tokio::time::Instant::now() + OUTPUT_GRACE;
                while output_open {
                    match tokio::time::timeout_at(grace, output_rx.recv()).await {
                        Ok(Some(data)) => {
                            tail.push(&data);
                            let _ = log_tx.send(data).await;
                        }
                        Ok(None) => output_open = false,
                        Err(_) => {
                            tracing::debug!(
                                "Task {}: tool exited with its output still open",
                                token.task_id
                            );
                            break;
                        }
                    }
                }
                kill_group(group);
                end
            }
            None => {
                tracing::warn!(
                    "Task {} exceeded {}s, killing tool",
                    token.task_id,
                    timeout.as_secs()
                );
                kill_group(group);
                if let Err(e) = child.kill().await {
                    tracing::debug!("kill after timeout: {}", e);
                }
                ProcessEnd::TimedOut
            }
        };

        for reader in readers {
            reader.abort();
        }
        drop(log_tx);
        let _ = log_writer.await;

        (end, tail)
    }
}

async fn append_log(
    file: &mut Option<tokio::fs::File>,
    data: &[u8],
) -> std::io::Result<()> {
    match file {
        Some(f) => f.write_all(data).await,
        None => Ok(()),
    }
}

fn pump<R>(mut reader: R, tx: mpsc::Sender<Vec<u8>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// SIGKILL every process in the tool's group. The group was created for the
/// child by process_group(0), so its id equals the child's pid.
fn kill_group(group: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = group {
        // SAFETY: killpg only sends a signal.
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = group;
}

fn failed(kind: ErrorKind, message: String) -> TaskOutcome {
    TaskOutcome::Failed(TaskError::new(kind, message))
}

fn describe(cmd: &Command) -> String {
    let std_cmd = cmd.as_std();
    let mut parts = vec![std_cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(std_cmd.get_args().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}

async fn reset_dir(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::create_dir_all(dir).await
}

/// Names of regular files directly inside `dir`, sorted.
async fn list_files(dir: &Path) -> Vec<String> {
    let mut names = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return names;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    names
}

async fn non_empty(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

fn has_extension(name: &str, ext: &str) -> bool {
    name.rsplit_once('.')
        .is_some_and(|(_, e)| e.eq_ignore_ascii_case(ext))
}

async fn missing_outputs(output: &Path, stage: Stage) -> Vec<String> {
    let mut missing = Vec::new();
    for expected in stage.expected_outputs() {
        match expected {
            ExpectedOutput::File(name) => {
                if !non_empty(&output.join(name)).await {
                    missing.push(name.to_string());
                }
            }
            ExpectedOutput::AnyWithExtension(ext) => {
                let mut found = false;
                for name in list_files(output).await {
                    if has_extension(&name, ext) && non_empty(&output.join(&name)).await {
                        found = true;
                        break;
                    }
                }
                if !found {
                    missing.push(format!("*.{}", ext));
                }
            }
        }
    }
    missing
}

/// Data rows in a CSV file, header excluded.
async fn csv_rows(path: &Path) -> u64 {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => (text.lines().filter(|l| !l.trim().is_empty()).count() as u64)
            .saturating_sub(1),
        Err(_) => 0,
    }
}

async fn collect_metrics(output: &Path, stage: Stage, files: &[String]) -> BTreeMap<String, u64> {
    let mut metrics = BTreeMap::new();
    match stage {
        Stage::ExtractFrames => {
            let frames = files.iter().filter(|f| has_extension(f, "pdb")).count();
            metrics.insert("frames".to_string(), frames as u64);
        }
        Stage::DetectPockets => {
            metrics.insert("pockets".to_string(), csv_rows(&output.join("pockets.csv")).await);
        }
        Stage::ClusterPockets => {
            metrics.insert(
                "pockets_clustered".to_string(),
                csv_rows(&output.join("pockets_clustered.csv")).await,
            );
            metrics.insert(
                "representatives".to_string(),
                csv_rows(&output.join("cluster_representatives.csv")).await,
            );
        }
        Stage::Docking => {
            metrics.insert(
                "poses".to_string(),
                csv_rows(&output.join("docking_results.csv")).await,
            );
        }
    }
    metrics
}
