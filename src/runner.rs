use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::{DataDirs, EngineSet, LimitsConfig};
use crate::database;
use crate::job::{BuildStatus, CompileJob, FinishedCompile, JobKind, JobResult};
use crate::notify::{BuildEvent, StatusBroadcaster};
use crate::oneshot::OneShotStore;
use crate::parser;
use crate::queue::JobQueue;
use crate::sandbox::{ExecOutcome, ExecRequest, Sandbox, render_command, resolve_engine};
use crate::shared::{SharedStore, cancel_key};

/// Cancellation flags are observed with this poll cadence; cancellation
/// latency is bounded by it
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Map of currently executing jobs to their abort handles. Each entry is
/// written by the owning job's routine and read by the cancellation path;
/// job state is disjoint, so this mutex is the only synchronization needed.
#[derive(Default)]
pub struct ActiveJobs {
    inner: parking_lot::Mutex<HashMap<String, CancellationToken>>,
}

impl ActiveJobs {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, job_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.inner.lock().insert(job_id.to_string(), token.clone());
        token
    }

    fn unregister(&self, job_id: &str) {
        self.inner.lock().remove(job_id);
    }

    /// Aborts a locally executing job; false when it is not running here
    pub fn abort(&self, job_id: &str) -> bool {
        match self.inner.lock().get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct RunnerStats {
    started_at: Instant,
    max_concurrent: u32,
    running: AtomicBool,
    active: AtomicU32,
    total_processed: AtomicU64,
    total_errors: AtomicU64,
}

impl RunnerStats {
    fn new(max_concurrent: u32) -> Self {
        Self {
            started_at: Instant::now(),
            max_concurrent,
            running: AtomicBool::new(false),
            active: AtomicU32::new(0),
            total_processed: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
        }
    }
}

/// Point-in-time health of one runner instance
#[derive(Serialize, Debug, Clone)]
pub struct HealthSnapshot {
    pub running: bool,
    pub active_jobs: u32,
    pub max_concurrent: u32,
    pub total_processed: u64,
    pub total_errors: u64,
    pub uptime_ms: u64,
    pub backend_connected: bool,
}

/// Everything a runner needs besides its own identity and cap
pub struct RunnerContext {
    pub queue: Arc<dyn JobQueue>,
    pub store: Arc<dyn SharedStore>,
    pub sandbox: Arc<dyn Sandbox>,
    pub db: SqlitePool,
    pub oneshot: Arc<OneShotStore>,
    pub notifier: StatusBroadcaster,
    pub active: Arc<ActiveJobs>,
    pub dirs: DataDirs,
    pub limits: LimitsConfig,
    pub engines: Arc<EngineSet>,
}

/// Claims jobs from one queue and drives each through
/// copy, execute, parse, persist, notify and cleanup.
///
/// The project-build runner and the one-shot runner are two instances of
/// this type with independent queues and concurrency caps.
pub struct CompileRunner {
    label: &'static str,
    max_concurrent: u32,
    ctx: RunnerContext,
    stats: RunnerStats,
}

impl CompileRunner {
    pub fn new(label: &'static str, max_concurrent: u32, ctx: RunnerContext) -> Arc<Self> {
        Arc::new(Self {
            label,
            max_concurrent,
            ctx,
            stats: RunnerStats::new(max_concurrent),
        })
    }

    /// Spawns one worker loop per concurrency slot
    pub fn spawn_workers(self: &Arc<Self>, workers: &mut JoinSet<()>, shutdown: CancellationToken) {
        self.stats.running.store(true, Ordering::Relaxed);
        for id in 1..=self.max_concurrent {
            let runner = Arc::clone(self);
            let token = shutdown.clone();
            workers.spawn(async move { runner.worker(id, token).await });
        }
    }

    async fn worker(self: Arc<Self>, id: u32, token: CancellationToken) {
        log::info!("{} worker {id} initialized", self.label);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    log::info!("{} worker {id} received shutdown signal, stopping", self.label);
                    break;
                }
                claimed = self.ctx.queue.claim() => {
                    match claimed {
                        Ok(Some(job)) => {
                            log::info!("{} worker {id} got job {} from queue", self.label, job.job_id);
                            self.drive(job).await;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            log::error!("{} worker {id} failed to claim from queue: {e}", self.label);
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
        log::info!("{} worker {id} has shut down gracefully", self.label);
    }

    pub async fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            running: self.stats.running.load(Ordering::Relaxed),
            active_jobs: self.stats.active.load(Ordering::Relaxed),
            max_concurrent: self.stats.max_concurrent,
            total_processed: self.stats.total_processed.load(Ordering::Relaxed),
            total_errors: self.stats.total_errors.load(Ordering::Relaxed),
            uptime_ms: self.stats.started_at.elapsed().as_millis() as u64,
            backend_connected: self.ctx.queue.is_connected().await,
        }
    }

    /// Takes one claimed job through its whole lifecycle
    async fn drive(&self, job: CompileJob) {
        let job_id = job.job_id.clone();

        // 1. A cancellation requested while the job sat unclaimed, possibly
        // on another instance, is honored before any work happens
        match self.ctx.store.take(&cancel_key(&job_id)).await {
            Ok(Some(_)) => {
                log::info!("Job {job_id} canceled before execution");
                self.finalize(
                    &job,
                    FinishedCompile::bare(BuildStatus::Canceled, "canceled before execution"),
                )
                .await;
                self.stats.total_processed.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Ok(None) => {}
            Err(e) => log::warn!("Failed to check cancellation flag for {job_id}: {e}"),
        }

        // 2. Transition to compiling; a record that moved on without us
        // (canceled or swept) discards the claim
        if !self.mark_compiling(&job).await {
            log::warn!("Job {job_id} is no longer pending, discarding claim");
            return;
        }

        // The abort handle is visible before the transition is announced, so
        // a cancel issued on the heels of the event always finds the job
        self.stats.active.fetch_add(1, Ordering::Relaxed);
        let token = self.ctx.active.register(&job_id);
        self.ctx.notifier.publish(BuildEvent {
            job_id: job_id.clone(),
            kind: job.kind,
            status: BuildStatus::Compiling,
            result: None,
        });

        let workdir = self.ctx.dirs.work_root.join(&job_id);
        let poller = spawn_cancel_poller(self.ctx.store.clone(), job_id.clone(), token.clone());

        let started = Instant::now();
        let outcome = self.run_compile(&job, &workdir, &token).await;

        // Unconditional teardown: poll timer, registry entry, working
        // directory, regardless of success, fault or abort
        poller.abort();
        self.ctx.active.unregister(&job_id);
        if let Err(e) = tokio::fs::remove_dir_all(&workdir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::error!("Failed to remove working directory of job {job_id}: {e}");
            }
        }
        self.stats.active.fetch_sub(1, Ordering::Relaxed);

        let finished = match outcome {
            Ok(finished) => finished,
            Err(e) => {
                log::error!("Job {job_id} failed with infrastructure error: {e:#}");
                let mut finished =
                    FinishedCompile::bare(BuildStatus::Error, format!("Internal error: {e:#}"));
                finished.duration_ms = started.elapsed().as_millis() as i64;
                finished
            }
        };

        self.finalize(&job, finished).await;
        self.stats.total_processed.fetch_add(1, Ordering::Relaxed);
    }

    async fn run_compile(
        &self,
        job: &CompileJob,
        workdir: &Path,
        token: &CancellationToken,
    ) -> Result<FinishedCompile> {
        let started = Instant::now();

        // 3. Fresh job-unique working directory holding the owner's current
        // tree; concurrent jobs for one owner never share mutable state
        let source_root = match job.kind {
            JobKind::ProjectBuild => self.ctx.dirs.projects_root.join(&job.owner_scope),
            JobKind::OneShot => self.ctx.oneshot.source_dir(&job.job_id)?,
        };
        let (src, dst) = (source_root.clone(), workdir.to_path_buf());
        tokio::task::spawn_blocking(move || copy_tree(&src, &dst))
            .await
            .context("file copy task failed")??;

        let main_path = workdir.join(&job.main_file);
        let engine = resolve_engine(&job.engine, &main_path);
        let engine_config = self
            .ctx
            .engines
            .find(&engine)
            .ok_or_else(|| anyhow!("no command configured for engine {engine}"))?;
        let command = render_command(&engine_config.command, &job.main_file);

        let request = ExecRequest {
            workdir: workdir.to_path_buf(),
            command,
            timeout: Duration::from_secs(self.ctx.limits.compile_timeout_secs),
            memory_limit_mb: self.ctx.limits.memory_limit_mb,
            cpu_fraction: self.ctx.limits.cpu_fraction,
        };
        let exec = self.ctx.sandbox.execute(&request, token).await?;

        let entries = parser::parse(&exec.output);
        let artifact_src = main_path.with_extension("pdf");
        let status = decide_status(
            token.is_cancelled(),
            &exec,
            parser::error_count(&entries) > 0,
            artifact_src.exists(),
        );

        // The artifact leaves the working directory before that is removed
        let artifact_path = if status == BuildStatus::Success {
            Some(self.store_artifact(job, &artifact_src)?)
        } else {
            None
        };

        Ok(FinishedCompile {
            status,
            engine_used: Some(engine),
            logs: exec.output,
            duration_ms: started.elapsed().as_millis() as i64,
            exit_code: exec.exit_code,
            artifact_path,
            entries,
        })
    }

    fn store_artifact(&self, job: &CompileJob, artifact_src: &Path) -> Result<String> {
        let dest = match job.kind {
            JobKind::ProjectBuild => {
                let dir = self.ctx.dirs.artifacts_root.join(&job.owner_scope);
                fs::create_dir_all(&dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
                dir.join(format!("{}.pdf", job.job_id))
            }
            JobKind::OneShot => self.ctx.oneshot.pdf_path(&job.job_id)?,
        };
        fs::copy(artifact_src, &dest).with_context(|| {
            format!("failed to store artifact at {}", dest.display())
        })?;
        Ok(dest.display().to_string())
    }

    async fn mark_compiling(&self, job: &CompileJob) -> bool {
        match job.kind {
            JobKind::ProjectBuild => database::mark_compiling(&self.ctx.db, &job.job_id)
                .await
                .unwrap_or_else(|e| {
                    log::error!("Failed to mark job {} compiling: {e}", job.job_id);
                    false
                }),
            JobKind::OneShot => self
                .ctx
                .oneshot
                .mark_compiling(&job.job_id)
                .unwrap_or_else(|e| {
                    log::error!("Failed to mark job {} compiling: {e}", job.job_id);
                    false
                }),
        }
    }

    /// Persists a terminal outcome and broadcasts it. Terminal states are
    /// write-once; a record that already finished swallows the result.
    async fn finalize(&self, job: &CompileJob, finished: FinishedCompile) {
        let applied = match job.kind {
            JobKind::ProjectBuild => database::finish_build(&self.ctx.db, &job.job_id, &finished)
                .await
                .unwrap_or_else(|e| {
                    log::error!("Failed to persist result of job {}: {e}", job.job_id);
                    false
                }),
            JobKind::OneShot => self
                .ctx
                .oneshot
                .finish(&job.job_id, &finished)
                .unwrap_or_else(|e| {
                    log::error!("Failed to persist result of job {}: {e}", job.job_id);
                    false
                }),
        };
        if !applied {
            log::warn!(
                "Job {} already reached a terminal state, dropping {} result",
                job.job_id,
                finished.status.as_str()
            );
            return;
        }

        if finished.status == BuildStatus::Error {
            self.stats.total_errors.fetch_add(1, Ordering::Relaxed);
        }

        let result = self.result_payload(job, &finished);
        self.ctx.notifier.publish(BuildEvent {
            job_id: job.job_id.clone(),
            kind: job.kind,
            status: finished.status,
            result: Some(result),
        });
        log::info!(
            "Job {} finished with status {}",
            job.job_id,
            finished.status.as_str()
        );
    }

    fn result_payload(&self, job: &CompileJob, finished: &FinishedCompile) -> JobResult {
        let expires_at = match job.kind {
            JobKind::OneShot => self
                .ctx
                .oneshot
                .load(&job.job_id)
                .ok()
                .flatten()
                .and_then(|m| m.expires_at),
            JobKind::ProjectBuild => None,
        };
        JobResult {
            job_id: job.job_id.clone(),
            status: finished.status,
            engine_used: finished.engine_used.clone(),
            logs: finished.logs.clone(),
            duration_ms: Some(finished.duration_ms),
            exit_code: finished.exit_code,
            artifact_path: finished.artifact_path.clone(),
            errors: finished.entries.clone(),
            warning_count: parser::warning_count(&finished.entries),
            error_count: parser::error_count(&finished.entries),
            expires_at,
        }
    }
}

/// Polls the shared cancellation flag for a running job and aborts its
/// executor when the flag appears
fn spawn_cancel_poller(
    store: Arc<dyn SharedStore>,
    job_id: String,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CANCEL_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    match store.take(&cancel_key(&job_id)).await {
                        Ok(Some(_)) => {
                            log::info!("Cancellation observed for running job {job_id}");
                            token.cancel();
                            break;
                        }
                        Ok(None) => {}
                        Err(e) => log::warn!("Cancellation poll for job {job_id} failed: {e}"),
                    }
                }
            }
        }
    })
}

/// Final status policy. The order matters: a canceled job is never reported
/// as an error even if partial output looks erroneous, and a timeout is
/// never misreported as a plain error. Exit code 0 alone is not success.
fn decide_status(
    canceled: bool,
    exec: &ExecOutcome,
    has_errors: bool,
    artifact_exists: bool,
) -> BuildStatus {
    if canceled {
        BuildStatus::Canceled
    } else if exec.timed_out {
        BuildStatus::Timeout
    } else if exec.exit_code != Some(0) || has_errors || !artifact_exists {
        BuildStatus::Error
    } else {
        BuildStatus::Success
    }
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("failed to create {}", dst.display()))?;
    for entry in
        fs::read_dir(src).with_context(|| format!("failed to read source tree {}", src.display()))?
    {
        let entry = entry?;
        let dest = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree(&entry.path(), &dest)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &dest)?;
        }
        // Symlinks are skipped; nothing outside the owner's tree reaches the sandbox
    }
    Ok(())
}
