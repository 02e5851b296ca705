use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::create_timestamp;
use crate::job::{BuildStatus, CompileJob, FinishedCompile, JobResult};
use crate::parser::LogEntry;

const METADATA_FILE: &str = "metadata.json";
const SOURCE_DIR: &str = "source";
const LOG_FILE: &str = "output.log";
const ERRORS_FILE: &str = "errors.json";
const PDF_FILE: &str = "output.pdf";

/// A file submitted inline with a one-shot compile request
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SubmittedFile {
    pub path: String,
    pub content: String,
}

/// Durable state of one ephemeral compile, stored as a JSON file in the
/// job's directory. `expires_at` is absent until the job turns terminal;
/// once set, the expiry sweep deletes the directory at or after that
/// instant, never before.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OneShotMetadata {
    pub job_id: String,
    pub status: BuildStatus,
    pub engine_used: Option<String>,
    pub warning_count: u32,
    pub error_count: u32,
    pub duration_ms: Option<i64>,
    pub exit_code: Option<i64>,
    pub source_path: String,
    pub logs_path: Option<String>,
    pub errors_path: Option<String>,
    pub pdf_path: Option<String>,
    pub created_at: String,
    pub expires_at: Option<String>,
}

/// Filesystem-backed store for one-shot jobs: one directory per job holding
/// the source tree, the compiled artifact, the raw log, the parsed errors
/// and the metadata file.
pub struct OneShotStore {
    root: PathBuf,
    ttl: Duration,
}

impl OneShotStore {
    pub fn new(root: PathBuf, ttl: Duration) -> Self {
        Self { root, ttl }
    }

    pub fn job_dir(&self, job_id: &str) -> Result<PathBuf> {
        validate_id(job_id)?;
        Ok(self.root.join(job_id))
    }

    pub fn source_dir(&self, job_id: &str) -> Result<PathBuf> {
        Ok(self.job_dir(job_id)?.join(SOURCE_DIR))
    }

    /// Materializes a submission: writes the inline files as the job's
    /// source tree and creates the queued metadata record. Submitting an id
    /// that already exists returns the existing record untouched.
    pub fn create(&self, job: &CompileJob, files: &[SubmittedFile]) -> Result<OneShotMetadata> {
        let dir = self.job_dir(&job.job_id)?;
        if let Some(existing) = self.load(&job.job_id)? {
            return Ok(existing);
        }

        let source_dir = dir.join(SOURCE_DIR);
        fs::create_dir_all(&source_dir)
            .with_context(|| format!("failed to create {}", source_dir.display()))?;
        for file in files {
            let rel = sanitize_rel_path(&file.path)?;
            let dest = source_dir.join(&rel);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&dest, &file.content)
                .with_context(|| format!("failed to write {}", dest.display()))?;
        }

        let metadata = OneShotMetadata {
            job_id: job.job_id.clone(),
            status: BuildStatus::Queued,
            engine_used: None,
            warning_count: 0,
            error_count: 0,
            duration_ms: None,
            exit_code: None,
            source_path: source_dir.display().to_string(),
            logs_path: None,
            errors_path: None,
            pdf_path: None,
            created_at: create_timestamp(),
            expires_at: None,
        };
        self.save(&metadata)?;
        Ok(metadata)
    }

    pub fn load(&self, job_id: &str) -> Result<Option<OneShotMetadata>> {
        let path = self.job_dir(job_id)?.join(METADATA_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    fn save(&self, metadata: &OneShotMetadata) -> Result<()> {
        let path = self.job_dir(&metadata.job_id)?.join(METADATA_FILE);
        fs::write(&path, serde_json::to_vec_pretty(metadata)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Moves a queued job to compiling; false when it is not queued anymore
    pub fn mark_compiling(&self, job_id: &str) -> Result<bool> {
        let Some(mut metadata) = self.load(job_id)? else {
            return Ok(false);
        };
        if metadata.status != BuildStatus::Queued {
            return Ok(false);
        }
        metadata.status = BuildStatus::Compiling;
        self.save(&metadata)?;
        Ok(true)
    }

    /// Writes a terminal outcome: raw log, parsed errors and the final
    /// metadata including the expiry instant. Terminal records are
    /// write-once; finishing an already-terminal job is a no-op.
    pub fn finish(&self, job_id: &str, finished: &FinishedCompile) -> Result<bool> {
        let Some(mut metadata) = self.load(job_id)? else {
            return Ok(false);
        };
        if metadata.status.is_terminal() {
            return Ok(false);
        }

        let dir = self.job_dir(job_id)?;
        let log_path = dir.join(LOG_FILE);
        fs::write(&log_path, &finished.logs)?;
        let errors_path = dir.join(ERRORS_FILE);
        fs::write(&errors_path, serde_json::to_vec(&finished.entries)?)?;

        metadata.status = finished.status;
        metadata.engine_used = finished.engine_used.clone();
        metadata.warning_count = crate::parser::warning_count(&finished.entries);
        metadata.error_count = crate::parser::error_count(&finished.entries);
        metadata.duration_ms = Some(finished.duration_ms);
        metadata.exit_code = finished.exit_code;
        metadata.logs_path = Some(log_path.display().to_string());
        metadata.errors_path = Some(errors_path.display().to_string());
        metadata.pdf_path = finished.artifact_path.clone();
        metadata.expires_at = Some(expiry_timestamp(self.ttl));
        self.save(&metadata)?;
        Ok(true)
    }

    /// Where the runner should place a successful artifact for this job
    pub fn pdf_path(&self, job_id: &str) -> Result<PathBuf> {
        Ok(self.job_dir(job_id)?.join(PDF_FILE))
    }

    /// Assembles the poll/notification payload for a job
    pub fn result(&self, metadata: &OneShotMetadata) -> JobResult {
        let entries: Vec<LogEntry> = metadata
            .errors_path
            .as_ref()
            .and_then(|path| fs::read_to_string(path).ok())
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        let logs = metadata
            .logs_path
            .as_ref()
            .and_then(|path| fs::read_to_string(path).ok())
            .unwrap_or_default();
        JobResult {
            job_id: metadata.job_id.clone(),
            status: metadata.status,
            engine_used: metadata.engine_used.clone(),
            logs,
            duration_ms: metadata.duration_ms,
            exit_code: metadata.exit_code,
            artifact_path: metadata.pdf_path.clone(),
            errors: entries,
            warning_count: metadata.warning_count,
            error_count: metadata.error_count,
            expires_at: metadata.expires_at.clone(),
        }
    }

    /// Deletes job directories whose expiry instant has passed
    pub fn sweep_expired(&self) -> Result<u64> {
        let now = create_timestamp();
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let metadata_path = entry.path().join(METADATA_FILE);
            let metadata: OneShotMetadata = match fs::read_to_string(&metadata_path)
                .ok()
                .and_then(|raw| serde_json::from_str(&raw).ok())
            {
                Some(metadata) => metadata,
                None => {
                    log::warn!("skipping unreadable job dir {}", entry.path().display());
                    continue;
                }
            };
            if matches!(&metadata.expires_at, Some(expires) if *expires <= now) {
                fs::remove_dir_all(entry.path())?;
                log::info!("Removed expired one-shot job {}", metadata.job_id);
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Boot-time pass closing out jobs abandoned by a previous process
    pub fn sweep_stale(&self, cutoff: &str, message: &str) -> Result<u64> {
        let mut swept = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Ok(Some(metadata)) = self.load(&name) else {
                continue;
            };
            if !metadata.status.is_terminal() && metadata.created_at.as_str() < cutoff {
                let finished = FinishedCompile::bare(BuildStatus::Error, message);
                if self.finish(&name, &finished)? {
                    swept += 1;
                }
            }
        }
        Ok(swept)
    }
}

/// Periodic expiry sweep, stopped by the shutdown token
pub async fn run_expiry_sweep(
    store: std::sync::Arc<OneShotStore>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match store.sweep_expired() {
                    Ok(0) => {}
                    Ok(n) => log::info!("Expiry sweep removed {n} one-shot jobs"),
                    Err(e) => log::error!("Expiry sweep failed: {e}"),
                }
            }
        }
    }
}

fn expiry_timestamp(ttl: Duration) -> String {
    use chrono::{SecondsFormat, Utc};
    let expires = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
    expires.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn validate_id(job_id: &str) -> Result<()> {
    if !crate::job::valid_id(job_id) {
        bail!("invalid job id {job_id:?}");
    }
    Ok(())
}

fn sanitize_rel_path(path: &str) -> Result<PathBuf> {
    let rel = Path::new(path);
    if rel.as_os_str().is_empty() || rel.is_absolute() {
        bail!("invalid file path {path:?}");
    }
    for component in rel.components() {
        if !matches!(component, Component::Normal(_)) {
            bail!("invalid file path {path:?}");
        }
    }
    Ok(rel.to_path_buf())
}
