use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::database;
use crate::job::{BuildStatus, FinishedCompile, JobKind, JobResult};
use crate::notify::{BuildEvent, StatusBroadcaster};
use crate::oneshot::OneShotStore;
use crate::queue::JobQueue;
use crate::runner::ActiveJobs;
use crate::shared::{SharedStore, cancel_key};

/// Lifetime of a raised cancellation flag
const CANCEL_FLAG_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelOutcome {
    pub was_queued: bool,
    pub was_running: bool,
}

/// Entry point for cancelling a job by id, wherever it currently lives.
///
/// Submission, execution and the cancellation request may happen on three
/// different runner instances, so a request has a triple effect: remove the
/// job from the queue if unclaimed, abort it if it runs here, and always
/// raise the shared TTL-bounded flag for everyone else.
pub struct CancellationCoordinator {
    queues: Vec<Arc<dyn JobQueue>>,
    active: Arc<ActiveJobs>,
    store: Arc<dyn SharedStore>,
    db: SqlitePool,
    oneshot: Arc<OneShotStore>,
    notifier: StatusBroadcaster,
}

impl CancellationCoordinator {
    pub fn new(
        queues: Vec<Arc<dyn JobQueue>>,
        active: Arc<ActiveJobs>,
        store: Arc<dyn SharedStore>,
        db: SqlitePool,
        oneshot: Arc<OneShotStore>,
        notifier: StatusBroadcaster,
    ) -> Self {
        Self {
            queues,
            active,
            store,
            db,
            oneshot,
            notifier,
        }
    }

    /// Both fields false means the job was already terminal or never existed
    /// from this coordinator's point of view.
    pub async fn request_cancel(&self, job_id: &str) -> Result<CancelOutcome> {
        let mut was_queued = false;
        for queue in &self.queues {
            if queue.remove_if_queued(job_id).await? {
                was_queued = true;
                break;
            }
        }
        if was_queued {
            self.finalize_unclaimed(job_id).await;
        }

        let was_running = self.active.abort(job_id);

        self.store
            .set_ex(&cancel_key(job_id), "1", CANCEL_FLAG_TTL)
            .await?;

        log::info!(
            "Cancellation requested for job {job_id} (was_queued={was_queued}, was_running={was_running})"
        );
        Ok(CancelOutcome {
            was_queued,
            was_running,
        })
    }

    /// A job pulled out of the queue never reaches a runner, so its record
    /// is closed out here: queued straight to canceled.
    async fn finalize_unclaimed(&self, job_id: &str) {
        let finished = FinishedCompile::bare(BuildStatus::Canceled, "canceled while queued");

        match database::fetch_build(&self.db, job_id).await {
            Ok(Some(_)) => {
                match database::finish_build(&self.db, job_id, &finished).await {
                    Ok(true) => self.publish_canceled(job_id, JobKind::ProjectBuild, &finished),
                    Ok(false) => {}
                    Err(e) => log::error!("Failed to cancel build record {job_id}: {e}"),
                }
                return;
            }
            Ok(None) => {}
            Err(e) => {
                log::error!("Failed to look up build record {job_id}: {e}");
                return;
            }
        }

        match self.oneshot.finish(job_id, &finished) {
            Ok(true) => self.publish_canceled(job_id, JobKind::OneShot, &finished),
            Ok(false) => {}
            Err(e) => log::error!("Failed to cancel one-shot job {job_id}: {e}"),
        }
    }

    fn publish_canceled(&self, job_id: &str, kind: JobKind, finished: &FinishedCompile) {
        let expires_at = match kind {
            JobKind::OneShot => self
                .oneshot
                .load(job_id)
                .ok()
                .flatten()
                .and_then(|m| m.expires_at),
            JobKind::ProjectBuild => None,
        };
        self.notifier.publish(BuildEvent {
            job_id: job_id.to_string(),
            kind,
            status: BuildStatus::Canceled,
            result: Some(JobResult {
                job_id: job_id.to_string(),
                status: BuildStatus::Canceled,
                engine_used: None,
                logs: finished.logs.clone(),
                duration_ms: None,
                exit_code: None,
                artifact_path: None,
                errors: Vec::new(),
                warning_count: 0,
                error_count: 0,
                expires_at,
            }),
        });
    }
}
