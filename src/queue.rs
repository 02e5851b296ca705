use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::Notify;

use crate::job::CompileJob;

/// How long one claim attempt waits before giving the worker loop a chance
/// to observe shutdown
const CLAIM_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Enqueued,
    /// A job with the same id is already waiting; the submission is a no-op
    Duplicate,
}

/// Durable, de-duplicated work queue keyed by job id.
///
/// Claims are atomic: two runner instances never both receive the same job.
/// `claim` waits a bounded amount of time and returns `None` when nothing
/// arrived, so worker loops stay responsive to shutdown.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: &CompileJob) -> Result<Enqueue>;
    async fn claim(&self) -> Result<Option<CompileJob>>;
    /// Removes a job only if it has not been claimed yet
    async fn remove_if_queued(&self, job_id: &str) -> Result<bool>;
    async fn is_connected(&self) -> bool;
}

/// In-process queue for development and tests
pub struct MemoryQueue {
    inner: tokio::sync::Mutex<QueueState>,
    notify: Notify,
}

#[derive(Default)]
struct QueueState {
    waiting: VecDeque<CompileJob>,
    ids: HashSet<String>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            inner: tokio::sync::Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: &CompileJob) -> Result<Enqueue> {
        let mut state = self.inner.lock().await;
        if !state.ids.insert(job.job_id.clone()) {
            return Ok(Enqueue::Duplicate);
        }
        state.waiting.push_back(job.clone());
        drop(state);
        self.notify.notify_one();
        Ok(Enqueue::Enqueued)
    }

    async fn claim(&self) -> Result<Option<CompileJob>> {
        {
            let mut state = self.inner.lock().await;
            if let Some(job) = state.waiting.pop_front() {
                state.ids.remove(&job.job_id);
                return Ok(Some(job));
            }
        }
        let _ = tokio::time::timeout(CLAIM_WAIT, self.notify.notified()).await;
        let mut state = self.inner.lock().await;
        if let Some(job) = state.waiting.pop_front() {
            state.ids.remove(&job.job_id);
            Ok(Some(job))
        } else {
            Ok(None)
        }
    }

    async fn remove_if_queued(&self, job_id: &str) -> Result<bool> {
        let mut state = self.inner.lock().await;
        let before = state.waiting.len();
        state.waiting.retain(|j| j.job_id != job_id);
        let removed = before != state.waiting.len();
        if removed {
            state.ids.remove(job_id);
        }
        Ok(removed)
    }

    async fn is_connected(&self) -> bool {
        true
    }
}

/// Redis-backed queue shared between runner processes.
///
/// Layout under the key prefix: a pending list holding job ids (claims pop
/// it atomically), a waiting set for dedup, and one payload key per job.
pub struct RedisQueue {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisQueue {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }

    fn pending_key(&self) -> String {
        format!("{}:pending", self.prefix)
    }

    fn waiting_key(&self) -> String {
        format!("{}:waiting", self.prefix)
    }

    fn payload_key(&self, job_id: &str) -> String {
        format!("{}:job:{}", self.prefix, job_id)
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(&self, job: &CompileJob) -> Result<Enqueue> {
        let mut conn = self.conn.clone();
        let added: i64 = conn
            .sadd(self.waiting_key(), &job.job_id)
            .await
            .context("queue backend sadd failed")?;
        if added == 0 {
            return Ok(Enqueue::Duplicate);
        }
        let payload = serde_json::to_string(job)?;
        let _: () = conn
            .set(self.payload_key(&job.job_id), payload)
            .await
            .context("queue backend set failed")?;
        let _: i64 = conn
            .rpush(self.pending_key(), &job.job_id)
            .await
            .context("queue backend rpush failed")?;
        Ok(Enqueue::Enqueued)
    }

    async fn claim(&self) -> Result<Option<CompileJob>> {
        let mut conn = self.conn.clone();
        // Plain LPOP plus a short sleep: a blocking pop would stall every
        // other user of the multiplexed connection.
        let popped: Option<String> = conn
            .lpop(self.pending_key(), None)
            .await
            .context("queue backend lpop failed")?;
        let Some(job_id) = popped else {
            tokio::time::sleep(CLAIM_WAIT).await;
            return Ok(None);
        };
        let _: i64 = conn.srem(self.waiting_key(), &job_id).await?;
        let payload: Option<String> = redis::cmd("GETDEL")
            .arg(self.payload_key(&job_id))
            .query_async(&mut conn)
            .await
            .context("queue backend getdel failed")?;
        match payload {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => {
                log::warn!("claimed job {job_id} had no payload, discarding");
                Ok(None)
            }
        }
    }

    async fn remove_if_queued(&self, job_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .lrem(self.pending_key(), 1, job_id)
            .await
            .context("queue backend lrem failed")?;
        if removed == 0 {
            return Ok(false);
        }
        let _: i64 = conn.srem(self.waiting_key(), job_id).await?;
        let _: i64 = conn.del(self.payload_key(job_id)).await?;
        Ok(true)
    }

    async fn is_connected(&self) -> bool {
        let mut conn = self.conn.clone();
        let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        pong.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobKind;

    fn job(id: &str) -> CompileJob {
        CompileJob {
            job_id: id.to_string(),
            owner_scope: "p1".to_string(),
            triggered_by: "alice".to_string(),
            engine: "auto".to_string(),
            main_file: "main.tex".to_string(),
            kind: JobKind::ProjectBuild,
        }
    }

    #[tokio::test]
    async fn duplicate_submission_keeps_one_entry() {
        let queue = MemoryQueue::new();
        assert_eq!(queue.enqueue(&job("a")).await.unwrap(), Enqueue::Enqueued);
        assert_eq!(queue.enqueue(&job("a")).await.unwrap(), Enqueue::Duplicate);

        let first = queue.claim().await.unwrap();
        assert_eq!(first.unwrap().job_id, "a");
        let second = queue.claim().await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn id_is_reusable_after_claim() {
        let queue = MemoryQueue::new();
        queue.enqueue(&job("a")).await.unwrap();
        queue.claim().await.unwrap().unwrap();
        assert_eq!(queue.enqueue(&job("a")).await.unwrap(), Enqueue::Enqueued);
    }

    #[tokio::test]
    async fn remove_if_queued_only_hits_unclaimed_jobs() {
        let queue = MemoryQueue::new();
        queue.enqueue(&job("a")).await.unwrap();
        assert!(queue.remove_if_queued("a").await.unwrap());
        assert!(!queue.remove_if_queued("a").await.unwrap());
        assert!(queue.claim().await.unwrap().is_none());

        queue.enqueue(&job("b")).await.unwrap();
        queue.claim().await.unwrap().unwrap();
        assert!(!queue.remove_if_queued("b").await.unwrap());
    }
}
