use serde::Serialize;
use tokio::sync::broadcast;

use crate::job::{BuildStatus, JobKind, JobResult};

/// One status transition of one job, emitted in transition order. Terminal
/// events carry the full result payload.
#[derive(Serialize, Debug, Clone)]
pub struct BuildEvent {
    pub job_id: String,
    pub kind: JobKind,
    pub status: BuildStatus,
    pub result: Option<JobResult>,
}

/// Fan-out channel towards the external notification collaborator (the
/// real-time sync layer subscribes here; pollers read the stores instead).
#[derive(Clone)]
pub struct StatusBroadcaster {
    tx: broadcast::Sender<BuildEvent>,
}

impl StatusBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: BuildEvent) {
        log::debug!(
            "Publishing status {} for job {}",
            event.status.as_str(),
            event.job_id
        );
        // No receiver is fine; events are best-effort towards subscribers,
        // the stores remain the source of truth
        let _ = self.tx.send(event);
    }
}
