use std::time::Duration;

use anyhow::Result;
use sqlx::SqlitePool;

use crate::database;
use crate::oneshot::OneShotStore;

/// Fixed explanation written into records closed out by the boot sweep
pub const RESTART_MESSAGE: &str = "compile interrupted by server restart";

#[derive(Debug, Clone, Copy)]
pub struct SweepReport {
    pub builds: u64,
    pub oneshot: u64,
}

/// One-time boot pass over both result stores.
///
/// Records still queued or compiling that predate the staleness window can
/// only belong to a process that died; they are forced to error with a fixed
/// message. Anything newer may simply be slow and is left alone.
pub async fn sweep_on_boot(
    db: &SqlitePool,
    oneshot: &OneShotStore,
    staleness: Duration,
) -> Result<SweepReport> {
    let cutoff = cutoff_timestamp(staleness);
    let builds = database::sweep_stale_builds(db, &cutoff, RESTART_MESSAGE).await?;
    let oneshot_count = oneshot.sweep_stale(&cutoff, RESTART_MESSAGE)?;

    if builds + oneshot_count > 0 {
        log::warn!(
            "Boot sweep closed {builds} abandoned builds and {oneshot_count} abandoned one-shot jobs"
        );
    }
    Ok(SweepReport {
        builds,
        oneshot: oneshot_count,
    })
}

fn cutoff_timestamp(staleness: Duration) -> String {
    use chrono::{SecondsFormat, Utc};
    let cutoff =
        Utc::now() - chrono::Duration::from_std(staleness).unwrap_or(chrono::Duration::zero());
    cutoff.to_rfc3339_opts(SecondsFormat::Millis, true)
}
