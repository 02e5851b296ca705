use std::fs;
use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::create_timestamp;
use crate::job::{BuildStatus, CompileJob, FinishedCompile};

const DATABASE_NAME: &str = "texd.sqlite3";

pub fn get_db_path() -> PathBuf {
    use directories::ProjectDirs;

    let proj_dirs = ProjectDirs::from("", "", "texd").expect("Unable to find user directory");
    let data_dir = proj_dirs.data_local_dir();

    fs::create_dir_all(data_dir).expect("Failed to create local data dir");

    data_dir.join(DATABASE_NAME)
}

pub async fn init_db(db_path: impl AsRef<Path>) -> sqlx::Result<SqlitePool> {
    let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display()); // rwc = read/write/create
    let db_pool = SqlitePoolOptions::new()
        .max_connections(2)
        .min_connections(0) // Allow pool to shrink when idle
        .connect(&db_url)
        .await?;

    // Execute PRAGMA statements first (these cannot be run inside a transaction)
    for pragma_sql in &[
        "PRAGMA foreign_keys = ON;",
        "PRAGMA busy_timeout = 2000;", // 2 seconds timeout for lock contention
        "PRAGMA journal_mode = WAL;",  // Write-Ahead Logging for better concurrency
        "PRAGMA synchronous = NORMAL;", // Balance between safety and performance
    ] {
        sqlx::query(pragma_sql).execute(&db_pool).await?;
    }

    for sql in &[
        r"
        CREATE TABLE IF NOT EXISTS builds (
            id            TEXT     PRIMARY KEY,
            project_id    TEXT     NOT NULL,
            owner_id      TEXT     NOT NULL,
            status        TEXT     NOT NULL,
            engine_used   TEXT,
            logs          TEXT     NOT NULL DEFAULT '',
            duration_ms   INTEGER,
            exit_code     INTEGER,
            artifact_path TEXT,
            created_at    TEXT     NOT NULL,
            completed_at  TEXT
        );",
        "CREATE INDEX IF NOT EXISTS idx_builds_status ON builds(status);",
        "CREATE INDEX IF NOT EXISTS idx_builds_project ON builds(project_id, created_at);",
    ] {
        sqlx::query(sql).execute(&db_pool).await?;
    }

    log::info!("Initialized database at {}", db_path.as_ref().display());

    Ok(db_pool)
}

pub fn remove_db(db_path: impl AsRef<Path>) {
    // Remove WAL and SHM files (ignore errors as they might not exist)
    let wal_path = format!("{}-wal", db_path.as_ref().display());
    let shm_path = format!("{}-shm", db_path.as_ref().display());
    let _ = fs::remove_file(wal_path);
    let _ = fs::remove_file(shm_path);

    if let Err(e) = std::fs::remove_file(&db_path) {
        log::warn!(
            "Unable to remove database at {}: {e}",
            db_path.as_ref().display()
        );
    } else {
        log::info!("Removed database at {}", db_path.as_ref().display());
    }
}

/// Persistent record of one project build, the durable shadow of a queued job
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct BuildRecord {
    pub id: String,
    pub project_id: String,
    pub owner_id: String,
    pub status: String,
    pub engine_used: Option<String>,
    pub logs: String,
    pub duration_ms: Option<i64>,
    pub exit_code: Option<i64>,
    pub artifact_path: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

impl BuildRecord {
    pub fn parsed_status(&self) -> BuildStatus {
        BuildStatus::parse(&self.status).unwrap_or(BuildStatus::Error)
    }
}

/// Creates the queued record for a submitted job. A resubmission of an id
/// that already exists leaves the existing record untouched.
pub async fn create_build(pool: &SqlitePool, job: &CompileJob) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO builds (id, project_id, owner_id, status, created_at)
        VALUES (?, ?, ?, 'queued', ?)
        ON CONFLICT(id) DO NOTHING
        "#,
    )
    .bind(&job.job_id)
    .bind(&job.owner_scope)
    .bind(&job.triggered_by)
    .bind(create_timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

/// Moves a queued build to compiling; returns false when the record is no
/// longer in the queued state (already claimed, finished or canceled)
pub async fn mark_compiling(pool: &SqlitePool, job_id: &str) -> sqlx::Result<bool> {
    let result = sqlx::query("UPDATE builds SET status = 'compiling' WHERE id = ? AND status = 'queued'")
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Writes a terminal outcome. The guard on the current status makes terminal
/// states write-once: a record that already finished is never overwritten.
pub async fn finish_build(
    pool: &SqlitePool,
    job_id: &str,
    finished: &FinishedCompile,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE builds
        SET status = ?, engine_used = ?, logs = ?, duration_ms = ?,
            exit_code = ?, artifact_path = ?, completed_at = ?
        WHERE id = ? AND status IN ('queued', 'compiling')
        "#,
    )
    .bind(finished.status.as_str())
    .bind(&finished.engine_used)
    .bind(&finished.logs)
    .bind(finished.duration_ms)
    .bind(finished.exit_code)
    .bind(&finished.artifact_path)
    .bind(create_timestamp())
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn fetch_build(pool: &SqlitePool, job_id: &str) -> sqlx::Result<Option<BuildRecord>> {
    sqlx::query_as::<_, BuildRecord>("SELECT * FROM builds WHERE id = ?")
        .bind(job_id)
        .fetch_optional(pool)
        .await
}

/// Closes out builds abandoned by a previous process: still queued or
/// compiling, and created before the cutoff. Returns how many were swept.
pub async fn sweep_stale_builds(
    pool: &SqlitePool,
    cutoff: &str,
    message: &str,
) -> sqlx::Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE builds
        SET status = 'error', logs = ?, completed_at = ?
        WHERE status IN ('queued', 'compiling') AND created_at < ?
        "#,
    )
    .bind(message)
    .bind(create_timestamp())
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
