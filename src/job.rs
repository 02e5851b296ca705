use serde::{Deserialize, Serialize};

use crate::parser::LogEntry;

/// Job ids become directory and key names, so only a conservative charset
/// is accepted
pub fn valid_id(job_id: &str) -> bool {
    !job_id.is_empty()
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// The unit of work handed to a queue. Immutable once enqueued; its
/// persistent shadow is the build record or one-shot metadata created at
/// submission time.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CompileJob {
    pub job_id: String,
    /// Identifies whose file tree the compile reads
    pub owner_scope: String,
    /// Actor for notification attribution; may differ from the owner
    pub triggered_by: String,
    /// Requested engine name, or "auto"
    pub engine: String,
    /// Entry document, relative to the source tree
    pub main_file: String,
    pub kind: JobKind,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    ProjectBuild,
    OneShot,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Queued,
    Compiling,
    Success,
    Error,
    Timeout,
    Canceled,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Compiling => "compiling",
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "compiling" => Some(Self::Compiling),
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            "timeout" => Some(Self::Timeout),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Error | Self::Timeout | Self::Canceled
        )
    }
}

/// Everything known about a compile once it reaches a terminal status
#[derive(Debug, Clone)]
pub struct FinishedCompile {
    pub status: BuildStatus,
    pub engine_used: Option<String>,
    pub logs: String,
    pub duration_ms: i64,
    pub exit_code: Option<i64>,
    pub artifact_path: Option<String>,
    pub entries: Vec<LogEntry>,
}

impl FinishedCompile {
    /// A terminal record carrying nothing but a status and an explanation,
    /// used for cancellations before execution and for infrastructure faults.
    pub fn bare(status: BuildStatus, logs: impl Into<String>) -> Self {
        Self {
            status,
            engine_used: None,
            logs: logs.into(),
            duration_ms: 0,
            exit_code: None,
            artifact_path: None,
            entries: Vec::new(),
        }
    }
}

/// Result payload served to pollers and embedded in terminal events
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JobResult {
    pub job_id: String,
    pub status: BuildStatus,
    pub engine_used: Option<String>,
    pub logs: String,
    pub duration_ms: Option<i64>,
    pub exit_code: Option<i64>,
    pub artifact_path: Option<String>,
    pub errors: Vec<LogEntry>,
    pub warning_count: u32,
    pub error_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}
