mod docker;
mod engine;
mod process;

pub use docker::DockerSandbox;
pub use engine::{BASELINE_ENGINE, detect_engine, resolve_engine};
pub use process::ProcessSandbox;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Safety bound on draining captured output once the process has stopped
pub(crate) const OUTPUT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// One compile invocation inside an isolated environment
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Job-unique directory holding the source tree; mounted read-write
    pub workdir: PathBuf,
    /// Fully rendered compiler command line
    pub command: Vec<String>,
    pub timeout: Duration,
    pub memory_limit_mb: u32,
    pub cpu_fraction: f64,
}

/// Raw execution result. The exit code is absent when the process was
/// killed; a cancellation is visible to the caller through its own abort
/// token, not through this value.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_code: Option<i64>,
    pub output: String,
    pub timed_out: bool,
}

/// Trait for different sandbox execution backends
///
/// Abstracts the execution environment for one compile - from a fully
/// isolated container to a plain local process for development setups.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn execute(&self, request: &ExecRequest, abort: &CancellationToken)
    -> Result<ExecOutcome>;
}

/// Creates a sandbox backend based on what the host offers
///
/// If a Docker daemon answers, compiles run in resource-capped,
/// network-isolated containers. Otherwise execution falls back to plain
/// processes with timeout handling only.
pub async fn create_sandbox(image: &str) -> Arc<dyn Sandbox> {
    match DockerSandbox::build(image).await {
        Ok(sandbox) => {
            log::info!("Creating DockerSandbox with image {image} (full isolation mode)");
            Arc::new(sandbox)
        }
        Err(e) => {
            log::info!("Docker daemon unavailable ({e}), creating ProcessSandbox");
            Arc::new(ProcessSandbox::new())
        }
    }
}

/// Applies the %MAIN% substitution to an engine command template
pub fn render_command(template: &[String], main_file: &str) -> Vec<String> {
    template
        .iter()
        .map(|part| part.replace("%MAIN%", main_file))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_substitution_touches_every_argument() {
        let template: Vec<String> = ["latexmk", "-pdf", "%MAIN%"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let rendered = render_command(&template, "paper.tex");
        assert_eq!(rendered, vec!["latexmk", "-pdf", "paper.tex"]);
    }
}
