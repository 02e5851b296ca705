use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use super::{ExecOutcome, ExecRequest, OUTPUT_READ_TIMEOUT, Sandbox};

/// A sandbox backend that executes compiles as plain local processes
///
/// ProcessSandbox honors the timeout and abort contract but enforces no
/// memory, CPU, network or privilege restrictions. This is intended for
/// development and test environments where a container runtime is not
/// available.
pub struct ProcessSandbox;

impl ProcessSandbox {
    pub fn new() -> Self {
        log::warn!(
            "ProcessSandbox provides NO security isolation - use only in trusted environments"
        );
        Self
    }
}

impl Default for ProcessSandbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn execute(
        &self,
        request: &ExecRequest,
        abort: &CancellationToken,
    ) -> Result<ExecOutcome> {
        if request.command.is_empty() {
            bail!("empty compile command");
        }

        let mut cmd = tokio::process::Command::new(&request.command[0]);
        cmd.args(&request.command[1..])
            .current_dir(&request.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn compiler {}", request.command[0]))?;

        // Readers start immediately so large output cannot fill the pipe
        // buffers, but their results are only collected after the process
        // has stopped.
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut pipe) = stdout {
                pipe.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        });
        let err_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut pipe) = stderr {
                pipe.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        });

        let waited = tokio::select! {
            _ = abort.cancelled() => None,
            waited = tokio::time::timeout(request.timeout, child.wait()) => Some(waited),
        };
        let (exit_code, timed_out) = match waited {
            // Aborted from outside; same forced-kill path as a timeout
            None => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                (None, false)
            }
            Some(Ok(Ok(status))) => (status.code().map(i64::from), false),
            Some(Ok(Err(e))) => return Err(e).context("failed to wait for compiler process"),
            Some(Err(_)) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                (None, true)
            }
        };

        let mut captured = Vec::new();
        for task in [out_task, err_task] {
            match tokio::time::timeout(OUTPUT_READ_TIMEOUT, task).await {
                Ok(Ok(Ok(bytes))) => captured.extend_from_slice(&bytes),
                Ok(Ok(Err(e))) => log::warn!("failed to read compiler output: {e}"),
                Ok(Err(e)) => log::warn!("compiler output reader failed: {e}"),
                Err(_) => log::warn!("compiler output read timed out"),
            }
        }

        Ok(ExecOutcome {
            exit_code,
            output: String::from_utf8_lossy(&captured).into_owned(),
            timed_out,
        })
    }
}
