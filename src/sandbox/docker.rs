use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::models::HostConfig;
use futures_util::stream::StreamExt;
use tokio_util::sync::CancellationToken;

use super::{ExecOutcome, ExecRequest, OUTPUT_READ_TIMEOUT, Sandbox};

/// Process-count ceiling inside a compile container
const PROCESS_LIMIT: i64 = 128;
/// How long a forced kill waits for the container to actually stop
const KILL_WAIT: Duration = Duration::from_secs(10);
/// Mount point of the job working directory inside the container
const COMPILE_DIR: &str = "/compile";

/// Container-backed sandbox for running compiles safely
///
/// Each compile gets a throwaway container with the job working directory
/// bind-mounted read-write and everything else locked down: no network, all
/// capabilities dropped, no-new-privileges, and hard process, memory and CPU
/// ceilings.
pub struct DockerSandbox {
    docker: Docker,
    image: String,
}

impl DockerSandbox {
    pub async fn build(image: &str) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("failed to connect to Docker daemon")?;
        docker
            .ping()
            .await
            .context("Docker daemon did not answer ping")?;
        Ok(Self {
            docker,
            image: image.to_string(),
        })
    }

    async fn run_container(
        &self,
        id: &str,
        request: &ExecRequest,
        abort: &CancellationToken,
    ) -> Result<ExecOutcome> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .context("failed to start container")?;

        let mut wait_stream = self.docker.wait_container(
            id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );

        let mut timed_out = false;
        let exit_code = tokio::select! {
            _ = abort.cancelled() => {
                self.kill_and_await(id).await;
                None
            }
            waited = tokio::time::timeout(request.timeout, wait_stream.next()) => match waited {
                Ok(Some(Ok(status))) => Some(status.status_code),
                Ok(_) => None,
                Err(_) => {
                    timed_out = true;
                    self.kill_and_await(id).await;
                    None
                }
            }
        };

        let output = self.read_output(id).await;

        Ok(ExecOutcome {
            exit_code,
            output,
            timed_out,
        })
    }

    /// Forcibly stops the container and awaits its exit so resources are
    /// reclaimed before output is read
    async fn kill_and_await(&self, id: &str) {
        if let Err(e) = self
            .docker
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await
        {
            log::debug!("kill_container {id}: {e}");
        }
        let mut drain = self.docker.wait_container(
            id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );
        let _ = tokio::time::timeout(KILL_WAIT, drain.next()).await;
    }

    /// Reads the captured output once the container has stopped.
    ///
    /// The log endpoint speaks a length-prefixed frame protocol multiplexing
    /// the output channels; the stream is consumed frame by frame, never as
    /// line-oriented text, and the whole read is bounded so a misbehaving
    /// channel still returns whatever was captured.
    async fn read_output(&self, id: &str) -> String {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        };
        let mut stream = self.docker.logs(id, Some(options));
        let mut captured: Vec<u8> = Vec::new();

        let drain = async {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(frame) => append_frame(&mut captured, frame),
                    Err(e) => {
                        log::warn!("log stream for container {id} ended early: {e}");
                        break;
                    }
                }
            }
        };
        if tokio::time::timeout(OUTPUT_READ_TIMEOUT, drain).await.is_err() {
            log::warn!("log read for container {id} timed out");
        }

        String::from_utf8_lossy(&captured).into_owned()
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn execute(
        &self,
        request: &ExecRequest,
        abort: &CancellationToken,
    ) -> Result<ExecOutcome> {
        let name = format!("texd-{}", uuid::Uuid::new_v4());
        let memory_bytes = i64::from(request.memory_limit_mb) * 1024 * 1024;
        let nano_cpus = (request.cpu_fraction * 1e9) as i64;

        let config = Config {
            image: Some(self.image.clone()),
            cmd: Some(request.command.clone()),
            working_dir: Some(COMPILE_DIR.to_string()),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                binds: Some(vec![format!(
                    "{}:{}",
                    request.workdir.display(),
                    COMPILE_DIR
                )]),
                memory: Some(memory_bytes),
                memory_swap: Some(memory_bytes),
                nano_cpus: Some(nano_cpus),
                pids_limit: Some(PROCESS_LIMIT),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                network_mode: Some("none".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let container = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await
            .context("failed to create container")?;

        let result = self.run_container(&container.id, request, abort).await;

        // The execution instance is removed in every path, success or not
        if let Err(e) = self
            .docker
            .remove_container(
                &container.id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            log::error!("failed to remove container {name}: {e}");
        }

        result
    }
}

fn append_frame(captured: &mut Vec<u8>, frame: LogOutput) {
    match frame {
        LogOutput::StdOut { message }
        | LogOutput::StdErr { message }
        | LogOutput::Console { message } => captured.extend_from_slice(&message),
        LogOutput::StdIn { .. } => {}
    }
}
