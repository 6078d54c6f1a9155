//! Docker container backend.
//!
//! Each container environment is a long-lived container kept running with
//! `sleep infinity`; tests run inside it through the engine's exec API.
//!
//! | Operation | Engine calls |
//! |-----------|--------------|
//! | execute | `create_exec` + `start_exec`, exit code from `inspect_exec` |
//! | kill | `kill_container` with `SIGKILL` |
//! | cleanup | `remove_container` (forced), then create + start from the image, verified running |
//! | provision | create + start with CPU/memory limits from the requirement |
//! | teardown | `remove_container` (forced) |

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, KillContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{ContainerStateStatusEnum, HostConfig};
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::{
    Backend, ExecContext, Execution, ExitStatus, OutputCapture, OutputLine, ProviderError,
    ProviderResult, Runner, shell_script,
};
use crate::config::ContainerBackendConfig;
use crate::model::{ArtifactRef, EnvironmentId, TestSpec};
use crate::pool::{
    Architecture, BackendType, Environment, HardwareCapabilities, HardwareRequirement,
};

/// Backend for Docker container environments.
pub struct ContainerBackend {
    docker: Docker,
    config: Arc<ContainerBackendConfig>,
}

impl ContainerBackend {
    /// Creates the backend. The engine is not contacted until first use.
    pub fn new(config: ContainerBackendConfig) -> ProviderResult<Self> {
        let docker = if let Some(host) = &config.docker_host {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| ProviderError::Connection(e.to_string()))?
        } else {
            Docker::connect_with_local_defaults()
                .map_err(|e| ProviderError::Connection(e.to_string()))?
        };

        Ok(Self {
            docker,
            config: Arc::new(config),
        })
    }

    /// Platforms this backend can start containers for.
    fn architectures(&self) -> Vec<Architecture> {
        if self.config.architectures.is_empty() {
            Architecture::host().into_iter().collect()
        } else {
            self.config.architectures.clone()
        }
    }
}

/// Docker platform string for an architecture.
fn docker_platform(arch: Architecture) -> &'static str {
    match arch {
        Architecture::X86_64 => "linux/amd64",
        Architecture::Arm64 => "linux/arm64",
        Architecture::Armv7 => "linux/arm/v7",
        Architecture::Riscv64 => "linux/riscv64",
    }
}

fn host_config(config: &ContainerBackendConfig, caps: &HardwareCapabilities) -> HostConfig {
    HostConfig {
        network_mode: Some(config.network_mode.clone()),
        // CPU period in microseconds; quota is cores * period
        cpu_period: Some(100_000),
        cpu_quota: Some(i64::from(caps.cpu_cores) * 100_000),
        memory: Some((caps.memory_mb as i64) * 1024 * 1024),
        ..Default::default()
    }
}

/// Removes any container under `name`, then creates and starts a fresh one.
async fn recreate(
    docker: &Docker,
    config: &ContainerBackendConfig,
    name: &str,
    caps: &HardwareCapabilities,
) -> ProviderResult<()> {
    let removed = docker
        .remove_container(
            name,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        )
        .await;
    if let Err(e) = removed {
        // absent containers are expected on first provision
        debug!(container = %name, error = %e, "Remove before recreate failed");
    }

    let env: Vec<String> = config
        .env
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();

    let container_config = ContainerConfig {
        image: Some(config.image.clone()),
        env: Some(env),
        working_dir: config.working_dir.clone(),
        host_config: Some(host_config(config, caps)),
        // Keep container running
        cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
        tty: Some(false),
        ..Default::default()
    };

    let options = CreateContainerOptions {
        name: name.to_string(),
        platform: Some(docker_platform(caps.architecture).to_string()),
    };

    docker
        .create_container(Some(options), container_config)
        .await
        .map_err(|e| ProviderError::CreateFailed(e.to_string()))?;

    docker
        .start_container(name, None::<StartContainerOptions<String>>)
        .await
        .map_err(|e| ProviderError::CreateFailed(e.to_string()))?;

    Ok(())
}

async fn is_running(docker: &Docker, name: &str) -> bool {
    match docker.inspect_container(name, None).await {
        Ok(info) => matches!(
            info.state.and_then(|s| s.status),
            Some(ContainerStateStatusEnum::RUNNING)
        ),
        Err(e) => {
            debug!(container = %name, error = %e, "Inspect failed");
            false
        }
    }
}

#[async_trait]
impl Backend for ContainerBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Container
    }

    fn can_provision(&self, requirement: &HardwareRequirement) -> bool {
        requirement.within(&self.architectures(), &self.config.features)
    }

    async fn provision(
        &self,
        id: &EnvironmentId,
        requirement: &HardwareRequirement,
    ) -> ProviderResult<Environment> {
        let architectures = self.architectures();
        if !requirement.within(&architectures, &self.config.features) {
            return Err(ProviderError::Unsupported(format!(
                "image {} does not provide {:?}",
                self.config.image, requirement
            )));
        }
        let Some(&fallback) = architectures.first() else {
            return Err(ProviderError::Unsupported(
                "no container platform for this host".to_string(),
            ));
        };
        let caps =
            HardwareCapabilities::from_requirement(requirement, fallback, &self.config.features);
        let name = format!("testgrid-{}", id);
        let timeout = Duration::from_secs(self.config.command_timeout_secs);

        tokio::time::timeout(timeout, recreate(&self.docker, &self.config, &name, &caps))
            .await
            .map_err(|_| ProviderError::Timeout(format!("creating container {name}")))??;

        let mut environment = Environment::new(id.clone(), BackendType::Container, name, caps);
        environment.ephemeral = true;
        info!(environment = %id, container = %environment.handle, "Provisioned container");
        Ok(environment)
    }

    async fn teardown(&self, environment: &Environment) -> ProviderResult<()> {
        self.docker
            .remove_container(
                &environment.handle,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| ProviderError::Other(e.into()))?;
        Ok(())
    }

    async fn health_check(&self, environment: &Environment) -> bool {
        is_running(&self.docker, &environment.handle).await
    }

    fn runner(&self, environment: &Environment) -> Box<dyn Runner> {
        Box::new(ContainerRunner {
            docker: self.docker.clone(),
            config: self.config.clone(),
            environment: environment.clone(),
        })
    }
}

/// Runs tests inside one container.
pub struct ContainerRunner {
    docker: Docker,
    config: Arc<ContainerBackendConfig>,
    environment: Environment,
}

impl ContainerRunner {
    fn name(&self) -> &str {
        &self.environment.handle
    }

    async fn kill(&self) {
        let killed = self
            .docker
            .kill_container(self.name(), Some(KillContainerOptions { signal: "SIGKILL" }))
            .await;
        if let Err(e) = killed {
            warn!(container = %self.name(), error = %e, "Failed to kill container");
        }
    }
}

#[async_trait]
impl Runner for ContainerRunner {
    fn environment(&self) -> &EnvironmentId {
        &self.environment.id
    }

    async fn execute(&self, test: &TestSpec, ctx: ExecContext) -> ProviderResult<Execution> {
        let start = Instant::now();
        let exec_cmd = vec!["/bin/sh".to_string(), "-c".to_string(), shell_script(test)];

        let exec_options = CreateExecOptions {
            cmd: Some(exec_cmd),
            working_dir: test.working_dir.clone().or_else(|| self.config.working_dir.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(self.name(), exec_options)
            .await
            .map_err(|e| ProviderError::ExecFailed(e.to_string()))?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| ProviderError::ExecFailed(e.to_string()))?;

        let StartExecResults::Attached { mut output, .. } = started else {
            return Err(ProviderError::ExecFailed("exec started detached".to_string()));
        };

        let mut capture = OutputCapture::default();
        let mut stdout = LineBuffer::default();
        let mut stderr = LineBuffer::default();

        let mut handle = |msg: LogOutput, capture: &mut OutputCapture| {
            let lines = match msg {
                LogOutput::StdOut { message } | LogOutput::Console { message } => stdout
                    .feed(&message)
                    .into_iter()
                    .map(OutputLine::Stdout)
                    .collect::<Vec<_>>(),
                LogOutput::StdErr { message } => stderr
                    .feed(&message)
                    .into_iter()
                    .map(OutputLine::Stderr)
                    .collect(),
                LogOutput::StdIn { .. } => Vec::new(),
            };
            for line in lines {
                ctx.emit(&line);
                capture.push(line);
            }
        };

        let mut lost = None;
        let killed = loop {
            tokio::select! {
                biased;
                _ = ctx.kill.cancelled() => break true,
                msg = output.next() => match msg {
                    Some(Ok(msg)) => handle(msg, &mut capture),
                    Some(Err(e)) => {
                        lost = Some(format!("exec stream: {e}"));
                        break false;
                    }
                    None => break false,
                },
            }
        };

        if killed {
            self.kill().await;
            let _ = tokio::time::timeout(ctx.grace, async {
                while let Some(Ok(msg)) = output.next().await {
                    handle(msg, &mut capture);
                }
            })
            .await;
        }
        drop(handle);
        if let Some(line) = stdout.finish() {
            capture.push(OutputLine::Stdout(line));
        }
        if let Some(line) = stderr.finish() {
            capture.push(OutputLine::Stderr(line));
        }

        let exit = if killed {
            ExitStatus::Killed
        } else if let Some(reason) = lost {
            warn!(container = %self.name(), %reason, "Lost exec stream");
            ExitStatus::Disconnected(reason)
        } else {
            let inspect = self
                .docker
                .inspect_exec(&exec.id)
                .await
                .map_err(|e| ProviderError::ExecFailed(e.to_string()))?;
            ExitStatus::Exited(inspect.exit_code.unwrap_or(-1) as i32)
        };

        let artifacts = test
            .artifacts
            .iter()
            .map(|path| ArtifactRef {
                environment: self.environment.id.clone(),
                path: path.clone(),
            })
            .collect();

        Ok(capture.into_execution(exit, start.elapsed(), artifacts))
    }

    async fn cleanup(&self) -> bool {
        let timeout = Duration::from_secs(self.config.command_timeout_secs);
        let recreated = tokio::time::timeout(
            timeout,
            recreate(
                &self.docker,
                &self.config,
                self.name(),
                &self.environment.capabilities,
            ),
        )
        .await;

        match recreated {
            Ok(Ok(())) => is_running(&self.docker, self.name()).await,
            Ok(Err(e)) => {
                warn!(container = %self.name(), error = %e, "Failed to recreate container");
                false
            }
            Err(_) => {
                warn!(container = %self.name(), "Recreating container timed out");
                false
            }
        }
    }
}

/// Splits a byte stream into lines across chunk boundaries.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.push_str(&String::from_utf8_lossy(chunk));
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.find('\n') {
            let rest = self.pending.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.pending, rest);
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}
