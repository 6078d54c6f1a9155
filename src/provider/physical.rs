//! Physical-board backend reached over ssh.
//!
//! Every command is executed as:
//!
//! ```sh
//! ssh [options] user@host "cd '/path' && export KEY='value'; command"
//! ```
//!
//! # Limitations
//!
//! - No persistent connection: each command spawns a new ssh process
//! - Killing a test kills the local ssh client; the board-side process is
//!   only guaranteed gone after `reset_command` runs during cleanup, so
//!   without one an interrupted board fails cleanup
//! - ssh exit status 255 means the transport failed, not the test, and is
//!   reported as [`ExitStatus::Disconnected`]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::process::{self, CommandOutput};
use super::{
    Backend, ExecContext, Execution, ExitStatus, ProviderError, ProviderResult, Runner,
    shell_script,
};
use crate::config::PhysicalBackendConfig;
use crate::model::{ArtifactRef, EnvironmentId, TestSpec};
use crate::pool::{BackendType, Environment, HardwareRequirement};

/// Exit status ssh uses for its own failures.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Builds ssh invocations against one lab.
#[derive(Debug, Clone)]
struct Ssh {
    program: String,
    user: Option<String>,
    opts: Vec<String>,
    command_timeout: Duration,
}

impl Ssh {
    fn from_config(config: &PhysicalBackendConfig) -> Self {
        let mut opts = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", config.connect_timeout_secs),
        ];

        if config.disable_host_key_check {
            opts.push("-o".to_string());
            opts.push("StrictHostKeyChecking=no".to_string());
            opts.push("-o".to_string());
            opts.push("UserKnownHostsFile=/dev/null".to_string());
        }

        if let Some(key_path) = &config.identity_file {
            let key = shellexpand::tilde(key_path).into_owned();
            opts.push("-i".to_string());
            opts.push(key);
        }

        if let Some(port) = config.port {
            opts.push("-p".to_string());
            opts.push(port.to_string());
        }

        Self {
            program: config.ssh_program.clone(),
            user: config.user.clone(),
            opts,
            command_timeout: Duration::from_secs(config.command_timeout_secs),
        }
    }

    fn destination(&self, host: &str) -> String {
        match &self.user {
            Some(user) => format!("{user}@{host}"),
            None => host.to_string(),
        }
    }

    fn command(&self, host: &str, remote: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.opts).arg(self.destination(host)).arg(remote);
        cmd
    }

    async fn run(&self, host: &str, remote: &str) -> ProviderResult<CommandOutput> {
        let output = process::run_bounded(self.command(host, remote), self.command_timeout).await?;
        if output.exit_code == SSH_TRANSPORT_FAILURE {
            return Err(ProviderError::Connection(format!(
                "ssh to {host} failed: {}",
                output.stderr.trim()
            )));
        }
        Ok(output)
    }
}

/// Backend for physical boards.
pub struct PhysicalBackend {
    config: Arc<PhysicalBackendConfig>,
    ssh: Arc<Ssh>,

    /// Standby hosts currently claimed by provisioned environments.
    claimed: Mutex<HashSet<String>>,
}

impl PhysicalBackend {
    pub fn new(config: PhysicalBackendConfig) -> Self {
        let ssh = Arc::new(Ssh::from_config(&config));
        Self {
            config: Arc::new(config),
            ssh,
            claimed: Mutex::new(HashSet::new()),
        }
    }

    fn claim(&self, requirement: &HardwareRequirement) -> Option<crate::config::BoardConfig> {
        let mut claimed = self.claimed.lock().unwrap_or_else(|e| e.into_inner());
        let board = self
            .config
            .standby
            .iter()
            .find(|b| !claimed.contains(&b.host) && b.capabilities.satisfies(requirement))?
            .clone();
        claimed.insert(board.host.clone());
        Some(board)
    }

    fn unclaim(&self, host: &str) {
        self.claimed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(host);
    }
}

#[async_trait]
impl Backend for PhysicalBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Physical
    }

    fn can_provision(&self, requirement: &HardwareRequirement) -> bool {
        self.config
            .standby
            .iter()
            .any(|b| b.capabilities.satisfies(requirement))
    }

    async fn provision(
        &self,
        id: &EnvironmentId,
        requirement: &HardwareRequirement,
    ) -> ProviderResult<Environment> {
        if !self.can_provision(requirement) {
            return Err(ProviderError::Unsupported(
                "no standby board has the requested capabilities".to_string(),
            ));
        }
        let board = self.claim(requirement).ok_or_else(|| {
            ProviderError::Exhausted("no standby board satisfies the requirement".to_string())
        })?;

        let mut environment = Environment::new(
            id.clone(),
            BackendType::Physical,
            board.host.clone(),
            board.capabilities.clone(),
        );
        environment.ephemeral = true;

        if !self.health_check(&environment).await {
            self.unclaim(&board.host);
            return Err(ProviderError::Connection(format!(
                "standby board {} failed its health check",
                board.host
            )));
        }

        info!(environment = %id, host = %board.host, "Claimed standby board");
        Ok(environment)
    }

    async fn teardown(&self, environment: &Environment) -> ProviderResult<()> {
        // boards are returned to standby, never destroyed
        if environment.ephemeral {
            self.unclaim(&environment.handle);
        }
        Ok(())
    }

    async fn health_check(&self, environment: &Environment) -> bool {
        match self
            .ssh
            .run(&environment.handle, &self.config.health_command)
            .await
        {
            Ok(output) => output.success(),
            Err(e) => {
                warn!(environment = %environment.id, error = %e, "Board health check failed");
                false
            }
        }
    }

    fn runner(&self, environment: &Environment) -> Box<dyn Runner> {
        Box::new(PhysicalRunner {
            ssh: self.ssh.clone(),
            reset_command: self.config.reset_command.clone(),
            environment: environment.clone(),
            settled: AtomicBool::new(true),
        })
    }
}

/// Runs tests on one board.
pub struct PhysicalRunner {
    ssh: Arc<Ssh>,
    reset_command: Option<String>,
    environment: Environment,
    /// False while a test runs and after one was killed or cut off.
    settled: AtomicBool,
}

#[async_trait]
impl Runner for PhysicalRunner {
    fn environment(&self) -> &EnvironmentId {
        &self.environment.id
    }

    async fn execute(&self, test: &TestSpec, ctx: ExecContext) -> ProviderResult<Execution> {
        let script = shell_script(test);
        debug!(test = %test.id, host = %self.environment.handle, "Executing on board");

        self.settled.store(false, Ordering::SeqCst);
        let captured =
            process::run_captured(self.ssh.command(&self.environment.handle, &script), &ctx)
                .await?;

        let exit = match captured.code {
            Some(SSH_TRANSPORT_FAILURE) => {
                let reason = captured
                    .output
                    .stderr
                    .lines()
                    .rfind(|l| !l.trim().is_empty())
                    .unwrap_or("ssh exited with status 255")
                    .to_string();
                ExitStatus::Disconnected(reason)
            }
            Some(code) => ExitStatus::Exited(code),
            None => ExitStatus::Killed,
        };
        self.settled
            .store(matches!(exit, ExitStatus::Exited(_)), Ordering::SeqCst);
        let artifacts = test
            .artifacts
            .iter()
            .map(|path| ArtifactRef {
                environment: self.environment.id.clone(),
                path: path.clone(),
            })
            .collect();

        Ok(captured
            .output
            .into_execution(exit, captured.duration, artifacts))
    }

    async fn cleanup(&self) -> bool {
        let Some(reset) = &self.reset_command else {
            let settled = self.settled.load(Ordering::SeqCst);
            if !settled {
                warn!(
                    environment = %self.environment.id,
                    "No reset_command to clean up after an interrupted test"
                );
            }
            return settled;
        };
        match self.ssh.run(&self.environment.handle, reset).await {
            Ok(output) if output.success() => true,
            Ok(output) => {
                warn!(
                    environment = %self.environment.id,
                    exit_code = output.exit_code,
                    "Board reset did not verify clean"
                );
                false
            }
            Err(e) => {
                warn!(environment = %self.environment.id, error = %e, "Board reset failed");
                false
            }
        }
    }
}
