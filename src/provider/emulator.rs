//! Emulated-hardware backend driven by shell command templates.
//!
//! Emulators (QEMU, vendor simulators, device farms with a CLI) differ
//! wildly in how they are driven, so this backend delegates every operation
//! to a user-defined command template run through the configured shell.
//!
//! # Command Protocol
//!
//! | Template | Used by | Success criterion |
//! |----------|---------|-------------------|
//! | `launch_command` | provisioning | exit 0; last stdout line (if any) becomes the instance handle |
//! | `exec_command` | test execution | exit code is the test's exit code |
//! | `reset_command` | cleanup | exit 0 means verified clean |
//! | `health_command` | health sweep | exit 0 |
//! | `destroy_command` | decommission | exit 0 |
//!
//! Placeholders are substituted shell-quoted: `{instance}`, `{arch}`,
//! `{memory_mb}`, `{cpu_cores}` and, for `exec_command` only, `{command}`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::process::{self, CommandOutput};
use super::{
    Backend, ExecContext, Execution, ExitStatus, ProviderError, ProviderResult, Runner,
    shell_script,
};
use crate::config::EmulatorBackendConfig;
use crate::model::{ArtifactRef, EnvironmentId, TestSpec};
use crate::pool::{
    Architecture, BackendType, Environment, HardwareCapabilities, HardwareRequirement,
};

/// Backend for emulated-hardware environments.
pub struct EmulatorBackend {
    config: Arc<EmulatorBackendConfig>,
}

impl EmulatorBackend {
    pub fn new(config: EmulatorBackendConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    fn supports_architecture(&self, requirement: &HardwareRequirement) -> bool {
        let architectures = &self.config.architectures;
        architectures.is_empty()
            || requirement
                .architecture
                .is_none_or(|a| architectures.contains(&a))
    }

    async fn run_template(
        &self,
        template: &str,
        environment: &Environment,
    ) -> ProviderResult<CommandOutput> {
        run_template(&self.config, template, environment).await
    }
}

async fn run_template(
    config: &EmulatorBackendConfig,
    template: &str,
    environment: &Environment,
) -> ProviderResult<CommandOutput> {
    let rendered = render(template, &vars(environment), None);
    debug!(environment = %environment.id, command = %rendered, "Running emulator command");
    process::run_bounded(
        process::shell(&config.shell, &rendered),
        Duration::from_secs(config.command_timeout_secs),
    )
    .await
}

fn vars(environment: &Environment) -> [(&'static str, String); 4] {
    let caps = &environment.capabilities;
    [
        ("instance", environment.handle.clone()),
        ("arch", caps.architecture.to_string()),
        ("memory_mb", caps.memory_mb.to_string()),
        ("cpu_cores", caps.cpu_cores.to_string()),
    ]
}

/// Substitutes `{name}` placeholders with shell-quoted values.
///
/// `{command}` is substituted last so text inside the test script is never
/// mistaken for a placeholder.
fn render(template: &str, vars: &[(&str, String)], command: Option<&str>) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{name}}}"), &shell_words::quote(value));
    }
    if let Some(command) = command {
        out = out.replace("{command}", &shell_words::quote(command));
    }
    out
}

#[async_trait]
impl Backend for EmulatorBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::EmulatedHardware
    }

    fn can_provision(&self, requirement: &HardwareRequirement) -> bool {
        self.config.launch_command.is_some()
            && self.supports_architecture(requirement)
            && requirement.features.iter().all(|f| self.config.features.contains(f))
    }

    async fn provision(
        &self,
        id: &EnvironmentId,
        requirement: &HardwareRequirement,
    ) -> ProviderResult<Environment> {
        let Some(launch) = &self.config.launch_command else {
            return Err(ProviderError::CreateFailed(
                "emulator backend has no launch_command".to_string(),
            ));
        };
        if !self.can_provision(requirement) {
            return Err(ProviderError::Unsupported(format!(
                "emulator cannot launch {requirement:?}"
            )));
        }

        let fallback = self
            .config
            .architectures
            .first()
            .copied()
            .or_else(Architecture::host)
            .unwrap_or(Architecture::X86_64);
        let capabilities =
            HardwareCapabilities::from_requirement(requirement, fallback, &self.config.features);
        let mut environment = Environment::new(
            id.clone(),
            BackendType::EmulatedHardware,
            id.as_str(),
            capabilities,
        );
        environment.ephemeral = true;

        let output = self.run_template(launch, &environment).await?;
        if !output.success() {
            return Err(ProviderError::CreateFailed(format!(
                "launch_command exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }

        // instance id is the last line of stdout
        if let Some(handle) = output.stdout.lines().map(str::trim).rfind(|l| !l.is_empty()) {
            environment.handle = handle.to_string();
        }
        info!(
            environment = %environment.id,
            instance = %environment.handle,
            "Launched emulator instance"
        );
        Ok(environment)
    }

    async fn teardown(&self, environment: &Environment) -> ProviderResult<()> {
        let Some(destroy) = &self.config.destroy_command else {
            return Ok(());
        };
        let output = self.run_template(destroy, environment).await?;
        if !output.success() {
            return Err(ProviderError::ExecFailed(format!(
                "destroy_command exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn health_check(&self, environment: &Environment) -> bool {
        let Some(health) = &self.config.health_command else {
            return true;
        };
        match self.run_template(health, environment).await {
            Ok(output) => output.success(),
            Err(e) => {
                warn!(environment = %environment.id, error = %e, "Health command failed");
                false
            }
        }
    }

    fn runner(&self, environment: &Environment) -> Box<dyn Runner> {
        Box::new(EmulatorRunner {
            config: self.config.clone(),
            environment: environment.clone(),
            settled: AtomicBool::new(true),
        })
    }
}

/// Runs tests inside one emulator instance.
pub struct EmulatorRunner {
    config: Arc<EmulatorBackendConfig>,
    environment: Environment,
    /// False while a test runs and after one was killed or lost, since the
    /// instance may still hold its processes.
    settled: AtomicBool,
}

#[async_trait]
impl Runner for EmulatorRunner {
    fn environment(&self) -> &EnvironmentId {
        &self.environment.id
    }

    async fn execute(&self, test: &TestSpec, ctx: ExecContext) -> ProviderResult<Execution> {
        let script = shell_script(test);
        let rendered = render(
            &self.config.exec_command,
            &vars(&self.environment),
            Some(&script),
        );
        debug!(test = %test.id, environment = %self.environment.id, "Executing on emulator");

        self.settled.store(false, Ordering::SeqCst);
        let captured =
            process::run_captured(process::shell(&self.config.shell, &rendered), &ctx).await?;
        let exit = match captured.code {
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
        let Some(reset) = &self.config.reset_command else {
            let settled = self.settled.load(Ordering::SeqCst);
            if !settled {
                warn!(
                    environment = %self.environment.id,
                    "No reset_command to clean up after an interrupted test"
                );
            }
            return settled;
        };
        match run_template(&self.config, reset, &self.environment).await {
            Ok(output) if output.success() => true,
            Ok(output) => {
                warn!(
                    environment = %self.environment.id,
                    exit_code = output.exit_code,
                    "Reset command did not verify clean"
                );
                false
            }
            Err(e) => {
                warn!(environment = %self.environment.id, error = %e, "Reset command failed");
                false
            }
        }
    }
}
