//! Backend adapters and runner dispatch.
//!
//! This module defines the abstractions the orchestrator uses to turn an
//! allocated [`Environment`] into a running test. The design is pluggable:
//! each [`BackendType`] has exactly one [`Backend`] registered in the
//! [`Dispatcher`], and that backend hands out [`Runner`]s bound to a single
//! environment.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Dispatcher                            │
//! │  (one backend per backend type)                              │
//! │                                                              │
//! │  select(test, environment) ──────► Runner                    │
//! └────────────────────────────────┼────────────────────────────┘
//!                                  │
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Runner                               │
//! │  (bound to one allocated environment)                        │
//! │                                                              │
//! │  execute(test, ctx) ───► Execution                           │
//! │  cleanup()          ───► verified clean?                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Built-in Backends
//!
//! | Backend | Module | Description |
//! |---------|--------|-------------|
//! | Container | [`container`] | Docker containers driven through the engine API |
//! | Emulated hardware | [`emulator`] | Emulator instances driven by shell templates |
//! | Physical | [`physical`] | Boards reached over `ssh` |
//!
//! # Error Handling
//!
//! Backend operations return [`ProviderResult<T>`]. A test that runs and
//! exits non-zero is *not* an error: it is an [`Execution`] with
//! [`ExitStatus::Exited`]. Errors mean the runner itself could not do its
//! job, and [`ProviderError::is_transient`] tells the orchestrator whether a
//! retry is worthwhile.

pub mod container;
pub mod emulator;
pub mod physical;
pub mod process;

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::config::BackendsConfig;
use crate::model::{ArtifactRef, EnvironmentId, ResourceUsage, TestSpec};
use crate::pool::{BackendType, Environment, HardwareRequirement};

/// Result type for backend and runner operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors that can occur while provisioning, driving or cleaning an environment.
///
/// Errors are categorized to enable appropriate handling strategies:
/// - **Transient**: `Timeout`, `Connection` - may succeed on retry
/// - **Fatal**: `CreateFailed`, `NotFound`, `ExecFailed` - surfaced as-is
/// - **Resource**: `Exhausted` - nothing left to provision from;
///   `Unsupported` - the backend cannot provide what was asked
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Failed to create a new environment.
    ///
    /// Common causes: image not found, emulator failed to boot, no launch
    /// command configured.
    #[error("Failed to provision environment: {0}")]
    CreateFailed(String),

    /// Failed to start a command in the environment or talk to it mid-run.
    ///
    /// A command that runs and exits non-zero is NOT this error.
    #[error("Failed to execute command: {0}")]
    ExecFailed(String),

    /// The environment's backing resource does not exist.
    #[error("Environment not found: {0}")]
    NotFound(String),

    /// Failed to establish or keep a connection to the backend.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A backend operation (not the test itself) timed out.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The backend has no more capacity to provision from.
    #[error("Backend exhausted: {0}")]
    Exhausted(String),

    /// The backend cannot vouch for part of the requirement (an architecture
    /// or feature flag it does not provide). Retrying will not help.
    #[error("Requirement not supported: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Backend error: {0}")]
    Other(#[from] anyhow::Error),
}

impl ProviderError {
    /// Whether the failure looks like an infrastructure blip worth one more try.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Connection(_) | ProviderError::Timeout(_))
    }
}

/// Errors raised while choosing a runner for an allocation.
///
/// These are configuration errors: retrying will not help.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no backend registered for backend type '{backend}' (environment {environment})")]
    Unsupported {
        backend: BackendType,
        environment: EnvironmentId,
    },
}

/// A single line of output from a running test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

impl OutputLine {
    pub fn text(&self) -> &str {
        match self {
            OutputLine::Stdout(s) | OutputLine::Stderr(s) => s,
        }
    }
}

/// Callback invoked for every output line as it is produced.
pub type OutputCallback = Arc<dyn Fn(&OutputLine) + Send + Sync>;

/// Per-execution context handed to [`Runner::execute`].
#[derive(Clone)]
pub struct ExecContext {
    /// Cancelled when the runner must forcibly stop the test (deadline or
    /// plan cancellation). The runner then returns [`ExitStatus::Killed`]
    /// with whatever output it captured.
    pub kill: CancellationToken,

    /// How long a killed runner may spend draining partial output.
    pub grace: Duration,

    pub output: Option<OutputCallback>,
}

impl ExecContext {
    pub fn new(kill: CancellationToken, grace: Duration) -> Self {
        Self {
            kill,
            grace,
            output: None,
        }
    }

    pub fn with_output(mut self, callback: OutputCallback) -> Self {
        self.output = Some(callback);
        self
    }

    pub fn emit(&self, line: &OutputLine) {
        if let Some(callback) = &self.output {
            callback(line);
        }
    }
}

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    /// The test process ran to completion with this exit code.
    Exited(i32),

    /// The runner killed the test after its kill token fired.
    Killed,

    /// The runner lost its transport mid-run (e.g. ssh exit 255). Output up
    /// to that point is kept.
    Disconnected(String),
}

/// Everything a runner observed while executing one test.
#[derive(Debug, Clone)]
pub struct Execution {
    pub exit: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub artifacts: Vec<ArtifactRef>,
}

impl Execution {
    pub fn usage(&self) -> ResourceUsage {
        ResourceUsage {
            wall_clock_ms: self.duration.as_millis() as u64,
            stdout_bytes: self.stdout.len() as u64,
            stderr_bytes: self.stderr.len() as u64,
        }
    }
}

/// Accumulates output lines into stdout/stderr buffers.
#[derive(Debug, Default, Clone)]
pub struct OutputCapture {
    pub stdout: String,
    pub stderr: String,
}

impl OutputCapture {
    pub fn push(&mut self, line: OutputLine) {
        let buf = match line {
            OutputLine::Stdout(s) => {
                self.stdout.push_str(&s);
                &mut self.stdout
            }
            OutputLine::Stderr(s) => {
                self.stderr.push_str(&s);
                &mut self.stderr
            }
        };
        buf.push('\n');
    }

    pub fn into_execution(
        self,
        exit: ExitStatus,
        duration: Duration,
        artifacts: Vec<ArtifactRef>,
    ) -> Execution {
        Execution {
            exit,
            stdout: self.stdout,
            stderr: self.stderr,
            duration,
            artifacts,
        }
    }
}

/// A runner bound to one allocated environment.
#[async_trait]
pub trait Runner: Send + Sync {
    fn environment(&self) -> &EnvironmentId;

    /// Runs `test` to completion or until `ctx.kill` fires.
    ///
    /// Must return promptly after the kill token is cancelled, carrying the
    /// partial output captured so far.
    async fn execute(&self, test: &TestSpec, ctx: ExecContext) -> ProviderResult<Execution>;

    /// Restores the environment to a pristine state. Returns `true` only if
    /// cleanliness was verified.
    async fn cleanup(&self) -> bool;
}

/// Provisioning interface implemented by each backend adapter.
#[async_trait]
pub trait Backend: Send + Sync {
    fn backend_type(&self) -> BackendType;

    /// Whether an environment provisioned for `requirement` would really have
    /// every requested capability. Only such requirements are provisioned.
    fn can_provision(&self, requirement: &HardwareRequirement) -> bool;

    /// Creates a new environment satisfying `requirement`, registered under `id`.
    async fn provision(
        &self,
        id: &EnvironmentId,
        requirement: &HardwareRequirement,
    ) -> ProviderResult<Environment>;

    async fn teardown(&self, environment: &Environment) -> ProviderResult<()>;

    async fn health_check(&self, environment: &Environment) -> bool;

    fn runner(&self, environment: &Environment) -> Box<dyn Runner>;
}

/// Maps each backend type to its single backend adapter.
#[derive(Default, Clone)]
pub struct Dispatcher {
    backends: HashMap<BackendType, Arc<dyn Backend>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds one adapter per configured backend table.
    pub fn from_config(backends: &BackendsConfig) -> ProviderResult<Self> {
        let mut dispatcher = Self::new();
        if let Some(config) = &backends.container {
            dispatcher = dispatcher
                .with_backend(Arc::new(container::ContainerBackend::new(config.clone())?));
        }
        if let Some(config) = &backends.emulator {
            dispatcher =
                dispatcher.with_backend(Arc::new(emulator::EmulatorBackend::new(config.clone())));
        }
        if let Some(config) = &backends.physical {
            dispatcher =
                dispatcher.with_backend(Arc::new(physical::PhysicalBackend::new(config.clone())));
        }
        Ok(dispatcher)
    }

    /// Registers `backend`, replacing any previous adapter for its type.
    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backends.insert(backend.backend_type(), backend);
        self
    }

    pub fn backend(&self, backend: BackendType) -> Option<&Arc<dyn Backend>> {
        self.backends.get(&backend)
    }

    pub fn supports(&self, backend: BackendType) -> bool {
        self.backends.contains_key(&backend)
    }

    /// Chooses the runner for `test` on `environment`.
    ///
    /// The environment's backend type alone decides the runner class.
    pub fn select(
        &self,
        test: &TestSpec,
        environment: &Environment,
    ) -> Result<Box<dyn Runner>, DispatchError> {
        let backend = self
            .backends
            .get(&environment.backend)
            .ok_or_else(|| DispatchError::Unsupported {
                backend: environment.backend,
                environment: environment.id.clone(),
            })?;
        tracing::debug!(
            test = %test.id,
            environment = %environment.id,
            backend = %environment.backend,
            "Selected runner"
        );
        Ok(backend.runner(environment))
    }

    /// Checks that every environment in the pool has a registered backend.
    pub fn validate_pool<'a>(
        &self,
        environments: impl IntoIterator<Item = &'a Environment>,
    ) -> Result<(), DispatchError> {
        for env in environments {
            if !self.supports(env.backend) {
                return Err(DispatchError::Unsupported {
                    backend: env.backend,
                    environment: env.id.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Builds the shell script that runs `test`: working directory, exported
/// environment, then the command itself.
pub fn shell_script(test: &TestSpec) -> String {
    let mut script = String::new();
    if let Some(dir) = &test.working_dir {
        script.push_str(&format!("cd {} && ", shell_words::quote(dir)));
    }
    for (key, value) in &test.env {
        script.push_str(&format!("export {}={}; ", key, shell_words::quote(value)));
    }
    script.push_str(&test.command);
    script
}

static PROGRESS_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*::progress\s+(\d{1,3}(?:\.\d+)?)\s*$").expect("valid progress pattern")
});

/// Parses a `::progress N` marker (N in 0..=100) into a 0.0..=1.0 fraction.
pub fn parse_progress(line: &str) -> Option<f32> {
    let caps = PROGRESS_MARKER.captures(line)?;
    let pct: f32 = caps.get(1)?.as_str().parse().ok()?;
    if pct > 100.0 {
        return None;
    }
    Some(pct / 100.0)
}
