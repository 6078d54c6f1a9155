//! Configuration schema definitions for testgrid.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── OrchestratorConfig     - Worker pool, deadlines, retries, state dir
//! ├── ProvisioningConfig     - On-demand environment provisioning
//! ├── BackendsConfig         - One optional table per backend type
//! │   ├── container          - Docker containers
//! │   ├── emulator           - Emulated hardware via command templates
//! │   └── physical           - Boards reached over ssh
//! └── [[environments]]       - Static pool entries
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::EnvironmentId;
use crate::pool::{Architecture, BackendType, Environment, HardwareCapabilities};

/// Root configuration structure for testgrid.
///
/// # TOML Structure
///
/// ```toml
/// [orchestrator]
/// max_parallel = 4
/// test_timeout_secs = 600
///
/// [backends.emulator]
/// launch_command = "qemu-launch --arch {arch} --mem {memory_mb} --name {instance}"
/// exec_command = "qemu-exec {instance} -- sh -c {command}"
///
/// [[environments]]
/// id = "qemu-arm-1"
/// backend = "emulated_hardware"
/// architecture = "arm64"
/// memory_mb = 2048
/// cpu_cores = 2
/// ```
///
/// # Example
///
/// ```
/// use testgrid::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [orchestrator]
///     max_parallel = 2
///
///     [backends.emulator]
///     exec_command = "sh -c {command}"
/// "#).unwrap();
/// assert_eq!(config.orchestrator.max_parallel, 2);
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub provisioning: ProvisioningConfig,

    #[serde(default)]
    pub backends: BackendsConfig,

    /// Statically declared pool entries.
    #[serde(default)]
    pub environments: Vec<EnvironmentConfig>,
}

/// Core orchestrator settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `max_parallel` | 8 |
/// | `test_timeout_secs` | 900 (15 minutes) |
/// | `kill_grace_secs` | 5 |
/// | `release_timeout_secs` | 60 |
/// | `transient_retries` | 1 |
/// | `transient_patterns` | connection/network failure patterns |
/// | `idle_poll_ms` | 500 |
/// | `pending_timeout_secs` | None (wait forever) |
/// | `state_dir` | `.testgrid` |
/// | `stream_output` | false |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    /// Upper bound on concurrent scheduler iterations.
    ///
    /// The effective worker count is further capped by the number of
    /// environments the pool can ever hold.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Deadline for a test that does not set its own `timeout_secs`.
    #[serde(default = "default_test_timeout")]
    pub test_timeout_secs: u64,

    /// How long a killed runner may spend flushing partial output.
    #[serde(default = "default_kill_grace")]
    pub kill_grace_secs: u64,

    /// Upper bound on runner cleanup before the environment is declared
    /// unhealthy.
    #[serde(default = "default_release_timeout")]
    pub release_timeout_secs: u64,

    /// Automatic retries for runner failures that look transient.
    #[serde(default = "default_transient_retries")]
    pub transient_retries: u32,

    /// Regular expressions matched against a runner failure message and the
    /// test's stderr to classify the failure as transient.
    #[serde(default = "default_transient_patterns")]
    pub transient_patterns: Vec<String>,

    /// Fallback poll interval for idle workers.
    #[serde(default = "default_idle_poll")]
    pub idle_poll_ms: u64,

    /// Terminate tests that stay un-allocatable for this long as `error`.
    #[serde(default)]
    pub pending_timeout_secs: Option<u64>,

    /// Directory holding the durable state file.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Print test output lines as they are produced.
    #[serde(default)]
    pub stream_output: bool,

    /// Finished plans kept in the state file; older ones are pruned. 0
    /// keeps every plan.
    #[serde(default = "default_retain_plans")]
    pub retain_plans: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            test_timeout_secs: default_test_timeout(),
            kill_grace_secs: default_kill_grace(),
            release_timeout_secs: default_release_timeout(),
            transient_retries: default_transient_retries(),
            transient_patterns: default_transient_patterns(),
            idle_poll_ms: default_idle_poll(),
            pending_timeout_secs: None,
            state_dir: default_state_dir(),
            stream_output: false,
            retain_plans: default_retain_plans(),
        }
    }
}

impl OrchestratorConfig {
    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn release_timeout(&self) -> Duration {
        Duration::from_secs(self.release_timeout_secs)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn pending_timeout(&self) -> Option<Duration> {
        self.pending_timeout_secs.map(Duration::from_secs)
    }
}

fn default_max_parallel() -> usize {
    8
}

fn default_test_timeout() -> u64 {
    900 // 15 minutes
}

fn default_kill_grace() -> u64 {
    5
}

fn default_release_timeout() -> u64 {
    60
}

fn default_transient_retries() -> u32 {
    1
}

fn default_transient_patterns() -> Vec<String> {
    vec![
        "(?i)connection (reset|refused|closed)".to_string(),
        "(?i)broken pipe".to_string(),
        "(?i)network is unreachable".to_string(),
        "(?i)no route to host".to_string(),
    ]
}

fn default_retain_plans() -> usize {
    500
}

fn default_idle_poll() -> u64 {
    500
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".testgrid")
}

/// On-demand provisioning of new environments.
///
/// Provisioning is only attempted when no environment in the pool could ever
/// satisfy a request, and never beyond `max_environments`.
///
/// # Example
///
/// ```toml
/// [provisioning]
/// enabled = true
/// max_attempts = 3
/// backoff_ms = 500
/// max_environments = 16
/// default_backend = "emulated_hardware"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProvisioningConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Attempts per provisioning request before the slot is marked unhealthy.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay of the exponential backoff between attempts.
    #[serde(default = "default_backoff")]
    pub backoff_ms: u64,

    /// Pool size limit, counting every status.
    #[serde(default = "default_max_environments")]
    pub max_environments: usize,

    /// Backend used when a request has no preference of its own.
    #[serde(default = "default_backend")]
    pub default_backend: BackendType,

    /// Interval of the unhealthy-environment recovery sweep. 0 disables it.
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff(),
            max_environments: default_max_environments(),
            default_backend: default_backend(),
            health_check_interval_secs: default_health_interval(),
        }
    }
}

impl ProvisioningConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff() -> u64 {
    500
}

fn default_max_environments() -> usize {
    32
}

fn default_backend() -> BackendType {
    BackendType::Container
}

fn default_health_interval() -> u64 {
    60
}

/// Backend adapter settings. Only configured backends are registered.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BackendsConfig {
    #[serde(default)]
    pub container: Option<ContainerBackendConfig>,

    #[serde(default)]
    pub emulator: Option<EmulatorBackendConfig>,

    #[serde(default)]
    pub physical: Option<PhysicalBackendConfig>,
}

impl BackendsConfig {
    pub fn is_configured(&self, backend: BackendType) -> bool {
        match backend {
            BackendType::Container => self.container.is_some(),
            BackendType::EmulatedHardware => self.emulator.is_some(),
            BackendType::Physical => self.physical.is_some(),
        }
    }
}

/// Docker container backend.
///
/// # Example
///
/// ```toml
/// [backends.container]
/// image = "ubuntu:24.04"
/// network_mode = "none"
///
/// [backends.container.env]
/// CI = "1"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContainerBackendConfig {
    /// Image every container is created (and recreated) from.
    pub image: String,

    /// Docker daemon address. Local defaults when unset.
    #[serde(default)]
    pub docker_host: Option<String>,

    #[serde(default = "default_network_mode")]
    pub network_mode: String,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub working_dir: Option<String>,

    /// Platforms the engine can run `image` on. Empty means the host
    /// architecture only.
    #[serde(default)]
    pub architectures: Vec<Architecture>,

    /// Feature flags every container from `image` provides.
    #[serde(default)]
    pub features: Vec<String>,

    /// Bound on engine calls during cleanup and provisioning.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_network_mode() -> String {
    "bridge".to_string()
}

fn default_command_timeout() -> u64 {
    120
}

/// Emulated-hardware backend driven by shell command templates.
///
/// Placeholders: `{instance}` (environment handle), `{command}` (the quoted
/// test script), `{arch}`, `{memory_mb}` and `{cpu_cores}`.
///
/// # Example
///
/// ```toml
/// [backends.emulator]
/// launch_command = "emuctl start {instance} --arch {arch} --mem {memory_mb} --smp {cpu_cores}"
/// exec_command = "emuctl exec {instance} -- sh -c {command}"
/// reset_command = "emuctl restore {instance} --snapshot clean"
/// health_command = "emuctl ping {instance}"
/// destroy_command = "emuctl stop {instance}"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmulatorBackendConfig {
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Boots a new instance. Provisioning is unavailable without it.
    #[serde(default)]
    pub launch_command: Option<String>,

    pub exec_command: String,

    /// Restores an instance to its clean snapshot. Without it, cleanup is a
    /// no-op that always verifies clean.
    #[serde(default)]
    pub reset_command: Option<String>,

    #[serde(default)]
    pub health_command: Option<String>,

    #[serde(default)]
    pub destroy_command: Option<String>,

    /// Architectures `launch_command` can boot. Empty means any, since
    /// `{arch}` is passed through to the emulator.
    #[serde(default)]
    pub architectures: Vec<Architecture>,

    /// Feature flags every launched instance provides.
    #[serde(default)]
    pub features: Vec<String>,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl EmulatorBackendConfig {
    /// Only an exec template: no provisioning, and cleanup always verifies.
    pub fn new(exec_command: impl Into<String>) -> Self {
        Self {
            shell: default_shell(),
            launch_command: None,
            exec_command: exec_command.into(),
            reset_command: None,
            health_command: None,
            destroy_command: None,
            architectures: Vec::new(),
            features: Vec::new(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

/// Physical boards reached over ssh.
///
/// # Example
///
/// ```toml
/// [backends.physical]
/// user = "ci"
/// identity_file = "~/.ssh/boards"
/// reset_command = "sudo /usr/local/bin/board-reset"
///
/// [[backends.physical.standby]]
/// host = "rpi-07.lab"
/// architecture = "arm64"
/// memory_mb = 4096
/// cpu_cores = 4
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PhysicalBackendConfig {
    #[serde(default = "default_ssh_program")]
    pub ssh_program: String,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    /// Private key path, `~` expanded.
    #[serde(default)]
    pub identity_file: Option<String>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Skip host key verification (lab networks with reflashed boards).
    #[serde(default)]
    pub disable_host_key_check: bool,

    /// Run on the board after every test. Cleanup verifies clean only if it
    /// exits zero.
    #[serde(default)]
    pub reset_command: Option<String>,

    #[serde(default = "default_health_command")]
    pub health_command: String,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Boards that may be claimed by provisioning.
    #[serde(default)]
    pub standby: Vec<BoardConfig>,
}

fn default_ssh_program() -> String {
    "ssh".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_health_command() -> String {
    "true".to_string()
}

/// A standby board in the physical inventory.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BoardConfig {
    pub host: String,

    #[serde(flatten)]
    pub capabilities: HardwareCapabilities,
}

/// A statically declared pool entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EnvironmentConfig {
    pub id: String,

    pub backend: BackendType,

    /// Backend address. Defaults to the id.
    #[serde(default)]
    pub handle: Option<String>,

    #[serde(flatten)]
    pub capabilities: HardwareCapabilities,
}

impl EnvironmentConfig {
    pub fn to_environment(&self) -> Environment {
        Environment::new(
            EnvironmentId::new(self.id.clone()),
            self.backend,
            self.handle.clone().unwrap_or_else(|| self.id.clone()),
            self.capabilities.clone(),
        )
    }
}
