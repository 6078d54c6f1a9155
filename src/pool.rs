//! Environment pool: the allocatable execution backends and their matching rules.
//!
//! The pool itself is a plain data structure. It is not synchronized; the
//! [`ResourceManager`](crate::resource::ResourceManager) owns it behind the
//! allocation mutex.
//!
//! # Matching
//!
//! An environment qualifies for a request when:
//!
//! | Dimension | Rule |
//! |-----------|------|
//! | Architecture | equal, or the request has no constraint |
//! | Memory / CPU | capability ≥ requirement |
//! | Features | requested flags ⊆ environment flags |
//! | Isolation | backend's strongest isolation ≥ requested level |
//!
//! Qualifying environments are ranked by exact backend preference first,
//! then least recently used, then id.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::EnvironmentId;

/// Kind of execution backend behind an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    Container,
    #[serde(alias = "emulator")]
    EmulatedHardware,
    #[serde(alias = "board")]
    Physical,
}

impl BackendType {
    pub const ALL: [BackendType; 3] = [
        BackendType::Container,
        BackendType::EmulatedHardware,
        BackendType::Physical,
    ];

    /// Strongest isolation this backend can guarantee.
    pub fn max_isolation(self) -> IsolationLevel {
        match self {
            BackendType::Container => IsolationLevel::Container,
            BackendType::EmulatedHardware | BackendType::Physical => IsolationLevel::FullMachine,
        }
    }

    pub fn supports(self, isolation: IsolationLevel) -> bool {
        isolation <= self.max_isolation()
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendType::Container => "container",
            BackendType::EmulatedHardware => "emulated_hardware",
            BackendType::Physical => "physical",
        };
        f.write_str(s)
    }
}

/// Isolation a test requires from its environment, weakest first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    #[default]
    None,
    Process,
    Container,
    FullMachine,
}

/// CPU architecture of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    #[serde(alias = "amd64")]
    X86_64,
    #[serde(alias = "aarch64")]
    Arm64,
    #[serde(alias = "armhf")]
    Armv7,
    Riscv64,
}

impl Architecture {
    /// Architecture of the machine running the orchestrator, if recognised.
    pub fn host() -> Option<Self> {
        match std::env::consts::ARCH {
            "x86_64" => Some(Architecture::X86_64),
            "aarch64" => Some(Architecture::Arm64),
            "arm" => Some(Architecture::Armv7),
            "riscv64" => Some(Architecture::Riscv64),
            _ => None,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Architecture::X86_64 => "x86_64",
            Architecture::Arm64 => "arm64",
            Architecture::Armv7 => "armv7",
            Architecture::Riscv64 => "riscv64",
        };
        f.write_str(s)
    }
}

/// Declared hardware of an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareCapabilities {
    pub architecture: Architecture,
    pub memory_mb: u64,
    pub cpu_cores: u32,
    #[serde(default)]
    pub features: Vec<String>,
}

impl HardwareCapabilities {
    pub fn satisfies(&self, requirement: &HardwareRequirement) -> bool {
        if let Some(arch) = requirement.architecture
            && arch != self.architecture
        {
            return false;
        }
        if requirement.memory_mb.is_some_and(|m| self.memory_mb < m) {
            return false;
        }
        if requirement.cpu_cores.is_some_and(|c| self.cpu_cores < c) {
            return false;
        }
        requirement
            .features
            .iter()
            .all(|f| self.features.iter().any(|have| have == f))
    }

    /// Smallest capabilities that satisfy `requirement`, used when provisioning.
    ///
    /// Feature flags are not copied from the requirement: a provisioned
    /// environment only claims the `features` its backend vouches for.
    pub fn from_requirement(
        requirement: &HardwareRequirement,
        fallback: Architecture,
        features: &[String],
    ) -> Self {
        Self {
            architecture: requirement.architecture.unwrap_or(fallback),
            memory_mb: requirement.memory_mb.unwrap_or(1024),
            cpu_cores: requirement.cpu_cores.unwrap_or(1),
            features: features.to_vec(),
        }
    }
}

/// Minimum hardware a test declares. Unset dimensions are unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareRequirement {
    #[serde(default)]
    pub architecture: Option<Architecture>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub cpu_cores: Option<u32>,
    #[serde(default)]
    pub features: Vec<String>,
}

impl HardwareRequirement {
    pub fn architecture(mut self, arch: Architecture) -> Self {
        self.architecture = Some(arch);
        self
    }

    pub fn memory_mb(mut self, mb: u64) -> Self {
        self.memory_mb = Some(mb);
        self
    }

    pub fn cpu_cores(mut self, cores: u32) -> Self {
        self.cpu_cores = Some(cores);
        self
    }

    pub fn feature(mut self, flag: impl Into<String>) -> Self {
        self.features.push(flag.into());
        self
    }

    /// Whether a backend offering `architectures` and `features` can honour
    /// this requirement. Memory and CPU are not checked here; backends
    /// enforce those as limits.
    pub fn within(&self, architectures: &[Architecture], features: &[String]) -> bool {
        self.architecture.is_none_or(|a| architectures.contains(&a))
            && self.features.iter().all(|f| features.contains(f))
    }
}

/// What a test asks the resource manager for. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationRequest {
    pub requirement: HardwareRequirement,
    pub isolation: IsolationLevel,
    pub backend: Option<BackendType>,
}

/// Current status of a pool entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentStatus {
    Available,
    Busy,
    Provisioning,
    Unhealthy,
}

impl fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnvironmentStatus::Available => "available",
            EnvironmentStatus::Busy => "busy",
            EnvironmentStatus::Provisioning => "provisioning",
            EnvironmentStatus::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// A pool entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub id: EnvironmentId,
    pub backend: BackendType,
    pub capabilities: HardwareCapabilities,
    pub status: EnvironmentStatus,
    pub last_used: Option<DateTime<Utc>>,

    /// Backend address: container name, emulator instance id or board host.
    pub handle: String,

    /// Provisioned on demand rather than declared in configuration.
    #[serde(default)]
    pub ephemeral: bool,
}

impl Environment {
    pub fn new(
        id: impl Into<EnvironmentId>,
        backend: BackendType,
        handle: impl Into<String>,
        capabilities: HardwareCapabilities,
    ) -> Self {
        Self {
            id: id.into(),
            backend,
            capabilities,
            status: EnvironmentStatus::Available,
            last_used: None,
            handle: handle.into(),
            ephemeral: false,
        }
    }

    /// Whether this environment could ever serve `request`, ignoring status.
    pub fn is_compatible(&self, request: &AllocationRequest) -> bool {
        self.capabilities.satisfies(&request.requirement)
            && self.backend.supports(request.isolation)
    }

    fn rank(&self, request: &AllocationRequest, other: &Environment) -> Ordering {
        let preference = |env: &Environment| match request.backend {
            Some(b) if b == env.backend => 0,
            Some(_) => 1,
            None => 0,
        };
        preference(self)
            .cmp(&preference(other))
            // never-used sorts before any timestamp
            .then_with(|| self.last_used.cmp(&other.last_used))
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// The set of known environments keyed by id.
#[derive(Debug, Default)]
pub struct EnvironmentPool {
    environments: BTreeMap<EnvironmentId, Environment>,
}

impl EnvironmentPool {
    pub fn new(environments: impl IntoIterator<Item = Environment>) -> Self {
        Self {
            environments: environments.into_iter().map(|e| (e.id.clone(), e)).collect(),
        }
    }

    pub fn insert(&mut self, environment: Environment) {
        self.environments.insert(environment.id.clone(), environment);
    }

    pub fn remove(&mut self, id: &EnvironmentId) -> Option<Environment> {
        self.environments.remove(id)
    }

    pub fn get(&self, id: &EnvironmentId) -> Option<&Environment> {
        self.environments.get(id)
    }

    pub fn get_mut(&mut self, id: &EnvironmentId) -> Option<&mut Environment> {
        self.environments.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.environments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.environments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Environment> {
        self.environments.values()
    }

    pub fn count(&self, status: EnvironmentStatus) -> usize {
        self.iter().filter(|e| e.status == status).count()
    }

    /// Best available environment for `request`, if any.
    pub fn best_match(&self, request: &AllocationRequest) -> Option<&Environment> {
        self.iter()
            .filter(|e| e.status == EnvironmentStatus::Available && e.is_compatible(request))
            .min_by(|a, b| a.rank(request, b))
    }

    /// Whether any environment that is not unhealthy could serve `request`
    /// once it frees up or finishes provisioning.
    pub fn could_satisfy(&self, request: &AllocationRequest) -> bool {
        self.iter()
            .filter(|e| e.status != EnvironmentStatus::Unhealthy)
            .any(|e| e.is_compatible(request))
    }

    /// Picks the best match and flips it to busy. Callers hold the allocation lock.
    pub fn take_best(&mut self, request: &AllocationRequest) -> Option<Environment> {
        let id = self.best_match(request)?.id.clone();
        let env = self.environments.get_mut(&id)?;
        env.status = EnvironmentStatus::Busy;
        env.last_used = Some(Utc::now());
        Some(env.clone())
    }

    pub fn snapshot(&self) -> Vec<Environment> {
        self.environments.values().cloned().collect()
    }
}
