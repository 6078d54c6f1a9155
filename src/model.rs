//! Core data model: plans, tests, per-attempt status records and results.
//!
//! Every state field is a closed enum. Ids are opaque string newtypes so the
//! state store can be addressed without ambient global maps.
//!
//! ```text
//! ExecutionPlan ──► TestSpec ──► TestExecutionStatus (one per attempt)
//!                                        │
//!                                        ▼
//!                                   TestResult (one per attempt)
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pool::{AllocationRequest, BackendType, HardwareRequirement, IsolationLevel};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Identifier of a submitted execution plan.
    PlanId
);
string_id!(
    /// Identifier of a test, unique within its plan.
    TestId
);
string_id!(
    /// Identifier of a pool environment.
    EnvironmentId
);

impl PlanId {
    /// Generates a fresh random plan id.
    pub fn generate() -> Self {
        Self(format!("plan-{}", uuid::Uuid::new_v4()))
    }
}

/// Addresses one test inside one plan.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TestKey {
    pub plan: PlanId,
    pub test: TestId,
}

impl TestKey {
    pub fn new(plan: impl Into<PlanId>, test: impl Into<TestId>) -> Self {
        Self {
            plan: plan.into(),
            test: test.into(),
        }
    }
}

impl fmt::Display for TestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.plan, self.test)
    }
}

/// Scheduling priority of a plan. Higher priorities dequeue first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// A single test inside a plan: what to run and what it needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSpec {
    pub id: TestId,

    /// Shell command executed inside the allocated environment.
    pub command: String,

    /// Working directory inside the environment.
    #[serde(default)]
    pub working_dir: Option<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub requirement: HardwareRequirement,

    #[serde(default)]
    pub isolation: IsolationLevel,

    /// Preferred backend. Other compatible backends are used as fallback.
    #[serde(default)]
    pub backend: Option<BackendType>,

    /// Overrides the plan priority for this test.
    #[serde(default)]
    pub priority: Option<Priority>,

    /// Overrides the orchestrator-wide deadline for this test.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Paths inside the environment the result should reference.
    #[serde(default)]
    pub artifacts: Vec<String>,
}

impl TestSpec {
    pub fn new(id: impl Into<TestId>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            working_dir: None,
            env: BTreeMap::new(),
            requirement: HardwareRequirement::default(),
            isolation: IsolationLevel::default(),
            backend: None,
            priority: None,
            timeout_secs: None,
            artifacts: Vec::new(),
        }
    }

    pub fn with_requirement(mut self, requirement: HardwareRequirement) -> Self {
        self.requirement = requirement;
        self
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_backend(mut self, backend: BackendType) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// The allocation request this test presents to the resource manager.
    pub fn allocation_request(&self) -> AllocationRequest {
        AllocationRequest {
            requirement: self.requirement.clone(),
            isolation: self.isolation,
            backend: self.backend,
        }
    }
}

/// Errors raised while validating a submitted plan.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("plan {0} contains no tests")]
    Empty(PlanId),

    #[error("plan {plan} lists test {test} more than once")]
    DuplicateTest { plan: PlanId, test: TestId },

    #[error("test {0} has an empty command")]
    EmptyCommand(TestKey),
}

/// A submitted unit of work.
///
/// Immutable after submission; lifecycle state lives in the status tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    #[serde(default = "PlanId::generate")]
    pub id: PlanId,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default = "Utc::now")]
    pub submitted_at: DateTime<Utc>,

    pub tests: Vec<TestSpec>,
}

impl ExecutionPlan {
    pub fn new(id: impl Into<PlanId>, priority: Priority, tests: Vec<TestSpec>) -> Self {
        Self {
            id: id.into(),
            priority,
            submitted_at: Utc::now(),
            tests,
        }
    }

    /// Checks the structural rules the orchestrator relies on.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.tests.is_empty() {
            return Err(PlanError::Empty(self.id.clone()));
        }
        let mut seen = std::collections::HashSet::new();
        for test in &self.tests {
            if !seen.insert(&test.id) {
                return Err(PlanError::DuplicateTest {
                    plan: self.id.clone(),
                    test: test.id.clone(),
                });
            }
            if test.command.trim().is_empty() {
                return Err(PlanError::EmptyCommand(TestKey::new(
                    self.id.clone(),
                    test.id.clone(),
                )));
            }
        }
        Ok(())
    }

    pub fn key(&self, test: &TestId) -> TestKey {
        TestKey::new(self.id.clone(), test.clone())
    }

    pub fn test(&self, id: &TestId) -> Option<&TestSpec> {
        self.tests.iter().find(|t| &t.id == id)
    }

    /// Priority a test is queued at: its own, or the plan's.
    pub fn priority_of(&self, test: &TestSpec) -> Priority {
        test.priority.unwrap_or(self.priority)
    }
}

/// Loads a plan from a `.toml` or `.json` file.
pub fn load_plan(path: &Path) -> Result<ExecutionPlan> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan file: {}", path.display()))?;

    let plan: ExecutionPlan = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse plan file: {}", path.display()))?,
        _ => toml::from_str(&content)
            .with_context(|| format!("Failed to parse plan file: {}", path.display()))?,
    };

    Ok(plan)
}

/// Plan-level lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl PlanState {
    pub fn is_terminal(self) -> bool {
        match self {
            PlanState::Queued | PlanState::Running => false,
            PlanState::Completed | PlanState::Failed | PlanState::Cancelled => true,
        }
    }
}

impl fmt::Display for PlanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlanState::Queued => "queued",
            PlanState::Running => "running",
            PlanState::Completed => "completed",
            PlanState::Failed => "failed",
            PlanState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Per-attempt test state machine.
///
/// ```text
/// queued ──► allocating ──► running ──► completed | failed | timeout | error | cancelled
///   │             │
///   └─► cancelled └─► error | cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestState {
    Queued,
    Allocating,
    Running,
    Completed,
    Failed,
    Timeout,
    Error,
    Cancelled,
}

impl TestState {
    pub fn is_terminal(self) -> bool {
        match self {
            TestState::Queued | TestState::Allocating | TestState::Running => false,
            TestState::Completed
            | TestState::Failed
            | TestState::Timeout
            | TestState::Error
            | TestState::Cancelled => true,
        }
    }

    /// Whether `self → next` is a legal forward transition.
    ///
    /// Retries never appear here: they create a new attempt record instead.
    pub fn can_transition_to(self, next: TestState) -> bool {
        match self {
            TestState::Queued => matches!(next, TestState::Allocating | TestState::Cancelled),
            TestState::Allocating => matches!(
                next,
                TestState::Running | TestState::Error | TestState::Cancelled
            ),
            TestState::Running => next.is_terminal(),
            TestState::Completed
            | TestState::Failed
            | TestState::Timeout
            | TestState::Error
            | TestState::Cancelled => false,
        }
    }
}

impl fmt::Display for TestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TestState::Queued => "queued",
            TestState::Allocating => "allocating",
            TestState::Running => "running",
            TestState::Completed => "completed",
            TestState::Failed => "failed",
            TestState::Timeout => "timeout",
            TestState::Error => "error",
            TestState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Live status of one attempt of one test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestExecutionStatus {
    pub key: TestKey,

    /// 1-based attempt number.
    pub attempt: u32,

    pub state: TestState,

    pub environment: Option<EnvironmentId>,

    /// Queue timestamp of this attempt; also its FIFO position on recovery.
    pub queued_at: DateTime<Utc>,

    pub started_at: Option<DateTime<Utc>>,

    pub finished_at: Option<DateTime<Utc>>,

    /// Progress between 0.0 and 1.0.
    pub progress: f32,

    pub message: Option<String>,

    /// Number of retries that preceded this attempt.
    pub retry_count: u32,
}

impl TestExecutionStatus {
    pub fn queued(key: TestKey, attempt: u32, queued_at: DateTime<Utc>) -> Self {
        Self {
            key,
            attempt,
            state: TestState::Queued,
            environment: None,
            queued_at,
            started_at: None,
            finished_at: None,
            progress: 0.0,
            message: None,
            retry_count: attempt.saturating_sub(1),
        }
    }
}

/// A reference to an artifact left inside an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub environment: EnvironmentId,
    pub path: String,
}

/// Resource usage captured for an attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub wall_clock_ms: u64,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
}

/// Terminal output of one attempt. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub key: TestKey,
    pub attempt: u32,
    pub environment: Option<EnvironmentId>,
    pub state: TestState,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
    #[serde(default)]
    pub usage: ResourceUsage,
    pub message: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Aggregated view of a plan at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlanStatus {
    pub plan: PlanId,
    pub state: PlanState,
    pub priority: Priority,
    pub total: usize,
    pub queued: usize,
    pub allocating: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub errored: usize,
    pub cancelled: usize,
    /// Attempts beyond the first, summed over all tests.
    pub retries: usize,
}

impl ExecutionPlanStatus {
    /// Tests that reached a terminal state other than `completed`.
    pub fn unsuccessful(&self) -> usize {
        self.failed + self.timed_out + self.errored + self.cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        let all = [
            TestState::Queued,
            TestState::Allocating,
            TestState::Running,
            TestState::Completed,
            TestState::Failed,
            TestState::Timeout,
            TestState::Error,
            TestState::Cancelled,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be illegal");
            }
        }
    }

    #[test]
    fn test_forward_transitions() {
        assert!(TestState::Queued.can_transition_to(TestState::Allocating));
        assert!(TestState::Allocating.can_transition_to(TestState::Running));
        assert!(TestState::Running.can_transition_to(TestState::Timeout));
        assert!(!TestState::Queued.can_transition_to(TestState::Running));
        assert!(!TestState::Running.can_transition_to(TestState::Queued));
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let plan = ExecutionPlan::new(
            "p",
            Priority::Normal,
            vec![TestSpec::new("a", "true"), TestSpec::new("a", "false")],
        );
        assert_eq!(
            plan.validate(),
            Err(PlanError::DuplicateTest {
                plan: PlanId::from("p"),
                test: TestId::from("a"),
            })
        );
    }

    #[test]
    fn test_validate_rejects_empty() {
        let plan = ExecutionPlan::new("p", Priority::Low, vec![]);
        assert!(matches!(plan.validate(), Err(PlanError::Empty(_))));

        let plan = ExecutionPlan::new("p", Priority::Low, vec![TestSpec::new("a", "  ")]);
        assert!(matches!(plan.validate(), Err(PlanError::EmptyCommand(_))));
    }

    #[test]
    fn test_plan_from_toml() {
        let plan: ExecutionPlan = toml::from_str(
            r#"
            id = "nightly"
            priority = "high"

            [[tests]]
            id = "boot"
            command = "./boot-test.sh"
            timeout_secs = 30
            backend = "emulated_hardware"

            [tests.requirement]
            architecture = "arm64"
            memory_mb = 2048
            "#,
        )
        .unwrap();

        assert_eq!(plan.id.as_str(), "nightly");
        assert_eq!(plan.priority, Priority::High);
        assert_eq!(plan.tests.len(), 1);
        assert_eq!(plan.tests[0].timeout_secs, Some(30));
        assert_eq!(plan.tests[0].backend, Some(BackendType::EmulatedHardware));
        assert_eq!(plan.tests[0].requirement.memory_mb, Some(2048));
    }
}
