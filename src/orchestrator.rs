//! Orchestrator service: the worker pool that moves tests from queued to
//! resulted.
//!
//! # Architecture
//!
//! ```text
//!   submit(plan)
//!       │
//!       ▼
//!  StatusTracker ──persist──► StateStore
//!       │ register_plan
//!       ▼
//!  QueueMonitor ◄──────────── requeue_retry ◄────────────┐
//!       │ claim_first                                     │
//!       │   └─► ResourceManager::allocate                 │
//!       │         ├─ Allocated(env) ──► attempt::run ─────┤
//!       │         └─ Pending ──► stays queued             │
//!       ▼                                                 │
//!   worker (×N) ── Dispatcher::select ──► Runner::execute ┘
//!                                             │
//!                                             ▼
//!                               record result ──► cleanup ──► release
//! ```
//!
//! # Execution Flow
//!
//! 1. **Submission**: the plan is validated and persisted, then every test is
//!    queued at its priority.
//! 2. **Claiming**: an idle worker walks the queue in priority+FIFO order and
//!    claims the first test the resource manager can allocate for. Tests
//!    that come back pending keep their place.
//! 3. **Execution**: the attempt runs under a deadline watchdog; plan
//!    cancellation and the deadline share the same forced-termination path.
//! 4. **Completion**: the terminal state is recorded (or a retry queued),
//!    the runner cleans up and the environment is released.
//!
//! Workers wait on a [`Notify`] that is signalled by submissions, releases
//! and finished provisioning, with `idle_poll_ms` as a fallback tick.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use testgrid::config::load_config;
//! use testgrid::model::load_plan;
//! use testgrid::orchestrator::Orchestrator;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(Path::new("testgrid.toml"))?;
//!     let orchestrator = Orchestrator::from_config(&config).await?;
//!     let handle = orchestrator.start();
//!
//!     let plan = load_plan(Path::new("nightly.toml"))?;
//!     let id = orchestrator.submit(plan)?;
//!     let status = orchestrator.wait_for_plan(&id).await?;
//!     println!("{}: {}", status.plan, status.state);
//!
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod attempt;
pub mod retry;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, OrchestratorConfig};
use crate::model::{
    ExecutionPlan, ExecutionPlanStatus, PlanId, TestExecutionStatus, TestKey, TestResult,
};
use crate::pool::Environment;
use crate::provider::{DispatchError, Dispatcher, ProviderError};
use crate::queue::QueueMonitor;
use crate::resource::{Allocation, PendingReason, ResourceManager};
use crate::store::StateStore;
use crate::tracker::{StatusTracker, TrackerError};

pub use retry::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("invalid transient pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// State shared by the service handle, its workers and in-flight attempts.
pub(crate) struct Shared {
    pub(crate) config: OrchestratorConfig,
    pub(crate) health_interval: Option<Duration>,
    pub(crate) queue: QueueMonitor,
    pub(crate) tracker: StatusTracker,
    pub(crate) resources: ResourceManager,
    pub(crate) wake: Arc<Notify>,
    pub(crate) retry: RetryPolicy,
    plans: Mutex<HashMap<PlanId, CancellationToken>>,
}

impl Shared {
    /// Cancellation token of `plan`; the kill token of every attempt is a
    /// child of it.
    pub(crate) fn plan_token(&self, plan: &PlanId) -> CancellationToken {
        self.plans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(plan.clone())
            .or_default()
            .clone()
    }

    pub(crate) fn forget_plan_if_done(&self, plan: &PlanId) {
        if self
            .tracker
            .snapshot(plan)
            .is_some_and(|s| s.state.is_terminal())
        {
            self.plans
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(plan);
        }
    }

    /// Claims the first queued test an environment can be allocated for.
    fn claim(self: &Arc<Self>) -> Option<(crate::queue::QueuedTest, Environment)> {
        let mut provisioning = Vec::new();
        let claimed = self
            .queue
            .claim_first(|test| match self.resources.allocate(&test.request) {
                Allocation::Allocated(env) => Some(env),
                Allocation::Pending(PendingReason::ProvisionStarted(id)) => {
                    provisioning.push(id);
                    None
                }
                Allocation::Pending(_) => None,
            });

        for id in provisioning {
            let shared = self.clone();
            tokio::spawn(async move {
                if let Err(e) = shared.resources.provision(id.clone()).await {
                    warn!(environment = %id, error = %e, "Provisioning failed");
                }
            });
        }
        claimed
    }

    /// Terminates queued attempts that have waited longer than
    /// `pending_timeout_secs`.
    fn expire_pending(&self) {
        let Some(limit) = self.config.pending_timeout() else {
            return;
        };
        let now = Utc::now();
        let expired = self.queue.drain_where(|t| {
            (now - t.enqueued_at)
                .to_std()
                .is_ok_and(|waited| waited > limit)
        });
        for test in expired {
            let message = format!(
                "no environment became available within {}s",
                limit.as_secs()
            );
            attempt::abandon(self, &test, &message);
            self.forget_plan_if_done(&test.key.plan);
        }
    }
}

async fn worker(shared: Arc<Shared>, index: usize, shutdown: CancellationToken) {
    debug!(worker = index, "Worker started");
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        // registered before checking the queue so a wake-up in between is not lost
        let notified = shared.wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some((test, env)) = shared.claim() {
            attempt::run(shared.clone(), test, env).await;
            continue;
        }
        shared.expire_pending();

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = &mut notified => {}
            _ = tokio::time::sleep(shared.config.idle_poll()) => {}
        }
    }
    debug!(worker = index, "Worker stopped");
}

async fn health_sweep(shared: Arc<Shared>, interval: Duration, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        let recovered = shared
            .resources
            .recover_unhealthy(shared.config.release_timeout())
            .await;
        if !recovered.is_empty() {
            info!(count = recovered.len(), "Recovered unhealthy environments");
        }
    }
}

/// The orchestrator service. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    /// Opens the service over `dispatcher` and the environments declared in
    /// `config`.
    ///
    /// With a `store`, previously persisted plans are loaded and recovered:
    /// attempts that were in flight are re-queued and the environments they
    /// held are cleaned before anything else runs on them.
    pub async fn open(
        config: &Config,
        dispatcher: Dispatcher,
        store: Option<StateStore>,
    ) -> Result<Self, OrchestratorError> {
        let environments: Vec<Environment> = config
            .environments
            .iter()
            .map(|e| e.to_environment())
            .collect();
        dispatcher.validate_pool(&environments)?;

        let retry = RetryPolicy::new(
            config.orchestrator.transient_retries,
            &config.orchestrator.transient_patterns,
        )?;
        let tracker = match store {
            Some(store) => StatusTracker::open(store)?,
            None => StatusTracker::new(),
        }
        .retain_plans(config.orchestrator.retain_plans);
        let wake = Arc::new(Notify::new());
        let resources = ResourceManager::new(
            environments,
            Arc::new(dispatcher),
            config.provisioning.clone(),
            wake.clone(),
        );
        let health_interval = Some(config.provisioning.health_check_interval_secs)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let shared = Arc::new(Shared {
            config: config.orchestrator.clone(),
            health_interval,
            queue: QueueMonitor::new(),
            tracker,
            resources,
            wake,
            retry,
            plans: Mutex::new(HashMap::new()),
        });

        let recovery = shared.tracker.recover()?;
        for id in &recovery.dirty_environments {
            if shared.resources.get(id).is_none() {
                continue;
            }
            let clean = shared
                .resources
                .sanitize(id, shared.config.release_timeout())
                .await;
            info!(environment = %id, clean, "Cleaned environment after restart");
        }
        if !recovery.requeued.is_empty() {
            info!(
                requeued = recovery.requeued.len(),
                interrupted = recovery.interrupted.len(),
                "Resuming queued tests"
            );
        }
        shared.queue.extend(recovery.requeued);

        Ok(Self { shared })
    }

    /// Builds backends from `config` and persists to its `state_dir`.
    pub async fn from_config(config: &Config) -> Result<Self, OrchestratorError> {
        let dispatcher = Dispatcher::from_config(&config.backends)?;
        let store = StateStore::new(&config.orchestrator.state_dir);
        Self::open(config, dispatcher, Some(store)).await
    }

    /// Accepts a plan. It is durably persisted before this returns.
    pub fn submit(&self, plan: ExecutionPlan) -> Result<PlanId, OrchestratorError> {
        let id = plan.id.clone();
        let queued = self.shared.tracker.register_plan(plan)?;
        info!(plan = %id, tests = queued.len(), "Plan submitted");
        self.shared.queue.extend(queued);
        self.shared.wake.notify_waiters();
        Ok(id)
    }

    /// Cancels every non-terminal test of `plan`.
    ///
    /// Queued tests are cancelled immediately; running ones are killed the
    /// same way a deadline kills them. Returns the tests cancelled directly.
    pub fn cancel(&self, plan: &PlanId) -> Result<Vec<TestKey>, OrchestratorError> {
        let cancelled = self.shared.tracker.cancel_queued(plan)?;
        self.shared.queue.remove_plan(plan);
        self.shared.plan_token(plan).cancel();
        self.shared.forget_plan_if_done(plan);
        info!(plan = %plan, "Plan cancelled");
        Ok(cancelled)
    }

    /// Spawns the worker pool.
    ///
    /// The pool size is `max_parallel` capped by how many environments could
    /// ever be busy at once.
    pub fn start(&self) -> OrchestratorHandle {
        let shutdown = CancellationToken::new();
        let workers = self
            .shared
            .config
            .max_parallel
            .min(self.shared.resources.capacity())
            .max(1);

        let mut tasks: Vec<JoinHandle<()>> = (0..workers)
            .map(|i| tokio::spawn(worker(self.shared.clone(), i, shutdown.clone())))
            .collect();
        if let Some(interval) = self.shared.health_interval {
            tasks.push(tokio::spawn(health_sweep(
                self.shared.clone(),
                interval,
                shutdown.clone(),
            )));
        }
        info!(workers, "Orchestrator started");

        OrchestratorHandle {
            shared: self.shared.clone(),
            shutdown,
            tasks,
            workers,
        }
    }

    pub fn status(&self, plan: &PlanId) -> Option<ExecutionPlanStatus> {
        self.shared.tracker.snapshot(plan)
    }

    pub fn plans(&self) -> Vec<ExecutionPlanStatus> {
        self.shared.tracker.plans()
    }

    pub fn active_count(&self) -> usize {
        self.shared.tracker.active_count()
    }

    pub fn test_status(&self, key: &TestKey) -> Option<TestExecutionStatus> {
        self.shared.tracker.test_status(key)
    }

    pub fn history(&self, key: &TestKey) -> Vec<TestExecutionStatus> {
        self.shared.tracker.history(key)
    }

    pub fn result(&self, key: &TestKey) -> Option<TestResult> {
        self.shared.tracker.result(key)
    }

    pub fn results(&self, key: &TestKey) -> Vec<TestResult> {
        self.shared.tracker.results(key)
    }

    pub fn pool_snapshot(&self) -> Vec<Environment> {
        self.shared.resources.pool_snapshot()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    /// The status tracker, for subscribing to pushed events.
    pub fn tracker(&self) -> &StatusTracker {
        &self.shared.tracker
    }

    pub async fn wait_for_plan(
        &self,
        plan: &PlanId,
    ) -> Result<ExecutionPlanStatus, OrchestratorError> {
        Ok(self.shared.tracker.wait_for_plan(plan).await?)
    }

    /// Waits until every known plan is terminal.
    pub async fn wait_idle(&self) {
        self.shared.tracker.wait_idle().await
    }
}

/// Handle to a started worker pool.
pub struct OrchestratorHandle {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    workers: usize,
}

impl OrchestratorHandle {
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Stops claiming new work, waits for in-flight attempts and tears down
    /// environments provisioned on demand.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Worker task failed");
            }
        }
        self.shared.resources.teardown_ephemeral().await;
        info!("Orchestrator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmulatorBackendConfig, EnvironmentConfig};
    use crate::model::{PlanState, Priority, TestSpec, TestState};
    use crate::pool::{Architecture, BackendType, HardwareCapabilities};
    use crate::provider::emulator::EmulatorBackend;

    fn config(envs: usize) -> Config {
        let mut config = Config::default();
        config.orchestrator.idle_poll_ms = 20;
        config.provisioning.enabled = false;
        config.provisioning.health_check_interval_secs = 0;
        config.environments = (0..envs)
            .map(|i| EnvironmentConfig {
                id: format!("emu-{i}"),
                backend: BackendType::EmulatedHardware,
                handle: None,
                capabilities: HardwareCapabilities {
                    architecture: Architecture::X86_64,
                    memory_mb: 2048,
                    cpu_cores: 2,
                    features: Vec::new(),
                },
            })
            .collect();
        config
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new().with_backend(Arc::new(EmulatorBackend::new(
            EmulatorBackendConfig::new("sh -c {command}"),
        )))
    }

    #[tokio::test]
    async fn test_unknown_backend_rejected_at_open() {
        let result = Orchestrator::open(&config(1), Dispatcher::new(), None).await;
        assert!(matches!(result, Err(OrchestratorError::Dispatch(_))));
    }

    #[tokio::test]
    async fn test_submit_is_queued_before_start() {
        let orchestrator = Orchestrator::open(&config(1), dispatcher(), None)
            .await
            .unwrap();
        let id = orchestrator
            .submit(ExecutionPlan::new(
                "p",
                Priority::Normal,
                vec![TestSpec::new("a", "true"), TestSpec::new("b", "true")],
            ))
            .unwrap();

        assert_eq!(orchestrator.queue_len(), 2);
        assert_eq!(orchestrator.status(&id).unwrap().state, PlanState::Queued);
        assert_eq!(orchestrator.active_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let orchestrator = Orchestrator::open(&config(1), dispatcher(), None)
            .await
            .unwrap();
        let id = orchestrator
            .submit(ExecutionPlan::new(
                "p",
                Priority::Normal,
                vec![TestSpec::new("a", "true")],
            ))
            .unwrap();

        let cancelled = orchestrator.cancel(&id).unwrap();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(orchestrator.queue_len(), 0);
        let status = orchestrator.status(&id).unwrap();
        assert_eq!(status.state, PlanState::Cancelled);
        assert_eq!(
            orchestrator
                .test_status(&TestKey::new("p", "a"))
                .unwrap()
                .state,
            TestState::Cancelled
        );
    }

    #[tokio::test]
    async fn test_pending_timeout_terminates_as_error() {
        let mut config = config(1);
        config.orchestrator.pending_timeout_secs = Some(0);
        let orchestrator = Orchestrator::open(&config, dispatcher(), None)
            .await
            .unwrap();
        let handle = orchestrator.start();

        let too_big = TestSpec::new("huge", "true").with_requirement(
            crate::pool::HardwareRequirement::default().memory_mb(1 << 20),
        );
        let id = orchestrator
            .submit(ExecutionPlan::new("p", Priority::Normal, vec![too_big]))
            .unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), orchestrator.wait_for_plan(&id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.state, PlanState::Failed);
        assert_eq!(status.errored, 1);
        handle.shutdown().await;
    }
}
