//! Status tracker: the single source of truth for test and plan state.
//!
//! Every test has a list of attempt records. Only the latest attempt of a
//! test is ever mutated; retries append a new attempt in `queued` and leave
//! the terminal record before it untouched.
//!
//! All mutations happen under one mutex together with the aggregate
//! counters, so a state write and its counter adjustment are never observed
//! separately. When a [`StateStore`] is attached, each mutation encodes the
//! state document under the lock and writes it after releasing it; every
//! document carries a revision and an older one never replaces a newer one
//! on disk. Plan registration and crash recovery are the exceptions: they
//! write before returning so a failed write can be reported.
//!
//! Finished plans are pruned oldest-first once more than the retention limit
//! are held, so long-running services do not grow without bound.
//!
//! Observers can either poll ([`StatusTracker::snapshot`]) or subscribe to
//! pushed [`StatusEvent`]s.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info};

use crate::model::{
    EnvironmentId, ExecutionPlan, ExecutionPlanStatus, PlanError, PlanId, PlanState, TestId,
    TestExecutionStatus, TestKey, TestResult, TestSpec, TestState,
};
use crate::queue::QueuedTest;
use crate::store::{StateStore, StoreError};

const EVENT_CAPACITY: usize = 1024;

/// Message recorded on attempts reset by crash recovery.
pub const RECOVERED_MESSAGE: &str = "outcome unknown: service restarted while in flight";

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("unknown plan {0}")]
    UnknownPlan(PlanId),

    #[error("unknown test {0}")]
    UnknownTest(TestKey),

    #[error("plan {0} was already submitted")]
    DuplicatePlan(PlanId),

    #[error("attempt {attempt} of {key} is stale (latest is {latest})")]
    StaleAttempt { key: TestKey, attempt: u32, latest: u32 },

    #[error("illegal transition {from} -> {to} for {key}")]
    InvalidTransition {
        key: TestKey,
        from: TestState,
        to: TestState,
    },

    #[error("{0} cannot enter running without an environment")]
    MissingEnvironment(TestKey),

    #[error("latest attempt of {0} is not terminal")]
    AttemptNotTerminal(TestKey),

    #[error("attempt {attempt} of {key} already has a result")]
    ResultExists { key: TestKey, attempt: u32 },

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Optional fields applied alongside a transition.
#[derive(Debug, Clone, Default)]
pub struct StatusDetails {
    pub environment: Option<EnvironmentId>,
    pub message: Option<String>,
}

impl StatusDetails {
    pub fn environment(environment: EnvironmentId) -> Self {
        Self {
            environment: Some(environment),
            message: None,
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            environment: None,
            message: Some(message.into()),
        }
    }
}

/// Pushed to subscribers on every change.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    Test(TestExecutionStatus),
    Plan { plan: PlanId, state: PlanState },
}

/// Aggregate counters, maintained incrementally under the tracker lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    /// Attempts currently in `running`.
    pub active: usize,
    /// Tests whose latest attempt is `queued`.
    pub queued: usize,
    /// Tests whose latest attempt is `allocating`.
    pub allocating: usize,
    /// Tests whose latest attempt is terminal.
    pub completed: usize,
}

impl Counters {
    fn slot(&mut self, state: TestState) -> &mut usize {
        match state {
            TestState::Queued => &mut self.queued,
            TestState::Allocating => &mut self.allocating,
            TestState::Running => &mut self.active,
            TestState::Completed
            | TestState::Failed
            | TestState::Timeout
            | TestState::Error
            | TestState::Cancelled => &mut self.completed,
        }
    }

    fn enter(&mut self, state: TestState) {
        *self.slot(state) += 1;
    }

    fn leave(&mut self, state: TestState) {
        let slot = self.slot(state);
        *slot = slot.saturating_sub(1);
    }

    fn transition(&mut self, from: TestState, to: TestState) {
        self.leave(from);
        self.enter(to);
    }
}

/// What crash recovery found in the persisted state.
#[derive(Debug, Default)]
pub struct Recovery {
    /// Every queued attempt, including the ones reset from in-flight states.
    pub requeued: Vec<QueuedTest>,
    /// Tests that were `allocating` or `running` when the service stopped.
    pub interrupted: Vec<TestKey>,
    /// Environments those tests were bound to; they must be cleaned before reuse.
    pub dirty_environments: BTreeSet<EnvironmentId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TestRecord {
    id: TestId,
    attempts: Vec<TestExecutionStatus>,
    #[serde(default)]
    results: Vec<TestResult>,
}

impl TestRecord {
    fn latest(&self) -> &TestExecutionStatus {
        // attempts is never empty: records are created with attempt 1
        &self.attempts[self.attempts.len() - 1]
    }

    fn latest_mut(&mut self) -> &mut TestExecutionStatus {
        let last = self.attempts.len() - 1;
        &mut self.attempts[last]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PlanRecord {
    plan: ExecutionPlan,
    state: PlanState,
    #[serde(default)]
    cancel_requested: bool,
    tests: Vec<TestRecord>,
}

impl PlanRecord {
    fn test(&self, key: &TestKey) -> Result<&TestRecord, TrackerError> {
        self.tests
            .iter()
            .find(|t| t.id == key.test)
            .ok_or_else(|| TrackerError::UnknownTest(key.clone()))
    }

    fn test_mut(&mut self, key: &TestKey) -> Result<&mut TestRecord, TrackerError> {
        self.tests
            .iter_mut()
            .find(|t| t.id == key.test)
            .ok_or_else(|| TrackerError::UnknownTest(key.clone()))
    }

    fn derive_state(&self) -> PlanState {
        let latest: Vec<TestState> = self.tests.iter().map(|t| t.latest().state).collect();
        if latest.iter().all(|s| s.is_terminal()) {
            if self.cancel_requested {
                PlanState::Cancelled
            } else if latest.iter().all(|s| *s == TestState::Completed) {
                PlanState::Completed
            } else {
                PlanState::Failed
            }
        } else if self
            .tests
            .iter()
            .all(|t| t.attempts.len() == 1 && t.latest().state == TestState::Queued)
        {
            PlanState::Queued
        } else {
            PlanState::Running
        }
    }

    fn queued_test(&self, record: &TestRecord) -> Option<QueuedTest> {
        let spec = self.plan.test(&record.id)?;
        let status = record.latest();
        Some(QueuedTest {
            key: status.key.clone(),
            attempt: status.attempt,
            priority: self.plan.priority_of(spec),
            enqueued_at: status.queued_at,
            request: spec.allocation_request(),
        })
    }

    fn status(&self) -> ExecutionPlanStatus {
        let mut status = ExecutionPlanStatus {
            plan: self.plan.id.clone(),
            state: self.state,
            priority: self.plan.priority,
            total: self.tests.len(),
            queued: 0,
            allocating: 0,
            active: 0,
            completed: 0,
            failed: 0,
            timed_out: 0,
            errored: 0,
            cancelled: 0,
            retries: 0,
        };
        for test in &self.tests {
            status.retries += test.attempts.len() - 1;
            match test.latest().state {
                TestState::Queued => status.queued += 1,
                TestState::Allocating => status.allocating += 1,
                TestState::Running => status.active += 1,
                TestState::Completed => status.completed += 1,
                TestState::Failed => status.failed += 1,
                TestState::Timeout => status.timed_out += 1,
                TestState::Error => status.errored += 1,
                TestState::Cancelled => status.cancelled += 1,
            }
        }
        status
    }
}

/// Persisted form of the tracker.
#[derive(Debug, Default, Serialize, Deserialize)]
struct TrackerState {
    plans: BTreeMap<PlanId, PlanRecord>,
}

impl TrackerState {
    fn plan(&self, id: &PlanId) -> Result<&PlanRecord, TrackerError> {
        self.plans
            .get(id)
            .ok_or_else(|| TrackerError::UnknownPlan(id.clone()))
    }

    fn plan_mut(&mut self, id: &PlanId) -> Result<&mut PlanRecord, TrackerError> {
        self.plans
            .get_mut(id)
            .ok_or_else(|| TrackerError::UnknownPlan(id.clone()))
    }

    fn recount(&self) -> Counters {
        let mut counters = Counters::default();
        for plan in self.plans.values() {
            for test in &plan.tests {
                counters.enter(test.latest().state);
            }
        }
        counters
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: TrackerState,
    counters: Counters,
    /// Bumped on every encoded state document.
    revision: u64,
}

/// An encoded state document waiting to be written.
struct Pending {
    revision: u64,
    contents: Vec<u8>,
}

/// The status tracker.
pub struct StatusTracker {
    inner: Mutex<Inner>,
    store: Option<StateStore>,
    /// Revision of the document last written to the store.
    written: Mutex<u64>,
    /// Finished plans kept in memory and on disk. 0 keeps everything.
    retain_plans: usize,
    events: broadcast::Sender<StatusEvent>,
    version: watch::Sender<u64>,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTracker {
    /// An in-memory tracker without persistence.
    pub fn new() -> Self {
        Self::from_state(TrackerState::default(), None)
    }

    /// Opens a tracker backed by `store`, loading whatever it holds.
    pub fn open(store: StateStore) -> Result<Self, TrackerError> {
        let state = store.load::<TrackerState>()?.unwrap_or_default();
        info!(plans = state.plans.len(), "Loaded tracker state");
        Ok(Self::from_state(state, Some(store)))
    }

    fn from_state(state: TrackerState, store: Option<StateStore>) -> Self {
        let counters = state.recount();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (version, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner {
                state,
                counters,
                revision: 0,
            }),
            store,
            written: Mutex::new(0),
            retain_plans: 0,
            events,
            version,
        }
    }

    /// Keeps at most `limit` finished plans; 0 keeps all of them.
    pub fn retain_plans(mut self, limit: usize) -> Self {
        self.retain_plans = limit;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Encodes the current state for writing once the lock is released.
    fn encode(&self, inner: &mut Inner) -> Result<Option<Pending>, StoreError> {
        if self.store.is_none() {
            return Ok(None);
        }
        inner.revision += 1;
        Ok(Some(Pending {
            revision: inner.revision,
            contents: serde_json::to_vec_pretty(&inner.state)?,
        }))
    }

    fn write(&self, pending: Option<Pending>) -> Result<(), StoreError> {
        let (Some(store), Some(pending)) = (&self.store, pending) else {
            return Ok(());
        };
        let mut written = self.written.lock().unwrap_or_else(|e| e.into_inner());
        if *written >= pending.revision {
            // a newer document is already on disk
            return Ok(());
        }
        store.write(&pending.contents)?;
        *written = pending.revision;
        Ok(())
    }

    /// Writes the state before the caller releases the lock.
    fn persist(&self, inner: &mut Inner) -> Result<(), StoreError> {
        let pending = self.encode(inner)?;
        self.write(pending)
    }

    /// Writes an encoded change that must not be rolled back.
    fn persist_logged(&self, pending: Result<Option<Pending>, StoreError>) {
        if let Err(e) = pending.and_then(|p| self.write(p)) {
            error!(error = %e, "Failed to persist tracker state");
        }
    }

    /// Drops the oldest finished plans beyond the retention limit.
    fn prune(&self, inner: &mut Inner) {
        if self.retain_plans == 0 {
            return;
        }
        let mut finished: Vec<(chrono::DateTime<Utc>, PlanId)> = inner
            .state
            .plans
            .values()
            .filter(|p| p.state.is_terminal())
            .map(|p| (p.plan.submitted_at, p.plan.id.clone()))
            .collect();
        if finished.len() <= self.retain_plans {
            return;
        }
        finished.sort();
        let excess = finished.len() - self.retain_plans;
        for (_, id) in finished.into_iter().take(excess) {
            if let Some(record) = inner.state.plans.remove(&id) {
                for test in &record.tests {
                    inner.counters.leave(test.latest().state);
                }
                debug!(plan = %id, "Pruned finished plan");
            }
        }
    }

    fn publish(&self, events: Vec<StatusEvent>) {
        for event in events {
            // no subscribers is fine
            let _ = self.events.send(event);
        }
        self.version.send_modify(|v| *v += 1);
    }

    /// Refreshes the plan's derived state, returning an event if it changed.
    fn refresh_plan(record: &mut PlanRecord) -> Option<StatusEvent> {
        let next = record.derive_state();
        if next == record.state {
            return None;
        }
        debug!(plan = %record.plan.id, from = %record.state, to = %next, "Plan state changed");
        record.state = next;
        Some(StatusEvent::Plan {
            plan: record.plan.id.clone(),
            state: next,
        })
    }

    /// Registers a validated plan and durably persists it.
    ///
    /// Returns the first attempt of every test, ready to enqueue.
    pub fn register_plan(&self, mut plan: ExecutionPlan) -> Result<Vec<QueuedTest>, TrackerError> {
        plan.validate()?;
        // the queue orders on this, so callers cannot backdate it
        plan.submitted_at = Utc::now();

        let mut inner = self.lock();
        if inner.state.plans.contains_key(&plan.id) {
            return Err(TrackerError::DuplicatePlan(plan.id));
        }

        let tests = plan
            .tests
            .iter()
            .map(|spec| TestRecord {
                id: spec.id.clone(),
                attempts: vec![TestExecutionStatus::queued(
                    plan.key(&spec.id),
                    1,
                    plan.submitted_at,
                )],
                results: Vec::new(),
            })
            .collect();
        let record = PlanRecord {
            plan: plan.clone(),
            state: PlanState::Queued,
            cancel_requested: false,
            tests,
        };
        let queued: Vec<QueuedTest> = record
            .tests
            .iter()
            .filter_map(|t| record.queued_test(t))
            .collect();

        let plan_id = plan.id.clone();
        self.prune(&mut inner);
        inner.state.plans.insert(plan_id.clone(), record);
        if let Err(e) = self.persist(&mut inner) {
            inner.state.plans.remove(&plan_id);
            return Err(e.into());
        }
        inner.counters.queued += queued.len();
        drop(inner);

        info!(plan = %plan_id, tests = queued.len(), "Registered plan");
        self.publish(vec![StatusEvent::Plan {
            plan: plan_id,
            state: PlanState::Queued,
        }]);
        Ok(queued)
    }

    /// Moves the latest attempt of `key` to `next`.
    pub fn update(
        &self,
        key: &TestKey,
        attempt: u32,
        next: TestState,
        details: StatusDetails,
    ) -> Result<TestExecutionStatus, TrackerError> {
        let mut inner = self.lock();
        let Inner { state, counters, .. } = &mut *inner;
        let record = state.plan_mut(&key.plan)?;
        let status = transition(record.test_mut(key)?, key, attempt, next, details, counters)?;
        let plan_event = Self::refresh_plan(record);

        let pending = self.encode(&mut inner);
        drop(inner);
        self.persist_logged(pending);

        let mut events = vec![StatusEvent::Test(status.clone())];
        events.extend(plan_event);
        self.publish(events);
        Ok(status)
    }

    /// Records progress reported by a running test.
    pub fn set_progress(
        &self,
        key: &TestKey,
        attempt: u32,
        progress: f32,
        message: Option<String>,
    ) -> Result<(), TrackerError> {
        let mut inner = self.lock();
        let test = inner.state.plan_mut(&key.plan)?.test_mut(key)?;
        let latest = test.latest_mut();
        if latest.attempt != attempt {
            return Err(TrackerError::StaleAttempt {
                key: key.clone(),
                attempt,
                latest: latest.attempt,
            });
        }
        if latest.state.is_terminal() {
            return Ok(());
        }
        latest.progress = progress.clamp(0.0, 1.0);
        if message.is_some() {
            latest.message = message;
        }
        let status = latest.clone();
        drop(inner);

        self.publish(vec![StatusEvent::Test(status)]);
        Ok(())
    }

    /// Moves the attempt to `result.state` (if not already there) and appends
    /// the result, as one change.
    pub fn record_result(&self, result: TestResult) -> Result<TestExecutionStatus, TrackerError> {
        let mut inner = self.lock();
        let Inner { state, counters, .. } = &mut *inner;
        let record = state.plan_mut(&result.key.plan)?;
        let status = finish(record.test_mut(&result.key)?, result, counters)?;
        let plan_event = Self::refresh_plan(record);

        let pending = self.encode(&mut inner);
        drop(inner);
        self.persist_logged(pending);

        let mut events = vec![StatusEvent::Test(status.clone())];
        events.extend(plan_event);
        self.publish(events);
        Ok(status)
    }

    /// Records a terminal result and queues the next attempt in one change,
    /// so the plan never looks finished in between.
    pub fn retry(&self, result: TestResult) -> Result<QueuedTest, TrackerError> {
        let key = result.key.clone();
        let mut inner = self.lock();
        let Inner { state, counters, .. } = &mut *inner;
        let record = state.plan_mut(&key.plan)?;
        let test = record.test_mut(&key)?;
        let finished = finish(test, result, counters)?;
        let queued = append_attempt(record, &key, counters)?;
        let plan_event = Self::refresh_plan(record);

        let pending = self.encode(&mut inner);
        drop(inner);
        self.persist_logged(pending);

        let mut events = vec![StatusEvent::Test(finished)];
        events.extend(plan_event);
        self.publish(events);
        Ok(queued)
    }

    /// Flags `plan` as cancelled and moves its queued tests to `cancelled`.
    ///
    /// Tests that are already allocating or running are left to the worker
    /// that owns them.
    pub fn cancel_queued(&self, plan: &PlanId) -> Result<Vec<TestKey>, TrackerError> {
        let mut inner = self.lock();
        let Inner { state, counters, .. } = &mut *inner;
        let record = state.plan_mut(plan)?;
        if record.state.is_terminal() {
            return Ok(Vec::new());
        }
        record.cancel_requested = true;

        let mut cancelled = Vec::new();
        let mut events = Vec::new();
        for test in &mut record.tests {
            let latest = test.latest();
            if latest.state != TestState::Queued {
                continue;
            }
            let result = cancelled_result(latest);
            let key = latest.key.clone();
            events.push(StatusEvent::Test(finish(test, result, counters)?));
            cancelled.push(key);
        }
        events.extend(Self::refresh_plan(record));

        let pending = self.encode(&mut inner);
        drop(inner);
        self.persist_logged(pending);

        info!(plan = %plan, cancelled = cancelled.len(), "Cancelled queued tests");
        self.publish(events);
        Ok(cancelled)
    }

    pub fn is_cancel_requested(&self, plan: &PlanId) -> bool {
        self.lock()
            .state
            .plans
            .get(plan)
            .is_some_and(|p| p.cancel_requested)
    }

    /// Resets in-flight attempts left by a previous run and collects every
    /// queued attempt for re-enqueueing.
    ///
    /// In-flight attempts are reset in place rather than failed: the backend
    /// may have finished the work, so the outcome is unknown, not negative.
    /// Running this twice yields the same queue.
    pub fn recover(&self) -> Result<Recovery, TrackerError> {
        let mut inner = self.lock();
        let Inner { state, counters, .. } = &mut *inner;
        let mut recovery = Recovery::default();
        let mut events = Vec::new();

        for record in state.plans.values_mut() {
            if record.state.is_terminal() {
                continue;
            }
            for test in &mut record.tests {
                let latest = test.latest_mut();
                if !matches!(latest.state, TestState::Allocating | TestState::Running) {
                    continue;
                }
                counters.transition(latest.state, TestState::Queued);
                if let Some(env) = latest.environment.take() {
                    recovery.dirty_environments.insert(env);
                }
                latest.state = TestState::Queued;
                latest.started_at = None;
                latest.progress = 0.0;
                latest.message = Some(RECOVERED_MESSAGE.to_string());
                recovery.interrupted.push(latest.key.clone());
                events.push(StatusEvent::Test(latest.clone()));
            }

            if record.cancel_requested {
                for test in &mut record.tests {
                    let latest = test.latest();
                    if latest.state == TestState::Queued {
                        let result = cancelled_result(latest);
                        events.push(StatusEvent::Test(finish(test, result, counters)?));
                    }
                }
            }

            for test in &record.tests {
                if test.latest().state == TestState::Queued {
                    recovery.requeued.extend(record.queued_test(test));
                }
            }
            events.extend(Self::refresh_plan(record));
        }

        self.persist(&mut inner)?;
        drop(inner);

        info!(
            requeued = recovery.requeued.len(),
            interrupted = recovery.interrupted.len(),
            "Recovered tracker state"
        );
        self.publish(events);
        Ok(recovery)
    }

    pub fn active_count(&self) -> usize {
        self.lock().counters.active
    }

    pub fn counters(&self) -> Counters {
        self.lock().counters
    }

    /// Point-in-time aggregate of one plan.
    pub fn snapshot(&self, plan: &PlanId) -> Option<ExecutionPlanStatus> {
        self.lock().state.plans.get(plan).map(PlanRecord::status)
    }

    pub fn plans(&self) -> Vec<ExecutionPlanStatus> {
        self.lock()
            .state
            .plans
            .values()
            .map(PlanRecord::status)
            .collect()
    }

    pub fn plan(&self, plan: &PlanId) -> Option<ExecutionPlan> {
        self.lock().state.plans.get(plan).map(|p| p.plan.clone())
    }

    pub fn test_spec(&self, key: &TestKey) -> Option<TestSpec> {
        self.lock()
            .state
            .plans
            .get(&key.plan)?
            .plan
            .test(&key.test)
            .cloned()
    }

    /// Latest attempt of a test.
    pub fn test_status(&self, key: &TestKey) -> Option<TestExecutionStatus> {
        let inner = self.lock();
        let test = inner.state.plan(&key.plan).ok()?.test(key).ok()?;
        Some(test.latest().clone())
    }

    /// Every attempt of a test, oldest first.
    pub fn history(&self, key: &TestKey) -> Vec<TestExecutionStatus> {
        let inner = self.lock();
        inner
            .state
            .plan(&key.plan)
            .and_then(|p| p.test(key))
            .map(|t| t.attempts.clone())
            .unwrap_or_default()
    }

    /// Latest result of a test.
    pub fn result(&self, key: &TestKey) -> Option<TestResult> {
        self.results(key).pop()
    }

    /// Every result of a test, one per finished attempt.
    pub fn results(&self, key: &TestKey) -> Vec<TestResult> {
        let inner = self.lock();
        inner
            .state
            .plan(&key.plan)
            .and_then(|p| p.test(key))
            .map(|t| t.results.clone())
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Waits until `plan` reaches a terminal state.
    pub async fn wait_for_plan(&self, plan: &PlanId) -> Result<ExecutionPlanStatus, TrackerError> {
        let mut changes = self.version.subscribe();
        loop {
            let status = self
                .snapshot(plan)
                .ok_or_else(|| TrackerError::UnknownPlan(plan.clone()))?;
            if status.state.is_terminal() {
                return Ok(status);
            }
            if changes.changed().await.is_err() {
                // sender lives in self, so this only happens during teardown
                return Ok(status);
            }
        }
    }

    /// Waits until no plan is in a non-terminal state.
    pub async fn wait_idle(&self) {
        let mut changes = self.version.subscribe();
        loop {
            let busy = self
                .lock()
                .state
                .plans
                .values()
                .any(|p| !p.state.is_terminal());
            if !busy || changes.changed().await.is_err() {
                return;
            }
        }
    }
}

fn check_attempt(
    status: &TestExecutionStatus,
    key: &TestKey,
    attempt: u32,
) -> Result<(), TrackerError> {
    if status.attempt != attempt {
        return Err(TrackerError::StaleAttempt {
            key: key.clone(),
            attempt,
            latest: status.attempt,
        });
    }
    Ok(())
}

fn transition(
    test: &mut TestRecord,
    key: &TestKey,
    attempt: u32,
    next: TestState,
    details: StatusDetails,
    counters: &mut Counters,
) -> Result<TestExecutionStatus, TrackerError> {
    let status = test.latest_mut();
    check_attempt(status, key, attempt)?;
    if !status.state.can_transition_to(next) {
        return Err(TrackerError::InvalidTransition {
            key: key.clone(),
            from: status.state,
            to: next,
        });
    }
    if let Some(env) = details.environment {
        status.environment = Some(env);
    }
    if next == TestState::Running && status.environment.is_none() {
        return Err(TrackerError::MissingEnvironment(key.clone()));
    }

    counters.transition(status.state, next);
    status.state = next;
    let now = Utc::now();
    if next == TestState::Running {
        status.started_at = Some(now);
    }
    if next.is_terminal() {
        status.finished_at = Some(now);
    }
    if details.message.is_some() {
        status.message = details.message;
    }
    debug!(test = %key, attempt, state = %next, "Test state changed");
    Ok(status.clone())
}

fn finish(
    test: &mut TestRecord,
    result: TestResult,
    counters: &mut Counters,
) -> Result<TestExecutionStatus, TrackerError> {
    let key = result.key.clone();
    if test.results.iter().any(|r| r.attempt == result.attempt) {
        return Err(TrackerError::ResultExists {
            key,
            attempt: result.attempt,
        });
    }

    let current = test.latest().state;
    let status = if current == result.state {
        check_attempt(test.latest(), &key, result.attempt)?;
        test.latest().clone()
    } else {
        let details = StatusDetails {
            environment: result.environment.clone(),
            message: result.message.clone(),
        };
        transition(test, &key, result.attempt, result.state, details, counters)?
    };
    test.results.push(result);
    Ok(status)
}

fn append_attempt(
    record: &mut PlanRecord,
    key: &TestKey,
    counters: &mut Counters,
) -> Result<QueuedTest, TrackerError> {
    let test = record.test_mut(key)?;
    let latest = test.latest();
    if !latest.state.is_terminal() {
        return Err(TrackerError::AttemptNotTerminal(key.clone()));
    }
    let attempt = latest.attempt + 1;
    counters.transition(latest.state, TestState::Queued);
    test.attempts
        .push(TestExecutionStatus::queued(key.clone(), attempt, Utc::now()));

    let test = record.test(key)?;
    record
        .queued_test(test)
        .ok_or_else(|| TrackerError::UnknownTest(key.clone()))
}

fn cancelled_result(status: &TestExecutionStatus) -> TestResult {
    TestResult {
        key: status.key.clone(),
        attempt: status.attempt,
        environment: None,
        state: TestState::Cancelled,
        exit_code: None,
        stdout: String::new(),
        stderr: String::new(),
        duration_ms: 0,
        artifacts: Vec::new(),
        usage: Default::default(),
        message: Some("cancelled before start".to_string()),
        finished_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Priority, ResourceUsage};
    use tempfile::TempDir;

    fn plan(id: &str, tests: &[&str]) -> ExecutionPlan {
        ExecutionPlan::new(
            id,
            Priority::Normal,
            tests.iter().map(|t| TestSpec::new(*t, "true")).collect(),
        )
    }

    fn result(key: &TestKey, attempt: u32, state: TestState) -> TestResult {
        TestResult {
            key: key.clone(),
            attempt,
            environment: Some(EnvironmentId::from("env-1")),
            state,
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 10,
            artifacts: Vec::new(),
            usage: ResourceUsage::default(),
            message: None,
            finished_at: Utc::now(),
        }
    }

    fn start(tracker: &StatusTracker, key: &TestKey, attempt: u32, env: &str) {
        tracker
            .update(key, attempt, TestState::Allocating, StatusDetails::default())
            .unwrap();
        tracker
            .update(
                key,
                attempt,
                TestState::Running,
                StatusDetails::environment(EnvironmentId::from(env)),
            )
            .unwrap();
    }

    #[test]
    fn test_counters_follow_transitions() {
        let tracker = StatusTracker::new();
        tracker.register_plan(plan("p", &["a", "b"])).unwrap();
        let a = TestKey::new("p", "a");
        let b = TestKey::new("p", "b");

        assert_eq!(tracker.counters().queued, 2);
        start(&tracker, &a, 1, "env-a");
        start(&tracker, &b, 1, "env-b");
        assert_eq!(tracker.active_count(), 2);
        assert_eq!(tracker.counters().queued, 0);

        tracker.record_result(result(&a, 1, TestState::Completed)).unwrap();
        assert_eq!(tracker.active_count(), 1);
        tracker.record_result(result(&b, 1, TestState::Timeout)).unwrap();
        assert_eq!(tracker.active_count(), 0);
        assert_eq!(tracker.counters().completed, 2);

        let snapshot = tracker.snapshot(&PlanId::from("p")).unwrap();
        assert_eq!(snapshot.state, PlanState::Failed);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.timed_out, 1);
    }

    #[test]
    fn test_illegal_transitions_are_rejected() {
        let tracker = StatusTracker::new();
        tracker.register_plan(plan("p", &["a"])).unwrap();
        let a = TestKey::new("p", "a");

        let err = tracker
            .update(&a, 1, TestState::Running, StatusDetails::default())
            .unwrap_err();
        assert!(matches!(err, TrackerError::InvalidTransition { .. }));

        tracker
            .update(&a, 1, TestState::Allocating, StatusDetails::default())
            .unwrap();
        let err = tracker
            .update(&a, 1, TestState::Running, StatusDetails::default())
            .unwrap_err();
        assert!(matches!(err, TrackerError::MissingEnvironment(_)));
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn test_retry_preserves_history() {
        let tracker = StatusTracker::new();
        tracker.register_plan(plan("p", &["a"])).unwrap();
        let a = TestKey::new("p", "a");

        start(&tracker, &a, 1, "env-1");
        let next = tracker.retry(result(&a, 1, TestState::Error)).unwrap();
        assert_eq!(next.attempt, 2);
        assert_eq!(
            tracker.snapshot(&PlanId::from("p")).unwrap().state,
            PlanState::Running
        );

        start(&tracker, &a, 2, "env-2");
        tracker.record_result(result(&a, 2, TestState::Completed)).unwrap();

        let history = tracker.history(&a);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].state, TestState::Error);
        assert_eq!(history[1].state, TestState::Completed);
        assert_eq!(history[1].retry_count, 1);
        assert_eq!(tracker.results(&a).len(), 2);
        assert_eq!(tracker.result(&a).unwrap().attempt, 2);
        assert_eq!(tracker.snapshot(&PlanId::from("p")).unwrap().retries, 1);
    }

    #[test]
    fn test_results_are_immutable() {
        let tracker = StatusTracker::new();
        tracker.register_plan(plan("p", &["a"])).unwrap();
        let a = TestKey::new("p", "a");
        start(&tracker, &a, 1, "env-1");
        tracker.record_result(result(&a, 1, TestState::Failed)).unwrap();

        let err = tracker
            .record_result(result(&a, 1, TestState::Failed))
            .unwrap_err();
        assert!(matches!(err, TrackerError::ResultExists { .. }));
        assert!(tracker.retry(result(&a, 1, TestState::Error)).is_err());
        assert_eq!(tracker.history(&a).len(), 1);
    }

    #[test]
    fn test_stale_attempt_is_rejected() {
        let tracker = StatusTracker::new();
        tracker.register_plan(plan("p", &["a"])).unwrap();
        let a = TestKey::new("p", "a");
        let err = tracker
            .update(&a, 2, TestState::Allocating, StatusDetails::default())
            .unwrap_err();
        assert!(matches!(err, TrackerError::StaleAttempt { latest: 1, .. }));
    }

    #[test]
    fn test_cancel_queued() {
        let tracker = StatusTracker::new();
        tracker.register_plan(plan("p", &["a", "b"])).unwrap();
        let a = TestKey::new("p", "a");
        start(&tracker, &a, 1, "env-1");

        let cancelled = tracker.cancel_queued(&PlanId::from("p")).unwrap();
        assert_eq!(cancelled, vec![TestKey::new("p", "b")]);
        assert!(tracker.is_cancel_requested(&PlanId::from("p")));
        assert_eq!(
            tracker.snapshot(&PlanId::from("p")).unwrap().state,
            PlanState::Running
        );

        tracker.record_result(result(&a, 1, TestState::Cancelled)).unwrap();
        let snapshot = tracker.snapshot(&PlanId::from("p")).unwrap();
        assert_eq!(snapshot.state, PlanState::Cancelled);
        assert_eq!(snapshot.cancelled, 2);
    }

    #[test]
    fn test_duplicate_plan_rejected() {
        let tracker = StatusTracker::new();
        tracker.register_plan(plan("p", &["a"])).unwrap();
        assert!(matches!(
            tracker.register_plan(plan("p", &["a"])),
            Err(TrackerError::DuplicatePlan(_))
        ));
    }

    #[test]
    fn test_wait_for_finished_or_unknown_plan_returns_immediately() {
        let tracker = StatusTracker::new();
        tracker.register_plan(plan("p", &["a"])).unwrap();
        tracker.cancel_queued(&PlanId::from("p")).unwrap();

        let status = tokio_test::block_on(tracker.wait_for_plan(&PlanId::from("p"))).unwrap();
        assert_eq!(status.state, PlanState::Cancelled);
        assert!(matches!(
            tokio_test::block_on(tracker.wait_for_plan(&PlanId::from("nope"))),
            Err(TrackerError::UnknownPlan(_))
        ));
        tokio_test::block_on(tracker.wait_idle());
    }

    #[test]
    fn test_recovery_requeues_in_flight_exactly_once() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        {
            let tracker = StatusTracker::open(store.clone()).unwrap();
            tracker.register_plan(plan("p", &["a", "b", "c", "d"])).unwrap();
            start(&tracker, &TestKey::new("p", "a"), 1, "env-a");
            start(&tracker, &TestKey::new("p", "b"), 1, "env-b");
            tracker
                .update(
                    &TestKey::new("p", "c"),
                    1,
                    TestState::Allocating,
                    StatusDetails::default(),
                )
                .unwrap();
            // dropped without finishing: simulated crash
        }

        let tracker = StatusTracker::open(store.clone()).unwrap();
        assert_eq!(tracker.active_count(), 2);
        let recovery = tracker.recover().unwrap();

        assert_eq!(recovery.interrupted.len(), 3);
        assert_eq!(recovery.requeued.len(), 4);
        assert_eq!(recovery.dirty_environments.len(), 2);
        assert_eq!(tracker.active_count(), 0);
        assert_eq!(tracker.counters().queued, 4);

        let a = tracker.test_status(&TestKey::new("p", "a")).unwrap();
        assert_eq!(a.state, TestState::Queued);
        assert_eq!(a.attempt, 1);
        assert_eq!(a.message.as_deref(), Some(RECOVERED_MESSAGE));

        // a second restart finds nothing new in flight
        let again = StatusTracker::open(store).unwrap().recover().unwrap();
        assert_eq!(again.interrupted.len(), 0);
        assert_eq!(again.requeued.len(), 4);
    }

    #[test]
    fn test_submission_time_is_assigned_on_register() {
        let tracker = StatusTracker::new();
        let mut backdated = plan("old", &["a"]);
        backdated.submitted_at = Utc::now() - chrono::Duration::days(365);
        let before = Utc::now();

        let queued = tracker.register_plan(backdated).unwrap();
        let stored = tracker.plan(&PlanId::from("old")).unwrap();
        assert!(stored.submitted_at >= before);
        assert_eq!(queued[0].enqueued_at, stored.submitted_at);
    }

    #[test]
    fn test_finished_plans_are_pruned_oldest_first() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let tracker = StatusTracker::open(store.clone()).unwrap().retain_plans(2);

        for id in ["p1", "p2", "p3"] {
            tracker.register_plan(plan(id, &["a"])).unwrap();
            tracker.cancel_queued(&PlanId::from(id)).unwrap();
        }
        // p4 is still queued and never pruned
        tracker.register_plan(plan("p4", &["a"])).unwrap();

        let ids: Vec<PlanId> = tracker.plans().into_iter().map(|p| p.plan).collect();
        assert_eq!(
            ids,
            vec![PlanId::from("p2"), PlanId::from("p3"), PlanId::from("p4")]
        );
        assert_eq!(tracker.counters().completed, 2);
        assert_eq!(tracker.counters().queued, 1);

        let reopened = StatusTracker::open(store).unwrap();
        assert!(reopened.snapshot(&PlanId::from("p1")).is_none());
        assert_eq!(reopened.plans().len(), 3);
    }

    #[test]
    fn test_concurrent_updates_leave_latest_state_on_disk() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let tracker = std::sync::Arc::new(StatusTracker::open(store.clone()).unwrap());
        let names: Vec<String> = (0..8).map(|i| format!("t{i}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        tracker.register_plan(plan("p", &refs)).unwrap();

        let workers: Vec<_> = names
            .iter()
            .map(|name| {
                let tracker = tracker.clone();
                let key = TestKey::new("p", name.as_str());
                std::thread::spawn(move || {
                    start(&tracker, &key, 1, key.test.as_str());
                    tracker
                        .record_result(result(&key, 1, TestState::Completed))
                        .unwrap();
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let reopened = StatusTracker::open(store).unwrap();
        let status = reopened.snapshot(&PlanId::from("p")).unwrap();
        assert_eq!(status.state, PlanState::Completed);
        assert_eq!(status.completed, 8);
        assert_eq!(reopened.counters(), tracker.counters());
    }

    #[tokio::test]
    async fn test_wait_for_plan_and_events() {
        let tracker = std::sync::Arc::new(StatusTracker::new());
        tracker.register_plan(plan("p", &["a"])).unwrap();
        let mut events = tracker.subscribe();
        let a = TestKey::new("p", "a");

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_for_plan(&PlanId::from("p")).await })
        };

        start(&tracker, &a, 1, "env-1");
        tracker.record_result(result(&a, 1, TestState::Completed)).unwrap();

        let status = waiter.await.unwrap().unwrap();
        assert_eq!(status.state, PlanState::Completed);

        match events.recv().await.unwrap() {
            StatusEvent::Test(s) => assert_eq!(s.state, TestState::Allocating),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
