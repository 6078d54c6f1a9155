//! Resource manager: the allocation critical section over the environment pool.
//!
//! [`ResourceManager::allocate`] either hands out an environment (already
//! flipped to busy) or answers [`Allocation::Pending`]. It never blocks: a
//! pending caller is expected to try again on the next scheduling tick.
//!
//! When nothing in the pool could ever satisfy a request, the manager reserves
//! a placeholder entry in `provisioning` state and reports
//! [`PendingReason::ProvisionStarted`]; the caller then drives
//! [`ResourceManager::provision`] in the background. The placeholder makes
//! later identical requests wait for that environment instead of
//! provisioning a second one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::ProvisioningConfig;
use crate::model::EnvironmentId;
use crate::pool::{
    AllocationRequest, Architecture, BackendType, Environment, EnvironmentPool, EnvironmentStatus,
    HardwareCapabilities, HardwareRequirement,
};
use crate::provider::{Dispatcher, ProviderError};

/// Outcome of an allocation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Allocation {
    /// The environment is now busy and owned by the caller until released.
    Allocated(Environment),
    Pending(PendingReason),
}

/// Why an allocation came back pending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingReason {
    /// A compatible environment exists but none is available right now.
    Saturated,
    /// A compatible environment is still being provisioned.
    Provisioning,
    /// This call reserved a provisioning slot; drive it with
    /// [`ResourceManager::provision`].
    ProvisionStarted(EnvironmentId),
    /// Nothing in the pool matches and nothing can be provisioned.
    Unsatisfiable,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ResourceError {
    #[error("unknown environment {0}")]
    UnknownEnvironment(EnvironmentId),

    #[error("environment {id} is {status}, expected busy")]
    NotBusy {
        id: EnvironmentId,
        status: EnvironmentStatus,
    },
}

#[derive(Debug, Default)]
struct Inner {
    pool: EnvironmentPool,
    /// Requirements behind placeholders that are still provisioning.
    provisioning: HashMap<EnvironmentId, HardwareRequirement>,
}

pub struct ResourceManager {
    inner: Mutex<Inner>,
    dispatcher: Arc<Dispatcher>,
    config: ProvisioningConfig,
    wake: Arc<Notify>,
}

impl ResourceManager {
    pub fn new(
        environments: impl IntoIterator<Item = Environment>,
        dispatcher: Arc<Dispatcher>,
        config: ProvisioningConfig,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                pool: EnvironmentPool::new(environments),
                provisioning: HashMap::new(),
            }),
            dispatcher,
            config,
            wake,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Atomically picks and reserves an environment for `request`.
    pub fn allocate(&self, request: &AllocationRequest) -> Allocation {
        let mut inner = self.lock();
        if let Some(env) = inner.pool.take_best(request) {
            debug!(environment = %env.id, backend = %env.backend, "Allocated environment");
            return Allocation::Allocated(env);
        }

        if inner.pool.could_satisfy(request) {
            let busy = inner
                .pool
                .iter()
                .any(|e| e.status == EnvironmentStatus::Busy && e.is_compatible(request));
            return Allocation::Pending(if busy {
                PendingReason::Saturated
            } else {
                PendingReason::Provisioning
            });
        }

        match self.reserve_provisioning(&mut inner, request) {
            Some(id) => Allocation::Pending(PendingReason::ProvisionStarted(id)),
            None => Allocation::Pending(PendingReason::Unsatisfiable),
        }
    }

    /// Chooses the backend a new environment for `request` should come from.
    ///
    /// Only backends that vouch for every requested capability qualify.
    fn provisioning_backend(&self, request: &AllocationRequest) -> Option<BackendType> {
        let usable = |b: BackendType| {
            b.supports(request.isolation)
                && self
                    .dispatcher
                    .backend(b)
                    .is_some_and(|backend| backend.can_provision(&request.requirement))
        };
        request
            .backend
            .filter(|b| usable(*b))
            .or_else(|| Some(self.config.default_backend).filter(|b| usable(*b)))
            .or_else(|| BackendType::ALL.into_iter().find(|b| usable(*b)))
    }

    fn reserve_provisioning(
        &self,
        inner: &mut Inner,
        request: &AllocationRequest,
    ) -> Option<EnvironmentId> {
        if !self.config.enabled || inner.pool.len() >= self.config.max_environments {
            return None;
        }
        let backend = self.provisioning_backend(request)?;
        let id = EnvironmentId::new(format!("{}-{}", backend, uuid::Uuid::new_v4().simple()));
        let fallback = Architecture::host().unwrap_or(Architecture::X86_64);

        let mut placeholder = Environment::new(
            id.clone(),
            backend,
            String::new(),
            HardwareCapabilities::from_requirement(
                &request.requirement,
                fallback,
                &request.requirement.features,
            ),
        );
        placeholder.status = EnvironmentStatus::Provisioning;
        placeholder.ephemeral = true;

        inner.pool.insert(placeholder);
        inner
            .provisioning
            .insert(id.clone(), request.requirement.clone());
        info!(environment = %id, backend = %backend, "Reserved environment for provisioning");
        Some(id)
    }

    /// Provisions the environment reserved under `id`.
    ///
    /// Retries up to `max_attempts` times with exponential backoff and jitter.
    /// On persistent failure the placeholder is marked unhealthy so it stops
    /// attracting work.
    pub async fn provision(&self, id: EnvironmentId) -> Result<Environment, ProviderError> {
        let (backend_type, requirement) = {
            let inner = self.lock();
            let env = inner
                .pool
                .get(&id)
                .ok_or_else(|| ProviderError::NotFound(id.to_string()))?;
            let requirement = inner
                .provisioning
                .get(&id)
                .cloned()
                .ok_or_else(|| ProviderError::NotFound(id.to_string()))?;
            (env.backend, requirement)
        };
        let backend = self
            .dispatcher
            .backend(backend_type)
            .cloned()
            .ok_or_else(|| ProviderError::CreateFailed(format!("no {backend_type} backend")))?;

        let attempts = self.config.max_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match backend.provision(&id, &requirement).await {
                Ok(mut env) => {
                    env.id = id.clone();
                    env.status = EnvironmentStatus::Available;
                    env.ephemeral = true;
                    {
                        let mut inner = self.lock();
                        inner.provisioning.remove(&id);
                        inner.pool.insert(env.clone());
                    }
                    info!(environment = %id, attempt, "Provisioned environment");
                    self.wake.notify_waiters();
                    return Ok(env);
                }
                Err(e) => {
                    warn!(environment = %id, attempt, error = %e, "Provisioning failed");
                    let exhausted =
                        matches!(e, ProviderError::Exhausted(_) | ProviderError::Unsupported(_));
                    last_error = Some(e);
                    if exhausted {
                        break;
                    }
                    if attempt < attempts {
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                }
            }
        }

        {
            let mut inner = self.lock();
            inner.provisioning.remove(&id);
            if let Some(env) = inner.pool.get_mut(&id) {
                env.status = EnvironmentStatus::Unhealthy;
            }
        }
        warn!(environment = %id, "Giving up on provisioning, environment marked unhealthy");
        self.wake.notify_waiters();
        Err(last_error.unwrap_or_else(|| ProviderError::CreateFailed(id.to_string())))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.backoff().as_millis() as u64;
        let exp = base.saturating_mul(1u64 << (attempt - 1).min(10));
        let jitter = if base > 0 {
            rand::thread_rng().gen_range(0..=base / 2)
        } else {
            0
        };
        Duration::from_millis(exp + jitter)
    }

    /// Returns a busy environment to the pool.
    ///
    /// Only a verified-clean environment becomes available again; anything
    /// else is quarantined as unhealthy.
    pub fn release(&self, id: &EnvironmentId, verified_clean: bool) -> Result<(), ResourceError> {
        {
            let mut inner = self.lock();
            let env = inner
                .pool
                .get_mut(id)
                .ok_or_else(|| ResourceError::UnknownEnvironment(id.clone()))?;
            if env.status != EnvironmentStatus::Busy {
                return Err(ResourceError::NotBusy {
                    id: id.clone(),
                    status: env.status,
                });
            }
            env.status = if verified_clean {
                EnvironmentStatus::Available
            } else {
                EnvironmentStatus::Unhealthy
            };
        }
        if verified_clean {
            debug!(environment = %id, "Released environment");
        } else {
            warn!(environment = %id, "Cleanup not verified, environment marked unhealthy");
        }
        self.wake.notify_waiters();
        Ok(())
    }

    pub fn mark_unhealthy(&self, id: &EnvironmentId) -> Result<(), ResourceError> {
        let mut inner = self.lock();
        let env = inner
            .pool
            .get_mut(id)
            .ok_or_else(|| ResourceError::UnknownEnvironment(id.clone()))?;
        env.status = EnvironmentStatus::Unhealthy;
        warn!(environment = %id, "Marked environment unhealthy");
        Ok(())
    }

    /// Flips an available environment to busy without a request, so it can
    /// be cleaned before anything else runs on it.
    pub fn reserve(&self, id: &EnvironmentId) -> Option<Environment> {
        let mut inner = self.lock();
        let env = inner.pool.get_mut(id)?;
        if env.status != EnvironmentStatus::Available {
            return None;
        }
        env.status = EnvironmentStatus::Busy;
        Some(env.clone())
    }

    /// Runs the environment's cleanup and backend health check, bounded by
    /// `timeout`. Returns whether both passed.
    pub async fn verify_clean(&self, env: &Environment, timeout: Duration) -> bool {
        let Some(backend) = self.dispatcher.backend(env.backend).cloned() else {
            return false;
        };
        let check = async {
            backend.runner(env).cleanup().await && backend.health_check(env).await
        };
        match tokio::time::timeout(timeout, check).await {
            Ok(clean) => clean,
            Err(_) => {
                warn!(environment = %env.id, "Cleanup timed out");
                false
            }
        }
    }

    /// Cleans `id` before anything is allocated on it; used after a restart
    /// for environments whose previous test outcome is unknown.
    pub async fn sanitize(&self, id: &EnvironmentId, timeout: Duration) -> bool {
        let Some(env) = self.reserve(id) else {
            return false;
        };
        let clean = self.verify_clean(&env, timeout).await;
        // env is busy and owned here, so release cannot fail
        let _ = self.release(id, clean);
        clean
    }

    /// Re-checks unhealthy environments and returns the ones that recovered.
    ///
    /// Placeholders whose provisioning never produced an environment are
    /// dropped instead.
    pub async fn recover_unhealthy(&self, timeout: Duration) -> Vec<EnvironmentId> {
        let candidates: Vec<Environment> = {
            let mut inner = self.lock();
            let stale: Vec<EnvironmentId> = inner
                .pool
                .iter()
                .filter(|e| {
                    e.status == EnvironmentStatus::Unhealthy && e.ephemeral && e.handle.is_empty()
                })
                .map(|e| e.id.clone())
                .collect();
            for id in stale {
                inner.pool.remove(&id);
                debug!(environment = %id, "Dropped failed provisioning placeholder");
            }
            inner
                .pool
                .iter()
                .filter(|e| e.status == EnvironmentStatus::Unhealthy)
                .cloned()
                .collect()
        };

        let mut recovered = Vec::new();
        for env in candidates {
            if !self.verify_clean(&env, timeout).await {
                continue;
            }
            let mut inner = self.lock();
            if let Some(current) = inner.pool.get_mut(&env.id)
                && current.status == EnvironmentStatus::Unhealthy
            {
                current.status = EnvironmentStatus::Available;
                info!(environment = %env.id, "Environment recovered");
                recovered.push(env.id);
            }
        }
        if !recovered.is_empty() {
            self.wake.notify_waiters();
        }
        recovered
    }

    /// Removes an idle environment from the pool and tears it down.
    pub async fn decommission(&self, id: &EnvironmentId) -> Result<(), ProviderError> {
        let env = {
            let mut inner = self.lock();
            match inner.pool.get(id).map(|e| e.status) {
                None => return Err(ProviderError::NotFound(id.to_string())),
                Some(EnvironmentStatus::Busy) | Some(EnvironmentStatus::Provisioning) => {
                    return Err(ProviderError::Other(anyhow::anyhow!(
                        "environment {id} is in use"
                    )));
                }
                Some(_) => {}
            }
            inner
                .pool
                .remove(id)
                .ok_or_else(|| ProviderError::NotFound(id.to_string()))?
        };

        if env.handle.is_empty() {
            return Ok(());
        }
        match self.dispatcher.backend(env.backend) {
            Some(backend) => backend.teardown(&env).await,
            None => Ok(()),
        }
    }

    /// Tears down every idle environment that was provisioned on demand.
    pub async fn teardown_ephemeral(&self) {
        let ids: Vec<EnvironmentId> = self
            .lock()
            .pool
            .iter()
            .filter(|e| e.ephemeral && e.status != EnvironmentStatus::Busy)
            .map(|e| e.id.clone())
            .collect();
        for id in ids {
            if let Err(e) = self.decommission(&id).await {
                warn!(environment = %id, error = %e, "Failed to tear down environment");
            }
        }
    }

    pub fn pool_snapshot(&self) -> Vec<Environment> {
        self.lock().pool.snapshot()
    }

    pub fn get(&self, id: &EnvironmentId) -> Option<Environment> {
        self.lock().pool.get(id).cloned()
    }

    pub fn count(&self, status: EnvironmentStatus) -> usize {
        self.lock().pool.count(status)
    }

    /// Upper bound on how many environments can be busy at once.
    pub fn capacity(&self) -> usize {
        let len = self.lock().pool.len();
        let provisionable = self.config.enabled
            && BackendType::ALL
                .into_iter()
                .any(|b| self.dispatcher.supports(b));
        let cap = if provisionable {
            len.max(self.config.max_environments)
        } else {
            len
        };
        cap.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TestSpec;
    use crate::provider::{Backend, ExecContext, Execution, ProviderResult, Runner};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeRunner {
        id: EnvironmentId,
        clean: bool,
    }

    #[async_trait]
    impl Runner for FakeRunner {
        fn environment(&self) -> &EnvironmentId {
            &self.id
        }

        async fn execute(&self, _test: &TestSpec, _ctx: ExecContext) -> ProviderResult<Execution> {
            Err(ProviderError::ExecFailed("not used".into()))
        }

        async fn cleanup(&self) -> bool {
            self.clean
        }
    }

    #[derive(Default)]
    struct FakeBackend {
        failures_left: AtomicUsize,
        clean: AtomicBool,
        provisions: AtomicUsize,
        features: Vec<String>,
    }

    #[async_trait]
    impl Backend for FakeBackend {
        fn backend_type(&self) -> BackendType {
            BackendType::EmulatedHardware
        }

        fn can_provision(&self, requirement: &HardwareRequirement) -> bool {
            requirement.within(&[Architecture::Arm64], &self.features)
        }

        async fn provision(
            &self,
            id: &EnvironmentId,
            requirement: &HardwareRequirement,
        ) -> ProviderResult<Environment> {
            self.provisions.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ProviderError::CreateFailed("boot failed".into()));
            }
            Ok(Environment::new(
                id.clone(),
                BackendType::EmulatedHardware,
                format!("vm-{id}"),
                HardwareCapabilities::from_requirement(
                    requirement,
                    Architecture::Arm64,
                    &self.features,
                ),
            ))
        }

        async fn teardown(&self, _environment: &Environment) -> ProviderResult<()> {
            Ok(())
        }

        async fn health_check(&self, _environment: &Environment) -> bool {
            true
        }

        fn runner(&self, environment: &Environment) -> Box<dyn Runner> {
            Box::new(FakeRunner {
                id: environment.id.clone(),
                clean: self.clean.load(Ordering::SeqCst),
            })
        }
    }

    fn arm(id: &str, memory_mb: u64) -> Environment {
        Environment::new(
            id,
            BackendType::EmulatedHardware,
            id,
            HardwareCapabilities {
                architecture: Architecture::Arm64,
                memory_mb,
                cpu_cores: 2,
                features: Vec::new(),
            },
        )
    }

    fn config(enabled: bool) -> ProvisioningConfig {
        ProvisioningConfig {
            enabled,
            max_attempts: 3,
            backoff_ms: 1,
            max_environments: 4,
            ..Default::default()
        }
    }

    fn manager(
        envs: Vec<Environment>,
        backend: Arc<FakeBackend>,
        enabled: bool,
    ) -> ResourceManager {
        let dispatcher = Dispatcher::new().with_backend(backend);
        ResourceManager::new(
            envs,
            Arc::new(dispatcher),
            config(enabled),
            Arc::new(Notify::new()),
        )
    }

    fn request(memory_mb: u64) -> AllocationRequest {
        AllocationRequest {
            requirement: HardwareRequirement::default()
                .architecture(Architecture::Arm64)
                .memory_mb(memory_mb),
            ..Default::default()
        }
    }

    #[test]
    fn test_insufficient_memory_is_pending_not_allocated() {
        let rm = manager(vec![arm("arm-2g", 2048)], Arc::default(), false);
        assert_eq!(
            rm.allocate(&request(4096)),
            Allocation::Pending(PendingReason::Unsatisfiable)
        );
        assert_eq!(rm.count(EnvironmentStatus::Available), 1);
    }

    #[test]
    fn test_allocation_is_exclusive() {
        let rm = manager(vec![arm("arm-4g", 4096)], Arc::default(), false);
        let first = rm.allocate(&request(2048));
        assert!(matches!(first, Allocation::Allocated(ref e) if e.id.as_str() == "arm-4g"));
        assert_eq!(
            rm.allocate(&request(2048)),
            Allocation::Pending(PendingReason::Saturated)
        );

        rm.release(&EnvironmentId::from("arm-4g"), true).unwrap();
        assert!(matches!(rm.allocate(&request(2048)), Allocation::Allocated(_)));
    }

    #[test]
    fn test_concurrent_allocations_never_share() {
        let envs = (0..4).map(|i| arm(&format!("arm-{i}"), 4096)).collect();
        let rm = Arc::new(manager(envs, Arc::default(), false));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let rm = rm.clone();
                std::thread::spawn(move || match rm.allocate(&request(1024)) {
                    Allocation::Allocated(e) => Some(e.id),
                    Allocation::Pending(_) => None,
                })
            })
            .collect();
        let mut ids: Vec<EnvironmentId> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(ids.len(), 4);
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn test_unverified_release_quarantines() {
        let rm = manager(vec![arm("arm", 4096)], Arc::default(), false);
        let Allocation::Allocated(env) = rm.allocate(&request(1024)) else {
            panic!("expected allocation");
        };
        rm.release(&env.id, false).unwrap();
        assert_eq!(rm.get(&env.id).unwrap().status, EnvironmentStatus::Unhealthy);
        assert_eq!(
            rm.allocate(&request(1024)),
            Allocation::Pending(PendingReason::Unsatisfiable)
        );
        assert!(matches!(
            rm.release(&env.id, true),
            Err(ResourceError::NotBusy { .. })
        ));
    }

    #[tokio::test]
    async fn test_provisioning_reserves_once_then_succeeds() {
        let backend = Arc::new(FakeBackend {
            failures_left: AtomicUsize::new(1),
            ..Default::default()
        });
        let rm = manager(vec![], backend.clone(), true);

        let Allocation::Pending(PendingReason::ProvisionStarted(id)) = rm.allocate(&request(8192))
        else {
            panic!("expected provisioning to start");
        };
        assert_eq!(
            rm.allocate(&request(8192)),
            Allocation::Pending(PendingReason::Provisioning)
        );

        let env = rm.provision(id.clone()).await.unwrap();
        assert_eq!(env.status, EnvironmentStatus::Available);
        assert!(env.ephemeral);
        assert_eq!(backend.provisions.load(Ordering::SeqCst), 2);

        let Allocation::Allocated(allocated) = rm.allocate(&request(8192)) else {
            panic!("expected allocation");
        };
        assert_eq!(allocated.id, id);
        assert!(allocated.capabilities.memory_mb >= 8192);
    }

    #[tokio::test]
    async fn test_unvouched_capabilities_are_never_provisioned() {
        let backend = Arc::new(FakeBackend {
            features: vec!["kvm".to_string()],
            ..Default::default()
        });
        let rm = manager(vec![], backend.clone(), true);

        let mut gpu = request(1024);
        gpu.requirement = gpu.requirement.feature("gpu");
        assert_eq!(
            rm.allocate(&gpu),
            Allocation::Pending(PendingReason::Unsatisfiable)
        );
        let mut riscv = request(1024);
        riscv.requirement = riscv.requirement.architecture(Architecture::Riscv64);
        assert_eq!(
            rm.allocate(&riscv),
            Allocation::Pending(PendingReason::Unsatisfiable)
        );
        assert_eq!(rm.pool_snapshot().len(), 0);

        let mut kvm = request(1024);
        kvm.requirement = kvm.requirement.feature("kvm");
        let Allocation::Pending(PendingReason::ProvisionStarted(id)) = rm.allocate(&kvm) else {
            panic!("expected provisioning to start");
        };
        let env = rm.provision(id).await.unwrap();
        assert_eq!(env.capabilities.features, vec!["kvm".to_string()]);
        assert_eq!(backend.provisions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_persistent_provisioning_failure_marks_unhealthy() {
        let backend = Arc::new(FakeBackend {
            failures_left: AtomicUsize::new(10),
            ..Default::default()
        });
        let rm = manager(vec![], backend.clone(), true);
        let Allocation::Pending(PendingReason::ProvisionStarted(id)) = rm.allocate(&request(1024))
        else {
            panic!("expected provisioning to start");
        };

        assert!(rm.provision(id.clone()).await.is_err());
        assert_eq!(backend.provisions.load(Ordering::SeqCst), 3);
        assert_eq!(rm.get(&id).unwrap().status, EnvironmentStatus::Unhealthy);

        // the failed placeholder is dropped by the next health sweep
        assert!(rm.recover_unhealthy(Duration::from_secs(1)).await.is_empty());
        assert!(rm.get(&id).is_none());
    }

    #[tokio::test]
    async fn test_recover_unhealthy_after_clean_check() {
        let backend = Arc::new(FakeBackend::default());
        let rm = manager(vec![arm("arm", 4096)], backend.clone(), false);
        rm.mark_unhealthy(&EnvironmentId::from("arm")).unwrap();

        assert!(rm.recover_unhealthy(Duration::from_secs(1)).await.is_empty());
        backend.clean.store(true, Ordering::SeqCst);
        let recovered = rm.recover_unhealthy(Duration::from_secs(1)).await;
        assert_eq!(recovered, vec![EnvironmentId::from("arm")]);
        assert!(matches!(rm.allocate(&request(1024)), Allocation::Allocated(_)));
    }

    #[tokio::test]
    async fn test_sanitize_before_reuse() {
        let backend = Arc::new(FakeBackend::default());
        let rm = manager(vec![arm("arm", 4096)], backend, false);
        assert!(!rm.sanitize(&EnvironmentId::from("arm"), Duration::from_secs(1)).await);
        assert_eq!(
            rm.get(&EnvironmentId::from("arm")).unwrap().status,
            EnvironmentStatus::Unhealthy
        );
    }

    #[test]
    fn test_capacity() {
        let rm = manager(vec![arm("a", 1024), arm("b", 1024)], Arc::default(), false);
        assert_eq!(rm.capacity(), 2);
        let rm = manager(vec![arm("a", 1024)], Arc::default(), true);
        assert_eq!(rm.capacity(), 4);
    }
}
