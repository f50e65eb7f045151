//! Session orchestration and teardown.
//!
//! The `Orchestrator` owns the registry of live supervisors for one preview
//! session. Tasks run either as a sequential chain that stops at the first
//! failure, or as a parallel set that is joined as a whole. Any error that
//! escapes a guarded section terminates every registered process before it
//! is returned, so nothing keeps listening on a port after the session ends.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::errors::{RackError, Result, TaskError};
use crate::handle::ShutdownConfig;
use crate::process::{TaskResult, TaskSpec};
use crate::readiness::ReadinessPattern;
use crate::service_log::ServiceLogWriter;
use crate::supervisor::{BoxFuture, TaskHooks, TaskSupervisor};

/// One step of a sequential chain; `None` means the step was skipped.
pub type Step<'a, T, E> = Box<dyn FnOnce() -> BoxFuture<'a, Option<std::result::Result<T, E>>> + Send + 'a>;

/// Boxes a closure returning a future into a `Step`.
pub fn step<'a, T, E, F, Fut>(f: F) -> Step<'a, T, E>
where
    F: FnOnce() -> Fut + Send + 'a,
    Fut: Future<Output = Option<std::result::Result<T, E>>> + Send + 'a,
{
    Box::new(move || Box::pin(f()))
}

/// Runs `steps` in order and stops at the first error.
///
/// The output has one slot per step; skipped steps leave `None`. Steps after
/// a failing one are never invoked.
pub async fn sequential_tasks<'a, T, E>(
    steps: Vec<Step<'a, T, E>>,
) -> std::result::Result<Vec<Option<T>>, E> {
    let mut results = Vec::with_capacity(steps.len());
    for (index, step) in steps.into_iter().enumerate() {
        match step().await {
            None => {
                debug!(step = index, "step skipped");
                results.push(None);
            }
            Some(Ok(value)) => results.push(Some(value)),
            Some(Err(err)) => {
                debug!(step = index, "step failed; remaining steps not run");
                return Err(err);
            }
        }
    }
    Ok(results)
}

/// A task started as part of a parallel set.
#[derive(Debug, Clone)]
pub struct ServiceTask {
    pub spec: TaskSpec,
    /// `None` waits for the process to exit instead of a readiness pattern.
    pub pattern: Option<ReadinessPattern>,
}

impl ServiceTask {
    pub fn new(spec: TaskSpec, pattern: Option<ReadinessPattern>) -> Self {
        Self { spec, pattern }
    }
}

/// What a preview session runs: installs one after another, then services
/// all at once.
#[derive(Debug, Clone, Default)]
pub struct SessionPlan {
    pub installs: Vec<TaskSpec>,
    pub services: Vec<ServiceTask>,
}

impl SessionPlan {
    pub fn is_empty(&self) -> bool {
        self.installs.is_empty() && self.services.is_empty()
    }
}

/// Runs tasks for one session and guarantees their teardown.
pub struct Orchestrator {
    hooks: Arc<dyn TaskHooks>,
    logs: Option<Arc<ServiceLogWriter>>,
    shutdown: ShutdownConfig,
    ready_timeout: Option<Duration>,
    registry: Mutex<Vec<Arc<TaskSupervisor>>>,
}

impl Orchestrator {
    pub fn new(hooks: Arc<dyn TaskHooks>, logs: Option<Arc<ServiceLogWriter>>) -> Self {
        Self {
            hooks,
            logs,
            shutdown: ShutdownConfig::default(),
            ready_timeout: None,
            registry: Mutex::new(Vec::new()),
        }
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownConfig) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Titles of the registered supervisors, in start order.
    pub fn running(&self) -> Vec<String> {
        self.registry
            .lock()
            .map(|registry| registry.iter().map(|t| t.title().to_string()).collect())
            .unwrap_or_default()
    }

    /// Runs a foreground task until it exits.
    pub async fn run_task(&self, spec: TaskSpec) -> std::result::Result<TaskResult, TaskError> {
        let task = self.register(spec);
        let result = task.wait(self.hooks.as_ref(), self.logs.clone()).await;
        self.unregister(&task);
        result
    }

    /// Starts a service and waits until it is ready or exits.
    ///
    /// The service stays registered until `teardown`.
    pub async fn start_service(
        &self,
        spec: TaskSpec,
        pattern: &ReadinessPattern,
    ) -> std::result::Result<TaskResult, TaskError> {
        let task = self.register(spec);
        task.wait_for(pattern, self.hooks.as_ref(), self.logs.clone())
            .await
    }

    /// Runs all `tasks` concurrently and joins them.
    ///
    /// Each task resolves on its own; a failure does not cut the others
    /// short. If anything failed, the whole registry is torn down once every
    /// task has resolved. Results are in input order.
    pub async fn run_parallel(&self, tasks: Vec<ServiceTask>) -> Result<Vec<TaskResult>> {
        let mut set = JoinSet::new();
        let mut supervisors = Vec::with_capacity(tasks.len());
        for (index, ServiceTask { spec, pattern }) in tasks.into_iter().enumerate() {
            let task = self.register(spec);
            supervisors.push(task.clone());
            let hooks = self.hooks.clone();
            let logs = self.logs.clone();
            set.spawn(async move {
                let result = match &pattern {
                    Some(pattern) => task.wait_for(pattern, hooks.as_ref(), logs).await,
                    None => task.wait(hooks.as_ref(), logs).await,
                };
                (index, result)
            });
        }

        let mut slots: Vec<Option<std::result::Result<TaskResult, TaskError>>> =
            supervisors.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(err) => warn!(error = %err, "supervisor task aborted"),
            }
        }

        let mut results = Vec::with_capacity(slots.len());
        let mut errors = Vec::new();
        for (task, slot) in supervisors.iter().zip(slots) {
            if !task.spec().background {
                self.unregister(task);
            }
            match slot {
                Some(Ok(result)) => results.push(result),
                Some(Err(err)) => errors.push(err),
                None => errors.push(TaskError::Rejected {
                    title: task.title().to_string(),
                    message: "supervisor task aborted".to_string(),
                    log_file: None,
                }),
            }
        }

        if errors.is_empty() {
            return Ok(results);
        }
        warn!(failed = errors.len(), "parallel tasks failed; tearing down");
        self.teardown().await;
        if errors.len() == 1 {
            return Err(RackError::Task(errors.remove(0)));
        }
        Err(RackError::Tasks(errors))
    }

    /// Runs `work`; on error tears down every registered task first.
    pub async fn run_guarded<T, E, F>(&self, work: F) -> std::result::Result<T, E>
    where
        F: Future<Output = std::result::Result<T, E>>,
    {
        match work.await {
            Ok(value) => Ok(value),
            Err(err) => {
                warn!("session step failed; tearing down running tasks");
                self.teardown().await;
                Err(err)
            }
        }
    }

    /// Sequential chain with teardown on failure.
    pub async fn sequential<'a, T, E>(
        &self,
        steps: Vec<Step<'a, T, E>>,
    ) -> std::result::Result<Vec<Option<T>>, E> {
        self.run_guarded(sequential_tasks(steps)).await
    }

    /// Installs in order, then all services in parallel.
    pub async fn run_plan(&self, plan: SessionPlan) -> Result<Vec<TaskResult>> {
        info!(
            installs = plan.installs.len(),
            services = plan.services.len(),
            "starting session"
        );
        self.run_guarded(async move {
            let steps: Vec<Step<'_, TaskResult, TaskError>> = plan
                .installs
                .into_iter()
                .map(|spec| step(move || async move { Some(self.run_task(spec).await) }))
                .collect();
            let mut results: Vec<TaskResult> =
                sequential_tasks(steps).await?.into_iter().flatten().collect();
            results.extend(self.run_parallel(plan.services).await?);
            Ok::<_, RackError>(results)
        })
        .await
    }

    /// Terminates every registered task, in start order.
    pub async fn teardown(&self) {
        let mut terminated = 0;
        while let Some(task) = self.take_first() {
            if task.terminate().await {
                terminated += 1;
            }
        }
        if terminated > 0 {
            info!(terminated, "session teardown complete");
        }
    }

    fn register(&self, spec: TaskSpec) -> Arc<TaskSupervisor> {
        let task = Arc::new(
            TaskSupervisor::new(spec)
                .with_shutdown(self.shutdown)
                .with_ready_timeout(self.ready_timeout),
        );
        if let Ok(mut registry) = self.registry.lock() {
            registry.push(task.clone());
        }
        task
    }

    fn unregister(&self, task: &Arc<TaskSupervisor>) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.retain(|entry| !Arc::ptr_eq(entry, task));
        }
    }

    fn take_first(&self) -> Option<Arc<TaskSupervisor>> {
        let mut registry = self.registry.lock().ok()?;
        if registry.is_empty() {
            None
        } else {
            Some(registry.remove(0))
        }
    }
}
