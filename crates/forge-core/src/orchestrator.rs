//! Orchestrator
//!
//! Wires the engine, coordinator, queue and governance components together
//! and runs them:
//!
//! ```text
//! submit ──► engine.start_workflow ──► coordinator.create_coordination_plan
//!                                              │
//!                 ┌────────── dispatch_ready ◄─┘
//!                 ▼
//!            TaskQueue ──► ArtifactWorker ──► explain ─► gate ─► produce ─► pipeline
//!                 │                                                      │
//!                 │ JobEvent::Failed                accept: complete + dispatch_ready
//!                 ▼                                 reject: retry or fail
//!            on_terminal_failure ──► report_task_failure ──► workflow failed
//!                 ▲
//!            reconcile_failures, after dropped events
//! ```

use crate::config::ForgeConfig;
use crate::engine::WorkflowEngine;
use crate::error::ForgeError;
use crate::producer::Producer;
use crate::worker::ArtifactWorker;
use forge_contracts::ContractRegistry;
use forge_coordination::{CoordinationError, DependencyCoordinator};
use forge_governance::{
    ExplanationGate, FailureModeRegistry, FeatureFailureSpec, InvariantEnforcer, PurityGate,
    ValidationPipeline,
};
use forge_model::{
    FailureClass, JobKey, MessageSink, Requirement, StateStore, Task, TaskFailure, TaskId,
    TaskStatus, WorkerClass, Workflow, WorkflowId,
};
use forge_queue::{JobEvent, JobHandler, JobState, TaskQueue};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Components shared by the orchestrator, its workers and its event loop
pub(crate) struct Services {
    pub(crate) engine: WorkflowEngine,
    pub(crate) coordinator: DependencyCoordinator,
    pub(crate) queue: Arc<TaskQueue>,
    pub(crate) contracts: Arc<ContractRegistry>,
    pub(crate) failure_modes: Arc<FailureModeRegistry>,
    pub(crate) invariants: Arc<InvariantEnforcer>,
    pub(crate) gate: ExplanationGate,
    pub(crate) pipeline: ValidationPipeline,
    pub(crate) producer: Arc<dyn Producer>,
    pub(crate) producer_timeout: Duration,
}

impl Services {
    pub(crate) fn store(&self) -> &Arc<dyn StateStore> {
        self.engine.store()
    }

    /// Claim every ready task of a workflow and queue it
    ///
    /// Nothing is dispatched for a terminal workflow.
    pub(crate) async fn dispatch_ready(&self, workflow_id: WorkflowId) -> Result<usize, ForgeError> {
        let workflow = self.engine.get_workflow(workflow_id).await?;
        if workflow.status.is_terminal() {
            return Ok(0);
        }
        let ready = self
            .coordinator
            .claim_ready_tasks(workflow_id, &HashSet::new())
            .await?;
        if ready.is_empty() {
            return Ok(0);
        }

        for (n, task_id) in ready.iter().enumerate() {
            if let Err(err) = self.dispatch(&workflow, *task_id).await {
                for unsent in &ready[n..] {
                    if let Err(release) = self.release(workflow_id, *unsent).await {
                        tracing::warn!(workflow_id = %workflow_id, task_id = %unsent, error = %release, "claim not released");
                    }
                }
                return Err(err);
            }
        }
        self.engine.refresh_workflow_progress(workflow_id).await?;
        Ok(ready.len())
    }

    async fn dispatch(&self, workflow: &Workflow, task_id: TaskId) -> Result<(), ForgeError> {
        let task = self.engine.get_task(task_id).await?;
        let payload = self
            .engine
            .planner()
            .payload(workflow, &task)
            .ok_or(ForgeError::UnknownTask(task_id))?;
        let task = self
            .engine
            .assign_task(task_id, self.queue.policy(task.worker_class).max_attempts)
            .await?;
        self.queue.queue_task(&task, payload)?;
        tracing::debug!(
            workflow_id = %workflow.id,
            task_id = %task_id,
            worker_class = task.worker_class.as_str(),
            "task dispatched"
        );
        Ok(())
    }

    /// Undo a claim whose task never reached the queue
    async fn release(&self, workflow_id: WorkflowId, task_id: TaskId) -> Result<(), ForgeError> {
        self.coordinator.release_claim(workflow_id, task_id).await?;
        let task = self.engine.get_task(task_id).await?;
        if task.status == TaskStatus::Assigned {
            self.engine.update_task_status(task_id, TaskStatus::Pending).await?;
        }
        Ok(())
    }

    /// Settle a job the queue gave up on
    pub(crate) async fn on_terminal_failure(&self, event: &JobEvent) -> Result<(), ForgeError> {
        let JobEvent::Failed {
            workflow_id,
            attempts,
            error,
            retryable,
            ..
        } = event
        else {
            return Ok(());
        };
        let Some(task_id) = event.task_id() else {
            tracing::warn!(workflow_id = %workflow_id, job = %event.key(), error = %error, "message job failed");
            return Ok(());
        };

        let task = self.engine.get_task(task_id).await?;
        let failure = match (task.status, task.failure.clone()) {
            (TaskStatus::Failed, Some(failure)) => failure,
            (_, previous) => {
                let failure = match previous {
                    Some(last) => TaskFailure {
                        reason: format!("{} (gave up after {attempts} attempts)", last.reason),
                        ..last
                    },
                    None => {
                        let class = if *retryable {
                            FailureClass::Transient
                        } else {
                            FailureClass::Fatal
                        };
                        TaskFailure::new(error.clone(), class)
                    }
                }
                .with_attempts(*attempts);
                self.engine.fail_task(task_id, failure.clone()).await?;
                failure
            }
        };

        if self.engine.get_workflow(*workflow_id).await?.status.is_terminal() {
            return Ok(());
        }
        let notified = self
            .coordinator
            .report_task_failure(*workflow_id, task_id, &failure, false)
            .await?;
        for dependent in notified {
            if self.engine.get_task(dependent).await?.status == TaskStatus::Pending {
                self.engine.update_task_status(dependent, TaskStatus::Blocked).await?;
            }
        }
        self.engine
            .fail_workflow(
                *workflow_id,
                format!("task {} failed: {}", task.title, failure.reason),
            )
            .await?;
        Ok(())
    }

    /// Settle failures whose queue event was never received
    ///
    /// Scans every workflow still coordinated as active for a task that
    /// failed in the engine or whose job failed in the queue, and settles
    /// it as if its `JobEvent::Failed` had arrived. Returns the number of
    /// workflows settled.
    pub(crate) async fn reconcile_failures(&self) -> Result<usize, ForgeError> {
        let mut settled = 0;
        for workflow_id in self.coordinator.active_workflows().await {
            if self.engine.get_workflow(workflow_id).await?.status.is_terminal() {
                continue;
            }
            let tasks = self.engine.get_tasks(workflow_id).await?;
            if let Some(event) = tasks.iter().find_map(|task| self.unsettled_failure(task)) {
                self.on_terminal_failure(&event).await?;
                settled += 1;
            }
        }
        if settled > 0 {
            tracing::info!(settled, "lost job failures reconciled");
        }
        Ok(settled)
    }

    fn unsettled_failure(&self, task: &Task) -> Option<JobEvent> {
        let key = JobKey::Task(task.id);
        let snapshot = self.queue.job_status(key);
        let job_failed = snapshot.as_ref().is_some_and(|job| job.state == JobState::Failed);
        if task.status != TaskStatus::Failed && !job_failed {
            return None;
        }
        let attempts = snapshot.as_ref().map_or(task.retry_count + 1, |job| job.attempts);
        let error = snapshot
            .and_then(|job| job.last_error)
            .or_else(|| task.failure.as_ref().map(|f| f.reason.clone()))
            .unwrap_or_default();
        Some(JobEvent::Failed {
            key,
            workflow_id: task.workflow_id,
            worker_class: task.worker_class,
            attempts,
            error,
            retryable: attempts >= self.queue.policy(task.worker_class).max_attempts,
        })
    }
}

/// Entry point of the engine
pub struct Orchestrator {
    services: Arc<Services>,
    config: ForgeConfig,
    started: AtomicBool,
    stop: watch::Sender<bool>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("started", &self.started.load(Ordering::SeqCst))
            .field("queue", &self.services.queue)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Build every component from configuration
    ///
    /// # Errors
    /// `Config` on invalid configuration, `Governance` if the purity
    /// classifier cannot be built.
    pub fn new(
        config: ForgeConfig,
        store: Arc<dyn StateStore>,
        producer: Arc<dyn Producer>,
    ) -> Result<Self, ForgeError> {
        config.validate()?;

        let queue = Arc::new(TaskQueue::with_policies(&config.queues)?);
        let sink: Arc<dyn MessageSink> = Arc::clone(&queue) as Arc<dyn MessageSink>;
        let coordinator = DependencyCoordinator::new(Arc::clone(&store))
            .with_sink(sink)
            .with_cycle_policy(config.coordination.cycle_policy);

        let contracts = Arc::new(ContractRegistry::new());
        let failure_modes = Arc::new(FailureModeRegistry::new());
        let invariants = Arc::new(InvariantEnforcer::new().with_mode(config.governance.enforcement));
        let purity = Arc::new(PurityGate::standard(config.governance.purity_cache_capacity)?);
        let pipeline = ValidationPipeline::new(
            Arc::clone(&contracts),
            Arc::clone(&failure_modes),
            Arc::clone(&invariants),
            purity,
        );
        let gate = ExplanationGate::new(Arc::clone(&failure_modes));

        let services = Services {
            engine: WorkflowEngine::new(store),
            coordinator,
            queue,
            contracts,
            failure_modes,
            invariants,
            gate,
            pipeline,
            producer,
            producer_timeout: config.producer_timeout(),
        };
        let (stop, _) = watch::channel(false);

        Ok(Self {
            services: Arc::new(services),
            config,
            started: AtomicBool::new(false),
            stop,
            event_loop: Mutex::new(None),
        })
    }

    /// Active configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ForgeConfig {
        &self.config
    }

    /// Workflow engine
    #[inline]
    #[must_use]
    pub fn engine(&self) -> &WorkflowEngine {
        &self.services.engine
    }

    /// Dependency coordinator
    #[inline]
    #[must_use]
    pub fn coordinator(&self) -> &DependencyCoordinator {
        &self.services.coordinator
    }

    /// Task queue
    #[inline]
    #[must_use]
    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.services.queue
    }

    /// Contract registry; register contracts before submitting
    #[inline]
    #[must_use]
    pub fn contracts(&self) -> &Arc<ContractRegistry> {
        &self.services.contracts
    }

    /// Failure mode registry
    #[inline]
    #[must_use]
    pub fn failure_modes(&self) -> &Arc<FailureModeRegistry> {
        &self.services.failure_modes
    }

    /// Invariant enforcer; register invariants before submitting
    #[inline]
    #[must_use]
    pub fn invariants(&self) -> &Arc<InvariantEnforcer> {
        &self.services.invariants
    }

    /// Explanation gate
    #[inline]
    #[must_use]
    pub fn gate(&self) -> &ExplanationGate {
        &self.services.gate
    }

    /// Start, plan and dispatch a workflow for a requirement
    ///
    /// `failure_spec` declares the feature's failure modes; without one the
    /// baseline taxonomy is registered under the requirement id.
    ///
    /// # Errors
    /// - `Requirement` listing every missing field; nothing is persisted
    /// - `Coordination` if the plan is rejected; the workflow is failed
    pub async fn submit(
        &self,
        requirement: Requirement,
        owner: impl Into<String>,
        failure_spec: Option<FeatureFailureSpec>,
    ) -> Result<Workflow, ForgeError> {
        let workflow = self.services.engine.start_workflow(requirement, owner).await?;
        let feature_id = workflow.requirement.id.clone();

        let spec = failure_spec.unwrap_or_else(|| FeatureFailureSpec::baseline(feature_id.as_str()));
        if spec.feature_id != feature_id {
            tracing::warn!(
                workflow_id = %workflow.id,
                declared = %spec.feature_id,
                feature = %feature_id,
                "failure specification registered under a different feature id"
            );
        }
        self.services.failure_modes.register(spec);

        let tasks = self.services.engine.get_tasks(workflow.id).await?;
        if let Err(err) = self
            .services
            .coordinator
            .create_coordination_plan(workflow.id, &tasks)
            .await
        {
            self.services
                .engine
                .fail_workflow(workflow.id, format!("coordination rejected: {err}"))
                .await?;
            return Err(err.into());
        }

        let dispatched = self.services.dispatch_ready(workflow.id).await?;
        tracing::info!(workflow_id = %workflow.id, dispatched, "workflow submitted");
        self.services.engine.get_workflow(workflow.id).await
    }

    /// Start worker loops for every class and the failure event loop
    ///
    /// # Errors
    /// `AlreadyStarted` on a second call, `Queue` once shut down.
    pub fn start(&self) -> Result<(), ForgeError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ForgeError::AlreadyStarted);
        }

        let mut events = self.services.queue.subscribe();
        let handler: Arc<dyn JobHandler> = Arc::new(ArtifactWorker::new(Arc::clone(&self.services)));
        for class in WorkerClass::ALL {
            self.services.queue.process_jobs(class, Arc::clone(&handler))?;
        }

        let services = Arc::clone(&self.services);
        let mut stop = self.stop.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    received = events.recv() => match received {
                        Ok(event @ JobEvent::Failed { .. }) => {
                            if let Err(err) = services.on_terminal_failure(&event).await {
                                tracing::error!(job = %event.key(), error = %err, "terminal failure not settled");
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "job events dropped, reconciling");
                            if let Err(err) = services.reconcile_failures().await {
                                tracing::error!(error = %err, "reconcile failed");
                            }
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            tracing::debug!("event loop stopped");
        });
        *self.event_loop.lock() = Some(handle);
        tracing::info!("orchestrator started");
        Ok(())
    }

    /// Wait until a workflow is completed or failed
    ///
    /// # Errors
    /// `Timeout` if it is still running after `timeout`.
    pub async fn wait_for_workflow(&self, id: WorkflowId, timeout: Duration) -> Result<Workflow, ForgeError> {
        let deadline = Instant::now() + timeout;
        loop {
            let workflow = self.services.engine.get_workflow(id).await?;
            if workflow.status.is_terminal() {
                return Ok(workflow);
            }
            if Instant::now() >= deadline {
                return Err(ForgeError::Timeout {
                    workflow_id: id,
                    waited_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Cancel a workflow
    ///
    /// In-flight tasks finish and are recorded, but nothing further is
    /// dispatched.
    ///
    /// # Errors
    /// `UnknownWorkflow` or `Store`.
    pub async fn cancel_workflow(&self, id: WorkflowId, reason: impl Into<String>) -> Result<Workflow, ForgeError> {
        let workflow = self.services.engine.cancel_workflow(id, reason).await?;
        match self.services.coordinator.cancel(id).await {
            Ok(()) | Err(CoordinationError::UnknownWorkflow(_)) => Ok(workflow),
            Err(err) => Err(err.into()),
        }
    }

    /// Rebuild a workflow's coordination from the store and continue it
    ///
    /// Tasks that were dispatched but not finished are queued again; queue
    /// submission is idempotent on the task id. Returns the number of jobs
    /// queued.
    ///
    /// # Errors
    /// `UnknownWorkflow`, `Coordination` or `Queue`.
    pub async fn resume_workflow(&self, id: WorkflowId) -> Result<usize, ForgeError> {
        let workflow = self.services.engine.get_workflow(id).await?;
        if workflow.status.is_terminal() {
            return Ok(0);
        }
        let tasks = self.services.engine.get_tasks(id).await?;
        self.services.coordinator.restore(id, &tasks).await?;

        let mut queued = 0;
        for task in tasks.iter().filter(|t| {
            matches!(t.status, TaskStatus::Assigned | TaskStatus::InProgress | TaskStatus::Retry)
        }) {
            if let Some(payload) = self.services.engine.planner().payload(&workflow, task) {
                self.services.queue.queue_task(task, payload)?;
                queued += 1;
            }
        }
        queued += self.services.dispatch_ready(id).await?;
        tracing::info!(workflow_id = %id, queued, "workflow resumed");
        Ok(queued)
    }

    /// Stop workers and the event loop
    ///
    /// Jobs being handled finish first.
    pub async fn shutdown(&self) {
        self.services.queue.shutdown().await;
        self.stop.send_replace(true);
        let handle = self.event_loop.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "event loop ended abnormally");
            }
        }
        tracing::info!("orchestrator shut down");
    }
}
