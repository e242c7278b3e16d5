//! Per-class priority queues
//!
//! Each worker class owns an independent [`ClassQueue`]: a heap of waiting
//! jobs ordered by priority score and then submission order, a job table
//! that makes submission idempotent, and a `Notify` that wakes idle worker
//! loops. Retries are scheduled on the queue's own clock.

use crate::error::{JobError, QueueError};
use crate::policy::QueuePolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forge_model::{
    AgentMessage, Job, JobKey, JobPayload, MessageSink, Participant, Priority, SinkError, Task, TaskId,
    WorkerClass, WorkflowId, FAILURE_MESSAGE_PRIORITY,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 1024;

/// Lifecycle of a queued job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// In the heap
    Waiting,
    /// Held by a worker loop
    Active,
    /// Waiting for its backoff to elapse
    Delayed,
    /// Handler succeeded
    Completed,
    /// Terminal failure
    Failed,
}

impl JobState {
    /// Whether the job will never be dispatched again
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Outcome of a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Submission {
    /// New job queued
    Accepted,
    /// Job key already known; payload updated if still waiting
    Duplicate,
}

/// Inspectable view of one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    /// Job identity
    pub key: JobKey,
    /// Owning workflow
    pub workflow_id: WorkflowId,
    /// Queue the job lives in
    pub worker_class: WorkerClass,
    /// Lifecycle
    pub state: JobState,
    /// Attempts made so far
    pub attempts: u32,
    /// Submission priority
    pub priority: Priority,
    /// Payload label
    pub kind: String,
    /// Last handler error
    pub last_error: Option<String>,
    /// First submission
    pub enqueued_at: DateTime<Utc>,
    /// Last state change
    pub updated_at: DateTime<Utc>,
}

/// Counts by state for one class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// In the heap
    pub waiting: usize,
    /// Being handled
    pub active: usize,
    /// Waiting for backoff
    pub delayed: usize,
    /// Completed, including jobs no longer retained
    pub completed: usize,
    /// Failed, including jobs no longer retained
    pub failed: usize,
}

/// Broadcast job lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum JobEvent {
    /// Handler succeeded
    Completed {
        /// Job
        key: JobKey,
        /// Workflow
        workflow_id: WorkflowId,
        /// Class
        worker_class: WorkerClass,
        /// Attempts used
        attempts: u32,
    },
    /// Attempt failed, another is scheduled
    Retrying {
        /// Job
        key: JobKey,
        /// Workflow
        workflow_id: WorkflowId,
        /// Class
        worker_class: WorkerClass,
        /// Failed attempt
        attempt: u32,
        /// Backoff before the next attempt
        delay_ms: u64,
        /// Handler error
        error: String,
    },
    /// Terminal failure
    Failed {
        /// Job
        key: JobKey,
        /// Workflow
        workflow_id: WorkflowId,
        /// Class
        worker_class: WorkerClass,
        /// Attempts used
        attempts: u32,
        /// Handler error
        error: String,
        /// Whether the last error was retryable (attempts exhausted)
        retryable: bool,
    },
}

impl JobEvent {
    /// Job the event is about
    #[inline]
    #[must_use]
    pub fn key(&self) -> JobKey {
        match self {
            JobEvent::Completed { key, .. } | JobEvent::Retrying { key, .. } | JobEvent::Failed { key, .. } => *key,
        }
    }

    /// Task id, if the job carries a task
    #[inline]
    #[must_use]
    pub fn task_id(&self) -> Option<TaskId> {
        match self.key() {
            JobKey::Task(id) => Some(id),
            JobKey::Message(_) => None,
        }
    }
}

/// Worker-side processing of a job
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Handle one attempt (1-based) of a job
    async fn handle(&self, job: Job, attempt: u32) -> Result<(), JobError>;
}

#[derive(Debug)]
struct Entry {
    job: Job,
    priority: Priority,
    state: JobState,
    attempts: u32,
    seq: u64,
    last_error: Option<String>,
    enqueued_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Entry {
    fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            key: self.job.key,
            workflow_id: self.job.workflow_id,
            worker_class: self.job.worker_class,
            state: self.state,
            attempts: self.attempts,
            priority: self.priority,
            kind: self.job.payload.label().to_string(),
            last_error: self.last_error.clone(),
            enqueued_at: self.enqueued_at,
            updated_at: self.updated_at,
        }
    }
}

/// Heap slot; stale when the entry's `seq` moved on
#[derive(Debug, PartialEq, Eq)]
struct Ready {
    score: u32,
    seq: u64,
    key: JobKey,
}

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .cmp(&other.score)
            .then_with(|| other.seq.cmp(&self.seq))
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct ClassState {
    heap: BinaryHeap<Ready>,
    jobs: HashMap<JobKey, Entry>,
    finished: HashSet<JobKey>,
    finished_order: VecDeque<JobKey>,
    next_seq: u64,
    completed_total: usize,
    failed_total: usize,
}

impl ClassState {
    fn bump(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Remember a finished key, forgetting the oldest beyond `capacity`
    fn forget(&mut self, key: JobKey, capacity: usize) {
        if self.finished.insert(key) {
            self.finished_order.push_back(key);
        }
        while self.finished_order.len() > capacity {
            if let Some(oldest) = self.finished_order.pop_front() {
                self.finished.remove(&oldest);
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Settled {
    Completed,
    Retry(std::time::Duration),
    Failed { retryable: bool },
}

/// Queue of one worker class
#[derive(Debug)]
pub struct ClassQueue {
    class: WorkerClass,
    policy: QueuePolicy,
    state: Mutex<ClassState>,
    notify: Notify,
    processing: AtomicBool,
}

impl ClassQueue {
    fn new(class: WorkerClass, policy: QueuePolicy) -> Self {
        Self {
            class,
            policy,
            state: Mutex::new(ClassState::default()),
            notify: Notify::new(),
            processing: AtomicBool::new(false),
        }
    }

    /// Worker class served
    #[inline]
    #[must_use]
    pub fn class(&self) -> WorkerClass {
        self.class
    }

    /// Policy in force
    #[inline]
    #[must_use]
    pub fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    fn submit(&self, job: Job, priority: Priority) -> Submission {
        let mut state = self.state.lock();
        let key = job.key;
        if state.finished.contains(&key) {
            return Submission::Duplicate;
        }
        if let Some(entry) = state.jobs.get_mut(&key) {
            if entry.state == JobState::Waiting {
                entry.job.payload = job.payload;
                entry.updated_at = Utc::now();
            }
            return Submission::Duplicate;
        }

        let seq = state.bump();
        let now = Utc::now();
        state.heap.push(Ready {
            score: priority.score(),
            seq,
            key,
        });
        state.jobs.insert(
            key,
            Entry {
                job,
                priority,
                state: JobState::Waiting,
                attempts: 0,
                seq,
                last_error: None,
                enqueued_at: now,
                updated_at: now,
            },
        );
        drop(state);
        self.notify.notify_one();
        Submission::Accepted
    }

    /// Pop the best waiting job and mark it active
    fn take(&self) -> Option<(Job, u32)> {
        let mut state = self.state.lock();
        while let Some(ready) = state.heap.pop() {
            let Some(entry) = state.jobs.get_mut(&ready.key) else {
                continue;
            };
            if entry.state != JobState::Waiting || entry.seq != ready.seq {
                continue;
            }
            entry.state = JobState::Active;
            entry.attempts += 1;
            entry.updated_at = Utc::now();
            return Some((entry.job.clone(), entry.attempts));
        }
        None
    }

    fn requeue(&self, key: JobKey) {
        let mut state = self.state.lock();
        let seq = state.bump();
        let Some(entry) = state.jobs.get_mut(&key) else {
            return;
        };
        if entry.state != JobState::Delayed {
            return;
        }
        entry.state = JobState::Waiting;
        entry.seq = seq;
        entry.updated_at = Utc::now();
        let score = entry.priority.score();
        state.heap.push(Ready { score, seq, key });
        drop(state);
        self.notify.notify_one();
    }

    fn settle(&self, key: JobKey, attempt: u32, outcome: &Result<(), JobError>) -> Settled {
        let mut state = self.state.lock();
        let settled = match outcome {
            Ok(()) => Settled::Completed,
            Err(e) if e.retryable && attempt < self.policy.max_attempts => Settled::Retry(self.policy.backoff(attempt)),
            Err(e) => Settled::Failed { retryable: e.retryable },
        };

        let retain = match settled {
            Settled::Completed => {
                state.completed_total += 1;
                self.policy.retain_completed
            }
            Settled::Failed { .. } => {
                state.failed_total += 1;
                self.policy.retain_failed
            }
            Settled::Retry(_) => true,
        };

        if let Some(entry) = state.jobs.get_mut(&key) {
            entry.state = match settled {
                Settled::Completed => JobState::Completed,
                Settled::Retry(_) => JobState::Delayed,
                Settled::Failed { .. } => JobState::Failed,
            };
            entry.last_error = outcome.as_ref().err().map(|e| e.message.clone());
            entry.updated_at = Utc::now();
        }
        if !retain {
            state.jobs.remove(&key);
            state.forget(key, self.policy.forgotten_capacity);
        }
        settled
    }

    fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        let mut stats = QueueStats {
            completed: state.completed_total,
            failed: state.failed_total,
            ..QueueStats::default()
        };
        for entry in state.jobs.values() {
            match entry.state {
                JobState::Waiting => stats.waiting += 1,
                JobState::Active => stats.active += 1,
                JobState::Delayed => stats.delayed += 1,
                JobState::Completed | JobState::Failed => {}
            }
        }
        stats
    }

    fn snapshot(&self, key: JobKey) -> Option<JobSnapshot> {
        self.state.lock().jobs.get(&key).map(Entry::snapshot)
    }
}

/// Settle one attempt and publish what happened
fn conclude(
    queue: &Arc<ClassQueue>,
    job: &Job,
    attempt: u32,
    outcome: &Result<(), JobError>,
    events: &broadcast::Sender<JobEvent>,
    shutdown: &watch::Receiver<bool>,
) {
    let class = queue.class;
    let label = class.as_str();
    let error = outcome.as_ref().err().map(|e| e.message.clone()).unwrap_or_default();

    let event = match queue.settle(job.key, attempt, outcome) {
        Settled::Completed => {
            metrics::counter!("forge_queue_jobs_completed_total", "worker_class" => label).increment(1);
            tracing::info!(
                workflow_id = %job.workflow_id,
                job = %job.key,
                worker_class = label,
                attempt,
                "job completed"
            );
            JobEvent::Completed {
                key: job.key,
                workflow_id: job.workflow_id,
                worker_class: class,
                attempts: attempt,
            }
        }
        Settled::Retry(delay) => {
            metrics::counter!("forge_queue_jobs_retried_total", "worker_class" => label).increment(1);
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            tracing::warn!(
                workflow_id = %job.workflow_id,
                job = %job.key,
                worker_class = label,
                attempt,
                delay_ms,
                error = %error,
                "job attempt failed, retry scheduled"
            );

            let retry_queue = Arc::clone(queue);
            let shutdown = shutdown.clone();
            let key = job.key;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if !*shutdown.borrow() {
                    retry_queue.requeue(key);
                }
            });

            JobEvent::Retrying {
                key: job.key,
                workflow_id: job.workflow_id,
                worker_class: class,
                attempt,
                delay_ms,
                error,
            }
        }
        Settled::Failed { retryable } => {
            metrics::counter!("forge_queue_jobs_failed_total", "worker_class" => label).increment(1);
            tracing::error!(
                workflow_id = %job.workflow_id,
                job = %job.key,
                worker_class = label,
                attempt,
                exhausted = retryable,
                error = %error,
                "job failed"
            );
            JobEvent::Failed {
                key: job.key,
                workflow_id: job.workflow_id,
                worker_class: class,
                attempts: attempt,
                error,
                retryable,
            }
        }
    };
    // no subscribers is fine
    let _ = events.send(event);
}

async fn worker_loop(
    queue: Arc<ClassQueue>,
    handler: Arc<dyn JobHandler>,
    events: broadcast::Sender<JobEvent>,
    mut shutdown: watch::Receiver<bool>,
    worker: usize,
) {
    tracing::debug!(worker_class = queue.class.as_str(), worker, "worker loop started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let Some((job, attempt)) = queue.take() else {
            tokio::select! {
                () = queue.notify.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            continue;
        };

        tracing::debug!(
            workflow_id = %job.workflow_id,
            job = %job.key,
            worker_class = queue.class.as_str(),
            worker,
            attempt,
            kind = job.payload.label(),
            "job dispatched"
        );
        let outcome = handler.handle(job.clone(), attempt).await;
        conclude(&queue, &job, attempt, &outcome, &events, &shutdown);
    }
    tracing::debug!(worker_class = queue.class.as_str(), worker, "worker loop stopped");
}

fn class_index(class: WorkerClass) -> usize {
    match class {
        WorkerClass::Frontend => 0,
        WorkerClass::Backend => 1,
        WorkerClass::Infrastructure => 2,
        WorkerClass::Security => 3,
        WorkerClass::Testing => 4,
    }
}

/// Queue priority of a message job
fn message_priority(priority: u8) -> Priority {
    if priority >= FAILURE_MESSAGE_PRIORITY {
        Priority::Critical
    } else if priority >= 5 {
        Priority::High
    } else {
        Priority::Medium
    }
}

/// Task queue with one independent queue per worker class
pub struct TaskQueue {
    classes: Vec<Arc<ClassQueue>>,
    events: broadcast::Sender<JobEvent>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("classes", &self.classes.len())
            .field("workers", &self.workers.lock().len())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    /// Queue with each class's default policy
    #[must_use]
    pub fn new() -> Self {
        Self::build(QueuePolicy::for_class)
    }

    /// Queue with explicit policies; classes not listed get their default
    ///
    /// # Errors
    /// `InvalidPolicy` for the first class whose policy has problems.
    pub fn with_policies(policies: &BTreeMap<WorkerClass, QueuePolicy>) -> Result<Self, QueueError> {
        for (class, policy) in policies {
            let problems = policy.problems();
            if !problems.is_empty() {
                return Err(QueueError::InvalidPolicy { class: *class, problems });
            }
        }
        Ok(Self::build(|class| {
            policies
                .get(&class)
                .cloned()
                .unwrap_or_else(|| QueuePolicy::for_class(class))
        }))
    }

    fn build(policy: impl Fn(WorkerClass) -> QueuePolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        Self {
            classes: WorkerClass::ALL
                .iter()
                .map(|class| Arc::new(ClassQueue::new(*class, policy(*class))))
                .collect(),
            events,
            shutdown,
            workers: Mutex::new(Vec::new()),
        }
    }

    fn class(&self, class: WorkerClass) -> &Arc<ClassQueue> {
        &self.classes[class_index(class)]
    }

    /// Policy of a class
    #[inline]
    #[must_use]
    pub fn policy(&self, class: WorkerClass) -> &QueuePolicy {
        self.class(class).policy()
    }

    /// Whether shutdown was requested
    #[inline]
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Submit a task, keyed by its id, to its worker class's queue
    ///
    /// # Errors
    /// `ShuttingDown` once shutdown was requested.
    pub fn queue_task(&self, task: &Task, payload: JobPayload) -> Result<Submission, QueueError> {
        let job = Job {
            key: JobKey::Task(task.id),
            workflow_id: task.workflow_id,
            worker_class: task.worker_class,
            payload,
        };
        self.enqueue(job, task.priority)
    }

    /// Submit any job
    ///
    /// # Errors
    /// `ShuttingDown` once shutdown was requested.
    pub fn enqueue(&self, job: Job, priority: Priority) -> Result<Submission, QueueError> {
        if self.is_shutting_down() {
            return Err(QueueError::ShuttingDown);
        }
        let class = job.worker_class;
        let (workflow_id, key) = (job.workflow_id, job.key);
        let submission = self.class(class).submit(job, priority);

        match submission {
            Submission::Accepted => {
                metrics::counter!("forge_queue_jobs_enqueued_total", "worker_class" => class.as_str()).increment(1);
                tracing::debug!(
                    workflow_id = %workflow_id,
                    job = %key,
                    worker_class = class.as_str(),
                    score = priority.score(),
                    "job queued"
                );
            }
            Submission::Duplicate => {
                tracing::debug!(
                    workflow_id = %workflow_id,
                    job = %key,
                    worker_class = class.as_str(),
                    "duplicate submission"
                );
            }
        }
        Ok(submission)
    }

    /// Start the worker loops of a class
    ///
    /// Spawns `concurrency` loops that compete for the class's jobs until
    /// shutdown.
    ///
    /// # Errors
    /// - `ShuttingDown` once shutdown was requested
    /// - `AlreadyProcessing` if the class already has workers
    pub fn process_jobs(&self, class: WorkerClass, handler: Arc<dyn JobHandler>) -> Result<(), QueueError> {
        if self.is_shutting_down() {
            return Err(QueueError::ShuttingDown);
        }
        let queue = self.class(class);
        if queue.processing.swap(true, AtomicOrdering::SeqCst) {
            return Err(QueueError::AlreadyProcessing(class));
        }

        let concurrency = queue.policy.concurrency;
        let mut workers = self.workers.lock();
        for worker in 0..concurrency {
            workers.push(tokio::spawn(worker_loop(
                Arc::clone(queue),
                Arc::clone(&handler),
                self.events.clone(),
                self.shutdown.subscribe(),
                worker,
            )));
        }
        tracing::info!(worker_class = class.as_str(), concurrency, "worker loops started");
        Ok(())
    }

    /// Snapshot of a job
    #[must_use]
    pub fn job_status(&self, key: JobKey) -> Option<JobSnapshot> {
        self.classes.iter().find_map(|queue| queue.snapshot(key))
    }

    /// Counts by state for a class
    #[must_use]
    pub fn queue_stats(&self, class: WorkerClass) -> QueueStats {
        self.class(class).stats()
    }

    /// Subscribe to job lifecycle events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Stop accepting work and wait for every worker loop to exit
    ///
    /// Jobs being handled finish first; waiting jobs stay in the queue.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "worker loop ended abnormally");
            }
        }
        tracing::info!("task queue shut down");
    }
}

#[async_trait]
impl MessageSink for TaskQueue {
    async fn deliver(&self, message: AgentMessage) -> Result<(), SinkError> {
        let Participant::Worker(class) = message.to else {
            return Err(SinkError::Rejected(format!(
                "message {} is addressed to the coordinator",
                message.id
            )));
        };
        let priority = message_priority(message.priority);
        let job = Job {
            key: JobKey::Message(message.id),
            workflow_id: message.workflow_id,
            worker_class: class,
            payload: JobPayload::Message(message),
        };
        self.enqueue(job, priority)
            .map(|_| ())
            .map_err(|e| SinkError::Unavailable(e.to_string()))
    }
}
