//! Artifact worker
//!
//! The queue handler behind every worker class. One attempt of a task job:
//!
//! 1. skip if the workflow was cancelled
//! 2. mark the task in-progress
//! 3. audit completeness gaps of the feature's failure specification
//! 4. ask the producer for an explanation and record it
//! 5. pass the explanation gate
//! 6. produce under the timeout, holding the permit
//! 7. run the validation pipeline and persist the verdict
//! 8. accept, or send the task to the retry path, or fail it

use crate::error::ForgeError;
use crate::orchestrator::Services;
use crate::producer::{ProducedArtifact, ProducerError, ProductionRequest};
use async_trait::async_trait;
use chrono::Utc;
use forge_governance::{
    AgentExplanation, Candidate, Disposition, GateRefusal, Stage, Verdict, PRODUCER_FATAL,
    PRODUCER_TIMEOUT,
};
use forge_model::{
    AgentMessage, AuditEntry, ExplanationId, FailureClass, Job, JobPayload, StoredExplanation,
    Task, TaskFailure, TaskId, TaskStatus, ValidationRecord,
};
use forge_queue::{JobError, JobHandler};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;

/// Key under which an accepted artifact's digest is shared with dependents
pub const DIGEST_KEY: &str = "digest";

enum Settlement {
    Done,
    Retry(String),
    Fail(String),
}

/// Queue handler that produces and validates artifacts
pub struct ArtifactWorker {
    services: Arc<Services>,
}

impl std::fmt::Debug for ArtifactWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactWorker").finish_non_exhaustive()
    }
}

#[async_trait]
impl JobHandler for ArtifactWorker {
    async fn handle(&self, job: Job, attempt: u32) -> Result<(), JobError> {
        let key = job.key;
        let outcome = match job.payload {
            JobPayload::Message(message) => self.receive(&message).await.map(|()| Settlement::Done),
            payload => self.run(Job { payload, ..job }, attempt).await,
        };

        match outcome {
            Ok(Settlement::Done) => Ok(()),
            Ok(Settlement::Retry(reason)) => Err(JobError::retryable(reason)),
            Ok(Settlement::Fail(reason)) => Err(JobError::fatal(reason)),
            Err(err) => {
                tracing::error!(job = %key, attempt, error = %err, "job aborted");
                Err(JobError {
                    message: err.to_string(),
                    retryable: err.is_retryable(),
                })
            }
        }
    }
}

impl ArtifactWorker {
    pub(crate) fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    async fn receive(&self, message: &AgentMessage) -> Result<(), ForgeError> {
        tracing::info!(
            workflow_id = %message.workflow_id,
            task_id = %message.task_id,
            message_type = ?message.message_type(),
            priority = message.priority,
            "message received"
        );
        self.services
            .store()
            .append_audit(AuditEntry::new(
                message.workflow_id,
                Some(message.task_id),
                "message_received",
                json!({
                    "message_id": message.id,
                    "from": message.from,
                    "to": message.to,
                    "payload": message.payload,
                }),
            ))
            .await?;
        Ok(())
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, ProducerError>>,
    ) -> Result<T, ProducerError> {
        let limit = self.services.producer_timeout;
        tokio::time::timeout(limit, call)
            .await
            .map_err(|_| ProducerError::Timeout {
                waited_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
            })?
    }

    async fn run(&self, job: Job, attempt: u32) -> Result<Settlement, ForgeError> {
        let services = &self.services;
        let Some(task_id) = job.task_id() else {
            return Ok(Settlement::Done);
        };
        let Some(order) = job.payload.work_order() else {
            return Ok(Settlement::Done);
        };
        let feature_id = order.feature_id.clone();

        let workflow = services.engine.get_workflow(job.workflow_id).await?;
        if workflow.is_cancelled() {
            services
                .store()
                .append_audit(AuditEntry::new(
                    workflow.id,
                    Some(task_id),
                    "skipped_after_cancel",
                    json!({ "attempt": attempt }),
                ))
                .await?;
            tracing::info!(workflow_id = %workflow.id, task_id = %task_id, "task skipped after cancellation");
            return Ok(Settlement::Done);
        }

        let task = services.engine.update_task_status(task_id, TaskStatus::InProgress).await?;
        tracing::debug!(
            workflow_id = %workflow.id,
            task_id = %task_id,
            worker_class = task.worker_class.as_str(),
            attempt,
            kind = job.payload.label(),
            "task started"
        );

        if attempt == 1 {
            let gaps = services.pipeline.completeness(&feature_id);
            if !gaps.is_empty() {
                services
                    .store()
                    .append_audit(AuditEntry::new(
                        workflow.id,
                        Some(task_id),
                        "completeness_gaps",
                        serde_json::to_value(&gaps)?,
                    ))
                    .await?;
            }
        }

        let request = ProductionRequest {
            workflow_id: workflow.id,
            task_id,
            feature_id: feature_id.clone(),
            worker_class: task.worker_class,
            title: task.title.clone(),
            attempt,
            shared: services
                .coordinator
                .get_shared_artifacts(workflow.id, task_id, None)
                .await?,
            payload: job.payload,
        };

        let explanation = match self.bounded(services.producer.explain(&request)).await {
            Ok(explanation) => explanation,
            Err(err) => return self.producer_failed(&task, &feature_id, attempt, err).await,
        };
        let (explanation_id, mismatch) = self.record_explanation(task_id, &feature_id, explanation).await?;

        let (verdict, artifact) = match (mismatch, services.gate.can_emit_code(explanation_id)) {
            (Some(reason), _) => {
                let refusal = GateRefusal {
                    explanation_id,
                    missing: Vec::new(),
                    unhandled_modes: Vec::new(),
                    reason,
                };
                (services.pipeline.refused(&feature_id, refusal), None)
            }
            (None, Err(refusal)) => (services.pipeline.refused(&feature_id, refusal), None),
            (None, Ok(permit)) => {
                let artifact = match self.bounded(services.producer.produce(&permit, &request)).await {
                    Ok(artifact) => artifact,
                    Err(err) => return self.producer_failed(&task, &feature_id, attempt, err).await,
                };
                let candidate = Candidate {
                    files: &artifact.files,
                    entities: &artifact.entities,
                    state: &artifact.state,
                };
                let verdict = services.pipeline.evaluate(&permit, candidate).await?;
                (verdict, Some(artifact))
            }
        };

        services
            .store()
            .record_validation(ValidationRecord {
                workflow_id: workflow.id,
                task_id,
                attempt,
                accepted: verdict.is_accepted(),
                digest: verdict.digest.clone(),
                verdict: serde_json::to_value(&verdict)?,
                recorded_at: Utc::now(),
            })
            .await?;

        match (verdict.disposition, artifact) {
            (Disposition::Accept, Some(artifact)) => self.accept(&task, &verdict, artifact).await,
            _ => self.reject(&task, attempt, &verdict).await,
        }
    }

    /// Persist and gate an explanation
    ///
    /// An id already held by the gate is reused so a resent explanation
    /// survives the retry path; one whose content changed is refused.
    async fn record_explanation(
        &self,
        task_id: TaskId,
        feature_id: &str,
        explanation: AgentExplanation,
    ) -> Result<(ExplanationId, Option<String>), ForgeError> {
        let services = &self.services;
        let id = explanation.id;
        let mut mismatch = (explanation.task_id != task_id || explanation.feature_id != feature_id)
            .then(|| {
                format!(
                    "explanation {id} covers task {} of feature {}",
                    explanation.task_id, explanation.feature_id
                )
            });

        if let Some(previous) = services.gate.get(id) {
            if *previous != explanation {
                mismatch.get_or_insert_with(|| format!("explanation {id} was already recorded with different content"));
            }
            tracing::debug!(explanation_id = %id, task_id = %task_id, "explanation reused");
            return Ok((id, mismatch));
        }

        if services.store().get_explanation(id).await?.is_none() {
            services
                .store()
                .record_explanation(StoredExplanation {
                    id,
                    task_id,
                    body: serde_json::to_value(&explanation)?,
                    recorded_at: Utc::now(),
                })
                .await?;
        }
        services.gate.record(explanation)?;
        Ok((id, mismatch))
    }

    async fn accept(
        &self,
        task: &Task,
        verdict: &Verdict,
        artifact: ProducedArtifact,
    ) -> Result<Settlement, ForgeError> {
        let services = &self.services;
        let workflow_id = task.workflow_id;
        let result = json!({
            "digest": verdict.digest,
            "files": artifact.files.iter().map(|f| f.path.as_str()).collect::<Vec<_>>(),
            "entities": artifact.entities.len(),
            "metadata": artifact.metadata,
        });

        services.engine.complete_task(task.id, result.clone()).await?;
        let unblocked = services
            .coordinator
            .report_task_completion(workflow_id, task.id, result)
            .await?;
        for target in &unblocked {
            services
                .coordinator
                .share_artifact(workflow_id, task.id, *target, DIGEST_KEY, json!(verdict.digest))
                .await?;
        }

        services.dispatch_ready(workflow_id).await?;
        services.engine.refresh_workflow_progress(workflow_id).await?;
        Ok(Settlement::Done)
    }

    async fn reject(
        &self,
        task: &Task,
        attempt: u32,
        verdict: &Verdict,
    ) -> Result<Settlement, ForgeError> {
        let (reason, failure) = match &verdict.rejection {
            Some(rejection) => (
                format!("{} stage rejected the artifact: {}", rejection.stage, rejection.reason),
                TaskFailure::new(rejection.reason.clone(), rejection.classification)
                    .with_mode(rejection.failure_mode.clone()),
            ),
            None => (
                "artifact rejected".to_string(),
                TaskFailure::new("artifact rejected", Stage::Explanation.default_classification()),
            ),
        };
        let retry = verdict.disposition == Disposition::Retry;
        self.settle(task, retry, reason, failure.with_attempts(attempt)).await
    }

    async fn producer_failed(
        &self,
        task: &Task,
        feature_id: &str,
        attempt: u32,
        err: ProducerError,
    ) -> Result<Settlement, ForgeError> {
        let (mode, fallback) = match &err {
            ProducerError::Timeout { .. } => (Some(PRODUCER_TIMEOUT), FailureClass::Transient),
            ProducerError::Transient(_) => (None, FailureClass::Transient),
            ProducerError::Fatal(_) => (Some(PRODUCER_FATAL), FailureClass::Fatal),
        };
        let classification = mode
            .and_then(|m| self.services.failure_modes.classify(feature_id, m))
            .unwrap_or(fallback);
        let mut failure = TaskFailure::new(err.to_string(), classification).with_attempts(attempt);
        if let Some(mode) = mode {
            failure = failure.with_mode(mode);
        }

        self.services
            .store()
            .append_audit(AuditEntry::new(
                task.workflow_id,
                Some(task.id),
                "producer_error",
                json!({ "attempt": attempt, "error": err.to_string(), "classification": classification }),
            ))
            .await?;
        self.settle(task, classification.is_retryable(), err.to_string(), failure)
            .await
    }

    async fn settle(
        &self,
        task: &Task,
        retryable: bool,
        reason: String,
        failure: TaskFailure,
    ) -> Result<Settlement, ForgeError> {
        let exhausted = retryable && failure.attempts >= task.max_retries;
        if retryable && !exhausted {
            tracing::warn!(
                workflow_id = %task.workflow_id,
                task_id = %task.id,
                attempt = failure.attempts,
                reason = %reason,
                "attempt failed, retry scheduled"
            );
            self.services.engine.retry_task(task.id, failure).await?;
            return Ok(Settlement::Retry(reason));
        }

        let failure = if exhausted {
            TaskFailure {
                reason: format!("{} (gave up after {} attempts)", failure.reason, failure.attempts),
                ..failure
            }
        } else {
            failure
        };
        self.services.engine.fail_task(task.id, failure).await?;
        Ok(Settlement::Fail(reason))
    }
}
