//! Testing utilities for the Forge workspace
//!
//! Shared fixtures, a scripted producer and a store that fails on demand.

#![allow(missing_docs)]

use async_trait::async_trait;
use forge_core::{ProducedArtifact, Producer, ProducerError, ProductionRequest};
use forge_governance::{
    AgentExplanation, EmissionPermit, FailureModeRegistry, FeatureFailureSpec, Risk, RiskSeverity,
    SourceFile, Tradeoff,
};
use forge_model::{
    AgentMessage, AuditEntry, CoordinationRecord, ExplanationId, MemoryStore, Requirement,
    StateStore, StoreError, StoredExplanation, Task, TaskId, UserStory, ValidationRecord, Workflow,
    WorkflowId,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Requirement with `stories` user stories and `criteria` acceptance criteria
pub fn sample_requirement(stories: usize, criteria: usize) -> Requirement {
    sample_requirement_for("checkout", stories, criteria)
}

/// [`sample_requirement`] under another feature id
pub fn sample_requirement_for(id: &str, stories: usize, criteria: usize) -> Requirement {
    let mut requirement = Requirement::new(id, "Checkout flow")
        .with_description("Let a signed-in customer pay for the items in their cart");
    for n in 1..=stories {
        requirement = requirement.with_story(UserStory::new(
            format!("s{n}"),
            format!("As a customer I can complete step {n} of checkout"),
        ));
    }
    for n in 1..=criteria {
        requirement = requirement.with_criterion(format!("criterion {n} holds"));
    }
    requirement
}

/// Explanation with every category filled and every listed mode handled
pub fn complete_explanation<I, S>(task_id: TaskId, feature_id: &str, modes: I) -> AgentExplanation
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let explanation = AgentExplanation::new(task_id, feature_id)
        .assume("inputs were validated upstream")
        .tradeoff(Tradeoff {
            decision: "storage layout".into(),
            option_a: "normalized tables".into(),
            option_b: "single document".into(),
            choice: "normalized tables".into(),
            rationale: "orders are queried by line item".into(),
        })
        .honor("no I/O in domain logic")
        .edge_case("empty cart", "rejected before payment")
        .risk(Risk {
            description: "payment provider latency".into(),
            severity: RiskSeverity::Medium,
            mitigation: "bounded timeout with retry".into(),
        })
        .contract_note("order entities checked against the shop contract");
    modes
        .into_iter()
        .fold(explanation, |e, mode| e.handles(mode, "covered by tests"))
}

/// A pure source file for a task
pub fn pure_source(title: &str) -> SourceFile {
    let name: String = title
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    SourceFile::new(
        format!("src/domain/{name}.rs"),
        "pub fn total(items: &[i64]) -> i64 {\n    items.iter().sum()\n}\n",
    )
}

/// One scripted `produce` outcome
#[derive(Debug, Clone)]
pub enum Outcome {
    Artifact(ProducedArtifact),
    Error(ProducerError),
    /// Sleep before answering with the default artifact
    Stall(Duration),
}

/// Producer driven by a queue of outcomes
///
/// `explain` always answers with a complete explanation, a fresh one per
/// call unless [`ScriptedProducer::with_stable_explanations`] is set.
/// `produce` pops the next outcome for the feature, then for the task
/// title, falling back to the global script, and finally to a clean
/// artifact.
#[derive(Debug, Default)]
pub struct ScriptedProducer {
    registry: OnceLock<Arc<FailureModeRegistry>>,
    stable: bool,
    explained: Mutex<HashMap<TaskId, AgentExplanation>>,
    by_feature: Mutex<HashMap<String, VecDeque<Outcome>>>,
    by_title: Mutex<HashMap<String, VecDeque<Outcome>>>,
    script: Mutex<VecDeque<Outcome>>,
    explain_calls: AtomicUsize,
    produce_calls: Mutex<HashMap<TaskId, usize>>,
}

impl ScriptedProducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every `explain` of a task with the same explanation
    pub fn with_stable_explanations(mut self) -> Self {
        self.stable = true;
        self
    }

    /// Use the orchestrator's registry for the modes to handle
    pub fn attach(&self, registry: Arc<FailureModeRegistry>) {
        let _ = self.registry.set(registry);
    }

    /// Queue an outcome for any task
    pub fn then(&self, outcome: Outcome) -> &Self {
        self.script.lock().push_back(outcome);
        self
    }

    /// Queue an outcome for tasks of this feature
    pub fn then_for_feature(&self, feature_id: &str, outcome: Outcome) -> &Self {
        self.by_feature
            .lock()
            .entry(feature_id.to_string())
            .or_default()
            .push_back(outcome);
        self
    }

    /// Queue an outcome for tasks with this title
    pub fn then_for(&self, title: &str, outcome: Outcome) -> &Self {
        self.by_title
            .lock()
            .entry(title.to_string())
            .or_default()
            .push_back(outcome);
        self
    }

    pub fn explain_calls(&self) -> usize {
        self.explain_calls.load(Ordering::SeqCst)
    }

    /// Number of `produce` calls for a task
    pub fn produce_calls(&self, task_id: TaskId) -> usize {
        self.produce_calls.lock().get(&task_id).copied().unwrap_or(0)
    }

    pub fn total_produce_calls(&self) -> usize {
        self.produce_calls.lock().values().sum()
    }

    fn modes(&self, feature_id: &str) -> Vec<String> {
        match self.registry.get() {
            Some(registry) => registry.declared_modes(feature_id),
            None => FeatureFailureSpec::baseline(feature_id).modes.keys().cloned().collect(),
        }
    }

    fn next_outcome(&self, feature_id: &str, title: &str) -> Option<Outcome> {
        if let Some(outcome) = self.by_feature.lock().get_mut(feature_id).and_then(VecDeque::pop_front) {
            return Some(outcome);
        }
        if let Some(outcome) = self.by_title.lock().get_mut(title).and_then(VecDeque::pop_front) {
            return Some(outcome);
        }
        self.script.lock().pop_front()
    }
}

#[async_trait]
impl Producer for ScriptedProducer {
    async fn explain(&self, request: &ProductionRequest) -> Result<AgentExplanation, ProducerError> {
        self.explain_calls.fetch_add(1, Ordering::SeqCst);
        let fresh = || complete_explanation(request.task_id, &request.feature_id, self.modes(&request.feature_id));
        if !self.stable {
            return Ok(fresh());
        }
        Ok(self.explained.lock().entry(request.task_id).or_insert_with(fresh).clone())
    }

    async fn produce(
        &self,
        permit: &EmissionPermit,
        request: &ProductionRequest,
    ) -> Result<ProducedArtifact, ProducerError> {
        assert_eq!(permit.task_id(), request.task_id, "permit issued for another task");
        *self.produce_calls.lock().entry(request.task_id).or_insert(0) += 1;

        let clean = || {
            ProducedArtifact::new()
                .with_file(pure_source(&request.title))
                .with_metadata(serde_json::json!({ "title": request.title, "attempt": request.attempt }))
        };
        match self.next_outcome(&request.feature_id, &request.title) {
            None => Ok(clean()),
            Some(Outcome::Artifact(artifact)) => Ok(artifact),
            Some(Outcome::Error(err)) => Err(err),
            Some(Outcome::Stall(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(clean())
            }
        }
    }
}

/// Store that fails chosen writes
///
/// Writes are counted across every write method; the `n`-th (1-based) and
/// any listed later ones fail with `StoreError::Unavailable`.
#[derive(Debug, Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    writes: AtomicUsize,
    failing: Mutex<Vec<usize>>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the `n`-th write
    pub fn fail_write(self, n: usize) -> Self {
        self.failing.lock().push(n);
        self
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn write(&self, what: &str) -> Result<(), StoreError> {
        let n = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing.lock().contains(&n) {
            return Err(StoreError::Unavailable(format!("injected failure on write {n} ({what})")));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for FaultyStore {
    async fn create_workflow(&self, workflow: &Workflow, tasks: &[Task]) -> Result<(), StoreError> {
        self.write("create_workflow")?;
        self.inner.create_workflow(workflow, tasks).await
    }

    async fn get_workflow(&self, id: WorkflowId) -> Result<Option<Workflow>, StoreError> {
        self.inner.get_workflow(id).await
    }

    async fn update_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        self.write("update_workflow")?;
        self.inner.update_workflow(workflow).await
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        self.inner.get_task(id).await
    }

    async fn list_tasks(&self, workflow_id: WorkflowId) -> Result<Vec<Task>, StoreError> {
        self.inner.list_tasks(workflow_id).await
    }

    async fn update_task(&self, task: &Task) -> Result<(), StoreError> {
        self.write("update_task")?;
        self.inner.update_task(task).await
    }

    async fn record_coordination(&self, record: CoordinationRecord) -> Result<(), StoreError> {
        self.write("record_coordination")?;
        self.inner.record_coordination(record).await
    }

    async fn coordination_records(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<Vec<CoordinationRecord>, StoreError> {
        self.inner.coordination_records(workflow_id).await
    }

    async fn record_message(&self, message: &AgentMessage) -> Result<(), StoreError> {
        self.write("record_message")?;
        self.inner.record_message(message).await
    }

    async fn messages(&self, workflow_id: WorkflowId) -> Result<Vec<AgentMessage>, StoreError> {
        self.inner.messages(workflow_id).await
    }

    async fn record_explanation(&self, explanation: StoredExplanation) -> Result<(), StoreError> {
        self.write("record_explanation")?;
        self.inner.record_explanation(explanation).await
    }

    async fn get_explanation(
        &self,
        id: ExplanationId,
    ) -> Result<Option<StoredExplanation>, StoreError> {
        self.inner.get_explanation(id).await
    }

    async fn record_validation(&self, record: ValidationRecord) -> Result<(), StoreError> {
        self.write("record_validation")?;
        self.inner.record_validation(record).await
    }

    async fn validations(&self, task_id: TaskId) -> Result<Vec<ValidationRecord>, StoreError> {
        self.inner.validations(task_id).await
    }

    async fn append_audit(&self, entry: AuditEntry) -> Result<(), StoreError> {
        self.write("append_audit")?;
        self.inner.append_audit(entry).await
    }

    async fn audit_log(&self, workflow_id: WorkflowId) -> Result<Vec<AuditEntry>, StoreError> {
        self.inner.audit_log(workflow_id).await
    }
}
