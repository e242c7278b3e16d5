//! End-to-end workflow scenarios

use forge_core::{phases, ForgeConfig, ForgeError, Orchestrator, ProducerError, RequirementError, WorkflowEngine};
use forge_governance::PRODUCER_TIMEOUT;
use forge_model::{
    FailureClass, MemoryStore, PhaseKind, Requirement, StateStore, TaskStatus, WorkflowStatus,
};
use forge_queue::{QueuePolicy, Submission};
use forge_test_utils::{sample_requirement, sample_requirement_for, FaultyStore, Outcome, ScriptedProducer};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

fn config() -> ForgeConfig {
    ForgeConfig::default()
        .with_policy_for_all(&QueuePolicy::default().with_concurrency(2).with_backoff(5, 2.0, 20))
        .with_producer_timeout(Duration::from_millis(100))
}

fn orchestrator(store: Arc<dyn StateStore>) -> anyhow::Result<(Orchestrator, Arc<ScriptedProducer>)> {
    orchestrator_with(config(), store, ScriptedProducer::new())
}

fn orchestrator_with(
    config: ForgeConfig,
    store: Arc<dyn StateStore>,
    producer: ScriptedProducer,
) -> anyhow::Result<(Orchestrator, Arc<ScriptedProducer>)> {
    let producer = Arc::new(producer);
    let orchestrator = Orchestrator::new(config, store, producer.clone())?;
    producer.attach(Arc::clone(orchestrator.failure_modes()));
    Ok((orchestrator, producer))
}

#[tokio::test]
async fn four_stories_plan_five_phases_and_unlock_in_order() -> anyhow::Result<()> {
    let (orchestrator, _) = orchestrator(Arc::new(MemoryStore::new()))?;
    let workflow = orchestrator.submit(sample_requirement(4, 6), "alice", None).await?;

    let kinds: Vec<PhaseKind> = workflow.plan.phases.iter().map(|p| p.kind).collect();
    assert_eq!(
        kinds,
        vec![
            PhaseKind::Generation,
            PhaseKind::Generation,
            PhaseKind::Verification,
            PhaseKind::ValidationGate,
            PhaseKind::Integration,
        ]
    );
    let implementation = workflow.plan.phase(phases::IMPLEMENTATION).map(|p| p.task_ids.len());
    assert!(implementation >= Some(2));

    let tasks = orchestrator.engine().get_tasks(workflow.id).await?;
    assert_eq!(tasks[0].status, TaskStatus::Assigned);
    assert!(tasks[1..].iter().all(|t| t.status == TaskStatus::Pending));

    let first = tasks[0].id;
    let result = json!({ "digest": "abc" });
    orchestrator.engine().update_task_status(first, TaskStatus::InProgress).await?;
    orchestrator.engine().complete_task(first, result.clone()).await?;
    let unblocked = orchestrator
        .coordinator()
        .report_task_completion(workflow.id, first, result)
        .await?;

    let dependents: Vec<_> = tasks.iter().filter(|t| t.dependencies.contains(&first)).map(|t| t.id).collect();
    assert_eq!(unblocked, dependents);
    Ok(())
}

#[tokio::test]
async fn failed_create_leaves_nothing_behind() -> anyhow::Result<()> {
    let store = Arc::new(FaultyStore::new().fail_write(1));
    let engine = WorkflowEngine::new(store.clone());

    let err = engine.start_workflow(sample_requirement(2, 2), "alice").await.unwrap_err();
    assert!(matches!(err, ForgeError::Store(_)));
    assert_eq!(store.inner().workflow_count(), 0);

    let (orchestrator, producer) = orchestrator(Arc::new(FaultyStore::new().fail_write(1)))?;
    let err = orchestrator.submit(sample_requirement(2, 2), "alice", None).await.unwrap_err();
    assert!(matches!(err, ForgeError::Store(_)));
    assert!(orchestrator.failure_modes().get("checkout").is_none());
    assert_eq!(producer.explain_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn workflow_runs_to_completion() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let (orchestrator, producer) = orchestrator(store.clone())?;
    orchestrator.start()?;

    let workflow = orchestrator.submit(sample_requirement(3, 4), "alice", None).await?;
    let done = orchestrator.wait_for_workflow(workflow.id, WAIT).await?;
    assert_eq!(done.status, WorkflowStatus::Completed);
    assert!(done.completed_at.is_some());

    let tasks = orchestrator.engine().get_tasks(workflow.id).await?;
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Completed));
    assert_eq!(producer.total_produce_calls(), tasks.len());
    for task in &tasks {
        let validations = store.validations(task.id).await?;
        assert_eq!(validations.len(), 1);
        assert!(validations[0].accepted);
        assert_eq!(task.result.as_ref().map(|r| r["digest"].clone()), Some(json!(validations[0].digest)));
    }

    let last = tasks.last().map(|t| t.id).unwrap();
    let shared = orchestrator.coordinator().get_shared_artifacts(workflow.id, last, None).await?;
    assert_eq!(shared.len(), 1);
    assert_eq!(shared[0].key, "digest");
    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn timeout_is_retried_then_accepted() -> anyhow::Result<()> {
    let (orchestrator, producer) = orchestrator(Arc::new(MemoryStore::new()))?;
    producer.then_for("Database Schema", Outcome::Stall(Duration::from_millis(500)));
    orchestrator.start()?;

    let workflow = orchestrator.submit(sample_requirement(1, 1), "alice", None).await?;
    let done = orchestrator.wait_for_workflow(workflow.id, WAIT).await?;
    assert_eq!(done.status, WorkflowStatus::Completed);

    let schema = orchestrator.engine().get_tasks(workflow.id).await?.remove(0);
    assert_eq!(schema.retry_count, 1);
    assert_eq!(producer.produce_calls(schema.id), 2);
    assert!(schema.failure.is_none());

    let audit = orchestrator.engine().store().audit_log(workflow.id).await?;
    let errors: Vec<_> = audit.iter().filter(|e| e.kind == "producer_error").collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].detail["classification"], json!(FailureClass::Transient));
    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn resent_explanation_survives_a_transient_produce_error() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let (orchestrator, producer) =
        orchestrator_with(config(), store.clone(), ScriptedProducer::new().with_stable_explanations())?;
    producer.then_for("Database Schema", Outcome::Error(ProducerError::Transient("busy".into())));
    orchestrator.start()?;

    let workflow = orchestrator.submit(sample_requirement(1, 1), "alice", None).await?;
    let done = orchestrator.wait_for_workflow(workflow.id, WAIT).await?;
    assert_eq!(done.status, WorkflowStatus::Completed);

    let tasks = orchestrator.engine().get_tasks(workflow.id).await?;
    let schema = &tasks[0];
    assert_eq!(schema.retry_count, 1);
    assert_eq!(producer.produce_calls(schema.id), 2);
    assert_eq!(producer.explain_calls(), tasks.len() + 1);
    let validations = store.validations(schema.id).await?;
    assert_eq!(validations.len(), 1);
    assert!(validations[0].accepted);
    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn transient_failures_exhaust_attempts() -> anyhow::Result<()> {
    let single = QueuePolicy::default().with_concurrency(1).with_backoff(5, 2.0, 20);
    let (orchestrator, producer) = orchestrator_with(
        config().with_policy_for_all(&single),
        Arc::new(MemoryStore::new()),
        ScriptedProducer::new(),
    )?;
    for _ in 0..4 {
        producer.then_for_feature("checkout", Outcome::Error(ProducerError::Transient("rate limited".into())));
    }

    let workflow = orchestrator.submit(sample_requirement(2, 2), "alice", None).await?;
    let mut others = Vec::new();
    for n in 0..3 {
        let requirement = sample_requirement_for(&format!("billing-{n}"), 1, 1);
        others.push(orchestrator.submit(requirement, "bob", None).await?.id);
    }
    let first = orchestrator.engine().get_tasks(workflow.id).await?.remove(0);
    let class = first.worker_class;
    assert_eq!(first.max_retries, 3);
    assert!(orchestrator.queue().queue_stats(class).waiting > orchestrator.queue().policy(class).concurrency);
    orchestrator.start()?;

    let done = orchestrator.wait_for_workflow(workflow.id, WAIT).await?;
    assert_eq!(done.status, WorkflowStatus::Failed);
    assert!(done.failure_reason.as_deref().is_some_and(|r| r.contains("Database Schema")));

    let tasks = orchestrator.engine().get_tasks(workflow.id).await?;
    let failure = tasks[0].failure.clone().unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Failed);
    assert_eq!(failure.classification, FailureClass::Transient);
    assert_eq!(failure.attempts, 3);
    assert!(failure.reason.contains("gave up after 3 attempts"));
    for task in &tasks[1..] {
        let expected = if task.dependencies.contains(&first.id) {
            TaskStatus::Blocked
        } else {
            TaskStatus::Pending
        };
        assert_eq!(task.status, expected, "{}", task.title);
    }

    for id in others {
        let other = orchestrator.wait_for_workflow(id, WAIT).await?;
        assert_eq!(other.status, WorkflowStatus::Completed);
    }
    assert_eq!(producer.produce_calls(first.id), 3);
    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn fatal_producer_error_fails_without_retry() -> anyhow::Result<()> {
    let (orchestrator, producer) = orchestrator(Arc::new(MemoryStore::new()))?;
    producer.then_for("Database Schema", Outcome::Error(ProducerError::Fatal("model refused".into())));
    orchestrator.start()?;

    let workflow = orchestrator.submit(sample_requirement(1, 1), "alice", None).await?;
    let done = orchestrator.wait_for_workflow(workflow.id, WAIT).await?;
    assert_eq!(done.status, WorkflowStatus::Failed);

    let schema = orchestrator.engine().get_tasks(workflow.id).await?.remove(0);
    assert_eq!(producer.produce_calls(schema.id), 1);
    assert_eq!(schema.failure.map(|f| f.classification), Some(FailureClass::Fatal));
    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn invalid_requirement_lists_every_field() -> anyhow::Result<()> {
    let (orchestrator, _) = orchestrator(Arc::new(MemoryStore::new()))?;
    let err = orchestrator.submit(Requirement::new("", "  "), "alice", None).await.unwrap_err();

    let ForgeError::Requirement(RequirementError::Invalid { missing }) = err else {
        panic!("expected a requirement error, got {err}");
    };
    assert_eq!(missing, vec!["id", "title", "user_stories", "acceptance_criteria"]);
    Ok(())
}

#[tokio::test]
async fn queue_submission_is_idempotent() -> anyhow::Result<()> {
    let (orchestrator, _) = orchestrator(Arc::new(MemoryStore::new()))?;
    let workflow = orchestrator.submit(sample_requirement(1, 1), "alice", None).await?;
    let task = orchestrator.engine().get_tasks(workflow.id).await?.remove(0);
    let payload = orchestrator.engine().planner().payload(&workflow, &task).unwrap();

    assert_eq!(orchestrator.queue().queue_task(&task, payload)?, Submission::Duplicate);
    assert_eq!(orchestrator.queue().queue_stats(task.worker_class).waiting, 1);
    Ok(())
}

#[tokio::test]
async fn timeout_mode_is_declared_by_default() -> anyhow::Result<()> {
    let (orchestrator, _) = orchestrator(Arc::new(MemoryStore::new()))?;
    orchestrator.submit(sample_requirement(1, 1), "alice", None).await?;
    let modes = orchestrator.failure_modes().declared_modes("checkout");
    assert!(modes.iter().any(|m| m == PRODUCER_TIMEOUT));
    Ok(())
}
