//! Execution plan builder
//!
//! Every requirement gets the same five phases:
//!
//! | # | Phase | Worker class | Tasks |
//! |---|-------|--------------|-------|
//! | 1 | foundation | backend | data model and contracts |
//! | 2 | implementation | story hint or backend | one per chunk of user stories |
//! | 3 | verification | testing | unit, integration, end-to-end unless simple |
//! | 4 | validation-gate | security | code audit, dependency scan |
//! | 5 | integration | infrastructure | CI/CD pipeline, deployment wiring |
//!
//! Tasks form one chain: linear inside a phase, and the first task of a
//! phase depends on the last task of the previous one.

use forge_model::{
    Complexity, ExecutionPlan, JobPayload, Phase, PhaseKind, Priority, Requirement, Task,
    UserStory, WorkOrder, WorkerClass, Workflow, WorkflowId,
};

/// Phase numbers of the fixed plan
pub mod phases {
    /// Data model and contracts
    pub const FOUNDATION: u32 = 1;
    /// Story implementation
    pub const IMPLEMENTATION: u32 = 2;
    /// Test generation
    pub const VERIFICATION: u32 = 3;
    /// Audit and review
    pub const VALIDATION_GATE: u32 = 4;
    /// Pipelines and deployment
    pub const INTEGRATION: u32 = 5;
}

/// Title of the end-to-end test task
pub const E2E_TESTS: &str = "E2E tests";

/// Items every validation-gate review checks
pub const REVIEW_CHECKLIST: [&str; 10] = [
    "Code review - All PRs reviewed and approved",
    "Test coverage - Minimum 80% coverage met",
    "Performance - Lighthouse > 90",
    "Security - No vulnerabilities detected",
    "Accessibility - WCAG 2.1 AA compliant",
    "SEO - All meta tags and structured data present",
    "Documentation - API and code documented",
    "Breaking changes - None or properly documented",
    "Database migrations - All migrations tested",
    "Deployment plan - Ready for production",
];

/// Plan plus the tasks it references, in planning order
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedWorkflow {
    /// Execution plan
    pub plan: ExecutionPlan,
    /// Tasks in planning order
    pub tasks: Vec<Task>,
}

struct TaskTemplate {
    worker_class: WorkerClass,
    title: String,
    description: String,
}

impl TaskTemplate {
    fn new(worker_class: WorkerClass, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            worker_class,
            title: title.into(),
            description: description.into(),
        }
    }
}

struct PhaseTemplate {
    number: u32,
    name: &'static str,
    kind: PhaseKind,
    priority: Priority,
    tasks: Vec<TaskTemplate>,
}

/// Builds execution plans from requirements
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkflowPlanner;

impl WorkflowPlanner {
    /// Create a planner
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Stories per implementation task
    #[inline]
    #[must_use]
    pub fn chunk_size(complexity: Complexity) -> usize {
        match complexity {
            Complexity::Simple | Complexity::Moderate => 2,
            Complexity::Complex => 1,
        }
    }

    /// Build the five-phase plan for a requirement
    #[must_use]
    pub fn plan(&self, workflow_id: WorkflowId, requirement: &Requirement) -> PlannedWorkflow {
        let mut plan = ExecutionPlan::default();
        let mut tasks: Vec<Task> = Vec::new();

        for template in Self::templates(requirement) {
            let mut task_ids = Vec::with_capacity(template.tasks.len());
            for spec in template.tasks {
                let mut task = Task::new(workflow_id, spec.worker_class, spec.title, template.number)
                    .with_description(spec.description)
                    .with_priority(template.priority);
                if let Some(previous) = tasks.last() {
                    task = task.depends_on(previous.id);
                }
                task_ids.push(task.id);
                tasks.push(task);
            }

            plan.phases.push(Phase {
                number: template.number,
                name: template.name.to_string(),
                kind: template.kind,
                task_ids,
                requires: template.number.checked_sub(1).filter(|n| *n > 0).into_iter().collect(),
            });
        }

        tracing::debug!(
            workflow_id = %workflow_id,
            complexity = ?requirement.complexity(),
            phases = plan.phases.len(),
            tasks = tasks.len(),
            "execution plan built"
        );
        PlannedWorkflow { plan, tasks }
    }

    /// Job payload for a planned task
    ///
    /// Returns `None` if the task's phase is not in the workflow's plan.
    #[must_use]
    pub fn payload(&self, workflow: &Workflow, task: &Task) -> Option<JobPayload> {
        let phase = workflow.plan.phase(task.phase)?;
        let requirement = &workflow.requirement;

        let story_ids: Vec<String> = if phase.number == phases::IMPLEMENTATION {
            let position = phase.task_ids.iter().position(|id| *id == task.id)?;
            Self::story_chunks(requirement)
                .nth(position)
                .map(|chunk| chunk.iter().map(|s| s.id.clone()).collect())
                .unwrap_or_default()
        } else {
            requirement.user_stories.iter().map(|s| s.id.clone()).collect()
        };

        let order = WorkOrder {
            feature_id: requirement.id.clone(),
            requirement_title: requirement.title.clone(),
            instructions: if task.description.is_empty() {
                task.title.clone()
            } else {
                task.description.clone()
            },
            story_ids,
            acceptance_criteria: requirement.acceptance_criteria.clone(),
        };

        Some(match phase.kind {
            PhaseKind::Generation => JobPayload::Generate(order),
            PhaseKind::Verification => JobPayload::Verify {
                order,
                end_to_end: task.title == E2E_TESTS,
            },
            PhaseKind::ValidationGate => JobPayload::Review {
                order,
                checklist: REVIEW_CHECKLIST.iter().map(ToString::to_string).collect(),
            },
            PhaseKind::Integration => JobPayload::Integrate(order),
        })
    }

    fn story_chunks(requirement: &Requirement) -> std::slice::Chunks<'_, UserStory> {
        requirement
            .user_stories
            .chunks(Self::chunk_size(requirement.complexity()))
    }

    fn templates(requirement: &Requirement) -> Vec<PhaseTemplate> {
        let title = &requirement.title;
        let complexity = requirement.complexity();

        let implementation = Self::story_chunks(requirement)
            .map(|chunk| {
                let class = chunk
                    .first()
                    .and_then(|s| s.worker_class)
                    .unwrap_or(WorkerClass::Backend);
                let ids: Vec<&str> = chunk.iter().map(|s| s.id.as_str()).collect();
                let stories: Vec<&str> = chunk.iter().map(|s| s.description.as_str()).collect();
                TaskTemplate::new(class, format!("Implement {}", ids.join(", ")), stories.join("\n"))
            })
            .collect();

        let mut verification = vec![
            TaskTemplate::new(WorkerClass::Testing, "Unit tests", format!("Unit tests for {title}")),
            TaskTemplate::new(
                WorkerClass::Testing,
                "Integration tests",
                format!("Integration tests for {title}"),
            ),
        ];
        if complexity != Complexity::Simple {
            verification.push(TaskTemplate::new(
                WorkerClass::Testing,
                E2E_TESTS,
                format!("End-to-end flows for {title}"),
            ));
        }

        let checklist: Vec<String> = REVIEW_CHECKLIST.iter().map(|item| format!("- {item}")).collect();

        vec![
            PhaseTemplate {
                number: phases::FOUNDATION,
                name: "foundation",
                kind: PhaseKind::Generation,
                priority: Priority::Critical,
                tasks: vec![TaskTemplate::new(
                    WorkerClass::Backend,
                    "Database Schema",
                    format!("Data model and domain contracts for {title}"),
                )],
            },
            PhaseTemplate {
                number: phases::IMPLEMENTATION,
                name: "implementation",
                kind: PhaseKind::Generation,
                priority: Priority::High,
                tasks: implementation,
            },
            PhaseTemplate {
                number: phases::VERIFICATION,
                name: "verification",
                kind: PhaseKind::Verification,
                priority: Priority::High,
                tasks: verification,
            },
            PhaseTemplate {
                number: phases::VALIDATION_GATE,
                name: "validation-gate",
                kind: PhaseKind::ValidationGate,
                priority: Priority::High,
                tasks: vec![
                    TaskTemplate::new(
                        WorkerClass::Security,
                        "Code audit",
                        format!("Audit {title} against the review checklist:\n{}", checklist.join("\n")),
                    ),
                    TaskTemplate::new(
                        WorkerClass::Security,
                        "Dependency scanning",
                        format!("Scan dependencies introduced by {title}"),
                    ),
                ],
            },
            PhaseTemplate {
                number: phases::INTEGRATION,
                name: "integration",
                kind: PhaseKind::Integration,
                priority: Priority::Medium,
                tasks: vec![
                    TaskTemplate::new(
                        WorkerClass::Infrastructure,
                        "CI/CD pipelines",
                        format!("Build and test pipeline for {title}"),
                    ),
                    TaskTemplate::new(
                        WorkerClass::Infrastructure,
                        "Deployment wiring",
                        format!("Deployment configuration for {title}"),
                    ),
                ],
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn requirement(stories: usize, criteria: usize) -> Requirement {
        let mut req = Requirement::new("feat-1", "Checkout");
        for i in 1..=stories {
            req = req.with_story(UserStory::new(format!("s{i}"), format!("story {i}")));
        }
        for i in 1..=criteria {
            req = req.with_criterion(format!("criterion {i}"));
        }
        req
    }

    fn workflow(req: Requirement) -> (Workflow, Vec<Task>) {
        let mut wf = Workflow::new(req, "owner");
        let planned = WorkflowPlanner::new().plan(wf.id, &wf.requirement);
        wf.plan = planned.plan;
        (wf, planned.tasks)
    }

    #[test]
    fn simple_requirement_skips_end_to_end() {
        let (wf, tasks) = workflow(requirement(2, 3));
        let sizes: Vec<usize> = wf.plan.phases.iter().map(|p| p.task_ids.len()).collect();
        assert_eq!(sizes, vec![1, 1, 2, 2, 2]);
        assert!(tasks.iter().all(|t| t.title != E2E_TESTS));
    }

    #[test]
    fn moderate_requirement_chunks_stories_in_pairs() {
        let (wf, tasks) = workflow(requirement(4, 6));
        let names: Vec<&str> = wf.plan.phases.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["foundation", "implementation", "verification", "validation-gate", "integration"]
        );
        let implementation = wf.plan.phase(phases::IMPLEMENTATION).unwrap();
        assert_eq!(implementation.task_ids.len(), 2);
        assert_eq!(wf.plan.phase(phases::VERIFICATION).unwrap().task_ids.len(), 3);
        assert_eq!(tasks.len(), wf.plan.task_count());
        assert_eq!(tasks[1].title, "Implement s1, s2");
        assert!(wf.plan.validate().is_ok());
    }

    #[test]
    fn complex_requirement_gets_one_task_per_story() {
        let (wf, _) = workflow(requirement(6, 2));
        assert_eq!(wf.plan.phase(phases::IMPLEMENTATION).unwrap().task_ids.len(), 6);
    }

    #[test]
    fn tasks_form_a_single_chain() {
        let (wf, tasks) = workflow(requirement(4, 6));
        assert!(tasks[0].dependencies.is_empty());
        for pair in tasks.windows(2) {
            assert_eq!(pair[1].dependencies, vec![pair[0].id]);
        }
        for phase in &wf.plan.phases {
            let expected: Vec<u32> = if phase.number == 1 { vec![] } else { vec![phase.number - 1] };
            assert_eq!(phase.requires, expected);
        }
    }

    #[test]
    fn priorities_and_classes_follow_the_phase() {
        let req = Requirement::new("feat-2", "Profile")
            .with_story(UserStory::new("s1", "edit avatar").for_class(WorkerClass::Frontend))
            .with_criterion("avatar saved");
        let (_, tasks) = workflow(req);
        assert_eq!(tasks[0].priority, Priority::Critical);
        assert_eq!(tasks[0].worker_class, WorkerClass::Backend);
        assert_eq!(tasks[1].worker_class, WorkerClass::Frontend);
        assert_eq!(tasks[1].priority, Priority::High);
        assert_eq!(tasks.last().unwrap().priority, Priority::Medium);
        assert_eq!(tasks.last().unwrap().worker_class, WorkerClass::Infrastructure);
    }

    #[test]
    fn payload_matches_the_phase_kind() {
        let planner = WorkflowPlanner::new();
        let (wf, tasks) = workflow(requirement(4, 6));

        let Some(JobPayload::Generate(order)) = planner.payload(&wf, &tasks[2]) else {
            panic!("implementation task should generate");
        };
        assert_eq!(order.story_ids, vec!["s3", "s4"]);
        assert_eq!(order.acceptance_criteria.len(), 6);

        let e2e = tasks.iter().find(|t| t.title == E2E_TESTS).unwrap();
        assert!(matches!(
            planner.payload(&wf, e2e),
            Some(JobPayload::Verify { end_to_end: true, .. })
        ));

        let audit = tasks.iter().find(|t| t.title == "Code audit").unwrap();
        assert!(audit.description.contains("Deployment plan - Ready for production"));
        let Some(JobPayload::Review { checklist, .. }) = planner.payload(&wf, audit) else {
            panic!("audit task should review");
        };
        assert_eq!(checklist.len(), REVIEW_CHECKLIST.len());

        assert!(matches!(
            planner.payload(&wf, tasks.last().unwrap()),
            Some(JobPayload::Integrate(_))
        ));
    }

    #[test]
    fn payload_of_foreign_task_is_none() {
        let (wf, _) = workflow(requirement(1, 1));
        let stray = Task::new(wf.id, WorkerClass::Backend, "stray", 9);
        assert_eq!(WorkflowPlanner::new().payload(&wf, &stray), None);
    }
}
