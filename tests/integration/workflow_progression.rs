//! Workflow progression integration tests.
//!
//! A task's pipeline advances one stage per completed dispatch and never
//! moves backwards. These tests run real scheduler loops against scripted
//! sessions and check the observable trail: events, artifacts, payloads,
//! and the workspace shared across stages.

use hive::core::{DependencyKind, TaskGraph, TaskStatus};
use hive::orchestration::{SchedulerEvent, StopCause};
use hive::workflow::{Capability, TaskWorkflowState, WorkflowStep};

use crate::fixtures::{run_harness, test_task};

/// Test: Capability entry points
/// Given one task per capability
/// When each task's pipeline is inspected
/// Then entry stage and stage count match the capability's contract
#[test]
fn test_capability_entry_points_shape_pipeline() {
    let cases = [
        (Capability::Analyst, WorkflowStep::DefineRequirements, 6),
        (Capability::Architect, WorkflowStep::DesignArchitecture, 3),
        (Capability::Coder, WorkflowStep::ImplementCode, 2),
        (Capability::Tester, WorkflowStep::ExecuteTests, 1),
        (Capability::ImpasseSolver, WorkflowStep::DefineRequirements, 6),
        (Capability::RootCauseAnalyst, WorkflowStep::DefineRequirements, 6),
        (Capability::QualityAnalyst, WorkflowStep::DefineRequirements, 6),
    ];
    for (capability, entry, stages) in cases {
        let state = TaskWorkflowState::new(capability);
        assert_eq!(state.current(), entry, "{capability:?} entry");
        assert_eq!(
            state.remaining().len() + 1,
            stages,
            "{capability:?} stage count"
        );
    }
}

/// Test: Coder pipeline is forward-only
/// Given a single coder task
/// When the scheduler runs it to completion
/// Then the event trail is exactly start, implement, start, complete,
/// settled, and the recorded history shows both stages worked in order
#[tokio::test(start_paused = true)]
async fn test_single_coder_task_advances_forward_only() {
    let mut graph = TaskGraph::new();
    let task = test_task("solo", Capability::Coder);
    let task_id = task.id;
    graph.add_task(task);
    let mut harness = run_harness(graph);

    let report = harness.scheduler.run().await.unwrap();
    assert_eq!(report.stop_cause, StopCause::Completed);

    let events = harness.drain_events();
    assert_eq!(events.len(), 5, "unexpected trail: {events:?}");
    assert!(matches!(events[0], SchedulerEvent::TaskStarted { .. }));
    assert!(matches!(
        events[1],
        SchedulerEvent::StepCompleted {
            step: WorkflowStep::ImplementCode,
            ..
        }
    ));
    assert!(matches!(events[2], SchedulerEvent::TaskStarted { .. }));
    assert!(matches!(events[3], SchedulerEvent::TaskCompleted { .. }));
    assert!(matches!(events[4], SchedulerEvent::AllTasksSettled));

    let task = harness.scheduler.graph().task(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    let history: Vec<WorkflowStep> = task
        .workflow
        .completed_steps()
        .iter()
        .map(|c| c.step)
        .collect();
    assert_eq!(
        history,
        vec![WorkflowStep::ImplementCode, WorkflowStep::ExecuteTests]
    );
    assert!(task.workflow.completed_steps().iter().all(|c| !c.skipped));
}

/// Test: Analyst walks all six stages
/// Given a single analyst task
/// When the scheduler runs it to completion
/// Then five StepCompleted events fire in pipeline order and every stage
/// got its own agent session
#[tokio::test(start_paused = true)]
async fn test_analyst_task_walks_all_six_stages() {
    let mut graph = TaskGraph::new();
    let task = test_task("survey", Capability::Analyst);
    let task_id = task.id;
    graph.add_task(task);
    let mut harness = run_harness(graph);

    let report = harness.scheduler.run().await.unwrap();
    assert_eq!(report.stop_cause, StopCause::Completed);

    let events = harness.drain_events();
    let steps: Vec<WorkflowStep> = events
        .iter()
        .filter_map(|e| match e {
            SchedulerEvent::StepCompleted { step, .. } => Some(*step),
            _ => None,
        })
        .collect();
    // The terminal stage reports TaskCompleted instead of StepCompleted.
    assert_eq!(
        steps,
        vec![
            WorkflowStep::DefineRequirements,
            WorkflowStep::FormalizeContracts,
            WorkflowStep::PrototypeLogic,
            WorkflowStep::DesignArchitecture,
            WorkflowStep::ImplementCode,
        ]
    );

    let starts = events
        .iter()
        .filter(|e| matches!(e, SchedulerEvent::TaskStarted { .. }))
        .count();
    assert_eq!(starts, 6, "one dispatch per stage");
    assert_eq!(harness.sessions.started().len(), 6);

    let task = harness.scheduler.graph().task(&task_id).unwrap();
    assert_eq!(task.workflow.completed_steps().len(), 6);
}

/// Test: Artifacts recorded per stage
/// Given a single coder task run to completion
/// When the store is queried afterwards
/// Then each stage left its summary as the latest artifact
#[tokio::test(start_paused = true)]
async fn test_artifacts_recorded_per_stage() {
    let mut graph = TaskGraph::new();
    let task = test_task("solo", Capability::Coder);
    let task_id = task.id;
    graph.add_task(task);
    let mut harness = run_harness(graph);

    harness.scheduler.run().await.unwrap();

    for step in [WorkflowStep::ImplementCode, WorkflowStep::ExecuteTests] {
        let artifact = harness
            .store
            .latest_artifact(&task_id, step)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("no artifact for {step}"));
        assert_eq!(artifact.content, "step finished");
        assert_eq!(artifact.task_id, task_id);
    }
}

/// Test: Upstream artifacts prime dependents
/// Given alpha -> beta with alpha producing artifacts
/// When beta is dispatched after alpha completes
/// Then beta's instruction payload quotes alpha's artifact and alpha's
/// own payload carried no upstream section
#[tokio::test(start_paused = true)]
async fn test_upstream_artifacts_flow_into_dependent_payloads() {
    let mut graph = TaskGraph::new();
    let alpha = graph.add_task(test_task("alpha", Capability::Coder));
    let beta = graph.add_task(test_task("beta", Capability::Coder));
    graph
        .add_dependency(&alpha, &beta, DependencyKind::Ordering)
        .unwrap();
    let mut harness = run_harness(graph);

    harness.scheduler.run().await.unwrap();

    let launches = harness.sessions.launches();
    let alpha_first = launches
        .iter()
        .find(|l| l.session.starts_with("hive_alpha_"))
        .expect("alpha never launched");
    let beta_first = launches
        .iter()
        .find(|l| l.session.starts_with("hive_beta_"))
        .expect("beta never launched");

    assert!(
        !alpha_first.payload.contains("UPSTREAM ARTIFACTS"),
        "alpha has no prerequisites"
    );
    assert!(
        beta_first.payload.contains("UPSTREAM ARTIFACTS"),
        "beta payload missing upstream section:\n{}",
        beta_first.payload
    );
    assert!(
        beta_first.payload.contains("--- alpha"),
        "beta payload does not quote alpha's artifact"
    );
    assert!(
        beta_first.payload.contains("step finished"),
        "beta payload missing alpha's artifact content"
    );
}

/// Test: Workspace survives across stages
/// Given a coder task running two stages
/// When both stage sessions launch
/// Then they share one working directory
#[tokio::test(start_paused = true)]
async fn test_workspace_survives_across_stages() {
    let mut graph = TaskGraph::new();
    graph.add_task(test_task("solo", Capability::Coder));
    let mut harness = run_harness(graph);

    harness.scheduler.run().await.unwrap();

    let launches = harness.sessions.launches();
    assert_eq!(launches.len(), 2);
    assert_eq!(
        launches[0].cwd, launches[1].cwd,
        "second stage must reuse the first stage's workspace"
    );
}
