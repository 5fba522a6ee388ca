//! Recovery path integration tests.
//!
//! Each failure kind routes through the recovery engine to a strategy
//! whose effects land on the task graph, the agent pool, and the store.
//! These tests drive `handle_failure` directly for the surgical cases and
//! run a full scheduler loop for the critique veto, which can only be
//! observed end to end.

use std::collections::HashMap;
use std::time::Duration;

use hive::core::{
    DependencyKind, ErrorContext, FailureKind, Severity, TaskGraph, TaskId, TaskStatus,
};
use hive::orchestration::{CoordinationEvent, SchedulerEvent, StopCause};
use hive::workflow::{Capability, WorkflowStep};

use crate::fixtures::{
    recovery_harness, recovery_harness_sized, run_harness, run_harness_vetoing, test_task,
};

/// A one-task graph with the task already running.
fn running_task(capability: Capability) -> (TaskGraph, TaskId) {
    let mut graph = TaskGraph::new();
    let task_id = graph.add_task(test_task("stuck", capability));
    graph.task_mut(&task_id).unwrap().start();
    (graph, task_id)
}

fn failure(task_id: TaskId, kind: FailureKind, severity: Severity) -> ErrorContext {
    ErrorContext::new(task_id, kind, severity, "agent reported trouble")
}

/// Test: Timeout retry
/// Given a running task and its first timeout
/// When the failure is handled
/// Then the task re-enters the pool at the same stage and the failure is
/// persisted
#[tokio::test(start_paused = true)]
async fn test_timeout_retry_repends_task_at_current_stage() {
    let mut harness = recovery_harness();
    let (mut graph, task_id) = running_task(Capability::Analyst);
    let mut paused = HashMap::new();

    let outcome = harness
        .engine
        .handle_failure(
            &failure(task_id, FailureKind::Timeout, Severity::Medium),
            &mut graph,
            &mut paused,
        )
        .await;

    assert!(outcome.success);
    assert!(!outcome.escalated);
    assert_eq!(outcome.strategy.label(), "retry");

    let task = graph.task(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.current_step(), WorkflowStep::DefineRequirements);
    assert_eq!(harness.engine.ledger().retries(&task_id), 1);
    assert_eq!(harness.store.failure_count(&task_id).await.unwrap(), 1);
    assert!(paused.is_empty());
}

/// Test: Timeout retry budget
/// Given a task that timed out twice already
/// When a third timeout is handled
/// Then an impasse solver takes over in a fresh session and the task
/// parks at impasse
#[tokio::test(start_paused = true)]
async fn test_repeated_timeouts_bring_in_impasse_solver() {
    let mut harness = recovery_harness();
    let (mut graph, task_id) = running_task(Capability::Analyst);
    let mut paused = HashMap::new();

    for _ in 0..2 {
        let outcome = harness
            .engine
            .handle_failure(
                &failure(task_id, FailureKind::Timeout, Severity::Medium),
                &mut graph,
                &mut paused,
            )
            .await;
        assert_eq!(outcome.strategy.label(), "retry");
    }

    let outcome = harness
        .engine
        .handle_failure(
            &failure(task_id, FailureKind::Timeout, Severity::Medium),
            &mut graph,
            &mut paused,
        )
        .await;

    assert!(outcome.success);
    assert_eq!(outcome.strategy.label(), "spawn_helper");
    assert!(
        matches!(graph.task(&task_id).unwrap().status, TaskStatus::Impasse { .. }),
        "task should park at impasse while the helper works"
    );

    let started = harness.sessions.started();
    assert_eq!(started.len(), 1, "exactly one helper session");
    assert!(started[0].starts_with("hive_stuck_"));

    let mut spawned = Vec::new();
    while let Ok(event) = harness.event_rx.try_recv() {
        if let CoordinationEvent::Spawned { capability, .. } = event {
            spawned.push(capability);
        }
    }
    assert_eq!(spawned, vec![Capability::ImpasseSolver]);
}

/// Test: Critical system failure
/// Given a critical infrastructure failure
/// When it is handled
/// Then the task escalates straight to a terminal error
#[tokio::test]
async fn test_critical_system_failure_escalates_immediately() {
    let mut harness = recovery_harness();
    let (mut graph, task_id) = running_task(Capability::Coder);
    let mut paused = HashMap::new();

    let outcome = harness
        .engine
        .handle_failure(
            &failure(task_id, FailureKind::SystemFailure, Severity::Critical),
            &mut graph,
            &mut paused,
        )
        .await;

    assert!(!outcome.success);
    assert!(outcome.escalated);
    assert!(matches!(
        graph.task(&task_id).unwrap().status,
        TaskStatus::Error { .. }
    ));

    let records = harness.store.failures(&task_id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].escalated);
}

/// Test: System failure retry then diagnosis
/// Given a session death that already got its one retry
/// When the next system failure is handled
/// Then a root-cause analyst spawns with the diagnosis in its payload
#[tokio::test(start_paused = true)]
async fn test_session_death_retries_then_root_cause_analyst() {
    let mut harness = recovery_harness();
    let (mut graph, task_id) = running_task(Capability::Coder);
    let mut paused = HashMap::new();

    let first = harness
        .engine
        .handle_failure(
            &failure(task_id, FailureKind::SystemFailure, Severity::High),
            &mut graph,
            &mut paused,
        )
        .await;
    assert_eq!(first.strategy.label(), "retry");

    let second = harness
        .engine
        .handle_failure(
            &failure(task_id, FailureKind::SystemFailure, Severity::High),
            &mut graph,
            &mut paused,
        )
        .await;
    assert_eq!(second.strategy.label(), "spawn_helper");
    assert!(second.success);

    let mut spawned = Vec::new();
    while let Ok(event) = harness.event_rx.try_recv() {
        if let CoordinationEvent::Spawned { capability, .. } = event {
            spawned.push(capability);
        }
    }
    assert_eq!(spawned, vec![Capability::RootCauseAnalyst]);

    let launches = harness.sessions.launches();
    assert_eq!(launches.len(), 1);
    assert!(
        launches[0].payload.contains("PRIOR ANALYSIS"),
        "helper payload missing the diagnosis:\n{}",
        launches[0].payload
    );
    assert!(launches[0]
        .payload
        .contains("workspace permissions were wrong"));
}

/// Test: Step error skip
/// Given a stage that failed past its retry budget
/// When the next step error is handled
/// Then the stage is force-passed with a skip note and the task moves on
#[tokio::test(start_paused = true)]
async fn test_step_error_skips_after_retry_budget() {
    let mut harness = recovery_harness();
    let (mut graph, task_id) = running_task(Capability::Analyst);
    let mut paused = HashMap::new();

    for _ in 0..2 {
        harness
            .engine
            .handle_failure(
                &failure(task_id, FailureKind::WorkflowStepError, Severity::Medium),
                &mut graph,
                &mut paused,
            )
            .await;
    }
    let outcome = harness
        .engine
        .handle_failure(
            &failure(task_id, FailureKind::WorkflowStepError, Severity::Medium),
            &mut graph,
            &mut paused,
        )
        .await;

    assert!(outcome.success);
    assert_eq!(outcome.strategy.label(), "skip_step");

    let task = graph.task(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.current_step(), WorkflowStep::FormalizeContracts);
    let skipped = &task.workflow.completed_steps()[0];
    assert_eq!(skipped.step, WorkflowStep::DefineRequirements);
    assert!(skipped.skipped);
    assert_eq!(skipped.note.as_deref(), Some("agent reported trouble"));
}

/// Test: Skip at the terminal stage
/// Given a tester task wedged at its only stage
/// When the skip strategy fires
/// Then the task completes instead of retrying forever
#[tokio::test(start_paused = true)]
async fn test_skip_at_terminal_stage_completes_task() {
    let mut harness = recovery_harness();
    let (mut graph, task_id) = running_task(Capability::Tester);
    let mut paused = HashMap::new();

    for _ in 0..3 {
        harness
            .engine
            .handle_failure(
                &failure(task_id, FailureKind::WorkflowStepError, Severity::Medium),
                &mut graph,
                &mut paused,
            )
            .await;
    }

    let task = graph.task(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.workflow.completed_steps().len(), 1);
    assert!(task.workflow.completed_steps()[0].skipped);
}

/// Test: Downstream pause scope
/// Given a chain a -> b -> c plus an unrelated task d
/// When a high-severity critique failure on a is handled
/// Then b and c pause with a window, a sits out the same window, and d
/// is untouched
#[tokio::test]
async fn test_pause_downstream_freezes_dependent_subtree() {
    let mut harness = recovery_harness();
    let mut graph = TaskGraph::new();
    let a = graph.add_task(test_task("a", Capability::Coder));
    let b = graph.add_task(test_task("b", Capability::Coder));
    let c = graph.add_task(test_task("c", Capability::Tester));
    let d = graph.add_task(test_task("d", Capability::Coder));
    graph.add_dependency(&a, &b, DependencyKind::Ordering).unwrap();
    graph.add_dependency(&b, &c, DependencyKind::Ordering).unwrap();
    let mut paused = HashMap::new();

    let outcome = harness
        .engine
        .handle_failure(
            &failure(a, FailureKind::CritiqueFailure, Severity::High),
            &mut graph,
            &mut paused,
        )
        .await;

    assert!(outcome.success);
    assert_eq!(outcome.strategy.label(), "pause_downstream");

    assert_eq!(paused.len(), 3, "a, b, and c all get a pause window");
    assert!(paused.contains_key(&a));
    assert!(paused.contains_key(&b));
    assert!(paused.contains_key(&c));
    assert!(!paused.contains_key(&d));

    for id in [b, c] {
        match &graph.task(&id).unwrap().status {
            TaskStatus::Paused { reason } => {
                assert!(reason.contains("a"), "pause reason names the culprit")
            }
            other => panic!("expected Paused, got {other:?}"),
        }
    }
    // The failing task itself is withheld but not re-labelled.
    assert_eq!(graph.task(&a).unwrap().status, TaskStatus::Pending);
    assert_eq!(graph.task(&d).unwrap().status, TaskStatus::Pending);
}

/// Test: Critique veto in a live run
/// Given a -> b where every review of a's work demands a pause
/// When the scheduler runs
/// Then a's second stage is never dispatched, b pauses, and nothing
/// completes before the run is cancelled
#[tokio::test(start_paused = true)]
async fn test_critique_veto_pauses_pipeline_in_run() {
    let mut graph = TaskGraph::new();
    let alpha = graph.add_task(test_task("alpha", Capability::Coder));
    let beta = graph.add_task(test_task("beta", Capability::Tester));
    graph
        .add_dependency(&alpha, &beta, DependencyKind::Ordering)
        .unwrap();
    let mut harness = run_harness_vetoing(graph);

    let cancel = harness.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(400)).await;
        cancel.cancel();
    });

    let report = harness.scheduler.run().await.unwrap();
    assert_eq!(report.stop_cause, StopCause::Cancelled);
    assert_eq!(report.completed_count(), 0);

    let events = harness.drain_events();
    assert_eq!(events.len(), 2, "unexpected trail: {events:?}");
    assert!(
        matches!(events[0], SchedulerEvent::TaskStarted { task_id, .. } if task_id == alpha)
    );
    assert!(matches!(
        events[1],
        SchedulerEvent::StepCompleted {
            step: WorkflowStep::ImplementCode,
            ..
        }
    ));

    // Only alpha's first stage ever got a session.
    let started = harness.sessions.started();
    assert_eq!(started.len(), 1);
    assert!(started[0].starts_with("hive_alpha_"));

    assert!(matches!(
        harness.scheduler.graph().task(&beta).unwrap().status,
        TaskStatus::Paused { .. }
    ));
    assert_eq!(
        harness.scheduler.graph().task(&alpha).unwrap().status,
        TaskStatus::Pending,
        "the vetoed task is withheld, not failed"
    );
}

/// Test: Idle stop
/// Given a graph whose only task is wedged at impasse
/// When the scheduler runs
/// Then it stops as idle without starting any session
#[tokio::test]
async fn test_wedged_graph_goes_idle() {
    let mut graph = TaskGraph::new();
    let task_id = graph.add_task(test_task("wedged", Capability::Coder));
    graph
        .task_mut(&task_id)
        .unwrap()
        .mark_impasse("cannot resolve the contract");
    let mut harness = run_harness(graph);

    let report = harness.scheduler.run().await.unwrap();

    assert_eq!(report.stop_cause, StopCause::Idle);
    assert!(harness.sessions.started().is_empty());
    assert!(matches!(
        report.outcomes[0].status,
        TaskStatus::Impasse { .. }
    ));
}

/// Test: Helper spawn failure
/// Given an agent pool with no capacity for a helper
/// When an impasse is handled
/// Then the failure degrades to escalation and the task errors out
#[tokio::test]
async fn test_helper_spawn_failure_escalates() {
    let mut harness = recovery_harness_sized(0);
    let (mut graph, task_id) = running_task(Capability::Coder);
    let mut paused = HashMap::new();

    let outcome = harness
        .engine
        .handle_failure(
            &failure(task_id, FailureKind::Impasse, Severity::Medium),
            &mut graph,
            &mut paused,
        )
        .await;

    assert!(!outcome.success);
    assert!(outcome.escalated);
    assert!(matches!(
        graph.task(&task_id).unwrap().status,
        TaskStatus::Error { .. }
    ));
    assert!(harness.sessions.started().is_empty());

    let records = harness.store.failures(&task_id).await.unwrap();
    assert!(records.iter().any(|r| r.escalated));
}
