//! Plan-to-schedule integration tests.
//!
//! From a plan document to a finished run: compilation failures surface
//! before anything is scheduled, the seeded graph mirrors the plan's
//! dependencies, and a full run dispatches tasks in dependency order
//! while the budget gate can stop the loop before it spends anything.

use hive::core::{Priority, TaskStatus};
use hive::orchestration::{ParsedPlan, SchedulerEvent, StopCause};
use hive::Error;

use crate::fixtures::{chain_plan, cyclic_plan, run_harness, run_harness_with, task_ids_by_name};

/// Index of the first event matching `pred`, or a panic naming the miss.
fn index_where(
    events: &[SchedulerEvent],
    what: &str,
    pred: impl Fn(&SchedulerEvent) -> bool,
) -> usize {
    events
        .iter()
        .position(pred)
        .unwrap_or_else(|| panic!("no {} event in {:?}", what, events))
}

/// Test: Cyclic plan rejection
/// Given a plan whose features depend on each other in a cycle
/// When the plan is compiled
/// Then compilation fails naming the cycle and nothing is scheduled
#[test]
fn test_cyclic_plan_rejected_at_compile() {
    let err = ParsedPlan::compile(&cyclic_plan()).unwrap_err();
    match err {
        Error::CircularDependency { cycle } => {
            assert!(cycle.contains("->"), "cycle path missing arrows: {cycle}");
            assert!(
                cycle.contains("alpha") || cycle.contains("beta") || cycle.contains("gamma"),
                "cycle path names no feature: {cycle}"
            );
        }
        other => panic!("expected CircularDependency, got {other:?}"),
    }
}

/// Test: Unknown dependency rejection
/// Given a feature that depends on an undeclared feature
/// When the plan is compiled
/// Then compilation fails naming the unresolved dependency
#[test]
fn test_unknown_dependency_rejected() {
    let document = r#"# Plan: Broken

## Overview

One feature pointing at a ghost.

## Features

### alpha
capability: coder
description: Real work.
depends: ghost
"#;
    let err = ParsedPlan::compile(document).unwrap_err();
    match err {
        Error::MalformedPlan(message) => {
            assert!(message.contains("ghost"), "unexpected message: {message}");
            assert!(message.contains("alpha"), "unexpected message: {message}");
        }
        other => panic!("expected MalformedPlan, got {other:?}"),
    }
}

/// Test: Plan compilation carries metadata
/// Given the three-feature chain plan
/// When it is compiled
/// Then title, priorities, criteria, decisions, and the dependency order
/// all survive
#[test]
fn test_chain_plan_compiles_with_metadata() {
    let plan = ParsedPlan::compile(&chain_plan()).unwrap();

    assert_eq!(plan.title, "Demo Pipeline");
    assert_eq!(plan.features.len(), 3);
    assert_eq!(plan.decisions.len(), 1);

    let alpha = &plan.features[0];
    assert_eq!(alpha.name, "alpha");
    assert_eq!(alpha.priority, Priority::High);
    assert_eq!(alpha.criteria, vec!["ingest accepts well-formed input"]);
    assert!(alpha.depends_on.is_empty());

    let order = plan.dependency_order().unwrap();
    assert_eq!(order, vec!["alpha", "beta", "gamma"]);
}

/// Test: Seeded graph mirrors the plan
/// Given the compiled chain plan
/// When the task graph is seeded
/// Then edges follow the declared dependencies and only the root is ready
#[test]
fn test_seeded_graph_mirrors_plan_dependencies() {
    let plan = ParsedPlan::compile(&chain_plan()).unwrap();
    let graph = plan.seed_graph("demo").unwrap();
    let ids = task_ids_by_name(&graph);

    assert_eq!(graph.task_count(), 3);
    assert_eq!(graph.prerequisites(&ids["beta"]), vec![ids["alpha"]]);
    assert_eq!(graph.prerequisites(&ids["gamma"]), vec![ids["beta"]]);

    let ready: Vec<&str> = graph.ready_tasks().iter().map(|t| t.name.as_str()).collect();
    assert_eq!(ready, vec!["alpha"], "only the root task should be ready");

    let task = graph.task(&ids["alpha"]).unwrap();
    assert_eq!(task.project, "demo");
    assert_eq!(task.priority, Priority::High);
}

/// Test: Full chain run in dependency order
/// Given the seeded chain graph and agents that complete every step
/// When the scheduler runs to completion
/// Then each task starts only after its prerequisite completes, every
/// task finishes, and the run reports full success
#[tokio::test(start_paused = true)]
async fn test_chain_run_completes_every_task_in_order() {
    let plan = ParsedPlan::compile(&chain_plan()).unwrap();
    let graph = plan.seed_graph("demo").unwrap();
    let ids = task_ids_by_name(&graph);
    let mut harness = run_harness(graph);

    let report = harness.scheduler.run().await.unwrap();

    assert_eq!(report.stop_cause, StopCause::Completed);
    assert_eq!(report.completed_count(), 3);
    assert_eq!(report.failed_count(), 0);
    assert_eq!(report.escalations, 0);

    let events = harness.drain_events();
    assert!(
        matches!(events.last(), Some(SchedulerEvent::AllTasksSettled)),
        "run should close with AllTasksSettled"
    );

    // A dependent may start only after its prerequisite fully completes.
    let alpha_done = index_where(&events, "TaskCompleted(alpha)", |e| {
        matches!(e, SchedulerEvent::TaskCompleted { task_id, .. } if *task_id == ids["alpha"])
    });
    let beta_started = index_where(&events, "TaskStarted(beta)", |e| {
        matches!(e, SchedulerEvent::TaskStarted { task_id, .. } if *task_id == ids["beta"])
    });
    let beta_done = index_where(&events, "TaskCompleted(beta)", |e| {
        matches!(e, SchedulerEvent::TaskCompleted { task_id, .. } if *task_id == ids["beta"])
    });
    let gamma_started = index_where(&events, "TaskStarted(gamma)", |e| {
        matches!(e, SchedulerEvent::TaskStarted { task_id, .. } if *task_id == ids["gamma"])
    });
    assert!(
        alpha_done < beta_started,
        "beta started at {beta_started} before alpha completed at {alpha_done}"
    );
    assert!(
        beta_done < gamma_started,
        "gamma started at {gamma_started} before beta completed at {beta_done}"
    );

    // Each completion carries the workspace commit.
    for event in &events {
        if let SchedulerEvent::TaskCompleted { commit, .. } = event {
            assert_eq!(commit.as_deref(), Some("f4c3b00c"));
        }
    }

    // Coder tasks run two stages, the tester one; each stage is a fresh
    // session for the task.
    let started = harness.sessions.started();
    let count_for = |name: &str| {
        started
            .iter()
            .filter(|s| s.starts_with(&format!("hive_{name}_")))
            .count()
    };
    assert_eq!(count_for("alpha"), 2);
    assert_eq!(count_for("beta"), 2);
    assert_eq!(count_for("gamma"), 1);

    for task_id in ids.values() {
        let task = harness.scheduler.graph().task(task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed, "task {}", task.name);
    }
}

/// Test: Budget gate halts before dispatch
/// Given cumulative usage already past the limit
/// When the scheduler runs
/// Then it stops with BudgetExhausted without starting a single session
#[tokio::test]
async fn test_budget_exhausted_stops_before_any_dispatch() {
    let plan = ParsedPlan::compile(&chain_plan()).unwrap();
    let graph = plan.seed_graph("demo").unwrap();
    let usage = hive::completion::TokenUsage {
        input_tokens: 700,
        output_tokens: 500,
    };
    let mut harness = run_harness_with(graph, usage, Some(1000));

    let report = harness.scheduler.run().await.unwrap();

    assert_eq!(report.stop_cause, StopCause::BudgetExhausted);
    assert_eq!(report.tokens_spent, 1200);
    assert_eq!(report.completed_count(), 0);
    assert!(
        harness.sessions.started().is_empty(),
        "no session may start once the budget is spent"
    );

    let events = harness.drain_events();
    let exhausted = index_where(&events, "BudgetExhausted", |e| {
        matches!(e, SchedulerEvent::BudgetExhausted { spent: 1200, limit: 1000 })
    });
    assert_eq!(exhausted, 0, "budget stop should be the first event");
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, SchedulerEvent::TaskStarted { .. })),
        "no TaskStarted events expected"
    );

    // Tasks are untouched and could run under a higher budget.
    for outcome in &report.outcomes {
        assert_eq!(outcome.status, TaskStatus::Pending, "task {}", outcome.name);
    }
}
