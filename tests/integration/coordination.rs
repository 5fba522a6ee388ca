//! Agent coordination integration tests.
//!
//! Exercise the coordinator directly against scripted sessions: pool
//! limits, the marker poller, inter-agent messaging, staleness sweeps,
//! and helper takeover. The workspace-lifecycle test runs against a real
//! git repository because worktree creation and removal are exactly what
//! it is checking.

use chrono::Utc;

use hive::core::{AgentId, FailureKind, Severity, TaskStatus};
use hive::orchestration::{
    AgentOutcome, AgentStatus, CoordinationEvent, ExecutionContext, MessageKind, MessagePriority,
};
use hive::workflow::Capability;
use hive::Error;

use crate::fixtures::{coord_harness, coord_harness_with_git, test_task, TestRepo};

/// Test: Spawn bookkeeping
/// Given an empty pool
/// When a task is spawned
/// Then the agent, its session, the task fields, and the event stream all
/// agree on the assignment
#[tokio::test]
async fn test_spawn_registers_agent_and_session() {
    let mut harness = coord_harness(4);
    let mut task = test_task("ingest", Capability::Coder);

    let agent_id = harness
        .coordinator
        .spawn(&mut task, &ExecutionContext::default())
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.agent_id, Some(agent_id));
    assert!(task.workspace_path.is_some());
    assert!(task.branch_name.as_deref().unwrap().starts_with("hive/"));

    let info = harness.coordinator.agent_for_task(&task.id).await.unwrap();
    assert_eq!(info.id, agent_id);
    assert_eq!(info.status, AgentStatus::Active);
    assert_eq!(info.capability, Capability::Coder);
    assert!(info.session.starts_with("hive_ingest_"));
    assert_eq!(harness.coordinator.active_count().await, 1);

    let started = harness.sessions.started();
    assert_eq!(started, vec![info.session.clone()]);

    let events = harness.drain_events();
    assert!(matches!(
        events[0],
        CoordinationEvent::Spawned {
            agent,
            task: task_id,
            capability: Capability::Coder,
        } if agent == agent_id && task_id == task.id
    ));
}

/// Test: Double assignment
/// Given a task that already has an active agent
/// When a second spawn is attempted for it
/// Then the spawn is rejected by name
#[tokio::test]
async fn test_second_spawn_for_same_task_rejected() {
    let harness = coord_harness(4);
    let mut task = test_task("ingest", Capability::Coder);

    harness
        .coordinator
        .spawn(&mut task, &ExecutionContext::default())
        .await
        .unwrap();
    let err = harness
        .coordinator
        .spawn(&mut task, &ExecutionContext::default())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::AgentAlreadyActive { task } if task == "ingest"));
    assert_eq!(harness.sessions.started().len(), 1);
}

/// Test: Pool capacity
/// Given a pool of one
/// When a second task asks for an agent
/// Then the spawn is refused and nothing is allocated for it
#[tokio::test]
async fn test_pool_capacity_enforced() {
    let harness = coord_harness(1);
    let mut first = test_task("first", Capability::Coder);
    let mut second = test_task("second", Capability::Coder);

    harness
        .coordinator
        .spawn(&mut first, &ExecutionContext::default())
        .await
        .unwrap();
    let err = harness
        .coordinator
        .spawn(&mut second, &ExecutionContext::default())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::AgentPoolFull { max: 1 }));
    assert_eq!(harness.coordinator.active_count().await, 1);
    assert_eq!(harness.sessions.started().len(), 1);
    assert!(second.workspace_path.is_none());
}

/// Test: Workspace lifecycle
/// Given an agent working in a real git worktree
/// When its task is cleaned up
/// Then the session is killed, the worktree leaves the disk, and the pool
/// slot frees up
#[tokio::test]
async fn test_cleanup_releases_workspace_and_sessions() {
    let repo = TestRepo::new();
    let mut harness = coord_harness_with_git(&repo);
    let mut task = test_task("ingest", Capability::Coder);

    harness
        .coordinator
        .spawn(&mut task, &ExecutionContext::default())
        .await
        .unwrap();

    let workspace = task.workspace_path.clone().unwrap();
    assert!(workspace.exists(), "worktree should be on disk");
    assert!(workspace.starts_with(repo.workspaces_dir()));
    assert!(task.branch_name.as_deref().unwrap().starts_with("hive/"));

    harness.coordinator.cleanup(&task).await.unwrap();

    assert!(!workspace.exists(), "worktree should be removed");
    assert_eq!(harness.coordinator.active_count().await, 0);
    assert!(harness.coordinator.agent_for_task(&task.id).await.is_none());
    assert_eq!(harness.sessions.killed(), harness.sessions.started());

    let events = harness.drain_events();
    assert!(matches!(
        events.last(),
        Some(CoordinationEvent::Terminated { .. })
    ));
}

/// Test: Message delivery
/// Given two active agents
/// When one sends the other a message and the drain runs
/// Then the recipient's session receives the formatted text and unknown
/// recipients are rejected
#[tokio::test]
async fn test_messages_queue_and_drain_to_sessions() {
    let harness = coord_harness(4);
    let mut alpha = test_task("alpha", Capability::Coder);
    let mut beta = test_task("beta", Capability::Coder);

    let sender = harness
        .coordinator
        .spawn(&mut alpha, &ExecutionContext::default())
        .await
        .unwrap();
    let recipient = harness
        .coordinator
        .spawn(&mut beta, &ExecutionContext::default())
        .await
        .unwrap();
    let beta_session = harness.sessions.started()[1].clone();

    harness
        .coordinator
        .send_message(
            sender,
            recipient,
            MessageKind::Handoff,
            MessagePriority::High,
            "ingest schema is ready\nsee the committed artifacts",
        )
        .await
        .unwrap();

    assert_eq!(harness.coordinator.drain_messages(8).await, 1);
    let delivered = harness.sessions.sent_to(&beta_session);
    assert_eq!(delivered.len(), 1);
    assert!(delivered[0].starts_with("[hive message from="));
    assert!(delivered[0].contains("kind=handoff"));
    assert!(
        delivered[0].contains("ingest schema is ready see the committed artifacts"),
        "newlines flatten so the session gets one line"
    );
    let alpha_session = harness.sessions.started()[0].clone();
    assert!(harness.sessions.sent_to(&alpha_session).is_empty());

    let err = harness
        .coordinator
        .send_message(
            sender,
            AgentId::new(),
            MessageKind::StatusUpdate,
            MessagePriority::Medium,
            "hello?",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AgentNotFound { .. }));
}

/// Test: Messages wait for inactive recipients
/// Given a recipient whose session died
/// When the drain runs
/// Then nothing is delivered and the message stays queued
#[tokio::test]
async fn test_drain_skips_inactive_recipients() {
    let harness = coord_harness(4);
    let mut alpha = test_task("alpha", Capability::Coder);
    let mut beta = test_task("beta", Capability::Coder);

    let sender = harness
        .coordinator
        .spawn(&mut alpha, &ExecutionContext::default())
        .await
        .unwrap();
    let recipient = harness
        .coordinator
        .spawn(&mut beta, &ExecutionContext::default())
        .await
        .unwrap();
    let beta_session = harness.sessions.started()[1].clone();
    harness.sessions.mark_dead(&beta_session);

    let outcomes = harness.coordinator.poll_outcomes().await;
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(
        outcomes[0],
        AgentOutcome::SessionDied { task_id, .. } if task_id == beta.id
    ));

    harness
        .coordinator
        .send_message(
            sender,
            recipient,
            MessageKind::Alert,
            MessagePriority::Critical,
            "are you still there",
        )
        .await
        .unwrap();

    assert_eq!(harness.coordinator.drain_messages(8).await, 0);
    assert!(harness.sessions.sent_to(&beta_session).is_empty());
}

/// Test: Marker dedup
/// Given a session whose tail shows the completion marker
/// When the poller runs twice
/// Then the step completion is reported exactly once
#[tokio::test]
async fn test_poll_reports_step_complete_once() {
    let harness = coord_harness(4);
    let mut task = test_task("ingest", Capability::Coder);
    let agent_id = harness
        .coordinator
        .spawn(&mut task, &ExecutionContext::default())
        .await
        .unwrap();
    let session = harness.sessions.started()[0].clone();
    harness
        .sessions
        .set_tail(&session, "compiling\nSTEP COMPLETE: done the thing\n");

    let outcomes = harness.coordinator.poll_outcomes().await;
    assert_eq!(outcomes.len(), 1);
    match &outcomes[0] {
        AgentOutcome::StepComplete {
            task_id, summary, ..
        } => {
            assert_eq!(*task_id, task.id);
            assert_eq!(summary, "done the thing");
        }
        other => panic!("expected StepComplete, got {other:?}"),
    }

    assert!(harness.coordinator.poll_outcomes().await.is_empty());
    let info = harness.coordinator.agent(&agent_id).await.unwrap();
    assert_eq!(info.status, AgentStatus::Completed);
}

/// Test: Impasse marker and death precedence
/// Given one agent reporting an impasse and one dead session that also
/// printed a completion marker
/// When the poller runs
/// Then the impasse carries its reason and the dead session wins over its
/// marker
#[tokio::test]
async fn test_poll_reports_impasse_and_prefers_death() {
    let harness = coord_harness(4);
    let mut alpha = test_task("alpha", Capability::Coder);
    let mut beta = test_task("beta", Capability::Coder);

    harness
        .coordinator
        .spawn(&mut alpha, &ExecutionContext::default())
        .await
        .unwrap();
    harness
        .coordinator
        .spawn(&mut beta, &ExecutionContext::default())
        .await
        .unwrap();

    let alpha_session = harness.sessions.started()[0].clone();
    let beta_session = harness.sessions.started()[1].clone();
    harness
        .sessions
        .set_tail(&alpha_session, "IMPASSE: missing credentials");
    harness
        .sessions
        .set_tail(&beta_session, "STEP COMPLETE: finished");
    harness.sessions.mark_dead(&beta_session);

    let outcomes = harness.coordinator.poll_outcomes().await;
    assert_eq!(outcomes.len(), 2);
    for outcome in outcomes {
        match outcome {
            AgentOutcome::Impasse {
                task_id, reason, ..
            } => {
                assert_eq!(task_id, alpha.id);
                assert_eq!(reason, "missing credentials");
            }
            AgentOutcome::SessionDied { task_id, .. } => assert_eq!(task_id, beta.id),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}

/// Test: Staleness sweep
/// Given an agent with no heartbeat inside the window
/// When the sweep runs
/// Then the agent fails with a timeout context for recovery, exactly once
#[tokio::test]
async fn test_sweep_marks_silent_agents_stale() {
    let mut harness = coord_harness(4);
    let mut task = test_task("ingest", Capability::Coder);
    let agent_id = harness
        .coordinator
        .spawn(&mut task, &ExecutionContext::default())
        .await
        .unwrap();

    let contexts = harness
        .coordinator
        .sweep_stale(Utc::now() + chrono::Duration::seconds(400))
        .await;

    assert_eq!(contexts.len(), 1);
    let context = &contexts[0];
    assert_eq!(context.task_id, task.id);
    assert_eq!(context.kind, FailureKind::Timeout);
    assert_eq!(context.severity, Severity::High);
    assert_eq!(context.metadata.agent, Some(agent_id));
    assert!(context.message.contains("no heartbeat"));

    let info = harness.coordinator.agent(&agent_id).await.unwrap();
    assert_eq!(info.status, AgentStatus::Failed);

    // A failed agent is not swept again.
    let repeat = harness
        .coordinator
        .sweep_stale(Utc::now() + chrono::Duration::seconds(800))
        .await;
    assert!(repeat.is_empty());

    let events = harness.drain_events();
    assert!(events
        .iter()
        .any(|event| matches!(event, CoordinationEvent::Stale { agent, .. } if *agent == agent_id)));
}

/// Test: Helper takeover
/// Given a task with an active agent
/// When an impasse solver is spawned for it
/// Then the helper takes the task slot in the same working copy and both
/// agents record the cooperation
#[tokio::test]
async fn test_helper_takes_over_task_slot() {
    let mut harness = coord_harness(4);
    let mut task = test_task("ingest", Capability::Coder);
    let original = harness
        .coordinator
        .spawn(&mut task, &ExecutionContext::default())
        .await
        .unwrap();

    let helper = harness
        .coordinator
        .spawn_helper(
            &mut task,
            Capability::ImpasseSolver,
            "wedged on the schema migration",
            None,
        )
        .await
        .unwrap();

    let active = harness.coordinator.agent_for_task(&task.id).await.unwrap();
    assert_eq!(active.id, helper);
    assert_eq!(active.capability, Capability::ImpasseSolver);
    assert_eq!(task.agent_id, Some(helper));

    let all = harness.coordinator.agents_for_task(&task.id).await;
    assert_eq!(all.len(), 2);
    let original_info = all.iter().find(|info| info.id == original).unwrap();
    assert_eq!(original_info.status, AgentStatus::Waiting);
    assert!(original_info.cooperating_with.contains(&helper));
    let helper_info = all.iter().find(|info| info.id == helper).unwrap();
    assert!(helper_info.cooperating_with.contains(&original));

    // A waiting agent still holds its pool slot.
    assert_eq!(harness.coordinator.active_count().await, 2);

    let launches = harness.sessions.launches();
    assert_eq!(launches.len(), 2);
    assert_eq!(
        launches[0].cwd, launches[1].cwd,
        "helper joins the existing working copy"
    );
    assert!(launches[1].payload.contains("wedged on the schema migration"));

    let spawned: Vec<Capability> = harness
        .drain_events()
        .into_iter()
        .filter_map(|event| match event {
            CoordinationEvent::Spawned { capability, .. } => Some(capability),
            _ => None,
        })
        .collect();
    assert_eq!(spawned, vec![Capability::Coder, Capability::ImpasseSolver]);
}
