use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hive::completion::{CompletionClient, HeadlessCompletion};
use hive::config::Config;
use hive::orchestration::{
    AgentCoordinator, CritiqueGate, ParsedPlan, RecoveryEngine, RunReport, Scheduler,
    SchedulerConfig, SchedulerEvent, StatusTracker, StopCause,
};
use hive::quality::{CompletionQualityGate, QualityGate};
use hive::session::{SessionHost, TmuxSessions};
use hive::store::{JsonStore, TaskStore};
use hive::workspace::{GitWorkspaces, WorkspaceManager};
use hive::{hlog, hlog_error, Result};

/// Hive - plan-driven multi-agent task orchestrator
#[derive(Parser, Debug)]
#[command(name = "hive")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    HIVE_DEBUG=1    Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.hive/hive.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Compile a plan document and drive it to completion
    Run {
        /// Path to the plan document
        plan: PathBuf,

        /// Project name stamped on every task (defaults to the plan title)
        #[arg(long)]
        project: Option<String>,

        /// Token budget for this run, overriding the config file
        #[arg(long)]
        budget: Option<u64>,

        /// Maximum concurrently active agents
        #[arg(long)]
        max_agents: Option<usize>,
    },

    /// Parse a plan document and report problems without running it
    Validate {
        /// Path to the plan document
        plan: PathBuf,
    },

    /// Show the persisted status of tasks from previous runs
    Status,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    hive::log::init_with_debug(cli.debug);

    if let Err(e) = run(cli).await {
        hlog_error!("Fatal: {}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run {
            plan,
            project,
            budget,
            max_agents,
        } => run_plan(&plan, project, budget, max_agents).await,
        Command::Validate { plan } => validate_plan(&plan),
        Command::Status => show_status().await,
    }
}

async fn run_plan(
    plan_path: &Path,
    project: Option<String>,
    budget: Option<u64>,
    max_agents: Option<usize>,
) -> Result<()> {
    Config::ensure_dirs()?;
    let config = Config::load()?;

    let plan = ParsedPlan::load(plan_path)?;
    let project = project.unwrap_or_else(|| plan.title.clone());
    let graph = plan.seed_graph(&project)?;
    println!(
        "Compiled plan '{}': {} tasks, project '{}'",
        plan.title,
        graph.task_count(),
        project
    );

    // Agent sessions run the configured command line; the completion
    // service drives the same binary headlessly for reviews.
    let command: Vec<String> = config
        .effective_command()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    let binary = command.first().map(String::as_str).unwrap_or("claude");

    let budget_limit = budget.or(config.budget_limit);
    let completion: Arc<dyn CompletionClient> =
        Arc::new(HeadlessCompletion::new(binary)?.with_budget_limit(budget_limit));
    let quality: Arc<dyn QualityGate> = Arc::new(CompletionQualityGate::new(completion.clone()));
    let store: Arc<dyn TaskStore> = Arc::new(JsonStore::open(&Config::state_dir()?).await?);
    let sessions: Arc<dyn SessionHost> = Arc::new(TmuxSessions::default());
    let repo_root = std::env::current_dir()?;
    let workspaces: Arc<dyn WorkspaceManager> = Arc::new(GitWorkspaces::new(
        &repo_root,
        &Config::workspaces_dir()?,
    ));

    let (coordination_tx, coordination_rx) = mpsc::channel(64);
    let coordinator = Arc::new(AgentCoordinator::new(
        workspaces.clone(),
        sessions,
        coordination_tx,
        max_agents.unwrap_or_else(|| config.max_agents()),
        command,
        config.heartbeat_window(),
    ));
    let recovery = RecoveryEngine::new(
        store.clone(),
        quality.clone(),
        coordinator.clone(),
        config.pause_duration(),
    );
    let gate = CritiqueGate::new(store.clone(), quality);
    let tracker_limit = completion.configuration().budget_limit;
    let tracker = StatusTracker::new(completion, tracker_limit);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                hlog!("Interrupt received; stopping after the current iteration");
                cancel.cancel();
            }
        });
    }

    let (event_tx, event_rx) = mpsc::channel(256);
    let printer = tokio::spawn(print_events(event_rx));

    let mut scheduler = Scheduler::new(
        graph,
        coordinator,
        coordination_rx,
        recovery,
        gate,
        tracker,
        store,
        workspaces,
        event_tx,
        cancel,
        SchedulerConfig::from_config(&config),
    );
    let report = scheduler.run().await?;
    drop(scheduler);
    let _ = printer.await;

    print_report(&report);
    if report.stop_cause != StopCause::Completed || report.failed_count() > 0 {
        std::process::exit(1);
    }
    Ok(())
}

async fn print_events(mut event_rx: mpsc::Receiver<SchedulerEvent>) {
    while let Some(event) = event_rx.recv().await {
        match event {
            SchedulerEvent::TaskStarted { task_id, agent_id } => {
                println!("started    {} (agent {})", task_id.short(), agent_id.short());
            }
            SchedulerEvent::StepCompleted { task_id, step } => {
                println!("step done  {} finished {}", task_id.short(), step);
            }
            SchedulerEvent::TaskCompleted { task_id, commit } => match commit {
                Some(hash) => println!("completed  {} at commit {}", task_id.short(), hash),
                None => println!("completed  {}", task_id.short()),
            },
            SchedulerEvent::TaskFailed { task_id, error } => {
                println!("failed     {}: {}", task_id.short(), error);
            }
            SchedulerEvent::BudgetExhausted { spent, limit } => {
                println!("budget     {} of {} tokens spent; stopping", spent, limit);
            }
            SchedulerEvent::AllTasksSettled => {
                println!("all tasks settled");
            }
        }
    }
}

fn print_report(report: &RunReport) {
    println!();
    println!(
        "Run {} in {:.1}s: {} completed, {} failed, {} tokens spent",
        report.stop_cause,
        report.duration.as_secs_f64(),
        report.completed_count(),
        report.failed_count(),
        report.tokens_spent
    );
    for outcome in &report.outcomes {
        println!("  {:<24} {}", outcome.name, outcome.status.label());
    }
}

fn validate_plan(plan_path: &Path) -> Result<()> {
    let plan = ParsedPlan::load(plan_path)?;
    let order = plan.dependency_order()?;
    println!(
        "Plan '{}' is valid: {} features, {} decisions",
        plan.title,
        plan.features.len(),
        plan.decisions.len()
    );
    println!("Dispatch order:");
    for name in order {
        println!("  {}", name);
    }
    Ok(())
}

async fn show_status() -> Result<()> {
    let store = JsonStore::open(&Config::state_dir()?).await?;
    let tasks = store.list_tasks().await?;
    if tasks.is_empty() {
        println!("No recorded tasks.");
        return Ok(());
    }
    for task in tasks {
        println!(
            "{:<24} {:<10} {}",
            task.name,
            task.status.label(),
            task.project
        );
    }
    Ok(())
}
