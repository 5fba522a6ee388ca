//! Capability-specific instruction payloads.
//!
//! When the coordinator spawns an agent it types one payload into the
//! session: role, stage objective, task detail, upstream artifacts, and
//! field signals. Agents answer back through a two-marker protocol in
//! their output; the poller scans for the markers.

use crate::core::signal::SignalKind;
use crate::core::task::Task;
use crate::quality::Diagnosis;
use crate::workflow::{Capability, StepConfig, WorkflowStep};

/// Line an agent prints when its stage is done.
pub const STEP_COMPLETE_MARKER: &str = "STEP COMPLETE:";
/// Line an agent prints when it cannot make progress.
pub const IMPASSE_MARKER: &str = "IMPASSE:";

/// How much of each upstream artifact to quote into the payload.
const ARTIFACT_EXCERPT_CHARS: usize = 1500;

/// One upstream artifact relevant to the task being dispatched.
#[derive(Debug, Clone)]
pub struct DependencyArtifact {
    pub task_name: String,
    pub step: WorkflowStep,
    pub content: String,
}

/// One decayed signal read from the field.
#[derive(Debug, Clone)]
pub struct SignalSummary {
    pub context: String,
    pub kind: SignalKind,
    pub strength: f64,
}

/// Material gathered by the scheduler before dispatch.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub dependency_artifacts: Vec<DependencyArtifact>,
    pub signals: Vec<SignalSummary>,
}

fn role_line(capability: Capability) -> &'static str {
    match capability {
        Capability::Analyst => "a requirements analyst",
        Capability::Architect => "a software architect",
        Capability::Coder => "an implementation engineer",
        Capability::Tester => "a test engineer",
        Capability::ImpasseSolver => "an unblocking specialist",
        Capability::RootCauseAnalyst => "a root-cause analyst",
        Capability::QualityAnalyst => "a quality analyst",
    }
}

/// Build the instruction payload typed into a freshly spawned agent session.
pub fn instruction_payload(task: &Task, context: &ExecutionContext) -> String {
    let config = StepConfig::for_step(task.current_step());
    let mut payload = format!(
        r#"You are {role} working on task "{name}" in project "{project}".

CURRENT STAGE: {title} ({step})
OBJECTIVE: {objective}
EXPECTED ARTIFACT: {artifact}
GUIDANCE: {guidance}
FOCUS AREAS: {keywords}

TASK DESCRIPTION:
{description}
"#,
        role = role_line(task.capability),
        name = task.name,
        project = task.project,
        title = config.title,
        step = config.step,
        objective = config.objective,
        artifact = config.expected_artifact,
        guidance = config.guidance,
        keywords = config.keywords.join(", "),
        description = task.description,
    );

    if !task.criteria.is_empty() {
        payload.push_str("\nACCEPTANCE CRITERIA:\n");
        for (i, criterion) in task.criteria.iter().enumerate() {
            payload.push_str(&format!("{}. {}\n", i + 1, criterion));
        }
    }

    if !task.steps.is_empty() {
        payload.push_str("\nSUGGESTED STEPS:\n");
        for step in &task.steps {
            payload.push_str(&format!("- {}\n", step));
        }
    }

    if !context.dependency_artifacts.is_empty() {
        payload.push_str("\nUPSTREAM ARTIFACTS:\n");
        for artifact in &context.dependency_artifacts {
            payload.push_str(&format!(
                "--- {} ({}) ---\n{}\n",
                artifact.task_name,
                artifact.step,
                head_chars(&artifact.content, ARTIFACT_EXCERPT_CHARS)
            ));
        }
    }

    if !context.signals.is_empty() {
        payload.push_str("\nFIELD SIGNALS (recent outcomes nearby, strongest first):\n");
        for signal in &context.signals {
            payload.push_str(&format!(
                "- [{:?} {:.2}] {}\n",
                signal.kind, signal.strength, signal.context
            ));
        }
    }

    payload.push_str(&format!(
        r#"
Work only inside the current directory; commit your changes when done.
When the stage is complete, print a final line:
{STEP_COMPLETE_MARKER} <one-line summary of what was produced>
If you cannot make progress, print a final line instead:
{IMPASSE_MARKER} <what is blocking you>
"#
    ));
    payload
}

/// Build the payload for a helper agent taking over a troubled task.
pub fn helper_payload(
    helper: Capability,
    task: &Task,
    reason: &str,
    diagnosis: Option<&Diagnosis>,
) -> String {
    let mut payload = match helper {
        Capability::ImpasseSolver => format!(
            r#"You are {role}. The agent working on task "{name}" is stuck.

STAGE: {step}
REPORTED BLOCKER:
{reason}

Investigate the working copy, resolve the blocker directly (fix code,
adjust the approach, or complete the stage yourself), and commit the
result."#,
            role = role_line(helper),
            name = task.name,
            step = task.current_step(),
            reason = reason,
        ),
        Capability::RootCauseAnalyst => format!(
            r#"You are {role}. Task "{name}" keeps failing at stage {step}.

FAILURE:
{reason}

Find the root cause, fix it, and verify by re-running the failing part."#,
            role = role_line(helper),
            name = task.name,
            step = task.current_step(),
            reason = reason,
        ),
        Capability::QualityAnalyst => format!(
            r#"You are {role}. The output of task "{name}" at stage {step} did
not meet the quality bar.

FINDINGS:
{reason}

Rework the artifact until the findings are addressed, then commit."#,
            role = role_line(helper),
            name = task.name,
            step = task.current_step(),
            reason = reason,
        ),
        // A non-helper capability here is a programming error upstream, but
        // the payload still has to say something useful.
        _ => format!(
            "You are {role}. Assist with task \"{name}\": {reason}",
            role = role_line(helper),
            name = task.name,
            reason = reason,
        ),
    };

    if let Some(diagnosis) = diagnosis {
        payload.push_str(&format!("\n\nPRIOR ANALYSIS:\nRoot cause: {}\n", diagnosis.root_cause));
        for solution in &diagnosis.solutions {
            payload.push_str(&format!("- {}\n", solution));
        }
    }

    payload.push_str(&format!(
        r#"
When resolved, print a final line:
{STEP_COMPLETE_MARKER} <one-line summary>
If you also cannot make progress, print a final line instead:
{IMPASSE_MARKER} <why>
"#
    ));
    payload
}

fn head_chars(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
