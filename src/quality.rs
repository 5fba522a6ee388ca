//! Artifact critique and failure diagnosis.
//!
//! Before a gated step's output is allowed to feed downstream work, the
//! quality gate reviews it. The gate speaks a line-oriented keyword
//! protocol rather than free text so responses parse deterministically,
//! with lenient fallbacks for malformed replies.

use async_trait::async_trait;
use std::sync::Arc;

use crate::completion::{CompletionClient, CompletionRequest};
use crate::core::failure::ErrorContext;
use crate::core::task::Task;
use crate::error::Result;
use crate::hlog_debug;
use crate::store::Artifact;

/// How much artifact text to quote back to the reviewer.
const ARTIFACT_EXCERPT_CHARS: usize = 4000;

/// Outcome of reviewing one artifact.
#[derive(Debug, Clone)]
pub struct CritiqueReport {
    pub passed: bool,
    /// 0.0 (unusable) to 1.0 (excellent).
    pub overall_quality: f64,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
    /// Whether dependent tasks should be paused until this is fixed.
    pub pause_downstream: bool,
}

impl CritiqueReport {
    pub fn pass() -> Self {
        Self {
            passed: true,
            overall_quality: 0.8,
            issues: Vec::new(),
            recommendations: Vec::new(),
            pause_downstream: false,
        }
    }
}

/// Root-cause analysis of one failure.
#[derive(Debug, Clone)]
pub struct Diagnosis {
    pub root_cause: String,
    pub solutions: Vec<String>,
}

/// Seam for artifact review and failure diagnosis.
#[async_trait]
pub trait QualityGate: Send + Sync {
    /// Review an artifact a task produced for its current step.
    async fn review(&self, task: &Task, artifact: &Artifact) -> Result<CritiqueReport>;

    /// Analyze a failure and suggest fixes.
    async fn diagnose(&self, context: &ErrorContext) -> Result<Diagnosis>;
}

/// Quality gate backed by the completion service.
pub struct CompletionQualityGate {
    completion: Arc<dyn CompletionClient>,
}

impl CompletionQualityGate {
    pub fn new(completion: Arc<dyn CompletionClient>) -> Self {
        Self { completion }
    }

    /// Build the review prompt for one artifact.
    pub fn build_critique_prompt(task: &Task, artifact: &Artifact) -> String {
        let excerpt = tail_chars(&artifact.content, ARTIFACT_EXCERPT_CHARS);
        format!(
            r#"Review the output of a workflow step and judge whether downstream work can safely build on it.

TASK: {}
DESCRIPTION: {}
STEP: {}

ARTIFACT:
{}

Respond with EXACTLY this format:
VERDICT: PASS or FAIL
QUALITY: a number from 0.0 to 1.0
PAUSE_DOWNSTREAM: YES or NO
ISSUES:
- one issue per line (omit the section if none)
RECOMMENDATIONS:
- one recommendation per line (omit the section if none)"#,
            task.name, task.description, artifact.step, excerpt
        )
    }

    /// Parse a critique response. Malformed responses degrade to a pass so
    /// a flaky reviewer cannot wedge the whole pipeline.
    pub fn parse_critique(response: &str) -> CritiqueReport {
        let mut passed = true;
        let mut quality: Option<f64> = None;
        let mut pause_downstream = false;
        let mut issues = Vec::new();
        let mut recommendations = Vec::new();

        #[derive(PartialEq)]
        enum Section {
            None,
            Issues,
            Recommendations,
        }
        let mut section = Section::None;

        for line in response.lines() {
            let trimmed = line.trim();
            let upper = trimmed.to_uppercase();

            if let Some(rest) = upper.strip_prefix("VERDICT:") {
                passed = !rest.trim().starts_with("FAIL");
                section = Section::None;
            } else if let Some(rest) = upper.strip_prefix("QUALITY:") {
                if let Ok(value) = rest.trim().parse::<f64>() {
                    quality = Some(value.clamp(0.0, 1.0));
                }
                section = Section::None;
            } else if let Some(rest) = upper.strip_prefix("PAUSE_DOWNSTREAM:") {
                pause_downstream = rest.trim().starts_with("YES");
                section = Section::None;
            } else if upper.starts_with("ISSUES:") {
                section = Section::Issues;
            } else if upper.starts_with("RECOMMENDATIONS:") {
                section = Section::Recommendations;
            } else if let Some(item) = trimmed.strip_prefix('-') {
                let item = item.trim();
                if !item.is_empty() {
                    match section {
                        Section::Issues => issues.push(item.to_string()),
                        Section::Recommendations => recommendations.push(item.to_string()),
                        Section::None => {}
                    }
                }
            }
        }

        let overall_quality = quality.unwrap_or(if passed { 0.8 } else { 0.2 });
        CritiqueReport {
            passed,
            overall_quality,
            issues,
            recommendations,
            // Never pause downstream on a passing review.
            pause_downstream: pause_downstream && !passed,
        }
    }

    /// Build the diagnosis prompt for one failure.
    pub fn build_diagnosis_prompt(context: &ErrorContext) -> String {
        let step = context
            .metadata
            .step
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        format!(
            r#"Analyze this task failure and identify the root cause.

FAILURE KIND: {}
SEVERITY: {}
STEP: {}
ATTEMPT: {}
MESSAGE:
{}

Respond with EXACTLY this format:
ROOT_CAUSE: one line stating the most likely root cause
SOLUTIONS:
- one candidate solution per line (2-3 lines)"#,
            context.kind, context.severity, step, context.metadata.attempt, context.message
        )
    }

    /// Parse a diagnosis response.
    pub fn parse_diagnosis(response: &str) -> Diagnosis {
        let mut root_cause = String::new();
        let mut solutions = Vec::new();
        let mut in_solutions = false;

        for line in response.lines() {
            let trimmed = line.trim();
            let upper = trimmed.to_uppercase();

            if upper.starts_with("ROOT_CAUSE:") {
                root_cause = trimmed
                    .splitn(2, ':')
                    .nth(1)
                    .unwrap_or_default()
                    .trim()
                    .to_string();
                in_solutions = false;
            } else if upper.starts_with("SOLUTIONS:") {
                in_solutions = true;
            } else if in_solutions {
                if let Some(item) = trimmed.strip_prefix('-') {
                    let item = item.trim();
                    if !item.is_empty() {
                        solutions.push(item.to_string());
                    }
                }
            }
        }

        if root_cause.is_empty() {
            root_cause = "unable to determine root cause".to_string();
        }
        Diagnosis {
            root_cause,
            solutions,
        }
    }
}

#[async_trait]
impl QualityGate for CompletionQualityGate {
    async fn review(&self, task: &Task, artifact: &Artifact) -> Result<CritiqueReport> {
        let prompt = Self::build_critique_prompt(task, artifact);
        let response = self.completion.send(CompletionRequest::new(&prompt)).await?;
        let report = Self::parse_critique(&response.content);
        hlog_debug!(
            "Critique for {} {}: passed={} quality={:.2} issues={}",
            task.name,
            artifact.step,
            report.passed,
            report.overall_quality,
            report.issues.len()
        );
        Ok(report)
    }

    async fn diagnose(&self, context: &ErrorContext) -> Result<Diagnosis> {
        let prompt = Self::build_diagnosis_prompt(context);
        let response = self.completion.send(CompletionRequest::new(&prompt)).await?;
        Ok(Self::parse_diagnosis(&response.content))
    }
}

fn tail_chars(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    // Walk forward to a char boundary so the slice never splits a char.
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
