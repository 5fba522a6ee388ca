//! Pre-dispatch critique gate.
//!
//! Stages marked quality-gated get their most recent upstream artifact
//! reviewed before the next dispatch. A review that demands a downstream
//! pause vetoes the dispatch and feeds the recovery engine; everything
//! else allows dispatch, depositing a field signal that reflects how the
//! review went. Collaborator trouble degrades to allowing dispatch.

use std::sync::Arc;

use crate::core::failure::{ErrorContext, FailureKind, Severity};
use crate::core::signal::{Signal, SignalKind};
use crate::core::task::Task;
use crate::quality::QualityGate;
use crate::store::TaskStore;
use crate::workflow::StepConfig;
use crate::{hlog, hlog_debug, hlog_warn};

/// Reviews at or above this quality deposit a success signal.
const STRONG_QUALITY: f64 = 0.7;

/// Gate verdict for one dispatch attempt.
#[derive(Debug)]
pub enum GateDecision {
    /// Dispatch may proceed; the signal (if any) should be deposited.
    Allow { signal: Option<Signal> },
    /// Dispatch is vetoed; the context goes to the recovery engine.
    Veto { context: ErrorContext },
}

pub struct CritiqueGate {
    store: Arc<dyn TaskStore>,
    quality: Arc<dyn QualityGate>,
}

impl CritiqueGate {
    pub fn new(store: Arc<dyn TaskStore>, quality: Arc<dyn QualityGate>) -> Self {
        Self { store, quality }
    }

    /// Run the gate for a task about to be dispatched.
    pub async fn check(&self, task: &Task) -> GateDecision {
        let config = StepConfig::for_step(task.current_step());
        if !config.quality_gate {
            return GateDecision::Allow { signal: None };
        }

        // Review the artifact of the most recently completed step; a task
        // entering the pipeline has nothing to review yet.
        let Some(previous) = task.workflow.completed_steps().last().map(|c| c.step) else {
            return GateDecision::Allow { signal: None };
        };

        let artifact = match self.store.latest_artifact(&task.id, previous).await {
            Ok(Some(artifact)) => artifact,
            Ok(None) => {
                hlog_debug!(
                    "No artifact for {} at {}; gate allows",
                    task.name,
                    previous
                );
                return GateDecision::Allow { signal: None };
            }
            Err(e) => {
                hlog_warn!("Artifact lookup failed for {}: {}", task.name, e);
                return GateDecision::Allow { signal: None };
            }
        };

        let report = match self.quality.review(task, &artifact).await {
            Ok(report) => report,
            Err(e) => {
                hlog_warn!("Critique unavailable for {}: {}", task.name, e);
                return GateDecision::Allow { signal: None };
            }
        };

        if !report.passed && report.pause_downstream {
            let findings = if report.issues.is_empty() {
                "quality review failed".to_string()
            } else {
                report.issues.join("; ")
            };
            hlog!(
                "Critique gate vetoes '{}' at {}: {}",
                task.name,
                task.current_step(),
                findings
            );
            let context = ErrorContext::new(
                task.id,
                FailureKind::CritiqueFailure,
                Severity::High,
                &findings,
            )
            .with_step(task.current_step())
            .with_extra("reviewed_step", previous.as_str())
            .with_extra("quality", &format!("{:.2}", report.overall_quality));
            return GateDecision::Veto { context };
        }

        let signal = if report.passed && report.overall_quality >= STRONG_QUALITY {
            Some(
                Signal::new(
                    SignalKind::Success,
                    report.overall_quality,
                    &format!("task:{}", task.name),
                )
                .with_metadata("step", previous.as_str()),
            )
        } else if !report.passed {
            Some(
                Signal::new(
                    SignalKind::Warning,
                    1.0 - report.overall_quality,
                    &format!("task:{}", task.name),
                )
                .with_metadata("step", previous.as_str()),
            )
        } else {
            None
        };

        GateDecision::Allow { signal }
    }
}
