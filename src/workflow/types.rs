//! Core types for the delivery pipeline.
//!
//! Every task moves through the same fixed six-step pipeline. A task does not
//! necessarily enter at the first step: its capability decides the entry
//! point (a coder task starts directly at implementation), and steps before
//! the entry point are considered satisfied for readiness purposes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One step of the fixed delivery pipeline, in execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStep {
    /// Capture what the task must achieve and its constraints.
    DefineRequirements,
    /// Turn requirements into a formal interface contract.
    FormalizeContracts,
    /// Prove the core logic with a throwaway prototype.
    PrototypeLogic,
    /// Decide module boundaries and data flow.
    DesignArchitecture,
    /// Produce the production implementation.
    ImplementCode,
    /// Run and evaluate the verification suite.
    ExecuteTests,
}

impl WorkflowStep {
    /// All steps in pipeline order.
    pub const ALL: [WorkflowStep; 6] = [
        WorkflowStep::DefineRequirements,
        WorkflowStep::FormalizeContracts,
        WorkflowStep::PrototypeLogic,
        WorkflowStep::DesignArchitecture,
        WorkflowStep::ImplementCode,
        WorkflowStep::ExecuteTests,
    ];

    /// The entry point of the pipeline.
    pub fn first() -> Self {
        WorkflowStep::DefineRequirements
    }

    /// The step after this one, or `None` at the end of the pipeline.
    pub fn next(&self) -> Option<WorkflowStep> {
        match self {
            WorkflowStep::DefineRequirements => Some(WorkflowStep::FormalizeContracts),
            WorkflowStep::FormalizeContracts => Some(WorkflowStep::PrototypeLogic),
            WorkflowStep::PrototypeLogic => Some(WorkflowStep::DesignArchitecture),
            WorkflowStep::DesignArchitecture => Some(WorkflowStep::ImplementCode),
            WorkflowStep::ImplementCode => Some(WorkflowStep::ExecuteTests),
            WorkflowStep::ExecuteTests => None,
        }
    }

    /// Zero-based position in the pipeline.
    pub fn position(&self) -> usize {
        Self::ALL
            .iter()
            .position(|s| s == self)
            .unwrap_or(Self::ALL.len())
    }

    /// True for the last pipeline step.
    pub fn is_last(&self) -> bool {
        self.next().is_none()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStep::DefineRequirements => "define_requirements",
            WorkflowStep::FormalizeContracts => "formalize_contracts",
            WorkflowStep::PrototypeLogic => "prototype_logic",
            WorkflowStep::DesignArchitecture => "design_architecture",
            WorkflowStep::ImplementCode => "implement_code",
            WorkflowStep::ExecuteTests => "execute_tests",
        }
    }
}

impl fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The kind of agent a task (or helper role) requires.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Requirements and analysis work; the default entry capability.
    Analyst,
    /// Architecture and interface design.
    Architect,
    /// Production implementation.
    Coder,
    /// Test execution and verification.
    Tester,
    /// Helper role: unblocks a stalled task.
    ImpasseSolver,
    /// Helper role: investigates recurring system failures.
    RootCauseAnalyst,
    /// Helper role: reviews artifacts flagged by the critique gate.
    QualityAnalyst,
}

impl Capability {
    /// Parse a capability string from a plan document.
    ///
    /// Parsing is lenient: an unknown capability maps to `Analyst`, which
    /// enters the pipeline at the first step.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "analyst" | "planner" | "requirements" => Capability::Analyst,
            "architect" | "designer" => Capability::Architect,
            "coder" | "developer" | "implementer" | "engineer" => Capability::Coder,
            "tester" | "qa" | "verifier" => Capability::Tester,
            "impasse_solver" => Capability::ImpasseSolver,
            "root_cause_analyst" => Capability::RootCauseAnalyst,
            "quality_analyst" | "reviewer" => Capability::QualityAnalyst,
            _ => Capability::Analyst,
        }
    }

    /// The pipeline step a task with this capability enters at.
    pub fn initial_step(&self) -> WorkflowStep {
        match self {
            Capability::Coder => WorkflowStep::ImplementCode,
            Capability::Tester => WorkflowStep::ExecuteTests,
            Capability::Architect => WorkflowStep::DesignArchitecture,
            Capability::Analyst
            | Capability::ImpasseSolver
            | Capability::RootCauseAnalyst
            | Capability::QualityAnalyst => WorkflowStep::first(),
        }
    }

    /// Helper roles are spawned by recovery, never by a plan.
    pub fn is_helper(&self) -> bool {
        matches!(
            self,
            Capability::ImpasseSolver | Capability::RootCauseAnalyst | Capability::QualityAnalyst
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Analyst => "analyst",
            Capability::Architect => "architect",
            Capability::Coder => "coder",
            Capability::Tester => "tester",
            Capability::ImpasseSolver => "impasse_solver",
            Capability::RootCauseAnalyst => "root_cause_analyst",
            Capability::QualityAnalyst => "quality_analyst",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Static per-step configuration and context-priming metadata.
///
/// The descriptive fields (objective, artifact, guidance, keywords) feed the
/// instruction payload only; control flow reads `required_previous`,
/// `quality_gate`, and `auto_recover`.
#[derive(Debug, Clone, Copy)]
pub struct StepConfig {
    pub step: WorkflowStep,
    pub title: &'static str,
    /// The required capability for executing this step.
    pub capability: Capability,
    pub objective: &'static str,
    pub expected_artifact: &'static str,
    pub guidance: &'static str,
    pub keywords: &'static [&'static str],
    /// Steps that must be completed before this one is ready.
    pub required_previous: &'static [WorkflowStep],
    /// Whether the critique gate must run before dispatching this step.
    pub quality_gate: bool,
    /// Whether automatic recovery applies to failures at this step.
    pub auto_recover: bool,
}

impl StepConfig {
    /// Look up the static configuration for a pipeline step.
    pub fn for_step(step: WorkflowStep) -> &'static StepConfig {
        match step {
            WorkflowStep::DefineRequirements => &DEFINE_REQUIREMENTS,
            WorkflowStep::FormalizeContracts => &FORMALIZE_CONTRACTS,
            WorkflowStep::PrototypeLogic => &PROTOTYPE_LOGIC,
            WorkflowStep::DesignArchitecture => &DESIGN_ARCHITECTURE,
            WorkflowStep::ImplementCode => &IMPLEMENT_CODE,
            WorkflowStep::ExecuteTests => &EXECUTE_TESTS,
        }
    }
}

static DEFINE_REQUIREMENTS: StepConfig = StepConfig {
    step: WorkflowStep::DefineRequirements,
    title: "Define Requirements",
    capability: Capability::Analyst,
    objective: "State what the task must achieve, for whom, and under which constraints.",
    expected_artifact: "requirements document",
    guidance: "List functional requirements, constraints, and acceptance criteria. \
               Keep each requirement testable.",
    keywords: &["requirements", "constraints", "acceptance"],
    required_previous: &[],
    quality_gate: false,
    auto_recover: true,
};

static FORMALIZE_CONTRACTS: StepConfig = StepConfig {
    step: WorkflowStep::FormalizeContracts,
    title: "Formalize Contracts",
    capability: Capability::Architect,
    objective: "Turn the requirements into precise interface contracts.",
    expected_artifact: "interface contract",
    guidance: "Define inputs, outputs, error cases, and invariants for every \
               boundary the task touches.",
    keywords: &["contract", "interface", "invariant"],
    required_previous: &[WorkflowStep::DefineRequirements],
    quality_gate: false,
    auto_recover: true,
};

static PROTOTYPE_LOGIC: StepConfig = StepConfig {
    step: WorkflowStep::PrototypeLogic,
    title: "Prototype Logic",
    capability: Capability::Coder,
    objective: "Demonstrate the core algorithm end to end, ignoring polish.",
    expected_artifact: "working prototype",
    guidance: "Favor the shortest path that proves the approach. Throwaway \
               code is acceptable here.",
    keywords: &["prototype", "algorithm", "spike"],
    required_previous: &[WorkflowStep::DefineRequirements, WorkflowStep::FormalizeContracts],
    quality_gate: false,
    auto_recover: true,
};

static DESIGN_ARCHITECTURE: StepConfig = StepConfig {
    step: WorkflowStep::DesignArchitecture,
    title: "Design Architecture",
    capability: Capability::Architect,
    objective: "Decide module boundaries, data flow, and technology choices.",
    expected_artifact: "architecture decision record",
    guidance: "Record each decision with its alternatives and the reason it won.",
    keywords: &["architecture", "module", "decision"],
    required_previous: &[
        WorkflowStep::DefineRequirements,
        WorkflowStep::FormalizeContracts,
        WorkflowStep::PrototypeLogic,
    ],
    quality_gate: true,
    auto_recover: true,
};

static IMPLEMENT_CODE: StepConfig = StepConfig {
    step: WorkflowStep::ImplementCode,
    title: "Implement Code",
    capability: Capability::Coder,
    objective: "Produce the production implementation against the contracts.",
    expected_artifact: "implementation",
    guidance: "Follow the architecture record. Commit in reviewable increments.",
    keywords: &["implement", "code", "production"],
    required_previous: &[
        WorkflowStep::DefineRequirements,
        WorkflowStep::FormalizeContracts,
        WorkflowStep::PrototypeLogic,
        WorkflowStep::DesignArchitecture,
    ],
    quality_gate: true,
    auto_recover: true,
};

static EXECUTE_TESTS: StepConfig = StepConfig {
    step: WorkflowStep::ExecuteTests,
    title: "Execute Tests",
    capability: Capability::Tester,
    objective: "Verify the implementation against the acceptance criteria.",
    expected_artifact: "test report",
    guidance: "Run the full suite, record failures verbatim, and judge whether \
               the acceptance criteria hold.",
    keywords: &["test", "verify", "report"],
    required_previous: &[
        WorkflowStep::DefineRequirements,
        WorkflowStep::FormalizeContracts,
        WorkflowStep::PrototypeLogic,
        WorkflowStep::DesignArchitecture,
        WorkflowStep::ImplementCode,
    ],
    quality_gate: true,
    auto_recover: false,
};
