//! Plan document compiler.
//!
//! Turns a Markdown-shaped plan into a validated set of features and seeds
//! the task graph from it. The expected document shape:
//!
//! ```text
//! # Plan: Checkout revamp
//!
//! ## Overview
//! Why this work exists, a few lines of prose.
//!
//! ## Features
//!
//! ### cart-model
//! priority: high
//! capability: coder
//! description: Event-sourced cart aggregate.
//! criteria:
//! - replays to identical state
//!
//! ### checkout-flow
//! capability: coder
//! description: Rework checkout on top of the new cart.
//! depends: cart-model
//!
//! ## Decisions
//! - Carts are event-sourced.
//! ```
//!
//! Parsing is lenient about formatting (casing, unknown sections, wrapped
//! description prose) but strict about structure: a missing title, empty
//! overview, empty features section, a feature without a description or
//! capability, an unresolved dependency name, or a dependency cycle all fail
//! compilation with a reason that names the offender.

use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;

use crate::core::{DependencyKind, Feature, Priority, Task, TaskGraph, TaskId};
use crate::error::{Error, Result};
use crate::hlog_debug;
use crate::workflow::Capability;

/// Matches the `# Plan: <title>` line.
static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^#\s+plan:\s*(.+?)\s*$").unwrap());

/// Matches `## <section>` headers.
static SECTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^##\s+([^#].*?)\s*$").unwrap());

/// Matches `### <feature name>` headers inside the features section.
static FEATURE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^###\s+(.+?)\s*$").unwrap());

/// A compiled and validated plan document.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPlan {
    pub title: String,
    pub overview: String,
    pub features: Vec<Feature>,
    /// Architecture-decision bullets, carried verbatim for context priming.
    pub decisions: Vec<String>,
}

#[derive(Clone, Copy, PartialEq)]
enum Section {
    Preamble,
    Overview,
    Features,
    Decisions,
    Other,
}

impl Section {
    fn from_header(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "overview" => Section::Overview,
            "features" => Section::Features,
            "decisions" => Section::Decisions,
            _ => Section::Other,
        }
    }
}

/// Field keys recognized inside a feature block. Any other `word:` line is
/// treated as description prose, so free text may contain colons.
#[derive(Clone, Copy, PartialEq)]
enum FieldKey {
    Priority,
    Capability,
    Description,
    Depends,
    Criteria,
    Steps,
}

fn parse_field(line: &str) -> Option<(FieldKey, &str)> {
    let (key, value) = line.split_once(':')?;
    let key = match key.trim().to_lowercase().as_str() {
        "priority" => FieldKey::Priority,
        "capability" => FieldKey::Capability,
        "description" => FieldKey::Description,
        "depends" | "depends_on" => FieldKey::Depends,
        "criteria" => FieldKey::Criteria,
        "steps" => FieldKey::Steps,
        _ => return None,
    };
    Some((key, value.trim()))
}

fn parse_bullet(line: &str) -> Option<&str> {
    let item = line
        .strip_prefix("- ")
        .or_else(|| line.strip_prefix("* "))?
        .trim();
    (!item.is_empty()).then_some(item)
}

/// Which bullet list the current feature block is accumulating into.
#[derive(Clone, Copy, PartialEq)]
enum ListTarget {
    None,
    Criteria,
    Steps,
}

/// Accumulates one `### <name>` block until the next block or section.
struct FeatureDraft {
    name: String,
    priority: Priority,
    capability: Option<Capability>,
    description: String,
    depends_on: Vec<String>,
    criteria: Vec<String>,
    steps: Vec<String>,
}

impl FeatureDraft {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            priority: Priority::default(),
            capability: None,
            description: String::new(),
            depends_on: Vec::new(),
            criteria: Vec::new(),
            steps: Vec::new(),
        }
    }

    fn finish(self) -> Result<Feature> {
        if self.description.trim().is_empty() {
            return Err(Error::MalformedPlan(format!(
                "feature `{}` is missing a description",
                self.name
            )));
        }
        let capability = self.capability.ok_or_else(|| {
            Error::MalformedPlan(format!("feature `{}` is missing a capability", self.name))
        })?;
        Ok(Feature {
            name: self.name,
            priority: self.priority,
            description: self.description,
            capability,
            depends_on: self.depends_on,
            criteria: self.criteria,
            steps: self.steps,
        })
    }
}

impl ParsedPlan {
    /// Compile a plan document into a validated plan.
    ///
    /// # Errors
    /// `Error::MalformedPlan` for structural problems (missing title,
    /// overview, or features, incomplete feature blocks, unresolved or
    /// duplicate names); `Error::CircularDependency` when the feature
    /// dependency graph contains a cycle.
    pub fn compile(document: &str) -> Result<Self> {
        let mut title: Option<String> = None;
        let mut overview = String::new();
        let mut features: Vec<Feature> = Vec::new();
        let mut decisions: Vec<String> = Vec::new();

        let mut section = Section::Preamble;
        let mut draft: Option<FeatureDraft> = None;
        let mut list = ListTarget::None;

        for raw in document.lines() {
            let line = raw.trim_end();

            if title.is_none() {
                if let Some(caps) = TITLE_RE.captures(line) {
                    title = Some(caps[1].to_string());
                    continue;
                }
            }

            if let Some(caps) = SECTION_RE.captures(line) {
                if let Some(done) = draft.take() {
                    features.push(done.finish()?);
                }
                section = Section::from_header(&caps[1]);
                list = ListTarget::None;
                continue;
            }

            match section {
                Section::Overview => {
                    let text = line.trim();
                    if !text.is_empty() {
                        if !overview.is_empty() {
                            overview.push(' ');
                        }
                        overview.push_str(text);
                    }
                }
                Section::Features => {
                    if let Some(caps) = FEATURE_RE.captures(line) {
                        if let Some(done) = draft.take() {
                            features.push(done.finish()?);
                        }
                        draft = Some(FeatureDraft::named(&caps[1]));
                        list = ListTarget::None;
                    } else if let Some(current) = draft.as_mut() {
                        consume_feature_line(current, line.trim(), &mut list);
                    }
                }
                Section::Decisions => {
                    if let Some(item) = parse_bullet(line.trim()) {
                        decisions.push(item.to_string());
                    }
                }
                Section::Preamble | Section::Other => {}
            }
        }

        if let Some(done) = draft.take() {
            features.push(done.finish()?);
        }

        let title =
            title.ok_or_else(|| Error::MalformedPlan("missing `# Plan:` title line".to_string()))?;
        if overview.is_empty() {
            return Err(Error::MalformedPlan(
                "overview section is missing or empty".to_string(),
            ));
        }
        if features.is_empty() {
            return Err(Error::MalformedPlan(
                "features section is missing or empty".to_string(),
            ));
        }

        let plan = Self {
            title,
            overview,
            features,
            decisions,
        };
        plan.validate_names()?;
        plan.dependency_order()?;

        hlog_debug!(
            "Compiled plan `{}`: {} features, {} decisions",
            plan.title,
            plan.features.len(),
            plan.decisions.len()
        );
        Ok(plan)
    }

    /// Read and compile a plan document from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let document = std::fs::read_to_string(path)?;
        Self::compile(&document)
    }

    /// Every feature name must be unique and every dependency must name a
    /// declared feature.
    fn validate_names(&self) -> Result<()> {
        let mut seen: HashSet<&str> = HashSet::new();
        for feature in &self.features {
            if !seen.insert(feature.name.as_str()) {
                return Err(Error::MalformedPlan(format!(
                    "duplicate feature name `{}`",
                    feature.name
                )));
            }
        }
        for feature in &self.features {
            for dep in &feature.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(Error::MalformedPlan(format!(
                        "feature `{}` depends on unknown feature `{}`",
                        feature.name, dep
                    )));
                }
            }
        }
        Ok(())
    }

    /// Topological ordering of feature names, prerequisites first.
    ///
    /// Used for diagnostics and initial seeding only; the scheduler
    /// re-evaluates readiness from live task statuses and never trusts this
    /// static order.
    ///
    /// # Errors
    /// `Error::CircularDependency` naming the cycle path (`a -> b -> a`).
    pub fn dependency_order(&self) -> Result<Vec<String>> {
        let edges: HashMap<&str, &[String]> = self
            .features
            .iter()
            .map(|f| (f.name.as_str(), f.depends_on.as_slice()))
            .collect();

        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut path: Vec<&str> = Vec::new();
        let mut order: Vec<String> = Vec::new();

        for feature in &self.features {
            let name = feature.name.as_str();
            if marks.get(name).copied().unwrap_or(Mark::Unvisited) == Mark::Unvisited {
                visit_feature(name, &edges, &mut marks, &mut path, &mut order)?;
            }
        }
        Ok(order)
    }

    /// Materialize the plan into a graph of pending tasks plus ordering
    /// edges, one task per feature.
    pub fn seed_graph(&self, project: &str) -> Result<TaskGraph> {
        let mut graph = TaskGraph::new();
        let mut ids: HashMap<&str, TaskId> = HashMap::new();

        for feature in &self.features {
            let id = graph.add_task(Task::from_feature(feature, project));
            ids.insert(feature.name.as_str(), id);
        }
        for feature in &self.features {
            let to = ids[feature.name.as_str()];
            for dep in &feature.depends_on {
                let from = *ids.get(dep.as_str()).ok_or_else(|| {
                    Error::MalformedPlan(format!(
                        "feature `{}` depends on unknown feature `{}`",
                        feature.name, dep
                    ))
                })?;
                graph.add_dependency(&from, &to, DependencyKind::Ordering)?;
            }
        }

        hlog_debug!(
            "Seeded graph with {} tasks from plan `{}`",
            graph.task_count(),
            self.title
        );
        Ok(graph)
    }
}

fn consume_feature_line(draft: &mut FeatureDraft, line: &str, list: &mut ListTarget) {
    if line.is_empty() {
        return;
    }
    if let Some((key, value)) = parse_field(line) {
        match key {
            FieldKey::Priority => {
                draft.priority = Priority::parse(value);
                *list = ListTarget::None;
            }
            FieldKey::Capability => {
                draft.capability = Some(Capability::parse(value));
                *list = ListTarget::None;
            }
            FieldKey::Description => {
                draft.description = value.to_string();
                *list = ListTarget::None;
            }
            FieldKey::Depends => {
                draft.depends_on = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                *list = ListTarget::None;
            }
            FieldKey::Criteria => {
                *list = ListTarget::Criteria;
                if !value.is_empty() {
                    draft.criteria.push(value.to_string());
                }
            }
            FieldKey::Steps => {
                *list = ListTarget::Steps;
                if !value.is_empty() {
                    draft.steps.push(value.to_string());
                }
            }
        }
    } else if let Some(item) = parse_bullet(line) {
        match list {
            ListTarget::Criteria => draft.criteria.push(item.to_string()),
            ListTarget::Steps => draft.steps.push(item.to_string()),
            ListTarget::None => {}
        }
    } else {
        // Wrapped description prose.
        if !draft.description.is_empty() {
            draft.description.push(' ');
        }
        draft.description.push_str(line);
        *list = ListTarget::None;
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    InProgress,
    Visited,
}

fn visit_feature<'a>(
    name: &'a str,
    edges: &HashMap<&'a str, &'a [String]>,
    marks: &mut HashMap<&'a str, Mark>,
    path: &mut Vec<&'a str>,
    order: &mut Vec<String>,
) -> Result<()> {
    marks.insert(name, Mark::InProgress);
    path.push(name);

    for dep in edges.get(name).copied().unwrap_or(&[]) {
        match marks.get(dep.as_str()).copied().unwrap_or(Mark::Unvisited) {
            Mark::InProgress => {
                let start = path.iter().position(|n| *n == dep.as_str()).unwrap_or(0);
                let mut cycle: Vec<&str> = path[start..].to_vec();
                cycle.push(dep.as_str());
                return Err(Error::CircularDependency {
                    cycle: cycle.join(" -> "),
                });
            }
            Mark::Unvisited => visit_feature(dep.as_str(), edges, marks, path, order)?,
            Mark::Visited => {}
        }
    }

    path.pop();
    marks.insert(name, Mark::Visited);
    order.push(name.to_string());
    Ok(())
}
