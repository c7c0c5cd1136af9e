//! Structural warnings for workflow definitions.
//!
//! Hard errors are raised by `WorkflowDocument::validate` at load time. Lint rules
//! report things that are legal but probably wrong.

use crate::core::workflow::dot::build_graph;
use crate::core::workflow::schema::{StateKind, WorkflowDocument};
use petgraph::algo::has_path_connecting;
use petgraph::visit::Bfs;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

/// Diagnostic severity levels emitted by workflow lint rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LintSeverity {
    Error,
    Warning,
    Info,
}

impl LintSeverity {
    fn rank(&self) -> u8 {
        match self {
            LintSeverity::Error => 3,
            LintSeverity::Warning => 2,
            LintSeverity::Info => 1,
        }
    }
}

impl fmt::Display for LintSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LintSeverity::Error => write!(f, "error"),
            LintSeverity::Warning => write!(f, "warning"),
            LintSeverity::Info => write!(f, "info"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LintResult {
    pub code: String,
    pub severity: LintSeverity,
    pub message: String,
    /// State the finding is about.
    pub location: Option<String>,
    pub suggestion: Option<String>,
}

impl LintResult {
    fn warning(code: &str, state: &str, message: String, suggestion: &str) -> Self {
        LintResult {
            code: code.to_string(),
            severity: LintSeverity::Warning,
            message,
            location: Some(state.to_string()),
            suggestion: Some(suggestion.to_string()),
        }
    }
}

pub trait WorkflowLintRule {
    fn validate(&self, workflow: &WorkflowDocument) -> Vec<LintResult>;
}

/// States no transition or error route can reach from the initial state.
pub struct UnreachableStateRule;

impl WorkflowLintRule for UnreachableStateRule {
    fn validate(&self, workflow: &WorkflowDocument) -> Vec<LintResult> {
        let (graph, node_map) = build_graph(workflow);
        let Some(entry) = workflow.initial_state().and_then(|name| node_map.get(name)) else {
            return Vec::new();
        };
        let mut reachable = HashSet::new();
        let mut bfs = Bfs::new(&graph, *entry);
        while let Some(nx) = bfs.next(&graph) {
            reachable.insert(nx);
        }
        workflow
            .states
            .keys()
            .filter(|name| !reachable.contains(&node_map[*name]))
            .map(|name| {
                LintResult::warning(
                    "WFG-LINT-001",
                    name,
                    format!("state '{}' is unreachable from the initial state", name),
                    "remove the state or add a transition into it",
                )
            })
            .collect()
    }
}

/// Non-final states whose transitions are all conditional can fail at runtime.
pub struct MissingDefaultTransitionRule;

impl WorkflowLintRule for MissingDefaultTransitionRule {
    fn validate(&self, workflow: &WorkflowDocument) -> Vec<LintResult> {
        workflow
            .states
            .iter()
            .filter(|(_, state)| state.kind != StateKind::Final)
            .filter(|(_, state)| !state.transitions.iter().any(|t| t.is_unconditioned()))
            .map(|(name, _)| {
                LintResult::warning(
                    "WFG-LINT-002",
                    name,
                    format!(
                        "state '{}' has no unconditioned transition; an unmatched run fails",
                        name
                    ),
                    "add a final transition without `when`",
                )
            })
            .collect()
    }
}

/// States from which no final state can be reached.
pub struct NoPathToFinalRule;

impl WorkflowLintRule for NoPathToFinalRule {
    fn validate(&self, workflow: &WorkflowDocument) -> Vec<LintResult> {
        let (graph, node_map) = build_graph(workflow);
        let finals: Vec<_> = graph
            .node_indices()
            .filter(|idx| graph[*idx].kind == StateKind::Final)
            .collect();
        workflow
            .states
            .keys()
            .filter(|name| {
                let from = node_map[*name];
                !finals
                    .iter()
                    .any(|to| has_path_connecting(&graph, from, *to, None))
            })
            .map(|name| {
                LintResult::warning(
                    "WFG-LINT-003",
                    name,
                    format!("no final state is reachable from '{}'", name),
                    "add a transition that eventually leads to a final state",
                )
            })
            .collect()
    }
}

/// An unconditioned transition back into the same state loops until the step budget.
pub struct UnconditionedSelfLoopRule;

impl WorkflowLintRule for UnconditionedSelfLoopRule {
    fn validate(&self, workflow: &WorkflowDocument) -> Vec<LintResult> {
        workflow
            .states
            .iter()
            .filter(|(name, state)| {
                state
                    .transitions
                    .first()
                    .is_some_and(|t| t.is_unconditioned() && &t.to == *name)
            })
            .map(|(name, _)| {
                LintResult::warning(
                    "WFG-LINT-004",
                    name,
                    format!("state '{}' always transitions to itself", name),
                    "guard the self transition with a condition",
                )
            })
            .collect()
    }
}

/// Runs every built-in rule.
pub struct LintRegistry {
    rules: Vec<Box<dyn WorkflowLintRule>>,
}

impl LintRegistry {
    pub fn new() -> Self {
        let rules: Vec<Box<dyn WorkflowLintRule>> = vec![
            Box::new(UnreachableStateRule),
            Box::new(MissingDefaultTransitionRule),
            Box::new(NoPathToFinalRule),
            Box::new(UnconditionedSelfLoopRule),
        ];
        Self { rules }
    }

    /// Results sorted by `(severity desc, code asc, location asc)`.
    pub fn run(&self, workflow: &WorkflowDocument) -> Vec<LintResult> {
        let mut results = Vec::new();
        for rule in &self.rules {
            results.extend(rule.validate(workflow));
        }
        results.sort_by(|a, b| {
            b.severity
                .rank()
                .cmp(&a.severity.rank())
                .then(a.code.cmp(&b.code))
                .then(a.location.cmp(&b.location))
        });
        results
    }
}

impl Default for LintRegistry {
    fn default() -> Self {
        Self::new()
    }
}
