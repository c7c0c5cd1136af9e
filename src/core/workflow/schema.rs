#![allow(clippy::result_large_err)] // Workflow schema APIs return AppError to preserve structured validation context without boxing.

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow::expression::{evaluator_for, placeholder_regex, ExpressionEvaluator};
use crate::core::workflow::state::compute_sha256_hex;
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

fn default_context_value() -> Value {
    Value::Object(Map::new())
}

fn default_params_value() -> Value {
    Value::Object(Map::new())
}

fn default_max_steps() -> u64 {
    100
}

fn default_checkpoint_events() -> Vec<CheckpointEvent> {
    vec![
        CheckpointEvent::RunStart,
        CheckpointEvent::StateExited,
        CheckpointEvent::RunEnd,
    ]
}

fn default_item_alias() -> String {
    "item".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpressionLanguage {
    #[default]
    Rhai,
    Simple,
}

/// Points in a run at which a snapshot is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointEvent {
    RunStart,
    StateEntered,
    UnitExecuted,
    StateExited,
    RunEnd,
}

/// Root document for a workflow definition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowDocument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_context_value")]
    pub context: Value,
    #[serde(default)]
    pub settings: WorkflowSettings,
    pub states: IndexMap<String, StateDefinition>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowSettings {
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,
    #[serde(default)]
    pub max_time_seconds: Option<u64>,
    #[serde(default = "default_checkpoint_events")]
    pub checkpoint_events: Vec<CheckpointEvent>,
    #[serde(default)]
    pub expression_language: ExpressionLanguage,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        WorkflowSettings {
            max_steps: default_max_steps(),
            max_time_seconds: None,
            checkpoint_events: default_checkpoint_events(),
            expression_language: ExpressionLanguage::default(),
        }
    }
}

impl WorkflowSettings {
    pub fn checkpoints_on(&self, event: CheckpointEvent) -> bool {
        self.checkpoint_events.contains(&event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    Initial,
    #[default]
    Normal,
    Final,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StateDefinition {
    #[serde(default)]
    pub kind: StateKind,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub launch: Option<LaunchRef>,
    #[serde(default)]
    pub peer: Option<PeerRef>,
    #[serde(default)]
    pub unit: Option<UnitRef>,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub output: IndexMap<String, Value>,
    #[serde(default)]
    pub on_error: Option<ErrorRoute>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    #[serde(default)]
    pub result: Option<Value>,
}

/// Reference to a registered unit of work.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UnitRef {
    #[serde(rename = "type")]
    pub unit_type: String,
    #[serde(default = "default_params_value")]
    pub params: Value,
}

/// Fire-and-forget launch of another workflow.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LaunchRef {
    pub workflow: String,
    #[serde(default)]
    pub input: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerMode {
    #[default]
    Settled,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectMode {
    #[default]
    List,
    Map,
}

/// Blocking peer invocation: one workflow, a fixed set, or one per array element.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PeerRef {
    ForEach {
        foreach: String,
        workflow: String,
        #[serde(rename = "as", default = "default_item_alias")]
        alias: String,
        #[serde(default)]
        mode: PeerMode,
        #[serde(default)]
        collect: CollectMode,
        #[serde(default)]
        input: Option<Value>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Many {
        workflows: Vec<String>,
        #[serde(default)]
        mode: PeerMode,
        #[serde(default)]
        collect: CollectMode,
        #[serde(default)]
        input: Option<Value>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Single {
        workflow: String,
        #[serde(default)]
        input: Option<Value>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
}

impl PeerRef {
    /// Every workflow name this reference can invoke.
    pub fn targets(&self) -> Vec<&str> {
        match self {
            PeerRef::ForEach { workflow, .. } | PeerRef::Single { workflow, .. } => {
                vec![workflow.as_str()]
            }
            PeerRef::Many { workflows, .. } => workflows.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyConfig {
    #[default]
    Single,
    Retry {
        delays_ms: Vec<u64>,
        #[serde(default)]
        jitter: f64,
    },
    Parallel {
        samples: usize,
    },
    Voting(VotingConfig),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct VotingConfig {
    pub k_margin: usize,
    pub max_candidates: usize,
    /// Vote on this field of the output instead of the whole value.
    #[serde(default)]
    pub field: Option<String>,
    /// Candidates whose text does not match are red-flagged.
    #[serde(default)]
    pub pattern: Option<String>,
    /// Candidates whose canonical text is longer are red-flagged.
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub case_insensitive: bool,
}

impl StrategyConfig {
    pub fn validate(&self, state: &str) -> Result<(), AppError> {
        let problem = match self {
            StrategyConfig::Single => None,
            StrategyConfig::Retry { jitter, .. } if !(0.0..=1.0).contains(jitter) => {
                Some("retry.jitter must be within 0..=1".to_string())
            }
            StrategyConfig::Retry { .. } => None,
            StrategyConfig::Parallel { samples } if *samples == 0 => {
                Some("parallel.samples must be >= 1".to_string())
            }
            StrategyConfig::Parallel { .. } => None,
            StrategyConfig::Voting(voting) => {
                if voting.k_margin == 0 {
                    Some("voting.k_margin must be >= 1".to_string())
                } else if voting.max_candidates == 0 {
                    Some("voting.max_candidates must be >= 1".to_string())
                } else if let Some(pattern) = &voting.pattern {
                    Regex::new(pattern)
                        .err()
                        .map(|e| format!("voting.pattern does not compile: {e}"))
                } else {
                    None
                }
            }
        };
        match problem {
            Some(message) => Err(validation_error(format!("state '{state}': {message}"))),
            None => Ok(()),
        }
    }
}

/// Where a failed state goes instead of terminating the run.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ErrorRoute {
    Fallback(String),
    ByKind(IndexMap<String, String>),
}

impl ErrorRoute {
    /// Resolve the fallback for an error: explicit kind, then category key, then `default`.
    pub fn target_for(&self, error: &AppError) -> Option<&str> {
        match self {
            ErrorRoute::Fallback(target) => Some(target.as_str()),
            ErrorRoute::ByKind(routes) => routes
                .get(error.kind())
                .or_else(|| routes.get(error.category.route_key()))
                .or_else(|| routes.get("default"))
                .map(String::as_str),
        }
    }

    pub fn targets(&self) -> Vec<&str> {
        match self {
            ErrorRoute::Fallback(target) => vec![target.as_str()],
            ErrorRoute::ByKind(routes) => routes.values().map(String::as_str).collect(),
        }
    }
}

/// Transition between states.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Transition {
    pub to: String,
    #[serde(default)]
    pub when: Option<Condition>,
    #[serde(default)]
    pub label: Option<String>,
}

impl Transition {
    pub fn is_unconditioned(&self) -> bool {
        matches!(self.when, None | Some(Condition::Bool(true)))
    }
}

/// Condition guarding a transition.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Condition {
    Bool(bool),
    Text(String),
    Expr {
        #[serde(rename = "$expr")]
        expr: String,
    },
}

impl Condition {
    pub fn expression(&self) -> Option<&str> {
        match self {
            Condition::Text(expr) | Condition::Expr { expr } => Some(expr.as_str()),
            Condition::Bool(_) => None,
        }
    }
}

fn validation_error(message: impl Into<String>) -> AppError {
    AppError::new(ErrorCategory::ValidationError, message).with_code("WFG-VAL-001")
}

impl WorkflowDocument {
    /// Load and validate a workflow document from a YAML file.
    pub fn load_from_file(path: &Path) -> Result<Self, AppError> {
        let text = fs::read_to_string(path).map_err(|err| {
            AppError::new(
                ErrorCategory::IoError,
                format!("failed to read {}: {}", path.display(), err),
            )
        })?;
        Self::from_yaml_str(&text).map_err(|mut err| {
            err.add_context("path", &path.display().to_string());
            err
        })
    }

    /// Parse and validate a workflow document from YAML text.
    pub fn from_yaml_str(text: &str) -> Result<Self, AppError> {
        let doc: WorkflowDocument = serde_yaml::from_str(text).map_err(|err| {
            AppError::new(
                ErrorCategory::ValidationError,
                format!("failed to parse workflow: {}", err),
            )
            .with_code("WFG-PARSE-001")
        })?;
        doc.validate()?;
        Ok(doc)
    }

    pub fn evaluator(&self) -> Arc<dyn ExpressionEvaluator> {
        evaluator_for(self.settings.expression_language)
    }

    /// Name of the single initial state. Valid only after `validate`.
    pub fn initial_state(&self) -> Option<&str> {
        self.states
            .iter()
            .find(|(_, state)| state.kind == StateKind::Initial)
            .map(|(name, _)| name.as_str())
    }

    /// Digest of the canonical definition, stored in snapshots to detect edits between runs.
    pub fn hash(&self) -> Result<String, AppError> {
        let bytes = serde_json::to_vec(self).map_err(|err| {
            AppError::new(
                ErrorCategory::SerializationError,
                format!("failed to serialize workflow {}: {}", self.name, err),
            )
        })?;
        Ok(compute_sha256_hex(&bytes))
    }

    /// Validate the workflow document against schema requirements.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.name.trim().is_empty() {
            return Err(validation_error("workflow name must not be empty"));
        }
        if self.states.is_empty() {
            return Err(validation_error("workflow must define at least one state"));
        }
        if self.settings.max_steps == 0 {
            return Err(validation_error("settings.max_steps must be >= 1"));
        }
        if self.settings.max_time_seconds == Some(0) {
            return Err(validation_error("settings.max_time_seconds must be >= 1"));
        }

        let initial: Vec<&String> = self
            .states
            .iter()
            .filter(|(_, state)| state.kind == StateKind::Initial)
            .map(|(name, _)| name)
            .collect();
        if initial.len() != 1 {
            return Err(validation_error(format!(
                "workflow must have exactly one initial state, found {}",
                initial.len()
            )));
        }

        let mut exprs = Vec::new();
        collect_expression_strings(&self.context, &mut exprs);
        for (name, state) in &self.states {
            let unknown = |target: &str, what: &str| {
                validation_error(format!(
                    "state '{}' {} references unknown state '{}'",
                    name, what, target
                ))
            };

            if state.kind == StateKind::Final && !state.transitions.is_empty() {
                return Err(validation_error(format!(
                    "final state '{}' must not declare transitions",
                    name
                )));
            }
            if state.kind != StateKind::Final && state.transitions.is_empty() {
                return Err(validation_error(format!(
                    "state '{}' has no transitions and is not final",
                    name
                )));
            }
            for transition in &state.transitions {
                if !self.states.contains_key(&transition.to) {
                    return Err(unknown(&transition.to, "transition"));
                }
                if let Some(expr) = transition.when.as_ref().and_then(Condition::expression) {
                    exprs.push(expr.to_string());
                }
            }
            if let Some(route) = &state.on_error {
                for target in route.targets() {
                    if !self.states.contains_key(target) {
                        return Err(unknown(target, "on_error"));
                    }
                }
            }
            if let Some(unit) = &state.unit {
                if unit.unit_type.trim().is_empty() {
                    return Err(validation_error(format!(
                        "state '{}' has an empty unit type",
                        name
                    )));
                }
                collect_expression_strings(&unit.params, &mut exprs);
            }
            match &state.peer {
                Some(PeerRef::ForEach { foreach, .. }) => {
                    collect_expression_strings(&Value::String(foreach.clone()), &mut exprs);
                }
                Some(PeerRef::Many {
                    workflows,
                    collect: CollectMode::Map,
                    ..
                }) => {
                    // Map results are keyed by workflow name.
                    let mut seen = HashSet::new();
                    if let Some(dup) = workflows.iter().find(|w| !seen.insert(w.as_str())) {
                        return Err(validation_error(format!(
                            "state '{}': peer workflows list '{}' more than once with collect: map",
                            name, dup
                        )));
                    }
                }
                _ => {}
            }
            state.strategy.validate(name)?;

            for template in state
                .input
                .iter()
                .chain(state.output.values())
                .chain(state.result.iter())
                .chain(state.launch.iter().filter_map(|l| l.input.as_ref()))
            {
                collect_expression_strings(template, &mut exprs);
            }
        }

        let evaluator = self.evaluator();
        for expr in exprs {
            evaluator.check(&expr)?;
        }
        Ok(())
    }
}

/// Gather `$expr` objects and `{{ }}` placeholders so they can be compile-checked up front.
fn collect_expression_strings(value: &Value, expressions: &mut Vec<String>) {
    match value {
        Value::String(text) => {
            for caps in placeholder_regex().captures_iter(text) {
                if let Some(expr) = caps.get(1) {
                    expressions.push(expr.as_str().to_string());
                }
            }
        }
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(Value::String(expr)) = map.get("$expr") {
                    expressions.push(expr.clone());
                    return;
                }
            }
            for child in map.values() {
                collect_expression_strings(child, expressions);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_expression_strings(item, expressions);
            }
        }
        _ => {}
    }
}

/// Named workflow definitions available to a runtime, for peers and launches.
#[derive(Debug, Clone, Default)]
pub struct WorkflowCatalog {
    workflows: HashMap<String, Arc<WorkflowDocument>>,
}

impl WorkflowCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, workflow: WorkflowDocument) -> Arc<WorkflowDocument> {
        let workflow = Arc::new(workflow);
        self.workflows
            .insert(workflow.name.clone(), workflow.clone());
        workflow
    }

    pub fn get(&self, name: &str) -> Option<Arc<WorkflowDocument>> {
        self.workflows.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.workflows.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Load every `*.yaml` / `*.yml` file in a directory. A missing directory is empty.
    pub fn load_dir(dir: &Path) -> Result<Self, AppError> {
        let mut catalog = WorkflowCatalog::new();
        if !dir.exists() {
            return Ok(catalog);
        }
        let mut paths: Vec<_> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|ext| ext.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .collect();
        paths.sort();
        for path in paths {
            let doc = WorkflowDocument::load_from_file(&path)?;
            if catalog.get(&doc.name).is_some() {
                return Err(validation_error(format!(
                    "duplicate workflow name '{}' in {}",
                    doc.name,
                    path.display()
                )));
            }
            catalog.insert(doc);
        }
        Ok(catalog)
    }

    /// Check that every peer and launch target resolves to a known workflow.
    pub fn check_references(&self) -> Result<(), AppError> {
        for workflow in self.workflows.values() {
            for (name, state) in &workflow.states {
                let launch_target = state.launch.as_ref().map(|l| l.workflow.as_str());
                let peer_targets = state.peer.as_ref().map(PeerRef::targets).unwrap_or_default();
                for target in peer_targets.into_iter().chain(launch_target) {
                    if self.get(target).is_none() {
                        return Err(validation_error(format!(
                            "workflow '{}' state '{}' references unknown workflow '{}'",
                            workflow.name, name, target
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const REVIEW: &str = r#"
name: review
context: { score: 0 }
states:
  start:
    kind: initial
    transitions:
      - to: check
  check:
    on_error: { timeout: start, default: done }
    transitions:
      - when: "score >= 8"
        to: done
      - to: start
  done:
    kind: final
    result: { score: "{{ score }}" }
"#;

    #[test]
    fn parses_and_validates_review_workflow() {
        let doc = WorkflowDocument::from_yaml_str(REVIEW).unwrap();
        assert_eq!(doc.initial_state(), Some("start"));
        assert_eq!(doc.settings.max_steps, 100);
        let names: Vec<&str> = doc.states.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["start", "check", "done"]);
        assert!(doc.states["check"].transitions[1].is_unconditioned());
    }

    #[test]
    fn error_route_prefers_kind_then_category_then_default() {
        let doc = WorkflowDocument::from_yaml_str(REVIEW).unwrap();
        let route = doc.states["check"].on_error.as_ref().unwrap();
        let timeout = AppError::new(ErrorCategory::TimeoutError, "slow");
        assert_eq!(route.target_for(&timeout), Some("start"));
        let boom = AppError::new(ErrorCategory::UnitExecutionError, "boom");
        assert_eq!(route.target_for(&boom), Some("done"));
        let kinded = AppError::new(ErrorCategory::UnitExecutionError, "slow").with_kind("timeout");
        assert_eq!(route.target_for(&kinded), Some("start"));
    }

    #[test]
    fn rejects_unknown_transition_target() {
        let text = REVIEW.replace("to: done", "to: nowhere");
        let err = WorkflowDocument::from_yaml_str(&text).unwrap_err();
        assert!(err.message.contains("nowhere"));
    }

    #[test]
    fn rejects_two_initial_states() {
        let text = REVIEW.replace("  check:\n", "  check:\n    kind: initial\n");
        assert!(WorkflowDocument::from_yaml_str(&text).is_err());
    }

    #[test]
    fn rejects_bad_condition_and_voting_parameters() {
        let text = REVIEW.replace("score >= 8", "score >= ");
        assert!(WorkflowDocument::from_yaml_str(&text).is_err());

        let voting = StrategyConfig::Voting(VotingConfig {
            k_margin: 0,
            max_candidates: 5,
            field: None,
            pattern: None,
            max_length: None,
            case_insensitive: false,
        });
        assert!(voting.validate("s").is_err());
    }

    #[test]
    fn parses_peer_forms() {
        let single: PeerRef = serde_yaml::from_str("workflow: child").unwrap();
        assert!(matches!(single, PeerRef::Single { .. }));
        let many: PeerRef = serde_yaml::from_str("workflows: [a, b]\nmode: any").unwrap();
        assert!(matches!(many, PeerRef::Many { mode: PeerMode::Any, .. }));
        let each: PeerRef =
            serde_yaml::from_str("foreach: \"{{ items }}\"\nworkflow: child\nas: doc").unwrap();
        match each {
            PeerRef::ForEach { alias, collect, .. } => {
                assert_eq!(alias, "doc");
                assert_eq!(collect, CollectMode::List);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn map_collected_peers_need_distinct_workflows() {
        let doc = |collect: &str| {
            format!(
                "name: fan\nstates:\n  start:\n    kind: initial\n    peer:\n      workflows: [a, b, a]\n      collect: {collect}\n    transitions:\n      - to: done\n  done:\n    kind: final\n"
            )
        };
        let err = WorkflowDocument::from_yaml_str(&doc("map")).unwrap_err();
        assert!(err.message.contains("'a' more than once"));
        assert!(WorkflowDocument::from_yaml_str(&doc("list")).is_ok());
    }

    #[test]
    fn parses_strategy_kinds() {
        let retry: StrategyConfig =
            serde_yaml::from_str("kind: retry\ndelays_ms: [10, 20]\njitter: 0.5").unwrap();
        assert_eq!(
            retry,
            StrategyConfig::Retry {
                delays_ms: vec![10, 20],
                jitter: 0.5
            }
        );
        let voting: StrategyConfig =
            serde_yaml::from_str("kind: voting\nk_margin: 2\nmax_candidates: 7").unwrap();
        assert!(matches!(voting, StrategyConfig::Voting(VotingConfig { k_margin: 2, .. })));
    }

    #[test]
    fn hash_changes_with_definition() {
        let a = WorkflowDocument::from_yaml_str(REVIEW).unwrap();
        let mut b = a.clone();
        assert_eq!(a.hash().unwrap(), b.hash().unwrap());
        b.context = json!({"score": 1});
        assert_ne!(a.hash().unwrap(), b.hash().unwrap());
    }

    #[test]
    fn collects_exprs_from_nested_values() {
        let value = json!({
            "foo": {"$expr": "1 + 2"},
            "bar": [{"baz": "x {{ a.b }} y {{ c }}"}, 42]
        });
        let mut exprs = Vec::new();
        collect_expression_strings(&value, &mut exprs);
        exprs.sort();
        assert_eq!(exprs, vec!["1 + 2", "a.b", "c"]);
    }
}
