#![allow(clippy::result_large_err)] // Interpreter returns AppError to preserve full diagnostic context; boxing would discard run-time state.

use crate::core::error::AppError;
use crate::core::types::{ErrorCategory, ExecutionStatus};
use crate::core::workflow::checkpoint::{validate_checkpoint_key, CheckpointStore};
use crate::core::workflow::expression::ExpressionEvaluator;
use crate::core::workflow::hooks::{ActionRegistry, HookContext, LifecycleHooks, NoopHooks};
use crate::core::workflow::peer::{
    collect_settled, invoke_any, invoke_settled, InProcessPeerInvoker, PeerCall, PeerInvoker,
};
use crate::core::workflow::schema::{
    CheckpointEvent, Condition, LaunchRef, PeerMode, PeerRef, StateDefinition, StateKind,
    WorkflowCatalog, WorkflowDocument,
};
use crate::core::workflow::state::{
    ErrorSummary, ExecutionSnapshot, LaunchIntent, UsageTotals, SNAPSHOT_FORMAT_VERSION,
};
use crate::core::workflow::strategy::{self, StrategyOutcome};
use crate::core::workflow::unit::{UnitContext, UnitRegistry};
use chrono::Utc;
use dashmap::DashSet;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Capabilities shared by every run of one runtime. Passed explicitly; there are no globals.
pub struct Services {
    pub catalog: WorkflowCatalog,
    pub units: UnitRegistry,
    pub actions: ActionRegistry,
    pub hooks: Arc<dyn LifecycleHooks>,
    pub store: Arc<dyn CheckpointStore>,
    /// Launches started by this process that have not finished yet.
    pub(crate) in_flight: DashSet<String>,
}

impl Services {
    pub fn new(
        catalog: WorkflowCatalog,
        units: UnitRegistry,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Services {
            catalog,
            units,
            actions: ActionRegistry::new(),
            hooks: Arc::new(NoopHooks),
            store,
            in_flight: DashSet::new(),
        }
    }

    pub fn with_actions(mut self, actions: ActionRegistry) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn LifecycleHooks>) -> Self {
        self.hooks = hooks;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Use this id instead of a generated one.
    pub execution_id: Option<String>,
    pub parent_execution_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ResumeOptions {
    /// Resume even though the workflow definition changed since the snapshot.
    pub allow_workflow_change: bool,
}

/// What a finished (or previously finished) run reports.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorSummary>,
    pub steps: u64,
    pub usage: UsageTotals,
    /// States executed by this invocation, in order. Empty for a replayed terminal snapshot.
    pub visited: Vec<String>,
}

impl RunOutcome {
    fn from_snapshot(snapshot: &ExecutionSnapshot, visited: Vec<String>) -> Self {
        RunOutcome {
            execution_id: snapshot.execution_id.clone(),
            status: snapshot.status,
            output: snapshot.final_output.clone(),
            error: snapshot.error.clone(),
            steps: snapshot.step,
            usage: snapshot.usage.clone(),
            visited,
        }
    }
}

/// Deterministic id for the launch issued by `state` at `step`, also used as the
/// launched run's execution id.
pub fn launch_intent_id(execution_id: &str, state: &str, step: u64) -> String {
    let state: String = state
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{execution_id}-{state}-{step}")
}

enum StepFlow {
    Continue,
    Done(Value),
}

/// Live state of one run. The snapshot doubles as the working copy.
struct Run {
    workflow: Arc<WorkflowDocument>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    snapshot: ExecutionSnapshot,
    /// Whether any snapshot has been written; once true a terminal one always follows.
    persisted: bool,
    started: Instant,
    visited: Vec<String>,
}

impl Run {
    fn new(workflow: Arc<WorkflowDocument>, snapshot: ExecutionSnapshot, persisted: bool) -> Self {
        let evaluator = workflow.evaluator();
        Run {
            workflow,
            evaluator,
            snapshot,
            persisted,
            started: Instant::now(),
            visited: Vec::new(),
        }
    }

    fn hook_context(&self) -> HookContext {
        HookContext {
            execution_id: self.snapshot.execution_id.clone(),
            workflow: self.snapshot.workflow_name.clone(),
            step: self.snapshot.step,
        }
    }

    fn context_mut(&mut self) -> Result<&mut Map<String, Value>, AppError> {
        self.snapshot.context.as_object_mut().ok_or_else(|| {
            AppError::new(ErrorCategory::ValidationError, "run context must be an object")
                .with_code("WFG-RUN-005")
        })
    }
}

/// Drives workflow runs state by state. Cheap to clone.
#[derive(Clone)]
pub struct Interpreter {
    services: Arc<Services>,
    peers: Arc<dyn PeerInvoker>,
}

impl Interpreter {
    pub fn new(services: Services) -> Self {
        Self::from_shared(Arc::new(services))
    }

    /// Interpreter over existing services, invoking peers in-process.
    pub fn from_shared(services: Arc<Services>) -> Self {
        let peers = Arc::new(InProcessPeerInvoker::new(services.clone()));
        Interpreter { services, peers }
    }

    pub fn with_peer_invoker(mut self, peers: Arc<dyn PeerInvoker>) -> Self {
        self.peers = peers;
        self
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Start a new run of `workflow` and drive it to a final state.
    ///
    /// The initial context is the workflow's `context` template rendered against the
    /// input, with an object input's keys laid over it. A non-object input is
    /// available as `input`.
    pub async fn start(
        &self,
        workflow: &str,
        input: Value,
        options: RunOptions,
    ) -> Result<RunOutcome, AppError> {
        let doc = self.workflow(workflow)?;
        let execution_id = options
            .execution_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        validate_checkpoint_key(&execution_id)?;
        if self.services.store.load(&execution_id).await?.is_some() {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                format!("execution '{}' already exists; resume it instead", execution_id),
            )
            .with_code("WFG-RUN-002"));
        }

        let initial = doc.initial_state().map(str::to_string).ok_or_else(|| {
            AppError::new(
                ErrorCategory::ValidationError,
                format!("workflow '{}' has no initial state", doc.name),
            )
            .with_code("WFG-VAL-001")
        })?;
        let context = initial_context(&doc, &*doc.evaluator(), input)?;
        let now = Utc::now();
        let snapshot = ExecutionSnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION.to_string(),
            execution_id: execution_id.clone(),
            workflow_name: doc.name.clone(),
            workflow_hash: doc.hash()?,
            current_state: initial,
            context,
            step: 0,
            status: ExecutionStatus::Running,
            state_in_progress: false,
            created_at: now,
            updated_at: now,
            final_output: None,
            usage: UsageTotals::default(),
            parent_execution_id: options.parent_execution_id,
            launch_intents: Vec::new(),
            error: None,
        };
        let mut run = Run::new(doc, snapshot, false);
        tracing::info!(
            execution_id = %execution_id,
            workflow = %run.workflow.name,
            parent = run.snapshot.parent_execution_id.as_deref().unwrap_or(""),
            "run started"
        );

        let hook = run.hook_context();
        if let Err(err) = self
            .services
            .hooks
            .on_run_start(&hook, &mut run.snapshot.context)
            .await
        {
            return Err(self.finish_failed(&mut run, err).await);
        }
        if let Err(err) = self.checkpoint(&mut run, CheckpointEvent::RunStart).await {
            return Err(self.finish_failed(&mut run, err).await);
        }
        self.drive(run).await
    }

    /// Continue a run from its latest snapshot.
    ///
    /// A terminal snapshot is answered from the record without executing anything.
    /// Launch intents that were recorded but never confirmed are re-issued first.
    pub async fn resume(
        &self,
        execution_id: &str,
        options: ResumeOptions,
    ) -> Result<RunOutcome, AppError> {
        let snapshot = self.snapshot(execution_id).await?.ok_or_else(|| {
            AppError::new(
                ErrorCategory::ValidationError,
                format!("no snapshot for execution '{}'", execution_id),
            )
            .with_code("WFG-RUN-003")
        })?;
        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(AppError::new(
                ErrorCategory::SerializationError,
                format!(
                    "snapshot format {} is not supported (expected {})",
                    snapshot.format_version, SNAPSHOT_FORMAT_VERSION
                ),
            )
            .with_code("WFG-CKPT-003"));
        }
        if snapshot.is_terminal() {
            tracing::info!(
                execution_id,
                status = snapshot.status.as_str(),
                "run already finished; returning recorded outcome"
            );
            return terminal_outcome(&snapshot);
        }

        let doc = self.workflow(&snapshot.workflow_name)?;
        let hash = doc.hash()?;
        if hash != snapshot.workflow_hash {
            if !options.allow_workflow_change {
                return Err(AppError::new(
                    ErrorCategory::ValidationError,
                    format!(
                        "workflow '{}' changed since execution '{}' was checkpointed",
                        doc.name, execution_id
                    ),
                )
                .with_code("WFG-RUN-004"));
            }
            tracing::warn!(execution_id, workflow = %doc.name, "resuming against a changed workflow");
        }
        if !doc.states.contains_key(&snapshot.current_state) {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                format!(
                    "snapshot state '{}' no longer exists in workflow '{}'",
                    snapshot.current_state, doc.name
                ),
            )
            .with_code("WFG-RUN-004"));
        }

        let mut run = Run::new(doc, snapshot, true);
        run.snapshot.workflow_hash = hash;
        if run.snapshot.state_in_progress {
            // The interrupted state runs again under the same step number.
            run.snapshot.step = run.snapshot.step.saturating_sub(1);
        }
        tracing::info!(
            execution_id,
            state = %run.snapshot.current_state,
            step = run.snapshot.step,
            "run resumed"
        );

        let pending: Vec<LaunchIntent> = run.snapshot.pending_intents().cloned().collect();
        for intent in pending {
            tracing::info!(execution_id, intent = %intent.id, "re-issuing unconfirmed launch");
            if let Err(err) = self.issue_launch(&mut run, &intent).await {
                return Err(self.finish_failed(&mut run, err).await);
            }
        }
        self.drive(run).await
    }

    /// The recorded outcome of a finished run, `None` while it is still running.
    pub async fn result(&self, execution_id: &str) -> Result<Option<RunOutcome>, AppError> {
        Ok(self
            .snapshot(execution_id)
            .await?
            .filter(ExecutionSnapshot::is_terminal)
            .map(|snapshot| RunOutcome::from_snapshot(&snapshot, Vec::new())))
    }

    pub async fn snapshot(&self, execution_id: &str) -> Result<Option<ExecutionSnapshot>, AppError> {
        validate_checkpoint_key(execution_id)?;
        self.services.store.load(execution_id).await
    }

    fn workflow(&self, name: &str) -> Result<Arc<WorkflowDocument>, AppError> {
        self.services.catalog.get(name).ok_or_else(|| {
            AppError::new(
                ErrorCategory::ValidationError,
                format!("unknown workflow '{}'", name),
            )
            .with_code("WFG-RUN-001")
        })
    }

    async fn drive(&self, mut run: Run) -> Result<RunOutcome, AppError> {
        loop {
            match self.advance(&mut run).await {
                Ok(StepFlow::Continue) => {}
                Ok(StepFlow::Done(output)) => return self.finish_completed(&mut run, output).await,
                Err(err) => return Err(self.finish_failed(&mut run, err).await),
            }
        }
    }

    /// Execute the current state once, routing recoverable errors.
    async fn advance(&self, run: &mut Run) -> Result<StepFlow, AppError> {
        let settings = &run.workflow.settings;
        // The recorded step never passes the ceiling.
        if run.snapshot.step >= settings.max_steps {
            return Err(AppError::new(
                ErrorCategory::StepBudgetExceeded,
                format!("step budget of {} exhausted", settings.max_steps),
            )
            .with_code("WFG-RUN-006"));
        }
        run.snapshot.step += 1;
        if let Some(limit) = settings.max_time_seconds.map(Duration::from_secs) {
            if run.started.elapsed() > limit {
                return Err(AppError::new(
                    ErrorCategory::TimeoutError,
                    format!("run exceeded max_time_seconds ({}s)", limit.as_secs()),
                )
                .with_code("WFG-RUN-007"));
            }
        }

        let workflow = run.workflow.clone();
        let name = run.snapshot.current_state.clone();
        let state = workflow.states.get(&name).ok_or_else(|| {
            AppError::new(
                ErrorCategory::TransitionError,
                format!("state '{}' does not exist", name),
            )
            .with_code("WFG-TRN-002")
        })?;
        run.visited.push(name.clone());
        tracing::debug!(
            execution_id = %run.snapshot.execution_id,
            state = %name,
            step = run.snapshot.step,
            "entering state"
        );

        let err = match self.execute_state(run, &name, state).await {
            Ok(flow) => return Ok(flow),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => err,
        };

        let target = match state.on_error.as_ref().and_then(|route| route.target_for(&err)) {
            Some(target) => Some(target.to_string()),
            None => {
                let hook = run.hook_context();
                self.services
                    .hooks
                    .on_error(&hook, &name, &err, &run.snapshot.context)
                    .await
            }
        };
        let Some(target) = target else {
            return Err(err);
        };
        if !workflow.states.contains_key(&target) {
            return Err(AppError::new(
                ErrorCategory::TransitionError,
                format!("error route from '{}' targets unknown state '{}'", name, target),
            )
            .with_code("WFG-TRN-002"));
        }

        tracing::warn!(
            execution_id = %run.snapshot.execution_id,
            state = %name,
            target = %target,
            kind = err.kind(),
            error = %err.message,
            "state failed; routing to fallback"
        );
        let record = json!({
            "kind": err.kind(),
            "category": err.category.route_key(),
            "message": err.message,
            "state": name,
        });
        run.context_mut()?.insert("error".to_string(), record);
        run.snapshot.current_state = target;
        run.snapshot.state_in_progress = false;
        self.checkpoint(run, CheckpointEvent::StateExited).await?;
        Ok(StepFlow::Continue)
    }

    /// action → launch → peer → unit → output mapping → final result or transition.
    async fn execute_state(
        &self,
        run: &mut Run,
        name: &str,
        state: &StateDefinition,
    ) -> Result<StepFlow, AppError> {
        let hooks = &self.services.hooks;
        let hook = run.hook_context();
        hooks
            .on_state_enter(&hook, name, &mut run.snapshot.context)
            .await?;
        run.snapshot.state_in_progress = true;
        self.checkpoint(run, CheckpointEvent::StateEntered).await?;

        if let Some(action) = &state.action {
            let action = self.services.actions.resolve(action)?;
            let context = action.run(run.snapshot.context.clone(), &hook).await?;
            if !context.is_object() {
                return Err(AppError::new(
                    ErrorCategory::ValidationError,
                    format!("action in state '{}' returned a non-object context", name),
                )
                .with_code("WFG-ACT-002"));
            }
            run.snapshot.context = context;
        }

        if let Some(launch) = &state.launch {
            self.launch(run, name, launch).await?;
        }

        let peer_result = match &state.peer {
            Some(peer) => Some(self.invoke_peers(run, name, peer).await?),
            None => None,
        };

        let mut unit_outcome = None;
        if let Some(unit_ref) = &state.unit {
            let unit = self.services.units.resolve(&unit_ref.unit_type)?;
            let params = run.evaluator.render(&unit_ref.params, &run.snapshot.context)?;
            unit.validate_params(&params)?;
            let input = render_or_context(&*run.evaluator, state.input.as_ref(), &run.snapshot.context)?;
            let ctx = UnitContext {
                execution_id: run.snapshot.execution_id.clone(),
                workflow: run.snapshot.workflow_name.clone(),
                state: name.to_string(),
                step: run.snapshot.step,
                params,
                context: run.snapshot.context.clone(),
            };
            let outcome = strategy::execute(&state.strategy, unit, input, ctx).await?;
            run.snapshot.usage.absorb(&outcome.usage);
            self.checkpoint(run, CheckpointEvent::UnitExecuted).await?;
            unit_outcome = Some(outcome);
        }

        apply_output(run, state, unit_outcome.as_ref(), peer_result.as_ref())?;

        if state.kind == StateKind::Final {
            let output = match &state.result {
                Some(template) => run.evaluator.render(template, &run.snapshot.context)?,
                None => run.snapshot.context.clone(),
            };
            return Ok(StepFlow::Done(output));
        }

        let mut next = select_transition(run, name, state)?;
        if let Some(redirect) = hooks
            .on_transition(&hook, name, &next, &run.snapshot.context)
            .await
        {
            if !run.workflow.states.contains_key(&redirect) {
                return Err(AppError::new(
                    ErrorCategory::TransitionError,
                    format!("transition hook redirected '{}' to unknown state '{}'", name, redirect),
                )
                .with_code("WFG-TRN-002"));
            }
            next = redirect;
        }
        hooks
            .on_state_exit(&hook, name, &mut run.snapshot.context)
            .await?;

        tracing::debug!(
            execution_id = %run.snapshot.execution_id,
            from = name,
            to = %next,
            "transition"
        );
        run.snapshot.current_state = next;
        run.snapshot.state_in_progress = false;
        self.checkpoint(run, CheckpointEvent::StateExited).await?;
        Ok(StepFlow::Continue)
    }

    async fn launch(&self, run: &mut Run, name: &str, launch: &LaunchRef) -> Result<(), AppError> {
        let id = launch_intent_id(&run.snapshot.execution_id, name, run.snapshot.step);
        let intent = match run.snapshot.intent(&id) {
            Some(existing) if existing.launched => {
                tracing::debug!(intent = %id, "launch already confirmed; skipping");
                return Ok(());
            }
            Some(existing) => existing.clone(),
            None => {
                let input = render_or_context(&*run.evaluator, launch.input.as_ref(), &run.snapshot.context)?;
                let intent = LaunchIntent {
                    id,
                    workflow: launch.workflow.clone(),
                    input,
                    launched: false,
                };
                run.snapshot.launch_intents.push(intent.clone());
                self.persist(run).await?;
                intent
            }
        };
        self.issue_launch(run, &intent).await
    }

    async fn issue_launch(&self, run: &mut Run, intent: &LaunchIntent) -> Result<(), AppError> {
        let call = PeerCall {
            workflow: intent.workflow.clone(),
            input: intent.input.clone(),
            parent_execution_id: Some(run.snapshot.execution_id.clone()),
            timeout: None,
        };
        self.peers.launch(call, &intent.id).await?;
        run.snapshot.mark_launched(&intent.id);
        self.persist(run).await?;
        tracing::info!(
            execution_id = %run.snapshot.execution_id,
            launched = %intent.id,
            workflow = %intent.workflow,
            "launched workflow"
        );
        Ok(())
    }

    async fn invoke_peers(&self, run: &Run, name: &str, peer: &PeerRef) -> Result<Value, AppError> {
        let evaluator = &*run.evaluator;
        let context = &run.snapshot.context;
        let parent = Some(run.snapshot.execution_id.clone());
        let call = |workflow: &str, input: Value, timeout_ms: Option<u64>| PeerCall {
            workflow: workflow.to_string(),
            input,
            parent_execution_id: parent.clone(),
            timeout: timeout_ms.map(Duration::from_millis),
        };

        let (keys, calls, mode, collect) = match peer {
            PeerRef::Single {
                workflow,
                input,
                timeout_ms,
            } => {
                let input = render_or_context(evaluator, input.as_ref(), context)?;
                return self.peers.invoke(call(workflow.as_str(), input, *timeout_ms)).await;
            }
            PeerRef::Many {
                workflows,
                mode,
                collect,
                input,
                timeout_ms,
            } => {
                let input = render_or_context(evaluator, input.as_ref(), context)?;
                let calls = workflows
                    .iter()
                    .map(|workflow| call(workflow.as_str(), input.clone(), *timeout_ms))
                    .collect::<Vec<_>>();
                (workflows.clone(), calls, *mode, *collect)
            }
            PeerRef::ForEach {
                foreach,
                workflow,
                alias,
                mode,
                collect,
                input,
                timeout_ms,
            } => {
                let items = match evaluator.render(&Value::String(foreach.clone()), context)? {
                    Value::Array(items) => items,
                    other => {
                        return Err(AppError::new(
                            ErrorCategory::ValidationError,
                            format!(
                                "foreach in state '{}' must evaluate to an array, got {}",
                                name, other
                            ),
                        )
                        .with_code("WFG-PEER-004"))
                    }
                };
                let mut keys = Vec::with_capacity(items.len());
                let mut calls = Vec::with_capacity(items.len());
                for (index, item) in items.into_iter().enumerate() {
                    let mut scope = context.as_object().cloned().unwrap_or_default();
                    scope.insert(alias.clone(), item);
                    let scope = Value::Object(scope);
                    let input = render_or_context(evaluator, input.as_ref(), &scope)?;
                    keys.push(index.to_string());
                    calls.push(call(workflow.as_str(), input, *timeout_ms));
                }
                (keys, calls, *mode, *collect)
            }
        };

        tracing::debug!(state = name, branches = calls.len(), ?mode, "invoking peer set");
        match mode {
            PeerMode::Settled => {
                let results = invoke_settled(&self.peers, calls).await;
                collect_settled(&keys, results, collect, name)
            }
            PeerMode::Any => {
                let (index, value) = invoke_any(self.peers.clone(), calls).await?;
                tracing::debug!(state = name, winner = %keys[index], "peer race decided");
                Ok(value)
            }
        }
    }

    async fn checkpoint(&self, run: &mut Run, event: CheckpointEvent) -> Result<(), AppError> {
        if run.workflow.settings.checkpoints_on(event) {
            self.persist(run).await?;
        }
        Ok(())
    }

    async fn persist(&self, run: &mut Run) -> Result<(), AppError> {
        run.snapshot.updated_at = Utc::now();
        self.services
            .store
            .save(&run.snapshot.execution_id, &run.snapshot)
            .await?;
        run.persisted = true;
        Ok(())
    }

    fn terminal_due(&self, run: &Run) -> bool {
        run.persisted || run.workflow.settings.checkpoints_on(CheckpointEvent::RunEnd)
    }

    async fn finish_completed(&self, run: &mut Run, mut output: Value) -> Result<RunOutcome, AppError> {
        let hook = run.hook_context();
        if let Err(err) = self.services.hooks.on_run_end(&hook, &mut output).await {
            return Err(self.finish_failed(run, err).await);
        }
        run.snapshot.status = ExecutionStatus::Completed;
        run.snapshot.state_in_progress = false;
        run.snapshot.final_output = Some(output);
        if self.terminal_due(run) {
            if let Err(err) = self.persist(run).await {
                return Err(self.finish_failed(run, err).await);
            }
        }
        tracing::info!(
            execution_id = %run.snapshot.execution_id,
            workflow = %run.snapshot.workflow_name,
            steps = run.snapshot.step,
            "run completed"
        );
        Ok(RunOutcome::from_snapshot(
            &run.snapshot,
            std::mem::take(&mut run.visited),
        ))
    }

    async fn finish_failed(&self, run: &mut Run, err: AppError) -> AppError {
        run.snapshot.status = ExecutionStatus::Failed;
        run.snapshot.state_in_progress = false;
        run.snapshot.error = Some(ErrorSummary::from_error(
            &err,
            Some(&run.snapshot.current_state),
        ));
        if self.terminal_due(run) {
            if let Err(save_err) = self.persist(run).await {
                tracing::error!(
                    execution_id = %run.snapshot.execution_id,
                    error = %save_err.message,
                    "failed to write terminal snapshot"
                );
            }
        }
        tracing::error!(
            execution_id = %run.snapshot.execution_id,
            workflow = %run.snapshot.workflow_name,
            state = %run.snapshot.current_state,
            code = %err.code,
            "run failed: {}",
            err.message
        );
        err
    }
}

fn terminal_outcome(snapshot: &ExecutionSnapshot) -> Result<RunOutcome, AppError> {
    match (&snapshot.status, &snapshot.error) {
        (ExecutionStatus::Failed, Some(summary)) => Err(summary.to_error()),
        (ExecutionStatus::Failed, None) => Err(AppError::new(
            ErrorCategory::InternalError,
            format!("execution '{}' failed", snapshot.execution_id),
        )),
        _ => Ok(RunOutcome::from_snapshot(snapshot, Vec::new())),
    }
}

fn initial_context(
    doc: &WorkflowDocument,
    evaluator: &dyn ExpressionEvaluator,
    input: Value,
) -> Result<Value, AppError> {
    let mut scope = input.as_object().cloned().unwrap_or_default();
    scope.insert("input".to_string(), input.clone());
    let rendered = evaluator.render(&doc.context, &Value::Object(scope))?;
    let Value::Object(mut context) = rendered else {
        return Err(AppError::new(
            ErrorCategory::ValidationError,
            format!("context of workflow '{}' must be an object", doc.name),
        )
        .with_code("WFG-RUN-005"));
    };
    match input {
        Value::Object(fields) => context.extend(fields),
        Value::Null => {}
        other => {
            context.insert("input".to_string(), other);
        }
    }
    Ok(Value::Object(context))
}

fn render_or_context(
    evaluator: &dyn ExpressionEvaluator,
    template: Option<&Value>,
    context: &Value,
) -> Result<Value, AppError> {
    match template {
        Some(template) => evaluator.render(template, context),
        None => Ok(context.clone()),
    }
}

/// Scope for output mapping: the context plus this state's results. The result names
/// shadow context keys of the same name.
fn mapping_scope(context: &Value, unit: Option<&StrategyOutcome>, peer: Option<&Value>) -> Value {
    let mut scope = context.as_object().cloned().unwrap_or_default();
    let output = unit.map(|o| o.output.clone()).unwrap_or(Value::Null);
    let raw_text = unit
        .and_then(|o| o.raw_text.clone())
        .map(Value::String)
        .unwrap_or(Value::Null);
    let usage = unit
        .and_then(|o| serde_json::to_value(&o.usage).ok())
        .unwrap_or(Value::Null);
    let metrics = unit
        .and_then(|o| serde_json::to_value(&o.metrics).ok())
        .unwrap_or(Value::Null);
    scope.insert("output".to_string(), output);
    scope.insert("raw_text".to_string(), raw_text);
    scope.insert("peer".to_string(), peer.cloned().unwrap_or(Value::Null));
    scope.insert("usage".to_string(), usage);
    scope.insert("metrics".to_string(), metrics);
    Value::Object(scope)
}

/// Apply the output mapping. Without one, an object result is merged into the context.
fn apply_output(
    run: &mut Run,
    state: &StateDefinition,
    unit: Option<&StrategyOutcome>,
    peer: Option<&Value>,
) -> Result<(), AppError> {
    if state.output.is_empty() {
        let primary = unit
            .map(|o| &o.output)
            .filter(|v| !v.is_null())
            .or(peer);
        if let Some(Value::Object(fields)) = primary {
            let fields = fields.clone();
            run.context_mut()?.extend(fields);
        }
        return Ok(());
    }

    let scope = mapping_scope(&run.snapshot.context, unit, peer);
    let mut rendered = Vec::with_capacity(state.output.len());
    for (key, template) in &state.output {
        rendered.push((key.clone(), run.evaluator.render(template, &scope)?));
    }
    let context = run.context_mut()?;
    for (key, value) in rendered {
        context.insert(key, value);
    }
    Ok(())
}

/// First transition whose condition holds. No match is an authoring defect.
fn select_transition(run: &Run, name: &str, state: &StateDefinition) -> Result<String, AppError> {
    for transition in &state.transitions {
        let taken = match &transition.when {
            None => true,
            Some(Condition::Bool(value)) => *value,
            Some(condition) => match condition.expression() {
                Some(expr) => run
                    .evaluator
                    .evaluate_condition(expr, &run.snapshot.context)?,
                None => false,
            },
        };
        if taken {
            return Ok(transition.to.clone());
        }
    }
    Err(AppError::new(
        ErrorCategory::TransitionError,
        format!("no transition of state '{}' matched", name),
    )
    .with_code("WFG-TRN-001"))
}
