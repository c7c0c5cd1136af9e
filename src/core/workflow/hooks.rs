#![allow(clippy::result_large_err)] // Hook APIs return AppError so host failures route like any other state error.

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Identifies the run a hook or action is invoked for.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub execution_id: String,
    pub workflow: String,
    pub step: u64,
}

/// Host callbacks around a run. Every method defaults to a no-op.
///
/// Hooks that receive `&mut Value` may rewrite the context (or, for `on_run_end`, the
/// output). `on_transition` and `on_error` may redirect control by returning a state name.
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    async fn on_run_start(&self, _run: &HookContext, _context: &mut Value) -> Result<(), AppError> {
        Ok(())
    }

    async fn on_run_end(&self, _run: &HookContext, _output: &mut Value) -> Result<(), AppError> {
        Ok(())
    }

    async fn on_state_enter(
        &self,
        _run: &HookContext,
        _state: &str,
        _context: &mut Value,
    ) -> Result<(), AppError> {
        Ok(())
    }

    async fn on_state_exit(
        &self,
        _run: &HookContext,
        _state: &str,
        _context: &mut Value,
    ) -> Result<(), AppError> {
        Ok(())
    }

    /// Return `Some(state)` to take a different transition target.
    async fn on_transition(
        &self,
        _run: &HookContext,
        _from: &str,
        _to: &str,
        _context: &Value,
    ) -> Option<String> {
        None
    }

    /// Consulted after the state's own error route. Return `Some(state)` to recover there.
    async fn on_error(
        &self,
        _run: &HookContext,
        _state: &str,
        _error: &AppError,
        _context: &Value,
    ) -> Option<String> {
        None
    }
}

pub struct NoopHooks;

impl LifecycleHooks for NoopHooks {}

/// A named host side effect run at the start of a state.
#[async_trait]
pub trait Action: Send + Sync {
    /// Receives the context and returns the context to continue with.
    async fn run(&self, context: Value, run: &HookContext) -> Result<Value, AppError>;
}

/// Adapts a synchronous closure into an [`Action`].
pub struct FnAction<F>(pub F);

#[async_trait]
impl<F> Action for FnAction<F>
where
    F: Fn(Value) -> Result<Value, AppError> + Send + Sync,
{
    async fn run(&self, context: Value, _run: &HookContext) -> Result<Value, AppError> {
        (self.0)(context)
    }
}

#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, action: Arc<dyn Action>) -> &mut Self {
        self.actions.insert(name.into(), action);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Action>, AppError> {
        self.get(name).ok_or_else(|| {
            AppError::new(
                ErrorCategory::ValidationError,
                format!("unknown action '{}'", name),
            )
            .with_code("WFG-ACT-001")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn closure_actions_transform_context() {
        let mut registry = ActionRegistry::new();
        registry.register(
            "bump",
            Arc::new(FnAction(|mut ctx: Value| {
                let n = ctx["n"].as_i64().unwrap_or(0);
                ctx["n"] = json!(n + 1);
                Ok::<Value, AppError>(ctx)
            })),
        );
        let run = HookContext {
            execution_id: "e".into(),
            workflow: "w".into(),
            step: 1,
        };
        let action = registry.resolve("bump").unwrap();
        assert_eq!(action.run(json!({"n": 1}), &run).await.unwrap(), json!({"n": 2}));
        assert!(registry.resolve("missing").is_err());
    }

    #[tokio::test]
    async fn default_hooks_do_not_redirect() {
        let hooks = NoopHooks;
        let run = HookContext {
            execution_id: "e".into(),
            workflow: "w".into(),
            step: 1,
        };
        assert!(hooks.on_transition(&run, "a", "b", &json!({})).await.is_none());
        let err = AppError::new(ErrorCategory::UnitExecutionError, "x");
        assert!(hooks.on_error(&run, "a", &err, &json!({})).await.is_none());
    }
}
