#![allow(clippy::result_large_err)] // Unit trait and registry return AppError directly for structured diagnostics without boxing.

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow::units::{CommandUnit, EchoUnit, NoOpUnit, SetContextUnit};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Failure reported in-band by an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitError {
    pub kind: String,
    pub message: String,
}

/// What a unit of work hands back. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitResult {
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub raw_text: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub cost: Option<f64>,
    #[serde(default)]
    pub error: Option<UnitError>,
}

impl UnitResult {
    pub fn output(value: Value) -> Self {
        UnitResult {
            output: Some(value),
            ..Default::default()
        }
    }

    pub fn failure(kind: impl Into<String>, message: impl Into<String>) -> Self {
        UnitResult {
            error: Some(UnitError {
                kind: kind.into(),
                message: message.into(),
            }),
            ..Default::default()
        }
    }

    /// Turn an in-band `error` into an `AppError` carrying the executor's kind.
    pub fn into_result(self, unit: &str) -> Result<UnitResult, AppError> {
        match &self.error {
            Some(error) => Err(AppError::new(
                ErrorCategory::UnitExecutionError,
                format!("unit '{}' failed: {}", unit, error.message),
            )
            .with_code("WFG-UNIT-001")
            .with_kind(error.kind.clone())),
            None => Ok(self),
        }
    }

    /// The value voted on or mapped: parsed output, else raw text.
    pub fn value(&self) -> Value {
        match (&self.output, &self.raw_text) {
            (Some(output), _) => output.clone(),
            (None, Some(text)) => Value::String(text.clone()),
            (None, None) => Value::Null,
        }
    }
}

/// Execution context provided to each unit call.
#[derive(Debug, Clone)]
pub struct UnitContext {
    pub execution_id: String,
    pub workflow: String,
    pub state: String,
    pub step: u64,
    /// `params` rendered against the run context.
    pub params: Value,
    pub context: Value,
}

/// Trait implemented by units of work: the opaque "do this call" capability.
#[async_trait]
pub trait UnitOfWork: Send + Sync + 'static {
    /// Type tag used in workflow definitions.
    fn name(&self) -> &str;

    /// Validate params ahead of execution.
    fn validate_params(&self, params: &Value) -> Result<(), AppError>;

    async fn execute(&self, input: Value, ctx: UnitContext) -> Result<UnitResult, AppError>;
}

/// Builder used to register units before execution.
#[derive(Default)]
pub struct UnitRegistryBuilder {
    units: HashMap<String, Arc<dyn UnitOfWork>>,
}

impl UnitRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: UnitOfWork>(&mut self, unit: T) -> Result<&mut Self, AppError> {
        self.register_shared(Arc::new(unit))
    }

    pub fn register_shared(&mut self, unit: Arc<dyn UnitOfWork>) -> Result<&mut Self, AppError> {
        let name = unit.name().to_string();
        if self.units.contains_key(&name) {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                format!("duplicate unit registered: {}", name),
            )
            .with_code("WFG-UNIT-002"));
        }
        self.units.insert(name, unit);
        Ok(self)
    }

    /// `noop`, `echo`, `set_context` and `command`.
    pub fn with_builtins(workspace_root: PathBuf) -> Result<Self, AppError> {
        let mut builder = Self::new();
        builder
            .register(NoOpUnit)?
            .register(EchoUnit)?
            .register(SetContextUnit)?
            .register(CommandUnit::new(workspace_root))?;
        Ok(builder)
    }

    pub fn build(self) -> UnitRegistry {
        UnitRegistry {
            inner: Arc::new(self.units),
        }
    }
}

/// Immutable registry available during workflow execution.
#[derive(Clone, Default)]
pub struct UnitRegistry {
    inner: Arc<HashMap<String, Arc<dyn UnitOfWork>>>,
}

impl UnitRegistry {
    pub fn builder() -> UnitRegistryBuilder {
        UnitRegistryBuilder::new()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn UnitOfWork>> {
        self.inner.get(name).cloned()
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn UnitOfWork>, AppError> {
        self.get(name).ok_or_else(|| {
            AppError::new(
                ErrorCategory::ValidationError,
                format!("unknown unit type '{}'", name),
            )
            .with_code("WFG-UNIT-003")
        })
    }
}
