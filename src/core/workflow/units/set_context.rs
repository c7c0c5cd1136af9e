use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow::unit::{UnitContext, UnitOfWork, UnitResult};
use async_trait::async_trait;
use serde_json::Value;

/// Outputs `params.patch`; pair it with an output mapping to write fixed values.
pub struct SetContextUnit;

fn patch_of(params: &Value) -> Result<&Value, AppError> {
    match params.get("patch") {
        Some(patch) if patch.is_object() => Ok(patch),
        Some(_) => Err(AppError::new(
            ErrorCategory::ValidationError,
            "patch must be an object",
        )),
        None => Err(AppError::new(
            ErrorCategory::ValidationError,
            "set_context requires a patch object",
        )),
    }
}

#[async_trait]
impl UnitOfWork for SetContextUnit {
    fn name(&self) -> &str {
        "set_context"
    }

    fn validate_params(&self, params: &Value) -> Result<(), AppError> {
        patch_of(params).map(|_| ())
    }

    async fn execute(&self, _input: Value, ctx: UnitContext) -> Result<UnitResult, AppError> {
        let patch = patch_of(&ctx.params)?;
        Ok(UnitResult::output(patch.clone()))
    }
}
