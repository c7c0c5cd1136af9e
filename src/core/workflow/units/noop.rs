use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow::unit::{UnitContext, UnitOfWork, UnitResult};
use async_trait::async_trait;
use serde_json::{json, Value};

pub struct NoOpUnit;

#[async_trait]
impl UnitOfWork for NoOpUnit {
    fn name(&self) -> &str {
        "noop"
    }

    fn validate_params(&self, params: &Value) -> Result<(), AppError> {
        if !params.is_object() {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                "noop params must be an object",
            ));
        }
        Ok(())
    }

    async fn execute(&self, _input: Value, _ctx: UnitContext) -> Result<UnitResult, AppError> {
        Ok(UnitResult::output(json!({"status": "ok"})))
    }
}
