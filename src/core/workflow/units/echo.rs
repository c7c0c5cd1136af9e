use crate::core::error::AppError;
use crate::core::workflow::unit::{UnitContext, UnitOfWork, UnitResult};
use async_trait::async_trait;
use serde_json::Value;

/// Returns its input unchanged. Useful for wiring tests and pure-mapping states.
pub struct EchoUnit;

#[async_trait]
impl UnitOfWork for EchoUnit {
    fn name(&self) -> &str {
        "echo"
    }

    fn validate_params(&self, _params: &Value) -> Result<(), AppError> {
        Ok(())
    }

    async fn execute(&self, input: Value, _ctx: UnitContext) -> Result<UnitResult, AppError> {
        let raw_text = match &input {
            Value::String(text) => Some(text.clone()),
            _ => None,
        };
        Ok(UnitResult {
            output: Some(input),
            raw_text,
            ..Default::default()
        })
    }
}
