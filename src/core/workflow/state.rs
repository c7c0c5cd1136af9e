use crate::core::error::AppError;
use crate::core::types::{ErrorCategory, ExecutionStatus};
use crate::core::workflow::unit::Usage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Version embedded in persisted snapshots.
pub const SNAPSHOT_FORMAT_VERSION: &str = "1";

/// Accumulated usage for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub calls: u64,
    pub cost: f64,
}

impl UsageTotals {
    pub fn record(&mut self, usage: Option<&Usage>, cost: Option<f64>) {
        self.calls += 1;
        if let Some(usage) = usage {
            self.input_tokens += usage.input_tokens;
            self.output_tokens += usage.output_tokens;
        }
        self.cost += cost.unwrap_or(0.0);
    }

    pub fn absorb(&mut self, other: &UsageTotals) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.calls += other.calls;
        self.cost += other.cost;
    }
}

/// A fire-and-forget launch recorded before it is handed to the peer invoker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchIntent {
    /// Execution id the launched run will use. Also the idempotency key.
    pub id: String,
    pub workflow: String,
    pub input: Value,
    pub launched: bool,
}

/// Simplified summary of errors persisted to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub code: String,
    pub category: ErrorCategory,
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub state: Option<String>,
}

impl ErrorSummary {
    pub fn from_error(error: &AppError, state: Option<&str>) -> Self {
        ErrorSummary {
            code: error.code.clone(),
            category: error.category,
            kind: error.kind().to_string(),
            message: error.message.clone(),
            state: state.map(str::to_string),
        }
    }

    /// Rebuild an error for a run whose failure was already recorded.
    pub fn to_error(&self) -> AppError {
        let mut error = AppError::new(self.category, self.message.clone())
            .with_code(self.code.clone())
            .with_kind(self.kind.clone());
        if let Some(state) = &self.state {
            error.add_context("state", state);
        }
        error
    }
}

/// Durable capture of a run, sufficient to resume it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub format_version: String,
    pub execution_id: String,
    pub workflow_name: String,
    pub workflow_hash: String,
    pub current_state: String,
    pub context: Value,
    pub step: u64,
    pub status: ExecutionStatus,
    /// Set while the snapshot was taken inside `current_state`; resume re-enters it.
    #[serde(default)]
    pub state_in_progress: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub final_output: Option<Value>,
    #[serde(default)]
    pub usage: UsageTotals,
    #[serde(default)]
    pub parent_execution_id: Option<String>,
    #[serde(default)]
    pub launch_intents: Vec<LaunchIntent>,
    #[serde(default)]
    pub error: Option<ErrorSummary>,
}

impl ExecutionSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn pending_intents(&self) -> impl Iterator<Item = &LaunchIntent> {
        self.launch_intents.iter().filter(|intent| !intent.launched)
    }

    pub fn intent(&self, id: &str) -> Option<&LaunchIntent> {
        self.launch_intents.iter().find(|intent| intent.id == id)
    }

    pub fn mark_launched(&mut self, id: &str) {
        if let Some(intent) = self.launch_intents.iter_mut().find(|i| i.id == id) {
            intent.launched = true;
        }
    }
}

pub fn compute_sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_totals_accumulate() {
        let mut totals = UsageTotals::default();
        totals.record(
            Some(&Usage {
                input_tokens: 10,
                output_tokens: 4,
            }),
            Some(0.5),
        );
        totals.record(None, None);
        assert_eq!(totals.calls, 2);
        assert_eq!(totals.input_tokens, 10);
        assert_eq!(totals.output_tokens, 4);
        assert_eq!(totals.cost, 0.5);
    }

    #[test]
    fn error_summary_round_trips_kind() {
        let error = AppError::new(ErrorCategory::UnitExecutionError, "rate limited")
            .with_code("WFG-UNIT-001")
            .with_kind("rate_limit");
        let summary = ErrorSummary::from_error(&error, Some("call"));
        let rebuilt = summary.to_error();
        assert_eq!(rebuilt.kind(), "rate_limit");
        assert_eq!(rebuilt.code, "WFG-UNIT-001");
        assert_eq!(rebuilt.context.get("state").map(String::as_str), Some("call"));
    }

    #[test]
    fn sha256_is_hex() {
        assert_eq!(
            compute_sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
