use serde::{Deserialize, Serialize};

/// Error category enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    ValidationError,
    UnitExecutionError,
    TimeoutError,
    StepBudgetExceeded,
    TransitionError,
    PeerInvocationError,
    PersistenceError,
    SerializationError,
    IoError,
    CoordinationError,
    InternalError,
    Unknown,
}

impl ErrorCategory {
    /// Key used by state error routes to select a fallback for this category.
    pub fn route_key(&self) -> &'static str {
        match self {
            ErrorCategory::ValidationError => "validation",
            ErrorCategory::UnitExecutionError => "unit_execution",
            ErrorCategory::TimeoutError => "timeout",
            ErrorCategory::StepBudgetExceeded => "step_budget",
            ErrorCategory::TransitionError => "transition",
            ErrorCategory::PeerInvocationError => "peer_invocation",
            ErrorCategory::PersistenceError => "persistence",
            ErrorCategory::SerializationError => "serialization",
            ErrorCategory::IoError => "io",
            ErrorCategory::CoordinationError => "coordination",
            ErrorCategory::InternalError => "internal",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Fatal categories terminate a run without consulting error routes.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorCategory::StepBudgetExceeded
                | ErrorCategory::TransitionError
                | ErrorCategory::PersistenceError
        )
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Error severity enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Fatal,
    Error,
    Warning,
    Info,
}

/// Execution status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    #[default]
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}
