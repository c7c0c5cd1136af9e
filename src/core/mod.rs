pub mod config;
pub mod coordination;
pub mod error;
pub mod types;
pub mod workflow;

pub use config::{ConfigLoader, ConfigValidator, StatewrightConfig};
pub use coordination::{open_coordination, Coordination, CoordinationError};
pub use error::{AppError, DefaultErrorReporter, ErrorReporter};
pub use types::*;
pub use workflow::{Interpreter, RunOutcome, Services, WorkflowCatalog, WorkflowDocument};
