//! Workflow interpreter: definitions, expressions, execution strategies, peer
//! invocation and checkpointed runs.

pub mod checkpoint;
pub mod dot;
pub mod executor;
pub mod expression;
pub mod hooks;
pub mod lint;
pub mod peer;
pub mod schema;
pub mod state;
pub mod strategy;
pub mod unit;
pub mod units;

pub use checkpoint::{
    open_checkpoint_store, prune_terminal, CheckpointStore, FileCheckpointStore,
    MemoryCheckpointStore,
};
pub use executor::{
    launch_intent_id, Interpreter, ResumeOptions, RunOptions, RunOutcome, Services,
};
pub use expression::{evaluator_for, ExpressionEvaluator, RhaiEvaluator, SimpleEvaluator};
pub use hooks::{Action, ActionRegistry, FnAction, HookContext, LifecycleHooks, NoopHooks};
pub use peer::{InProcessPeerInvoker, PeerCall, PeerInvoker};
pub use schema::{WorkflowCatalog, WorkflowDocument};
pub use state::{ExecutionSnapshot, LaunchIntent, UsageTotals};
pub use unit::{UnitContext, UnitOfWork, UnitRegistry, UnitRegistryBuilder, UnitResult, Usage};
