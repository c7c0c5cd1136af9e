use clap::{Args, Subcommand};
use std::path::PathBuf;

/// Workspace selection shared by every subcommand.
#[derive(Args, Clone, Debug)]
pub struct WorkspaceArgs {
    /// Workspace holding statewright.toml and .statewright/ (default: current directory)
    #[arg(long, value_name = "DIR", global = true)]
    pub workspace: Option<PathBuf>,
}

#[derive(Args)]
pub struct RunArgs {
    /// Workflow document to execute (YAML)
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// JSON input passed to the initial context
    #[arg(long, value_name = "JSON")]
    pub input: Option<String>,

    /// Use this execution id instead of generating one
    #[arg(long, value_name = "ID")]
    pub execution_id: Option<String>,

    /// Print the full run outcome as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct ResumeArgs {
    /// Execution id of a checkpointed run
    #[arg(value_name = "ID")]
    pub execution_id: String,

    /// Workflow documents to load in addition to the workspace workflows directory
    #[arg(long = "workflow", value_name = "FILE")]
    pub workflows: Vec<PathBuf>,

    /// Resume even if the workflow definition changed since the snapshot
    #[arg(long)]
    pub allow_workflow_change: bool,

    /// Print the full run outcome as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct LintArgs {
    /// Workflow document to check
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Emit findings as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct DotArgs {
    /// Workflow document to render
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Write the DOT graph here instead of stdout
    #[arg(long, short, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

#[derive(Args)]
pub struct CheckpointsArgs {
    #[command(subcommand)]
    pub command: CheckpointsCommand,
}

#[derive(Subcommand)]
pub enum CheckpointsCommand {
    /// List stored execution ids
    List {
        /// Only ids starting with this prefix
        #[arg(long, value_name = "PREFIX")]
        prefix: Option<String>,
    },
    /// Print one snapshot as JSON
    Show {
        #[arg(value_name = "ID")]
        execution_id: String,
    },
    /// Delete terminal snapshots older than a duration such as 7d or 12h
    Prune {
        #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
        older_than: std::time::Duration,
    },
}

#[derive(Args)]
pub struct PoolArgs {
    #[command(subcommand)]
    pub command: PoolCommand,
}

#[derive(Subcommand)]
pub enum PoolCommand {
    /// Add a work item. The payload names a workflow and its input.
    Push {
        /// JSON payload, e.g. '{"workflow":"review","input":{}}'
        #[arg(long, value_name = "JSON")]
        payload: String,

        /// Failure budget before the item is poisoned (default: worker.max_retries)
        #[arg(long, value_name = "N")]
        max_retries: Option<u32>,
    },
    /// Count pending items
    Size,
}

#[derive(Args)]
pub struct WorkerArgs {
    /// Capability tags advertised by this worker (repeatable)
    #[arg(long = "capability", value_name = "TAG")]
    pub capabilities: Vec<String>,

    /// Exit after this many seconds (default: run until interrupted)
    #[arg(long, value_name = "SECONDS")]
    pub max_runtime: Option<u64>,
}

#[derive(Args)]
pub struct DaemonArgs {
    /// Run a single pass and exit
    #[arg(long)]
    pub once: bool,
}
