pub mod args;
pub mod commands;

pub use args::{
    CheckpointsArgs, CheckpointsCommand, DaemonArgs, DotArgs, LintArgs, PoolArgs, PoolCommand,
    ResumeArgs, RunArgs, WorkerArgs, WorkspaceArgs,
};
use clap::{Parser, Subcommand};

const HELP_TEMPLATE: &str = "\
{name} {version}\n\
{about-with-newline}\n\
USAGE:\n    {usage}\n\
\nOPTIONS:\n{options}\n\
COMMANDS:\n{subcommands}\n";

#[derive(Parser)]
#[command(name = "statewright")]
#[command(version = crate::VERSION)]
#[command(about = "Declarative workflow interpreter with checkpointed runs and work coordination")]
#[command(help_template = HELP_TEMPLATE)]
#[command(
    after_long_help = "Typical flow: lint a workflow, run it, resume it after a crash, or push it to a pool served by workers."
)]
pub struct Args {
    #[command(flatten)]
    pub workspace: WorkspaceArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    #[command(
        about = "Execute a workflow document to completion",
        long_about = "Run loads every workflow in the workspace catalog plus FILE, starts a new execution and drives it to a final state, checkpointing along the way.",
        after_help = "Example:\n    statewright run workflows/review.yaml --input '{\"score\": 3}'"
    )]
    Run(RunArgs),
    #[command(
        about = "Continue a checkpointed execution",
        long_about = "Resume reloads the snapshot for ID and continues from the recorded state. A finished execution returns its recorded outcome.",
        after_help = "Example:\n    statewright resume 1f0c9a4e-...\n"
    )]
    Resume(ResumeArgs),
    #[command(
        about = "Report structural problems in a workflow",
        after_help = "Example:\n    statewright lint workflows/review.yaml --json"
    )]
    Lint(LintArgs),
    #[command(
        about = "Render a workflow as a Graphviz DOT graph",
        after_help = "Example:\n    statewright dot workflows/review.yaml | dot -Tsvg > review.svg"
    )]
    Dot(DotArgs),
    #[command(about = "Inspect and prune stored checkpoints")]
    Checkpoints(CheckpointsArgs),
    #[command(about = "Push work items or inspect the work pool")]
    Pool(PoolArgs),
    #[command(
        about = "Claim and process work items until interrupted",
        long_about = "Worker registers in the worker registry, heartbeats, and runs {workflow, input} payloads claimed from the pool."
    )]
    Worker(WorkerArgs),
    #[command(about = "Mark silent workers dead and release their claims")]
    Reaper(DaemonArgs),
    #[command(about = "Spawn local workers to match the pending backlog")]
    Checker(DaemonArgs),
}

pub async fn run(args: Args) -> crate::Result<()> {
    let workspace = args.workspace;
    match args.command {
        Command::Run(run_args) => commands::run(&workspace, run_args).await,
        Command::Resume(resume_args) => commands::resume(&workspace, resume_args).await,
        Command::Lint(lint_args) => commands::lint(lint_args),
        Command::Dot(dot_args) => commands::dot(dot_args),
        Command::Checkpoints(cp_args) => commands::checkpoints(&workspace, cp_args).await,
        Command::Pool(pool_args) => commands::pool(&workspace, pool_args).await,
        Command::Worker(worker_args) => commands::worker(&workspace, worker_args).await,
        Command::Reaper(daemon_args) => commands::reaper(&workspace, daemon_args).await,
        Command::Checker(daemon_args) => commands::checker(&workspace, daemon_args).await,
    }
}
