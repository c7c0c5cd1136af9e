use crate::{
    cli::args::{
        CheckpointsArgs, CheckpointsCommand, DaemonArgs, DotArgs, LintArgs, PoolArgs, PoolCommand,
        ResumeArgs, RunArgs, WorkerArgs, WorkspaceArgs,
    },
    core::{
        config::{ConfigLoader, ConfigValidator, StatewrightConfig},
        coordination::{
            open_coordination, Checker, Coordination, Reaper, TaskSpawner, Worker,
            WorkflowJobProcessor,
        },
        workflow::{
            dot::workflow_to_dot,
            lint::{LintRegistry, LintSeverity},
            open_checkpoint_store, prune_terminal, Interpreter, ResumeOptions, RunOptions,
            RunOutcome, Services, UnitRegistryBuilder, WorkflowCatalog, WorkflowDocument,
        },
    },
    Result,
};
use anyhow::{anyhow, Context};
use serde_json::Value;
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio_util::sync::CancellationToken;

/// Resolve the workspace root: `--workspace` or the current directory.
fn resolve_workspace_root(workspace: &WorkspaceArgs) -> Result<PathBuf> {
    match &workspace.workspace {
        Some(path) => Ok(path.clone()),
        None => env::current_dir().context("cannot determine current directory"),
    }
}

fn load_config(root: &Path) -> Result<StatewrightConfig> {
    let config = ConfigLoader::load_from_workspace(root)?;
    ConfigValidator::validate(&config)?;
    Ok(config)
}

/// Workspace catalog plus explicitly named documents, which win on name clashes.
fn build_catalog(config: &StatewrightConfig, extra: &[PathBuf]) -> Result<WorkflowCatalog> {
    let mut catalog = WorkflowCatalog::load_dir(&config.runtime.workflows_dir)?;
    for path in extra {
        let doc = WorkflowDocument::load_from_file(path)?;
        tracing::debug!(workflow = %doc.name, path = %path.display(), "loaded workflow document");
        catalog.insert(doc);
    }
    catalog.check_references()?;
    Ok(catalog)
}

fn build_interpreter(
    root: &Path,
    config: &StatewrightConfig,
    extra: &[PathBuf],
) -> Result<Interpreter> {
    let catalog = build_catalog(config, extra)?;
    let units = UnitRegistryBuilder::with_builtins(root.to_path_buf())?.build();
    let store = open_checkpoint_store(&config.checkpoint);
    Ok(Interpreter::new(Services::new(catalog, units, store)))
}

/// Cancelled on Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; shutting down");
            trigger.cancel();
        }
    });
    cancel
}

/// Fire-and-forget launches run as tasks of this process; let them finish before exit.
async fn wait_for_launches(interpreter: &Interpreter, cancel: &CancellationToken) {
    let in_flight = &interpreter.services().in_flight;
    if !in_flight.is_empty() {
        tracing::info!(count = in_flight.len(), "waiting for launched workflows");
    }
    while !in_flight.is_empty() && !cancel.is_cancelled() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn report_outcome(outcome: &RunOutcome, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }
    println!(
        "execution {} {} after {} steps",
        outcome.execution_id,
        outcome.status.as_str(),
        outcome.steps
    );
    if let Some(output) = &outcome.output {
        println!("{}", serde_json::to_string_pretty(output)?);
    }
    Ok(())
}

fn parse_json_arg(raw: &str, flag: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{} is not valid JSON", flag))
}

pub async fn run(workspace: &WorkspaceArgs, args: RunArgs) -> Result<()> {
    let root = resolve_workspace_root(workspace)?;
    let config = load_config(&root)?;
    let doc = WorkflowDocument::load_from_file(&args.file)?;
    let interpreter = build_interpreter(&root, &config, std::slice::from_ref(&args.file))?;

    let input = match &args.input {
        Some(raw) => parse_json_arg(raw, "--input")?,
        None => Value::Object(Default::default()),
    };
    let options = RunOptions {
        execution_id: args.execution_id.clone(),
        ..RunOptions::default()
    };

    let cancel = shutdown_token();
    let outcome = interpreter.start(&doc.name, input, options).await;
    wait_for_launches(&interpreter, &cancel).await;
    report_outcome(&outcome?, args.json)
}

pub async fn resume(workspace: &WorkspaceArgs, args: ResumeArgs) -> Result<()> {
    let root = resolve_workspace_root(workspace)?;
    let config = load_config(&root)?;
    let interpreter = build_interpreter(&root, &config, &args.workflows)?;
    let options = ResumeOptions {
        allow_workflow_change: args.allow_workflow_change,
    };

    let cancel = shutdown_token();
    let outcome = interpreter.resume(&args.execution_id, options).await;
    wait_for_launches(&interpreter, &cancel).await;
    report_outcome(&outcome?, args.json)
}

pub fn lint(args: LintArgs) -> Result<()> {
    let doc = WorkflowDocument::load_from_file(&args.file)?;
    let results = LintRegistry::new().run(&doc);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else if results.is_empty() {
        println!("{}: no findings", doc.name);
    } else {
        for result in &results {
            println!(
                "{} {} [{}]: {}",
                result.severity,
                result.code,
                result.location.as_deref().unwrap_or("-"),
                result.message
            );
            if let Some(suggestion) = &result.suggestion {
                println!("    help: {}", suggestion);
            }
        }
    }

    let errors = results
        .iter()
        .filter(|r| r.severity == LintSeverity::Error)
        .count();
    if errors > 0 {
        return Err(anyhow!("{} lint error(s) in {}", errors, args.file.display()));
    }
    Ok(())
}

pub fn dot(args: DotArgs) -> Result<()> {
    let doc = WorkflowDocument::load_from_file(&args.file)?;
    let graph = workflow_to_dot(&doc);
    match &args.output {
        Some(path) => fs::write(path, graph)
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => println!("{}", graph),
    }
    Ok(())
}

pub async fn checkpoints(workspace: &WorkspaceArgs, args: CheckpointsArgs) -> Result<()> {
    let root = resolve_workspace_root(workspace)?;
    let config = load_config(&root)?;
    let store = open_checkpoint_store(&config.checkpoint);

    match args.command {
        CheckpointsCommand::List { prefix } => {
            for key in store.list(prefix.as_deref().unwrap_or("")).await? {
                let Some(snapshot) = store.load(&key).await? else {
                    continue;
                };
                println!(
                    "{}\t{}\t{}\t{}\tstep {}",
                    key,
                    snapshot.status.as_str(),
                    snapshot.workflow_name,
                    snapshot.current_state,
                    snapshot.step
                );
            }
        }
        CheckpointsCommand::Show { execution_id } => {
            let snapshot = store
                .load(&execution_id)
                .await?
                .ok_or_else(|| anyhow!("no checkpoint for execution '{}'", execution_id))?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        CheckpointsCommand::Prune { older_than } => {
            let removed = prune_terminal(&*store, older_than).await?;
            println!("pruned {} checkpoint(s)", removed.len());
        }
    }
    Ok(())
}

pub async fn pool(workspace: &WorkspaceArgs, args: PoolArgs) -> Result<()> {
    let root = resolve_workspace_root(workspace)?;
    let config = load_config(&root)?;
    let coordination = open_coordination(&config.coordination).await?;

    match args.command {
        PoolCommand::Push {
            payload,
            max_retries,
        } => {
            let payload = parse_json_arg(&payload, "--payload")?;
            let max_retries = max_retries.unwrap_or(config.worker.max_retries);
            let item_id = coordination.pool.push(payload, max_retries).await?;
            println!("{}", item_id);
        }
        PoolCommand::Size => {
            println!("{}", coordination.pool.size().await?);
        }
    }
    Ok(())
}

struct Runtime {
    config: StatewrightConfig,
    coordination: Coordination,
    interpreter: Interpreter,
}

async fn open_runtime(workspace: &WorkspaceArgs) -> Result<Runtime> {
    let root = resolve_workspace_root(workspace)?;
    let config = load_config(&root)?;
    let coordination = open_coordination(&config.coordination).await?;
    let interpreter = build_interpreter(&root, &config, &[])?;
    Ok(Runtime {
        config,
        coordination,
        interpreter,
    })
}

pub async fn worker(workspace: &WorkspaceArgs, args: WorkerArgs) -> Result<()> {
    let runtime = open_runtime(workspace).await?;
    let mut settings = runtime.config.worker.settings();
    settings.capabilities.extend(args.capabilities);

    let processor = Arc::new(WorkflowJobProcessor::new(runtime.interpreter.clone()));
    let worker = Worker::new(&runtime.coordination, processor, settings);

    let cancel = shutdown_token();
    if let Some(seconds) = args.max_runtime {
        let deadline = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(seconds)).await;
            tracing::info!(seconds, "max runtime reached");
            deadline.cancel();
        });
    }

    let exit = worker.run(cancel.clone()).await?;
    tracing::info!(worker_id = %worker.worker_id(), ?exit, "worker exited");
    wait_for_launches(&runtime.interpreter, &cancel).await;
    Ok(())
}

pub async fn reaper(workspace: &WorkspaceArgs, args: DaemonArgs) -> Result<()> {
    let root = resolve_workspace_root(workspace)?;
    let config = load_config(&root)?;
    let coordination = open_coordination(&config.coordination).await?;
    let reaper = Reaper::new(coordination, config.reaper.settings());

    if args.once {
        let report = reaper.reap_once().await?;
        println!(
            "reaped {} worker(s), released {} item(s)",
            report.reaped.len(),
            report.released.len()
        );
        return Ok(());
    }

    reaper.run(shutdown_token()).await;
    Ok(())
}

/// With `--once`, one check is made and the spawned workers run until the pool has
/// no pending items.
pub async fn checker(workspace: &WorkspaceArgs, args: DaemonArgs) -> Result<()> {
    let runtime = open_runtime(workspace).await?;
    let cancel = shutdown_token();
    let processor = Arc::new(WorkflowJobProcessor::new(runtime.interpreter.clone()));
    let worker_settings = runtime.config.worker.settings();
    let poll_interval = worker_settings.poll_interval;
    let spawner = Arc::new(TaskSpawner::new(
        runtime.coordination.clone(),
        processor,
        worker_settings,
        cancel.clone(),
    ));
    let checker = Checker::new(
        runtime.coordination.clone(),
        spawner.clone(),
        runtime.config.checker.settings(),
    );

    if args.once {
        let report = checker.check_once().await?;
        println!(
            "pending {} active {} desired {} spawned {}",
            report.pending,
            report.active,
            report.desired,
            report.spawned.len()
        );
        if !report.spawned.is_empty() {
            while !cancel.is_cancelled() && runtime.coordination.pool.size().await? > 0 {
                tokio::time::sleep(poll_interval).await;
            }
        }
        cancel.cancel();
    } else {
        checker.run(cancel.clone()).await;
    }

    spawner.join().await;
    wait_for_launches(&runtime.interpreter, &cancel).await;
    Ok(())
}
