pub mod config;
pub mod context;
pub mod layers;

pub use context::{detect_context, ExecutionContext};
pub use layers::console::ConsoleOutput;

use crate::logging::config::LoggingConfig;
use crate::logging::layers::{console, file, noop_layer, opentelemetry};
use crate::{cli::Args, Result};
use anyhow::{anyhow, Context};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::Registry;

static LOGGER_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Keeps the non-blocking file writer and the span exporter alive until the command ends.
pub struct LoggingGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
    _otel_guard: Option<opentelemetry::OpenTelemetryGuard>,
    context: ExecutionContext,
    console_output: ConsoleOutput,
    log_file_path: PathBuf,
}

impl LoggingGuard {
    pub fn context(&self) -> ExecutionContext {
        self.context
    }

    pub fn console_output(&self) -> ConsoleOutput {
        self.console_output
    }

    pub fn log_file_path(&self) -> &Path {
        &self.log_file_path
    }
}

/// Initialize tracing for one CLI invocation.
///
/// `RUST_LOG` wins over `logging.default_level`. Calling this twice in one process
/// is an error.
pub fn init(args: &Args) -> Result<LoggingGuard> {
    if LOGGER_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Err(anyhow!("logging already initialized"));
    }

    let context = detect_context(&args.command);
    let workspace_root = args
        .workspace
        .workspace
        .clone()
        .or_else(|| env::current_dir().ok());
    let config = LoggingConfig::load(workspace_root.as_deref())?;

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.default_level))
        .context("failed to configure tracing level")?;
    let log_file_path = file::log_file_path(&config, workspace_root.as_deref())?;

    type FileSubscriber = file::FileLayerStack<Registry>;
    type ConsoleSubscriber = console::ConsoleLayerStack<FileSubscriber>;

    let (file_layer, file_guard) = file::file_layer::<Registry>(&log_file_path, config.enable_file)?;
    let console_output = console::select_console_output(context, config.console_output);
    let console_layer = console::console_layer::<FileSubscriber>(console_output);

    let mut otel_error = None;
    let (otel_layer, otel_guard) = if config.opentelemetry.enabled {
        match opentelemetry::build_opentelemetry_layer::<ConsoleSubscriber>(&config.opentelemetry)
        {
            Ok((layer, guard)) => (layer, Some(guard)),
            Err(err) => {
                otel_error = Some(err);
                (noop_layer::<ConsoleSubscriber>(), None)
            }
        }
    } else {
        (noop_layer::<ConsoleSubscriber>(), None)
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(otel_layer)
        .with(env_filter)
        .init();

    if let Some(err) = otel_error {
        tracing::warn!(error = %err, "OpenTelemetry export disabled");
    }
    tracing::debug!(
        ?context,
        console = %console_output,
        log_file = %log_file_path.display(),
        "logging initialized"
    );

    Ok(LoggingGuard {
        _file_guard: file_guard,
        _otel_guard: otel_guard,
        context,
        console_output,
        log_file_path,
    })
}
