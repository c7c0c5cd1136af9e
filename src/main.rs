use clap::Parser;
use statewright::cli::{self, Args};
use statewright::core::{AppError, DefaultErrorReporter, ErrorReporter};
use statewright::logging;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let _guard = match logging::init(&args) {
        Ok(guard) => Some(guard),
        Err(err) => {
            eprintln!("[WARNING] logging disabled: {:#}", err);
            None
        }
    };

    match cli::run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<AppError>() {
                Some(app_error) => DefaultErrorReporter.report_error(app_error),
                None => {
                    tracing::error!(error = %err, "command failed");
                    eprintln!("[ERROR] {:#}", err);
                }
            }
            ExitCode::FAILURE
        }
    }
}
