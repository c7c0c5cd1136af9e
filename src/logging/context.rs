use crate::cli::Command;
use std::env;

/// Execution contexts that influence how logging is routed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionContext {
    /// One-shot commands driven from a terminal.
    Interactive,
    /// Long-running coordination roles: worker, reaper, checker.
    Daemon,
}

impl ExecutionContext {
    /// Returns `true` when console sinks are off unless configured explicitly.
    pub fn disables_console(self) -> bool {
        matches!(self, ExecutionContext::Daemon)
    }
}

/// Derive the active execution context from a parsed CLI command.
///
/// `STATEWRIGHT_DAEMON=1` forces the daemon context, for wrappers that run
/// one-shot commands unattended.
pub fn detect_context(command: &Command) -> ExecutionContext {
    if daemon_override_enabled() {
        return ExecutionContext::Daemon;
    }

    match command {
        Command::Worker(_) | Command::Reaper(_) | Command::Checker(_) => ExecutionContext::Daemon,
        Command::Run(_)
        | Command::Resume(_)
        | Command::Lint(_)
        | Command::Dot(_)
        | Command::Checkpoints(_)
        | Command::Pool(_) => ExecutionContext::Interactive,
    }
}

fn daemon_override_enabled() -> bool {
    env::var("STATEWRIGHT_DAEMON")
        .map(|value| value.trim() == "1")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::args::{DaemonArgs, LintArgs};
    use serial_test::serial;
    use std::path::PathBuf;

    #[test]
    #[serial]
    fn daemon_roles_are_detected() {
        env::remove_var("STATEWRIGHT_DAEMON");
        let reaper = Command::Reaper(DaemonArgs { once: false });
        assert_eq!(detect_context(&reaper), ExecutionContext::Daemon);

        let lint = Command::Lint(LintArgs {
            file: PathBuf::from("wf.yaml"),
            json: false,
        });
        assert_eq!(detect_context(&lint), ExecutionContext::Interactive);
    }

    #[test]
    #[serial]
    fn env_override_forces_daemon() {
        env::set_var("STATEWRIGHT_DAEMON", "1");
        let lint = Command::Lint(LintArgs {
            file: PathBuf::from("wf.yaml"),
            json: false,
        });
        assert_eq!(detect_context(&lint), ExecutionContext::Daemon);
        env::remove_var("STATEWRIGHT_DAEMON");
    }
}
