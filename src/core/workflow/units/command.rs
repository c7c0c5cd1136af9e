#![allow(clippy::result_large_err)] // Command unit returns AppError to surface shell execution diagnostics without boxing.

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow::unit::{UnitContext, UnitOfWork, UnitResult};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Command;

const OUTPUT_CAPTURE_LIMIT_BYTES: usize = 1_048_576;
const INPUT_ENV_VAR: &str = "STATEWRIGHT_INPUT";

/// Runs a subprocess. Stdout becomes `raw_text`, and `output` when it parses as JSON.
/// The unit input is exported to the child as JSON in `STATEWRIGHT_INPUT`.
pub struct CommandUnit {
    workspace_root: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl CommandUnit {
    pub fn new(workspace_root: PathBuf) -> Self {
        Self {
            workspace_root,
            runner: Arc::new(TokioCommandRunner),
        }
    }

    pub fn with_runner(workspace_root: PathBuf, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            workspace_root,
            runner,
        }
    }
}

#[async_trait]
impl UnitOfWork for CommandUnit {
    fn name(&self) -> &str {
        "command"
    }

    fn validate_params(&self, params: &Value) -> Result<(), AppError> {
        CommandParams::from_value(params).map(|_| ())
    }

    async fn execute(&self, input: Value, ctx: UnitContext) -> Result<UnitResult, AppError> {
        let parsed = CommandParams::from_value(&ctx.params)?;
        let cwd = parsed
            .cwd
            .as_deref()
            .map(|cwd| self.workspace_root.join(cwd))
            .unwrap_or_else(|| self.workspace_root.clone());

        let mut env = parsed.env.clone();
        env.insert(INPUT_ENV_VAR.to_string(), input.to_string());

        tracing::debug!(
            cmd = %parsed.cmd,
            cwd = %cwd.display(),
            shell = parsed.shell,
            execution_id = %ctx.execution_id,
            state = %ctx.state,
            "executing command"
        );

        let start = Instant::now();
        let output = self
            .runner
            .run(&CommandExecutionRequest {
                cmd: parsed.cmd.clone(),
                cwd,
                env,
                shell: parsed.shell,
            })
            .await?;
        let duration_ms = start.elapsed().as_millis() as u64;

        let stdout = limit_bytes(&output.stdout);
        let stderr = limit_bytes(&output.stderr);

        if output.exit_code != 0 {
            let mut result = UnitResult::failure(
                "nonzero_exit",
                format!(
                    "command exited with code {}: {}",
                    output.exit_code,
                    stderr.trim()
                ),
            );
            result.raw_text = Some(stdout);
            return Ok(result);
        }

        let parsed_output = serde_json::from_str::<Value>(stdout.trim()).ok();
        let output_value = parsed_output.unwrap_or_else(|| {
            json!({
                "exit_code": output.exit_code,
                "stdout": stdout,
                "stderr": stderr,
                "duration_ms": duration_ms,
            })
        });
        Ok(UnitResult {
            output: Some(output_value),
            raw_text: Some(stdout),
            ..Default::default()
        })
    }
}

#[derive(Clone, Debug)]
pub struct CommandExecutionRequest {
    pub cmd: String,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub shell: bool,
}

#[derive(Clone, Debug)]
pub struct CommandExecutionOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

#[async_trait]
pub trait CommandRunner: Send + Sync + 'static {
    async fn run(
        &self,
        request: &CommandExecutionRequest,
    ) -> Result<CommandExecutionOutput, AppError>;
}

struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(
        &self,
        request: &CommandExecutionRequest,
    ) -> Result<CommandExecutionOutput, AppError> {
        let mut command = if request.shell {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&request.cmd);
            cmd
        } else {
            let mut parts = request.cmd.split_whitespace();
            let program = parts.next().ok_or_else(|| {
                AppError::new(ErrorCategory::ValidationError, "cmd string is empty")
            })?;
            let mut cmd = Command::new(program);
            cmd.args(parts);
            cmd
        };

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&request.cwd)
            .envs(&request.env)
            .kill_on_drop(true);

        let output = command.output().await.map_err(|err| {
            AppError::new(
                ErrorCategory::UnitExecutionError,
                format!("failed to execute command: {}", err),
            )
            .with_code("WFG-CMD-002")
            .with_kind("spawn_failed")
        })?;

        Ok(CommandExecutionOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

struct CommandParams {
    cmd: String,
    cwd: Option<String>,
    env: HashMap<String, String>,
    shell: bool,
}

impl CommandParams {
    fn from_value(value: &Value) -> Result<Self, AppError> {
        let map = value.as_object().ok_or_else(|| {
            AppError::new(
                ErrorCategory::ValidationError,
                "command params must be an object",
            )
        })?;
        let cmd = map
            .get("cmd")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                AppError::new(ErrorCategory::ValidationError, "command requires a non-empty cmd")
                    .with_code("WFG-CMD-001")
            })?
            .to_string();

        let cwd = map
            .get("cwd")
            .and_then(Value::as_str)
            .map(str::trim)
            .map(str::to_string);
        if let Some(cwd) = &cwd {
            if Path::new(cwd).is_absolute() {
                return Err(
                    AppError::new(ErrorCategory::ValidationError, "cwd must be relative")
                        .with_code("WFG-CMD-001"),
                );
            }
        }

        let env = map
            .get("env")
            .and_then(Value::as_object)
            .map(|env_map| {
                env_map
                    .iter()
                    .filter_map(|(key, value)| value.as_str().map(|v| (key.clone(), v.to_string())))
                    .collect::<HashMap<_, _>>()
            })
            .unwrap_or_default();
        let shell = map.get("shell").and_then(Value::as_bool).unwrap_or(false);

        Ok(Self {
            cmd,
            cwd,
            env,
            shell,
        })
    }
}

fn limit_bytes(bytes: &[u8]) -> String {
    let limit = OUTPUT_CAPTURE_LIMIT_BYTES.min(bytes.len());
    String::from_utf8_lossy(&bytes[..limit]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedRunner {
        stdout: &'static str,
        exit_code: i32,
        seen: Mutex<Vec<CommandExecutionRequest>>,
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(
            &self,
            request: &CommandExecutionRequest,
        ) -> Result<CommandExecutionOutput, AppError> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(CommandExecutionOutput {
                stdout: self.stdout.as_bytes().to_vec(),
                stderr: b"warn".to_vec(),
                exit_code: self.exit_code,
            })
        }
    }

    fn ctx(params: Value) -> UnitContext {
        UnitContext {
            execution_id: "run-1".into(),
            workflow: "wf".into(),
            state: "call".into(),
            step: 1,
            params,
            context: json!({}),
        }
    }

    #[tokio::test]
    async fn json_stdout_becomes_output() {
        let runner = Arc::new(ScriptedRunner {
            stdout: "{\"score\": 9}\n",
            exit_code: 0,
            seen: Mutex::new(Vec::new()),
        });
        let unit = CommandUnit::with_runner(PathBuf::from("/ws"), runner.clone());
        let result = unit
            .execute(json!({"topic": "x"}), ctx(json!({"cmd": "score", "cwd": "sub"})))
            .await
            .unwrap();
        assert_eq!(result.output, Some(json!({"score": 9})));
        assert_eq!(result.raw_text.as_deref(), Some("{\"score\": 9}\n"));

        let seen = runner.seen.lock().unwrap();
        assert_eq!(seen[0].cwd, PathBuf::from("/ws/sub"));
        assert_eq!(
            seen[0].env.get(INPUT_ENV_VAR).map(String::as_str),
            Some("{\"topic\":\"x\"}")
        );
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_in_band() {
        let runner = Arc::new(ScriptedRunner {
            stdout: "",
            exit_code: 2,
            seen: Mutex::new(Vec::new()),
        });
        let unit = CommandUnit::with_runner(PathBuf::from("."), runner);
        let result = unit
            .execute(json!({}), ctx(json!({"cmd": "false"})))
            .await
            .unwrap();
        let err = result.into_result("command").unwrap_err();
        assert_eq!(err.kind(), "nonzero_exit");
    }

    #[test]
    fn rejects_absolute_cwd_and_missing_cmd() {
        let unit = CommandUnit::new(PathBuf::from("."));
        assert!(unit.validate_params(&json!({"cmd": "ls", "cwd": "/etc"})).is_err());
        assert!(unit.validate_params(&json!({"cmd": "  "})).is_err());
        assert!(unit.validate_params(&json!({"cmd": "ls"})).is_ok());
    }
}
