#![allow(clippy::result_large_err)] // Peer APIs return AppError so branch failures route like unit failures.

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow::executor::{Interpreter, RunOptions, Services};
use crate::core::workflow::schema::CollectMode;
use async_trait::async_trait;
use futures::future::{self, BoxFuture, FutureExt};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// One request to run a peer workflow.
#[derive(Debug, Clone)]
pub struct PeerCall {
    pub workflow: String,
    pub input: Value,
    pub parent_execution_id: Option<String>,
    /// Bounds how long the caller waits. The peer itself is never cancelled.
    pub timeout: Option<Duration>,
}

/// Runs other workflow instances on behalf of a state.
#[async_trait]
pub trait PeerInvoker: Send + Sync {
    /// Run a peer to completion and return its final output.
    async fn invoke(&self, call: PeerCall) -> Result<Value, AppError>;

    /// Start a peer without waiting for it. Repeating a launch with the same
    /// `execution_id` must not start a second run.
    async fn launch(&self, call: PeerCall, execution_id: &str) -> Result<String, AppError>;
}

/// Runs peers as tokio tasks sharing the caller's [`Services`].
pub struct InProcessPeerInvoker {
    services: Arc<Services>,
}

impl InProcessPeerInvoker {
    pub fn new(services: Arc<Services>) -> Self {
        InProcessPeerInvoker { services }
    }
}

#[async_trait]
impl PeerInvoker for InProcessPeerInvoker {
    async fn invoke(&self, call: PeerCall) -> Result<Value, AppError> {
        let interpreter = Interpreter::from_shared(self.services.clone());
        let workflow = call.workflow.clone();
        let options = RunOptions {
            execution_id: None,
            parent_execution_id: call.parent_execution_id,
        };
        let input = call.input;
        let handle = tokio::spawn({
            let workflow = workflow.clone();
            async move { interpreter.start(&workflow, input, options).await }
        });

        // Dropping the handle on timeout detaches the task; it keeps running.
        let joined = match call.timeout {
            Some(limit) => tokio::time::timeout(limit, handle).await.map_err(|_| {
                AppError::new(
                    ErrorCategory::TimeoutError,
                    format!(
                        "peer workflow '{}' did not finish within {}ms",
                        workflow,
                        limit.as_millis()
                    ),
                )
                .with_code("WFG-PEER-002")
            })?,
            None => handle.await,
        };
        let outcome = joined
            .map_err(|err| {
                AppError::new(
                    ErrorCategory::InternalError,
                    format!("peer workflow '{}' task aborted: {}", workflow, err),
                )
            })?
            .map_err(|err| {
                AppError::new(
                    ErrorCategory::PeerInvocationError,
                    format!("peer workflow '{}' failed: {}", workflow, err.message),
                )
                .with_code("WFG-PEER-001")
            })?;
        Ok(outcome.output.unwrap_or(Value::Null))
    }

    async fn launch(&self, call: PeerCall, execution_id: &str) -> Result<String, AppError> {
        let execution_id = execution_id.to_string();
        if self.services.store.load(&execution_id).await?.is_some() {
            tracing::debug!(execution_id = %execution_id, "launch skipped; run already exists");
            return Ok(execution_id);
        }
        if !self.services.in_flight.insert(execution_id.clone()) {
            tracing::debug!(execution_id = %execution_id, "launch skipped; run already in flight");
            return Ok(execution_id);
        }

        let interpreter = Interpreter::from_shared(self.services.clone());
        let services = self.services.clone();
        let options = RunOptions {
            execution_id: Some(execution_id.clone()),
            parent_execution_id: call.parent_execution_id,
        };
        let id = execution_id.clone();
        tokio::spawn(async move {
            match interpreter.start(&call.workflow, call.input, options).await {
                Ok(outcome) => tracing::info!(
                    execution_id = %id,
                    workflow = %call.workflow,
                    steps = outcome.steps,
                    "launched workflow completed"
                ),
                Err(err) => tracing::warn!(
                    execution_id = %id,
                    workflow = %call.workflow,
                    error = %err.message,
                    "launched workflow failed"
                ),
            }
            services.in_flight.remove(&id);
        });
        Ok(execution_id)
    }
}

/// Run every call concurrently and wait for all of them.
pub async fn invoke_settled(
    invoker: &Arc<dyn PeerInvoker>,
    calls: Vec<PeerCall>,
) -> Vec<Result<Value, AppError>> {
    future::join_all(calls.into_iter().map(|call| invoker.invoke(call))).await
}

/// Run every call concurrently and return the first success with its index.
///
/// Losing branches are not cancelled. Their results are drained on a detached task,
/// logged at debug level, and discarded.
pub async fn invoke_any(
    invoker: Arc<dyn PeerInvoker>,
    calls: Vec<PeerCall>,
) -> Result<(usize, Value), AppError> {
    if calls.is_empty() {
        return Err(AppError::new(
            ErrorCategory::PeerInvocationError,
            "no peer branches to race",
        )
        .with_code("WFG-PEER-003"));
    }
    let total = calls.len();
    let branches: Vec<BoxFuture<'static, Result<(usize, Value), AppError>>> = calls
        .into_iter()
        .enumerate()
        .map(|(index, call)| {
            let invoker = invoker.clone();
            async move { invoker.invoke(call).await.map(|value| (index, value)) }.boxed()
        })
        .collect();

    match future::select_ok(branches).await {
        Ok((winner, rest)) => {
            if !rest.is_empty() {
                tokio::spawn(async move {
                    for result in future::join_all(rest).await {
                        match result {
                            Ok((index, _)) => {
                                tracing::debug!(branch = index, "abandoned peer branch completed")
                            }
                            Err(err) => tracing::debug!(
                                error = %err.message,
                                "abandoned peer branch failed"
                            ),
                        }
                    }
                });
            }
            Ok(winner)
        }
        Err(last) => Err(AppError::new(
            ErrorCategory::PeerInvocationError,
            format!("all {} peer branches failed; last error: {}", total, last.message),
        )
        .with_code("WFG-PEER-001")),
    }
}

/// Fold settled branch results into a list or a keyed map. Failed branches become
/// `null`; the set fails only when every branch failed.
pub fn collect_settled(
    keys: &[String],
    results: Vec<Result<Value, AppError>>,
    collect: CollectMode,
    state: &str,
) -> Result<Value, AppError> {
    let total = results.len();
    let mut failures = 0;
    let mut last_error = None;
    let values: Vec<Value> = results
        .into_iter()
        .zip(keys)
        .map(|(result, key)| match result {
            Ok(value) => value,
            Err(err) => {
                failures += 1;
                tracing::warn!(state, branch = %key, error = %err.message, "peer branch failed");
                last_error = Some(err);
                Value::Null
            }
        })
        .collect();

    if total > 0 && failures == total {
        let message = last_error.map(|err| err.message).unwrap_or_default();
        return Err(AppError::new(
            ErrorCategory::PeerInvocationError,
            format!("all {} peer branches failed; last error: {}", total, message),
        )
        .with_code("WFG-PEER-001"));
    }

    Ok(match collect {
        CollectMode::List => Value::Array(values),
        CollectMode::Map => Value::Object(
            keys.iter()
                .cloned()
                .zip(values)
                .collect::<Map<String, Value>>(),
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers after a per-workflow delay; workflows named `fail*` error out.
    struct Delayed {
        finished: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PeerInvoker for Delayed {
        async fn invoke(&self, call: PeerCall) -> Result<Value, AppError> {
            let delay = call.input["delay_ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            if call.workflow.starts_with("fail") {
                return Err(AppError::new(ErrorCategory::PeerInvocationError, "nope"));
            }
            Ok(json!(call.workflow))
        }

        async fn launch(&self, _call: PeerCall, execution_id: &str) -> Result<String, AppError> {
            Ok(execution_id.to_string())
        }
    }

    fn call(workflow: &str, delay_ms: u64) -> PeerCall {
        PeerCall {
            workflow: workflow.into(),
            input: json!({ "delay_ms": delay_ms }),
            parent_execution_id: None,
            timeout: None,
        }
    }

    #[tokio::test]
    async fn any_returns_first_success_and_lets_the_rest_finish() {
        let finished = Arc::new(AtomicUsize::new(0));
        let invoker: Arc<dyn PeerInvoker> = Arc::new(Delayed {
            finished: finished.clone(),
        });
        let (index, value) = invoke_any(
            invoker,
            vec![call("slow", 60), call("fail-fast", 1), call("fast", 10)],
        )
        .await
        .unwrap();
        assert_eq!((index, value), (2, json!("fast")));

        for _ in 0..50 {
            if finished.load(Ordering::SeqCst) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(finished.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn any_fails_only_when_every_branch_fails() {
        let invoker: Arc<dyn PeerInvoker> = Arc::new(Delayed {
            finished: Arc::new(AtomicUsize::new(0)),
        });
        let err = invoke_any(invoker, vec![call("fail-a", 1), call("fail-b", 2)])
            .await
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::PeerInvocationError);
    }

    #[tokio::test]
    async fn settled_collects_into_map_with_nulls_for_failures() {
        let invoker: Arc<dyn PeerInvoker> = Arc::new(Delayed {
            finished: Arc::new(AtomicUsize::new(0)),
        });
        let results = invoke_settled(&invoker, vec![call("a", 5), call("fail-b", 1)]).await;
        let keys = vec!["a".to_string(), "fail-b".to_string()];
        let value = collect_settled(&keys, results, CollectMode::Map, "fan").unwrap();
        assert_eq!(value, json!({"a": "a", "fail-b": null}));

        let results = invoke_settled(&invoker, vec![call("fail-x", 1)]).await;
        assert!(collect_settled(&["fail-x".into()], results, CollectMode::List, "fan").is_err());
    }
}
