use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use statewright::core::types::{ErrorCategory, ExecutionStatus};
use statewright::core::workflow::state::SNAPSHOT_FORMAT_VERSION;
use statewright::core::workflow::{
    CheckpointStore, ExecutionSnapshot, Interpreter, LaunchIntent, MemoryCheckpointStore,
    PeerCall, PeerInvoker, ResumeOptions, RunOptions, Services, UnitContext, UnitOfWork,
    UnitRegistryBuilder, UnitResult, UsageTotals, WorkflowCatalog, WorkflowDocument,
};
use statewright::core::AppError;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

/// Counts executions per state.
#[derive(Default)]
struct Counter {
    calls: Mutex<Vec<String>>,
}

impl Counter {
    fn count(&self, state: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.as_str() == state)
            .count()
    }
}

struct CountingUnit(Arc<Counter>);

#[async_trait]
impl UnitOfWork for CountingUnit {
    fn name(&self) -> &str {
        "count"
    }

    fn validate_params(&self, _params: &Value) -> Result<(), AppError> {
        Ok(())
    }

    async fn execute(&self, _input: Value, ctx: UnitContext) -> Result<UnitResult, AppError> {
        self.0.calls.lock().unwrap().push(ctx.state.clone());
        Ok(UnitResult::output(json!({ "last": ctx.state })))
    }
}

struct FailingUnit;

#[async_trait]
impl UnitOfWork for FailingUnit {
    fn name(&self) -> &str {
        "flaky"
    }

    fn validate_params(&self, _params: &Value) -> Result<(), AppError> {
        Ok(())
    }

    async fn execute(&self, _input: Value, _ctx: UnitContext) -> Result<UnitResult, AppError> {
        Ok(UnitResult::failure("quota", "rate limited"))
    }
}

/// Memory store whose saves start failing once the budget is spent, like a process
/// dying between checkpoints.
struct FlakyStore {
    inner: Arc<MemoryCheckpointStore>,
    remaining: AtomicI64,
}

#[async_trait]
impl CheckpointStore for FlakyStore {
    async fn save(&self, key: &str, snapshot: &ExecutionSnapshot) -> Result<(), AppError> {
        if self.remaining.fetch_sub(1, Ordering::SeqCst) <= 0 {
            return Err(AppError::new(ErrorCategory::PersistenceError, "disk gone"));
        }
        self.inner.save(key, snapshot).await
    }

    async fn load(&self, key: &str) -> Result<Option<ExecutionSnapshot>, AppError> {
        self.inner.load(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, AppError> {
        self.inner.list(prefix).await
    }
}

/// Records launches instead of running them.
#[derive(Default)]
struct RecordingInvoker {
    launched: Mutex<Vec<String>>,
}

#[async_trait]
impl PeerInvoker for RecordingInvoker {
    async fn invoke(&self, call: PeerCall) -> Result<Value, AppError> {
        Ok(json!({ "workflow": call.workflow }))
    }

    async fn launch(&self, _call: PeerCall, execution_id: &str) -> Result<String, AppError> {
        self.launched.lock().unwrap().push(execution_id.to_string());
        Ok(execution_id.to_string())
    }
}

const PIPELINE: &str = r#"
name: pipeline
settings:
  checkpoint_events: [run_start, state_entered, state_exited, run_end]
states:
  start:
    kind: initial
    unit: { type: count }
    transitions:
      - to: work
  work:
    unit: { type: count }
    transitions:
      - to: done
  done:
    kind: final
    result: { last: "{{ last }}" }
"#;

const LAUNCHER: &str = r#"
name: launcher
states:
  fan:
    kind: initial
    launch:
      workflow: child
      input: { n: 1 }
    transitions:
      - to: after
  after:
    transitions:
      - to: done
  done:
    kind: final
"#;

const CHILD: &str = r#"
name: child
states:
  start:
    kind: initial
    transitions:
      - to: done
  done:
    kind: final
    result: { got: "{{ n }}" }
"#;

const BROKEN: &str = r#"
name: broken
states:
  start:
    kind: initial
    transitions:
      - when: false
        to: done
  done:
    kind: final
"#;

fn catalog(docs: &[&str]) -> WorkflowCatalog {
    let mut catalog = WorkflowCatalog::new();
    for doc in docs {
        catalog.insert(WorkflowDocument::from_yaml_str(doc).unwrap());
    }
    catalog
}

fn interpreter_with(
    docs: &[&str],
    counter: Arc<Counter>,
    store: Arc<dyn CheckpointStore>,
) -> Interpreter {
    let mut builder = UnitRegistryBuilder::with_builtins(PathBuf::from(".")).unwrap();
    builder.register(CountingUnit(counter)).unwrap();
    Interpreter::new(Services::new(catalog(docs), builder.build(), store))
}

fn snapshot_for(doc: &str, id: &str, state: &str, step: u64) -> ExecutionSnapshot {
    let doc = WorkflowDocument::from_yaml_str(doc).unwrap();
    let now = Utc::now();
    ExecutionSnapshot {
        format_version: SNAPSHOT_FORMAT_VERSION.to_string(),
        execution_id: id.to_string(),
        workflow_name: doc.name.clone(),
        workflow_hash: doc.hash().unwrap(),
        current_state: state.to_string(),
        context: json!({}),
        step,
        status: ExecutionStatus::Running,
        state_in_progress: false,
        created_at: now,
        updated_at: now,
        final_output: None,
        usage: UsageTotals::default(),
        parent_execution_id: None,
        launch_intents: Vec::new(),
        error: None,
    }
}

#[tokio::test]
async fn interrupted_state_runs_again_under_the_same_step() {
    let counter = Arc::new(Counter::default());
    let memory = Arc::new(MemoryCheckpointStore::new());
    // run_start, enter start, exit start, enter work; the exit of work is lost.
    let flaky = Arc::new(FlakyStore {
        inner: memory.clone(),
        remaining: AtomicI64::new(4),
    });
    let first = interpreter_with(&[PIPELINE], counter.clone(), flaky);
    let err = first
        .start(
            "pipeline",
            json!({}),
            RunOptions {
                execution_id: Some("crash-1".into()),
                ..RunOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.category, ErrorCategory::PersistenceError);

    let stored = memory.load("crash-1").await.unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Running);
    assert_eq!(stored.current_state, "work");
    assert!(stored.state_in_progress);
    assert_eq!(stored.step, 2);

    let second = interpreter_with(&[PIPELINE], counter.clone(), memory.clone());
    let outcome = second
        .resume("crash-1", ResumeOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(outcome.visited, vec!["work", "done"]);
    assert_eq!(outcome.steps, 3);
    assert_eq!(outcome.output, Some(json!({ "last": "work" })));
    assert_eq!(counter.count("start"), 1);
    assert_eq!(counter.count("work"), 2);
}

#[tokio::test]
async fn resuming_a_finished_run_replays_the_record() {
    let counter = Arc::new(Counter::default());
    let store = Arc::new(MemoryCheckpointStore::new());
    let interpreter = interpreter_with(&[PIPELINE], counter.clone(), store);
    let first = interpreter
        .start(
            "pipeline",
            json!({}),
            RunOptions {
                execution_id: Some("done-1".into()),
                ..RunOptions::default()
            },
        )
        .await
        .unwrap();

    let replay = interpreter
        .resume("done-1", ResumeOptions::default())
        .await
        .unwrap();
    assert_eq!(replay.status, ExecutionStatus::Completed);
    assert_eq!(replay.output, first.output);
    assert_eq!(replay.steps, first.steps);
    assert!(replay.visited.is_empty());
    assert_eq!(counter.count("work"), 1);

    let again = interpreter
        .start(
            "pipeline",
            json!({}),
            RunOptions {
                execution_id: Some("done-1".into()),
                ..RunOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(again.code, "WFG-RUN-002");
}

#[tokio::test]
async fn changed_workflow_is_refused_unless_allowed() {
    let store = Arc::new(MemoryCheckpointStore::new());
    store
        .save("drift-1", &snapshot_for(PIPELINE, "drift-1", "work", 1))
        .await
        .unwrap();

    let edited = PIPELINE.replace("result: { last: \"{{ last }}\" }", "result: { edited: true }");
    let counter = Arc::new(Counter::default());
    let interpreter = interpreter_with(&[edited.as_str()], counter, store);

    let err = interpreter
        .resume("drift-1", ResumeOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, "WFG-RUN-004");

    let outcome = interpreter
        .resume(
            "drift-1",
            ResumeOptions {
                allow_workflow_change: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.output, Some(json!({ "edited": true })));
}

#[tokio::test]
async fn unconfirmed_launch_is_reissued_once_on_resume() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let mut snapshot = snapshot_for(LAUNCHER, "parent-1", "after", 1);
    snapshot.launch_intents.push(LaunchIntent {
        id: "parent-1-fan-1".into(),
        workflow: "child".into(),
        input: json!({ "n": 1 }),
        launched: false,
    });
    store.save("parent-1", &snapshot).await.unwrap();

    let recorder = Arc::new(RecordingInvoker::default());
    let interpreter = interpreter_with(&[LAUNCHER, CHILD], Arc::new(Counter::default()), store.clone())
        .with_peer_invoker(recorder.clone());
    let outcome = interpreter
        .resume("parent-1", ResumeOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(*recorder.launched.lock().unwrap(), vec!["parent-1-fan-1"]);

    let stored = store.load("parent-1").await.unwrap().unwrap();
    assert!(stored.launch_intents.iter().all(|intent| intent.launched));

    interpreter
        .resume("parent-1", ResumeOptions::default())
        .await
        .unwrap();
    assert_eq!(recorder.launched.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn confirmed_launch_is_not_repeated_when_its_state_reruns() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let mut snapshot = snapshot_for(LAUNCHER, "parent-2", "fan", 1);
    snapshot.state_in_progress = true;
    snapshot.launch_intents.push(LaunchIntent {
        id: "parent-2-fan-1".into(),
        workflow: "child".into(),
        input: json!({ "n": 1 }),
        launched: true,
    });
    store.save("parent-2", &snapshot).await.unwrap();

    let recorder = Arc::new(RecordingInvoker::default());
    let interpreter = interpreter_with(&[LAUNCHER, CHILD], Arc::new(Counter::default()), store)
        .with_peer_invoker(recorder.clone());
    let outcome = interpreter
        .resume("parent-2", ResumeOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.visited, vec!["fan", "after", "done"]);
    assert!(recorder.launched.lock().unwrap().is_empty());
}

#[tokio::test]
async fn in_process_launch_runs_the_child_under_the_intent_id() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let interpreter = interpreter_with(&[LAUNCHER, CHILD], Arc::new(Counter::default()), store);
    interpreter
        .start(
            "launcher",
            json!({}),
            RunOptions {
                execution_id: Some("parent-3".into()),
                ..RunOptions::default()
            },
        )
        .await
        .unwrap();

    let mut child = None;
    for _ in 0..100 {
        child = interpreter.result("parent-3-fan-1").await.unwrap();
        if child.is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let child = child.expect("launched child should finish");
    assert_eq!(child.output, Some(json!({ "got": 1 })));
    let snapshot = interpreter.snapshot("parent-3-fan-1").await.unwrap().unwrap();
    assert_eq!(snapshot.parent_execution_id.as_deref(), Some("parent-3"));
}

#[tokio::test]
async fn foreach_peers_collect_in_item_order() {
    const FANOUT: &str = r#"
name: fanout
context: { items: [1, 2, 3] }
states:
  fan:
    kind: initial
    peer:
      foreach: "{{ items }}"
      workflow: child
      input: { n: "{{ item }}" }
    output:
      results: "{{ peer }}"
    transitions:
      - to: done
  done:
    kind: final
    result: "{{ results }}"
"#;
    let interpreter = interpreter_with(
        &[FANOUT, CHILD],
        Arc::new(Counter::default()),
        Arc::new(MemoryCheckpointStore::new()),
    );
    let outcome = interpreter
        .start("fanout", json!({}), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(
        outcome.output,
        Some(json!([{ "got": 1 }, { "got": 2 }, { "got": 3 }]))
    );
}

#[tokio::test]
async fn settled_peers_tolerate_partial_failure_and_any_takes_a_winner() {
    const SETTLED: &str = r#"
name: settled
states:
  fan:
    kind: initial
    peer:
      workflows: [child, broken]
      collect: map
      input: { n: 5 }
    output:
      results: "{{ peer }}"
    transitions:
      - to: done
  done:
    kind: final
    result: "{{ results }}"
"#;
    const RACE: &str = r#"
name: race
states:
  fan:
    kind: initial
    peer:
      workflows: [broken, child]
      mode: any
      input: { n: 9 }
    transitions:
      - to: done
  done:
    kind: final
    result: { got: "{{ got }}" }
"#;
    let interpreter = interpreter_with(
        &[SETTLED, RACE, CHILD, BROKEN],
        Arc::new(Counter::default()),
        Arc::new(MemoryCheckpointStore::new()),
    );

    let settled = interpreter
        .start("settled", json!({}), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(
        settled.output,
        Some(json!({ "child": { "got": 5 }, "broken": null }))
    );

    let race = interpreter
        .start("race", json!({}), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(race.output, Some(json!({ "got": 9 })));
}

#[tokio::test]
async fn unit_failure_routes_by_kind_with_error_record() {
    const ROUTED: &str = r#"
name: routed
states:
  start:
    kind: initial
    unit: { type: flaky }
    on_error: { quota: recover, default: done }
    transitions:
      - to: done
  recover:
    transitions:
      - to: done
  done:
    kind: final
    result: { state: "{{ error.state }}", kind: "{{ error.kind }}" }
"#;
    let mut builder = UnitRegistryBuilder::new();
    builder.register(FailingUnit).unwrap();
    let interpreter = Interpreter::new(Services::new(
        catalog(&[ROUTED]),
        builder.build(),
        Arc::new(MemoryCheckpointStore::new()),
    ));
    let outcome = interpreter
        .start("routed", json!({}), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.visited, vec!["start", "recover", "done"]);
    assert_eq!(
        outcome.output,
        Some(json!({ "state": "start", "kind": "quota" }))
    );
}
