//! Execution strategies: the policy wrapped around calls to a unit of work.
//!
//! Retries live here and only here. The interpreter calls [`execute`] once per state
//! and never retries on its own.

#![allow(clippy::result_large_err)] // Strategy APIs return AppError to keep executor error kinds intact.

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow::schema::{StrategyConfig, VotingConfig};
use crate::core::workflow::state::UsageTotals;
use crate::core::workflow::unit::{UnitContext, UnitOfWork, UnitResult};
use indexmap::IndexMap;
use rand::Rng;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StrategyMetrics {
    pub calls: u64,
    pub failures: u64,
    /// Voting samples discarded as malformed, oversize, or failed.
    pub red_flags: u64,
    /// Vote count per canonical value, in first-seen order.
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub votes: IndexMap<String, u64>,
}

#[derive(Debug, Clone, Default)]
pub struct StrategyOutcome {
    pub output: Value,
    pub raw_text: Option<String>,
    pub usage: UsageTotals,
    pub metrics: StrategyMetrics,
}

/// Run `unit` under the configured policy.
pub async fn execute(
    config: &StrategyConfig,
    unit: Arc<dyn UnitOfWork>,
    input: Value,
    ctx: UnitContext,
) -> Result<StrategyOutcome, AppError> {
    match config {
        StrategyConfig::Single => {
            let mut outcome = StrategyOutcome::default();
            let result = call_once(&*unit, input, ctx, &mut outcome).await?;
            outcome.output = result.output.unwrap_or(Value::Null);
            outcome.raw_text = result.raw_text;
            Ok(outcome)
        }
        StrategyConfig::Retry { delays_ms, jitter } => {
            retry(&*unit, input, ctx, delays_ms, *jitter).await
        }
        StrategyConfig::Parallel { samples } => parallel(unit, input, ctx, *samples).await,
        StrategyConfig::Voting(voting) => vote(&*unit, input, ctx, voting).await,
    }
}

/// One executor call, with usage and failure counts folded into `outcome`.
async fn call_once(
    unit: &dyn UnitOfWork,
    input: Value,
    ctx: UnitContext,
    outcome: &mut StrategyOutcome,
) -> Result<UnitResult, AppError> {
    outcome.metrics.calls += 1;
    let result = match unit.execute(input, ctx).await {
        Ok(result) => {
            outcome.usage.record(result.usage.as_ref(), result.cost);
            result.into_result(unit.name())
        }
        Err(err) => {
            outcome.usage.record(None, None);
            Err(err)
        }
    };
    if result.is_err() {
        outcome.metrics.failures += 1;
    }
    result
}

/// Perturb a delay by up to `jitter` of its length in either direction.
pub fn jittered(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
    delay.mul_f64(factor.max(0.0))
}

async fn retry(
    unit: &dyn UnitOfWork,
    input: Value,
    ctx: UnitContext,
    delays_ms: &[u64],
    jitter: f64,
) -> Result<StrategyOutcome, AppError> {
    let mut outcome = StrategyOutcome::default();
    let attempts = delays_ms.len() + 1;
    for attempt in 0..attempts {
        match call_once(unit, input.clone(), ctx.clone(), &mut outcome).await {
            Ok(result) => {
                outcome.output = result.output.unwrap_or(Value::Null);
                outcome.raw_text = result.raw_text;
                return Ok(outcome);
            }
            Err(err) => {
                let Some(delay_ms) = delays_ms.get(attempt) else {
                    return Err(err);
                };
                let delay = jittered(Duration::from_millis(*delay_ms), jitter);
                tracing::warn!(
                    unit = unit.name(),
                    state = %ctx.state,
                    attempt = attempt + 1,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err.message,
                    "unit call failed; retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
    Err(AppError::new(ErrorCategory::InternalError, "retry loop exhausted without a result"))
}

async fn parallel(
    unit: Arc<dyn UnitOfWork>,
    input: Value,
    ctx: UnitContext,
    samples: usize,
) -> Result<StrategyOutcome, AppError> {
    let calls = (0..samples).map(|_| {
        let unit = unit.clone();
        let input = input.clone();
        let ctx = ctx.clone();
        async move {
            let mut partial = StrategyOutcome::default();
            let result = call_once(&*unit, input, ctx, &mut partial).await;
            (result, partial)
        }
    });
    let results = futures::future::join_all(calls).await;

    let mut outcome = StrategyOutcome::default();
    let mut values = Vec::with_capacity(samples);
    let mut last_error = None;
    for (result, partial) in results {
        outcome.usage.absorb(&partial.usage);
        outcome.metrics.calls += partial.metrics.calls;
        outcome.metrics.failures += partial.metrics.failures;
        match result {
            Ok(result) => values.push(result.value()),
            Err(err) => {
                values.push(Value::Null);
                last_error = Some(err);
            }
        }
    }
    if outcome.metrics.failures as usize == samples {
        if let Some(err) = last_error {
            return Err(err);
        }
    }
    outcome.output = Value::Array(values);
    Ok(outcome)
}

/// Running vote counts for first-to-lead-by-K consensus.
///
/// A value wins once it has more than `k` votes and leads every other value by at
/// least `k`. Both conditions are needed: a lone early value does not win until
/// the sample stream has had a chance to disagree with it.
#[derive(Debug, Clone)]
pub struct VoteTally {
    k_margin: u64,
    counts: IndexMap<String, (u64, Value)>,
}

impl VoteTally {
    pub fn new(k_margin: usize) -> Self {
        VoteTally {
            k_margin: k_margin as u64,
            counts: IndexMap::new(),
        }
    }

    /// Count one vote. Returns the winning value once the stop rule is met.
    pub fn add(&mut self, key: String, value: Value) -> Option<Value> {
        self.counts.entry(key).or_insert((0, value)).0 += 1;
        self.decided()
    }

    pub fn decided(&self) -> Option<Value> {
        let (leader_key, (top, value)) = self.leader_entry()?;
        let runner_up = self
            .counts
            .iter()
            .filter(|(key, _)| *key != leader_key)
            .map(|(_, (count, _))| *count)
            .max()
            .unwrap_or(0);
        (*top > self.k_margin && top - runner_up >= self.k_margin).then(|| value.clone())
    }

    /// Plurality leader; ties go to the value seen first.
    pub fn leader(&self) -> Option<Value> {
        self.leader_entry().map(|(_, (_, value))| value.clone())
    }

    fn leader_entry(&self) -> Option<(&String, &(u64, Value))> {
        let mut best: Option<(&String, &(u64, Value))> = None;
        for entry in &self.counts {
            if best.map_or(true, |(_, (count, _))| entry.1 .0 > *count) {
                best = Some(entry);
            }
        }
        best
    }

    pub fn counts(&self) -> IndexMap<String, u64> {
        self.counts
            .iter()
            .map(|(key, (count, _))| (key.clone(), *count))
            .collect()
    }
}

/// Validates and canonicalizes voting candidates.
pub struct CandidateFilter<'a> {
    config: &'a VotingConfig,
    pattern: Option<Regex>,
}

impl<'a> CandidateFilter<'a> {
    pub fn new(config: &'a VotingConfig) -> Result<Self, AppError> {
        let pattern = config
            .pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|err| {
                AppError::new(
                    ErrorCategory::ValidationError,
                    format!("voting.pattern does not compile: {err}"),
                )
            })?;
        Ok(CandidateFilter { config, pattern })
    }

    /// `(canonical key, value)` for a usable candidate, `None` for a red flag.
    pub fn canonicalize(&self, result: &UnitResult) -> Option<(String, Value)> {
        let mut value = result.value();
        if let Some(field) = &self.config.field {
            value = field
                .split('.')
                .try_fold(&value, |current, segment| current.get(segment))
                .cloned()
                .unwrap_or(Value::Null);
        }
        let (key, value) = match value {
            Value::Null => return None,
            Value::String(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    return None;
                }
                let key = if self.config.case_insensitive {
                    trimmed.to_lowercase()
                } else {
                    trimmed.to_string()
                };
                (key, Value::String(trimmed.to_string()))
            }
            other => (other.to_string(), other),
        };
        if let Some(max) = self.config.max_length {
            if key.chars().count() > max {
                return None;
            }
        }
        if let Some(pattern) = &self.pattern {
            if !pattern.is_match(&key) {
                return None;
            }
        }
        Some((key, value))
    }
}

async fn vote(
    unit: &dyn UnitOfWork,
    input: Value,
    ctx: UnitContext,
    config: &VotingConfig,
) -> Result<StrategyOutcome, AppError> {
    let filter = CandidateFilter::new(config)?;
    let mut tally = VoteTally::new(config.k_margin);
    let mut outcome = StrategyOutcome::default();

    let mut winner = None;
    for sample in 1..=config.max_candidates {
        let candidate = match call_once(unit, input.clone(), ctx.clone(), &mut outcome).await {
            Ok(result) => filter.canonicalize(&result),
            Err(err) => {
                tracing::debug!(state = %ctx.state, sample, error = %err.message, "voting sample failed");
                None
            }
        };
        let Some((key, value)) = candidate else {
            outcome.metrics.red_flags += 1;
            continue;
        };
        if let Some(decided) = tally.add(key, value) {
            tracing::debug!(state = %ctx.state, sample, "voting reached margin");
            winner = Some(decided);
            break;
        }
    }

    let output = winner.or_else(|| tally.leader()).unwrap_or(Value::Null);
    outcome.metrics.votes = tally.counts();
    tracing::info!(
        state = %ctx.state,
        samples = outcome.metrics.calls,
        red_flags = outcome.metrics.red_flags,
        "voting finished"
    );
    outcome.output = output;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::workflow::unit::Usage;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays a fixed script of results, one per call.
    struct Scripted {
        script: Vec<Result<Value, &'static str>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(script: Vec<Result<Value, &'static str>>) -> Arc<Self> {
            Arc::new(Scripted {
                script,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl UnitOfWork for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn validate_params(&self, _params: &Value) -> Result<(), AppError> {
            Ok(())
        }

        async fn execute(&self, _input: Value, _ctx: UnitContext) -> Result<UnitResult, AppError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self.script[n % self.script.len()].clone();
            let mut result = match step {
                Ok(value) => UnitResult::output(value),
                Err(kind) => UnitResult::failure(kind, "scripted failure"),
            };
            result.usage = Some(Usage {
                input_tokens: 1,
                output_tokens: 2,
            });
            Ok(result)
        }
    }

    fn ctx() -> UnitContext {
        UnitContext {
            execution_id: "e".into(),
            workflow: "w".into(),
            state: "s".into(),
            step: 1,
            params: json!({}),
            context: json!({}),
        }
    }

    fn voting(k: usize, max: usize) -> StrategyConfig {
        StrategyConfig::Voting(VotingConfig {
            k_margin: k,
            max_candidates: max,
            field: None,
            pattern: None,
            max_length: None,
            case_insensitive: false,
        })
    }

    fn stream(values: &[&str]) -> Arc<Scripted> {
        Scripted::new(values.iter().map(|v| Ok(json!(v))).collect())
    }

    async fn run_vote(values: &[&str], k: usize, max: usize) -> (Value, usize) {
        let unit = stream(values);
        let outcome = execute(&voting(k, max), unit.clone(), json!({}), ctx())
            .await
            .unwrap();
        (outcome.output, unit.calls())
    }

    #[tokio::test]
    async fn voting_stops_at_fourth_sample_for_aaba() {
        let (winner, calls) = run_vote(&["A", "A", "B", "A", "B", "B"], 2, 10).await;
        assert_eq!(winner, json!("A"));
        assert_eq!(calls, 4);
    }

    #[tokio::test]
    async fn voting_stops_at_sixth_sample_for_alternating_start() {
        let (winner, calls) = run_vote(&["A", "B", "A", "B", "A", "A", "B"], 2, 10).await;
        assert_eq!(winner, json!("A"));
        assert_eq!(calls, 6);
    }

    #[tokio::test]
    async fn voting_stops_at_third_sample_for_unanimous_stream() {
        let (winner, calls) = run_vote(&["A", "A", "A", "B"], 2, 10).await;
        assert_eq!(winner, json!("A"));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn voting_with_margin_one_stops_at_second_sample() {
        let (winner, calls) = run_vote(&["B", "B", "A"], 1, 10).await;
        assert_eq!(winner, json!("B"));
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn exhausted_budget_returns_first_seen_plurality_leader() {
        let (winner, calls) = run_vote(&["B", "A", "A", "B"], 3, 4).await;
        assert_eq!(calls, 4);
        assert_eq!(winner, json!("B"));
    }

    #[tokio::test]
    async fn red_flags_are_counted_not_raised() {
        let unit = Scripted::new(vec![
            Err("boom"),
            Ok(json!("way too long answer")),
            Ok(json!("yes")),
            Ok(json!("  YES ")),
            Ok(json!(42)),
            Ok(json!("yes")),
        ]);
        let config = StrategyConfig::Voting(VotingConfig {
            k_margin: 2,
            max_candidates: 6,
            field: None,
            pattern: Some("^(yes|no)$".into()),
            max_length: Some(5),
            case_insensitive: true,
        });
        let outcome = execute(&config, unit.clone(), json!({}), ctx()).await.unwrap();
        assert_eq!(outcome.output, json!("yes"));
        assert_eq!(unit.calls(), 6);
        assert_eq!(outcome.metrics.red_flags, 3);
        assert_eq!(outcome.metrics.votes.get("yes"), Some(&3));
        assert_eq!(outcome.usage.calls, 6);
    }

    #[tokio::test]
    async fn no_valid_sample_yields_null() {
        let unit = Scripted::new(vec![Err("boom")]);
        let outcome = execute(&voting(1, 3), unit, json!({}), ctx()).await.unwrap();
        assert_eq!(outcome.output, Value::Null);
        assert_eq!(outcome.metrics.red_flags, 3);
    }

    #[tokio::test]
    async fn votes_on_a_nested_field() {
        let unit = Scripted::new(vec![Ok(json!({"answer": {"label": "cat"}, "noise": 1}))]);
        let config = StrategyConfig::Voting(VotingConfig {
            k_margin: 1,
            max_candidates: 5,
            field: Some("answer.label".into()),
            pattern: None,
            max_length: None,
            case_insensitive: false,
        });
        let outcome = execute(&config, unit, json!({}), ctx()).await.unwrap();
        assert_eq!(outcome.output, json!("cat"));
    }

    #[tokio::test]
    async fn retry_attempts_are_delays_plus_one() {
        let unit = Scripted::new(vec![Err("flaky"), Err("flaky"), Ok(json!({"ok": true}))]);
        let config = StrategyConfig::Retry {
            delays_ms: vec![1, 1],
            jitter: 0.5,
        };
        let outcome = execute(&config, unit.clone(), json!({}), ctx()).await.unwrap();
        assert_eq!(outcome.output, json!({"ok": true}));
        assert_eq!(unit.calls(), 3);
        assert_eq!(outcome.usage.input_tokens, 3);

        let always = Scripted::new(vec![Err("down")]);
        let err = execute(&config, always.clone(), json!({}), ctx())
            .await
            .unwrap_err();
        assert_eq!(always.calls(), 3);
        assert_eq!(err.kind(), "down");
    }

    #[tokio::test]
    async fn parallel_keeps_every_sample_and_nulls_failures() {
        let unit = Scripted::new(vec![Ok(json!(1)), Err("x"), Ok(json!(3))]);
        let outcome = execute(&StrategyConfig::Parallel { samples: 3 }, unit, json!({}), ctx())
            .await
            .unwrap();
        let values = outcome.output.as_array().unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(values.iter().filter(|v| v.is_null()).count(), 1);
        assert_eq!(outcome.metrics.failures, 1);

        let down = Scripted::new(vec![Err("down")]);
        assert!(execute(&StrategyConfig::Parallel { samples: 2 }, down, json!({}), ctx())
            .await
            .is_err());
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..100 {
            let delay = jittered(Duration::from_millis(100), 0.2);
            assert!(delay >= Duration::from_millis(80) && delay <= Duration::from_millis(120));
        }
        assert_eq!(jittered(Duration::from_millis(100), 0.0), Duration::from_millis(100));
    }
}
