//! The eval engine's execution algorithm (spec.md §4.5.1): materialize the dataset, create
//! or join a suite and run, execute cases in semaphore-bounded concurrent batches, score and
//! persist each one, then compute and persist the run summary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::scorer::{Scorer, ScoreResult};
use super::store::EvalStore;
use super::{Case, DatasetItem, EvalEmitter, EvalEvent, NoopEmitter, RunStatus, Score, Summary};
use crate::error::EvalError;

/// One task invocation's raw result before scoring (spec.md §4.5 "task").
#[derive(Clone, Debug, PartialEq)]
pub struct TaskOutcome {
    pub output: Value,
    pub tokens_in: i64,
    pub tokens_out: i64,
}

/// The thing under evaluation: given a case's input, produce an output (or fail).
#[async_trait]
pub trait Task: Send + Sync {
    async fn run(&self, input: &Value) -> Result<TaskOutcome, String>;
}

/// Bundles everything `run_eval` needs (spec.md §4.5 `runEval(config)`).
pub struct RunEvalConfig {
    pub name: String,
    pub model: String,
    pub dataset: Vec<DatasetItem>,
    pub task: Arc<dyn Task>,
    pub scorers: Vec<Arc<dyn Scorer>>,
    pub store: Arc<dyn EvalStore>,
    pub emitter: Arc<dyn EvalEmitter>,
    pub suite_name: String,
    pub max_concurrency: usize,
    pub batch_size: Option<usize>,
    pub timeout: Duration,
    pub trials: u32,
    pub threshold: f64,
    /// Checked before issuing each case's task and between batches (spec.md §5
    /// "cancellation"); an open token (the default) never cancels the run.
    pub abort: CancellationToken,
}

impl RunEvalConfig {
    pub fn new(
        name: impl Into<String>,
        model: impl Into<String>,
        dataset: Vec<DatasetItem>,
        task: Arc<dyn Task>,
        scorers: Vec<Arc<dyn Scorer>>,
        store: Arc<dyn EvalStore>,
    ) -> Self {
        let name = name.into();
        RunEvalConfig {
            suite_name: name.clone(),
            name,
            model: model.into(),
            dataset,
            task,
            scorers,
            store,
            emitter: Arc::new(NoopEmitter),
            max_concurrency: 10,
            batch_size: None,
            timeout: Duration::from_secs(30),
            trials: 1,
            threshold: 0.5,
            abort: CancellationToken::new(),
        }
    }
}

struct TrialOutcome {
    output: Value,
    tokens_in: i64,
    tokens_out: i64,
    latency_ms: i64,
    error: Option<String>,
    scores: HashMap<String, f64>,
}

fn clamp_score(name: &str, score: f64) -> f64 {
    if !(0.0..=1.0).contains(&score) {
        tracing::warn!(scorer = name, score, "scorer returned an out-of-range score, clamping to [0,1]");
    }
    score.clamp(0.0, 1.0)
}

async fn run_trial(task: &Arc<dyn Task>, scorers: &[Arc<dyn Scorer>], item: &DatasetItem, timeout: Duration) -> TrialOutcome {
    let start = std::time::Instant::now();
    let attempt = tokio::time::timeout(timeout, task.run(&item.input)).await;
    let latency_ms = start.elapsed().as_millis() as i64;

    match attempt {
        Ok(Ok(outcome)) => {
            let mut scores = HashMap::new();
            for scorer in scorers {
                let ScoreResult { score, .. } = scorer.score(&item.input, &outcome.output, &item.expected).await;
                scores.insert(scorer.name().to_string(), clamp_score(scorer.name(), score));
            }
            TrialOutcome {
                output: outcome.output,
                tokens_in: outcome.tokens_in,
                tokens_out: outcome.tokens_out,
                latency_ms,
                error: None,
                scores,
            }
        }
        Ok(Err(reason)) => {
            let mut scores = HashMap::new();
            for scorer in scorers {
                scores.insert(scorer.name().to_string(), 0.0);
            }
            TrialOutcome {
                output: Value::Null,
                tokens_in: 0,
                tokens_out: 0,
                latency_ms,
                error: Some(format!("Task failed: {reason}")),
                scores,
            }
        }
        Err(_elapsed) => {
            let mut scores = HashMap::new();
            for scorer in scorers {
                scores.insert(scorer.name().to_string(), 0.0);
            }
            TrialOutcome {
                output: Value::Null,
                tokens_in: 0,
                tokens_out: 0,
                latency_ms,
                error: Some("timeout exceeded".to_string()),
                scores,
            }
        }
    }
}

/// Runs `trials` attempts sequentially (spec.md §4.5.1 step 5), averaging latency/tokens/
/// scores and keeping the last successful trial's output (or the last attempt's, if none
/// succeeded).
async fn run_case(
    run_id: &str,
    idx: usize,
    task: &Arc<dyn Task>,
    scorers: &[Arc<dyn Scorer>],
    item: &DatasetItem,
    timeout: Duration,
    trials: u32,
) -> (Case, Vec<Score>) {
    let mut trial_outcomes = Vec::with_capacity(trials.max(1) as usize);
    for _ in 0..trials.max(1) {
        trial_outcomes.push(run_trial(task, scorers, item, timeout).await);
    }

    let last_successful = trial_outcomes.iter().rev().find(|t| t.error.is_none());
    let displayed = last_successful.unwrap_or_else(|| trial_outcomes.last().unwrap());
    let output = displayed.output.clone();
    let error = if last_successful.is_some() { None } else { displayed.error.clone() };

    let n = trial_outcomes.len() as i64;
    let latency_ms = trial_outcomes.iter().map(|t| t.latency_ms).sum::<i64>() / n.max(1);
    let tokens_in = trial_outcomes.iter().map(|t| t.tokens_in).sum::<i64>() / n.max(1);
    let tokens_out = trial_outcomes.iter().map(|t| t.tokens_out).sum::<i64>() / n.max(1);

    let mut score_sums: HashMap<String, f64> = HashMap::new();
    for scorer in scorers {
        let sum: f64 = trial_outcomes.iter().filter_map(|t| t.scores.get(scorer.name())).sum();
        score_sums.insert(scorer.name().to_string(), sum / trial_outcomes.len().max(1) as f64);
    }

    let case = Case {
        id: crate::memory::uuid6::uuid6().to_string(),
        run_id: run_id.to_string(),
        idx,
        input: item.input.clone(),
        output,
        expected: item.expected.clone(),
        latency_ms,
        tokens_in,
        tokens_out,
        error,
    };
    let scores = score_sums
        .into_iter()
        .map(|(name, score)| Score::new(case.id.clone(), name, score, None))
        .collect();
    (case, scores)
}

/// Runs the full eval driver: materialize (already a `Vec`), create/join suite and run,
/// execute in semaphore-bounded concurrent batches, score, persist, and summarize
/// (spec.md §4.5.1).
pub async fn run_eval(config: RunEvalConfig) -> Result<Summary, EvalError> {
    let total_cases = config.dataset.len();
    let suite = config.store.get_or_create_suite(&config.suite_name).await?;
    let run_config = serde_json::json!({
        "maxConcurrency": config.max_concurrency,
        "batchSize": config.batch_size,
        "timeoutMs": config.timeout.as_millis() as u64,
        "trials": config.trials,
        "threshold": config.threshold,
    });
    let run = config.store.create_run(&suite.id, &config.name, &config.model, run_config).await?;
    config.emitter.emit(EvalEvent::RunStart {
        run_id: run.id.clone(),
        total_cases,
        name: config.name.clone(),
        model: config.model.clone(),
    });

    let batch_size = config.batch_size.unwrap_or(total_cases).max(1);
    let semaphore = Arc::new(tokio::sync::Semaphore::new(config.max_concurrency.max(1)));

    let mut pass_count = 0usize;
    let mut score_sums: HashMap<String, f64> = HashMap::new();
    for scorer in &config.scorers {
        score_sums.insert(scorer.name().to_string(), 0.0);
    }

    let indexed: Vec<(usize, &DatasetItem)> = config.dataset.iter().enumerate().collect();
    let mut cancelled = false;
    'batches: for batch in indexed.chunks(batch_size) {
        if config.abort.is_cancelled() {
            tracing::warn!(run_id = %run.id, "abort requested, not starting next batch");
            cancelled = true;
            break 'batches;
        }

        let mut handles = Vec::with_capacity(batch.len());
        for &(idx, item) in batch {
            if config.abort.is_cancelled() {
                tracing::warn!(run_id = %run.id, "abort requested, not issuing further cases this batch");
                cancelled = true;
                break;
            }
            let semaphore = semaphore.clone();
            let task = config.task.clone();
            let scorers = config.scorers.clone();
            let run_id = run.id.clone();
            let timeout = config.timeout;
            let trials = config.trials;
            let item = item.clone();
            let emitter = config.emitter.clone();
            emitter.emit(EvalEvent::CaseStart {
                run_id: run_id.clone(),
                index: idx,
                input: item.input.clone(),
            });
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                run_case(&run_id, idx, &task, &scorers, &item, timeout, trials).await
            }));
        }

        for handle in handles {
            let (case, scores) = handle.await.map_err(|e| EvalError::TaskFailed(e.to_string()))?;
            config.store.insert_case(case.clone(), scores.clone()).await?;

            let passed = scores.iter().all(|s| s.score >= config.threshold) && !scores.is_empty();
            if passed {
                pass_count += 1;
            }
            for score in &scores {
                *score_sums.entry(score.scorer_name.clone()).or_insert(0.0) += score.score;
            }

            config.emitter.emit(EvalEvent::CaseScored {
                run_id: run.id.clone(),
                index: case.idx,
                input: case.input.clone(),
                output: case.output.clone(),
                expected: case.expected.clone(),
                scores: scores.iter().map(|s| (s.scorer_name.clone(), s.score)).collect(),
                error: case.error.clone(),
                latency_ms: case.latency_ms,
                tokens_in: case.tokens_in,
                tokens_out: case.tokens_out,
            });
            if let Some(error) = &case.error {
                config.emitter.emit(EvalEvent::CaseError {
                    run_id: run.id.clone(),
                    index: case.idx,
                    error: error.clone(),
                });
            }
        }

        if cancelled {
            break 'batches;
        }
    }

    if cancelled {
        config.store.finish_run(&run.id, RunStatus::Failed, None).await?;
        return Err(EvalError::Cancelled);
    }

    let mean_scores: HashMap<String, f64> = score_sums
        .into_iter()
        .map(|(name, sum)| (name, sum / total_cases.max(1) as f64))
        .collect();
    let summary = Summary {
        total_cases,
        pass_count,
        fail_count: total_cases - pass_count,
        mean_scores,
    };

    config.store.finish_run(&run.id, RunStatus::Completed, Some(summary.clone())).await?;
    config.emitter.emit(EvalEvent::RunEnd {
        run_id: run.id.clone(),
        summary: summary.clone(),
    });

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::{ExactMatchScorer, InMemoryEvalStore};

    struct EchoTask;
    #[async_trait]
    impl Task for EchoTask {
        async fn run(&self, input: &Value) -> Result<TaskOutcome, String> {
            Ok(TaskOutcome {
                output: input.clone(),
                tokens_in: 1,
                tokens_out: 1,
            })
        }
    }

    struct SleepyTask(Duration);
    #[async_trait]
    impl Task for SleepyTask {
        async fn run(&self, _input: &Value) -> Result<TaskOutcome, String> {
            tokio::time::sleep(self.0).await;
            Ok(TaskOutcome {
                output: Value::Null,
                tokens_in: 0,
                tokens_out: 0,
            })
        }
    }

    #[tokio::test]
    async fn single_case_passes_with_exact_match() {
        let dataset = vec![DatasetItem {
            input: serde_json::json!("4"),
            expected: serde_json::json!("4"),
        }];
        let mut config = RunEvalConfig::new("smoke", "openai/gpt-4o", dataset, Arc::new(EchoTask), vec![Arc::new(ExactMatchScorer)], Arc::new(InMemoryEvalStore::new()));
        config.threshold = 0.5;
        let summary = run_eval(config).await.unwrap();
        assert_eq!(summary.total_cases, 1);
        assert_eq!(summary.pass_count, 1);
        assert_eq!(summary.fail_count, 0);
        assert_eq!(summary.mean_scores["exact-match"], 1.0);
    }

    #[tokio::test]
    async fn timed_out_case_scores_zero_with_timeout_error() {
        let dataset = vec![DatasetItem {
            input: serde_json::json!("anything"),
            expected: serde_json::json!("4"),
        }];
        let mut config = RunEvalConfig::new(
            "smoke",
            "openai/gpt-4o",
            dataset,
            Arc::new(SleepyTask(Duration::from_millis(200))),
            vec![Arc::new(ExactMatchScorer)],
            Arc::new(InMemoryEvalStore::new()),
        );
        config.timeout = Duration::from_millis(20);
        let summary = run_eval(config).await.unwrap();
        assert_eq!(summary.pass_count, 0);
        assert_eq!(summary.mean_scores["exact-match"], 0.0);
    }

    #[tokio::test]
    async fn trials_average_latency_tokens_and_scores() {
        struct FlakyOnce {
            calls: std::sync::atomic::AtomicUsize,
        }
        #[async_trait]
        impl Task for FlakyOnce {
            async fn run(&self, input: &Value) -> Result<TaskOutcome, String> {
                let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if n == 0 {
                    Err("boom".to_string())
                } else {
                    Ok(TaskOutcome {
                        output: input.clone(),
                        tokens_in: 2,
                        tokens_out: 2,
                    })
                }
            }
        }
        let dataset = vec![DatasetItem {
            input: serde_json::json!("4"),
            expected: serde_json::json!("4"),
        }];
        let mut config = RunEvalConfig::new(
            "smoke",
            "openai/gpt-4o",
            dataset,
            Arc::new(FlakyOnce {
                calls: std::sync::atomic::AtomicUsize::new(0),
            }),
            vec![Arc::new(ExactMatchScorer)],
            Arc::new(InMemoryEvalStore::new()),
        );
        config.trials = 2;
        let summary = run_eval(config).await.unwrap();
        // first trial fails (score 0), second passes (score 1): averaged to 0.5.
        assert_eq!(summary.mean_scores["exact-match"], 0.5);
    }

    #[tokio::test]
    async fn cancelled_before_first_batch_fails_the_run() {
        let dataset = vec![DatasetItem {
            input: serde_json::json!("4"),
            expected: serde_json::json!("4"),
        }];
        let mut config = RunEvalConfig::new(
            "smoke",
            "openai/gpt-4o",
            dataset,
            Arc::new(EchoTask),
            vec![Arc::new(ExactMatchScorer)],
            Arc::new(InMemoryEvalStore::new()),
        );
        config.abort.cancel();
        let err = run_eval(config).await.unwrap_err();
        assert!(matches!(err, EvalError::Cancelled));
    }
}
