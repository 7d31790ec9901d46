//! Eval Engine (spec.md §4.5): a one-shot `run_eval(config) -> Summary` driver over a
//! materialized dataset, plus `compare_runs` for baseline-vs-candidate diffing.
//!
//! Cases run concurrently bounded by a counting semaphore, each racing against a
//! per-case timeout; scores are persisted alongside the case in one transaction and the
//! run emits a typed event stream a caller can subscribe to (`run:start`, `case:scored`,
//! `case:error`, `run:end`).

mod compare;
mod memory;
mod runner;
mod scorer;
mod sqlite;
mod store;

pub use compare::{compare_runs, CaseDelta, CompareOptions, CompareResult, CostDelta, ScorerDelta, Verdict};
pub use memory::InMemoryEvalStore;
pub use runner::{run_eval, RunEvalConfig, Task, TaskOutcome};
pub use scorer::{ExactMatchScorer, Scorer, ScoreResult};
pub use sqlite::{resolve_default_store_path, SqliteEvalStore, DEFAULT_EVAL_STORE_PATH};
pub use store::EvalStore;

use std::collections::{BTreeSet, HashMap};

use serde_json::Value;

use crate::memory::uuid6;

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// `Suite(id, name, createdAt)` — a group of runs sharing a name (spec.md §3).
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Suite {
    pub id: String,
    pub name: String,
    pub created_at: i64,
}

impl Suite {
    pub fn new(name: impl Into<String>) -> Self {
        Suite {
            id: uuid6::uuid6().to_string(),
            name: name.into(),
            created_at: now_millis(),
        }
    }
}

/// A run's lifecycle state (spec.md §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

/// `Run(id, suiteId, name, model, config, startedAt, finishedAt?, status, summary?)`.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Run {
    pub id: String,
    pub suite_id: String,
    pub name: String,
    pub model: String,
    pub config: Value,
    pub started_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
}

impl Run {
    pub fn new(suite_id: impl Into<String>, name: impl Into<String>, model: impl Into<String>, config: Value) -> Self {
        Run {
            id: uuid6::uuid6().to_string(),
            suite_id: suite_id.into(),
            name: name.into(),
            model: model.into(),
            config,
            started_at: now_millis(),
            finished_at: None,
            status: RunStatus::Running,
            summary: None,
        }
    }
}

/// `Case(id, runId, idx, input, output, expected, latencyMs, tokensIn, tokensOut, error?)`.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Case {
    pub id: String,
    pub run_id: String,
    pub idx: usize,
    pub input: Value,
    pub output: Value,
    pub expected: Value,
    pub latency_ms: i64,
    pub tokens_in: i64,
    pub tokens_out: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `Score(id, caseId, scorerName, score ∈ [0,1], reason?)`.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Score {
    pub id: String,
    pub case_id: String,
    pub scorer_name: String,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Score {
    pub fn new(case_id: impl Into<String>, scorer_name: impl Into<String>, score: f64, reason: Option<String>) -> Self {
        Score {
            id: uuid6::uuid6().to_string(),
            case_id: case_id.into(),
            scorer_name: scorer_name.into(),
            score,
            reason,
        }
    }
}

/// `Prompt(id, name, version, content, createdAt)`, unique by `(name, version)` with
/// monotonically increasing `version` per `name`.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Prompt {
    pub id: String,
    pub name: String,
    pub version: i64,
    pub content: String,
    pub created_at: i64,
}

/// One dataset record, materialized before a run starts (spec.md §4.5.1 step 1).
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DatasetItem {
    pub input: Value,
    #[serde(default)]
    pub expected: Value,
}

/// Run totals and per-scorer means, computed after every batch completes (spec.md §4.5.2).
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Summary {
    pub total_cases: usize,
    pub pass_count: usize,
    pub fail_count: usize,
    pub mean_scores: HashMap<String, f64>,
}

/// Typed eval events (spec.md §6 "Eval event stream"), mirroring `StreamPart`'s tagged
/// shape so both event families share one `#[serde(tag = "type")]` convention.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EvalEvent {
    #[serde(rename = "run:start")]
    RunStart {
        run_id: String,
        total_cases: usize,
        name: String,
        model: String,
    },
    #[serde(rename = "case:start")]
    CaseStart { run_id: String, index: usize, input: Value },
    #[serde(rename = "case:scored")]
    CaseScored {
        run_id: String,
        index: usize,
        input: Value,
        output: Value,
        expected: Value,
        scores: HashMap<String, f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        latency_ms: i64,
        tokens_in: i64,
        tokens_out: i64,
    },
    #[serde(rename = "case:error")]
    CaseError { run_id: String, index: usize, error: String },
    #[serde(rename = "run:end")]
    RunEnd { run_id: String, summary: Summary },
}

/// Observes [`EvalEvent`]s as a run progresses. `Box<dyn Fn>` keeps call sites terse; an
/// implementation that needs `async` work (e.g. forwarding to a websocket) should hand off
/// to a channel from inside `emit`.
pub trait EvalEmitter: Send + Sync {
    fn emit(&self, event: EvalEvent);
}

/// An emitter that discards every event, for callers that only want the returned summary.
pub struct NoopEmitter;

impl EvalEmitter for NoopEmitter {
    fn emit(&self, _event: EvalEvent) {}
}

/// Forwards every event onto an unbounded channel for a caller to drain concurrently.
pub struct ChannelEmitter {
    sender: tokio::sync::mpsc::UnboundedSender<EvalEvent>,
}

impl ChannelEmitter {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<EvalEvent>) {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        (ChannelEmitter { sender }, receiver)
    }
}

impl EvalEmitter for ChannelEmitter {
    fn emit(&self, event: EvalEvent) {
        let _ = self.sender.send(event);
    }
}

/// A parsed `"1,3-4"`-style record selection: the zero-based indexes it names, and the
/// canonical comma-joined 1-based form (spec.md §8 "Record selection").
#[derive(Clone, Debug, PartialEq)]
pub struct RecordSelection {
    pub indexes: std::collections::HashSet<usize>,
    pub normalized: String,
}

/// Parses a human-entered record selection like `"1,3-4"` into zero-based indexes.
/// `"1,3-4"` names records 1, 3, and 4 (one-based) and normalizes to `"1,3,4"`.
pub fn parse_record_selection(spec: &str) -> Result<RecordSelection, crate::error::EvalError> {
    let mut numbers: BTreeSet<usize> = BTreeSet::new();
    for token in spec.split(',') {
        let token = token.trim();
        if token.is_empty() {
            return Err(crate::error::EvalError::InvalidRecordSelection(spec.to_string()));
        }
        match token.split_once('-') {
            Some((start, end)) => {
                let start: usize = start
                    .trim()
                    .parse()
                    .map_err(|_| crate::error::EvalError::InvalidRecordSelection(spec.to_string()))?;
                let end: usize = end
                    .trim()
                    .parse()
                    .map_err(|_| crate::error::EvalError::InvalidRecordSelection(spec.to_string()))?;
                if start == 0 || end < start {
                    return Err(crate::error::EvalError::InvalidRecordSelection(spec.to_string()));
                }
                numbers.extend(start..=end);
            }
            None => {
                let n: usize = token
                    .parse()
                    .map_err(|_| crate::error::EvalError::InvalidRecordSelection(spec.to_string()))?;
                if n == 0 {
                    return Err(crate::error::EvalError::InvalidRecordSelection(spec.to_string()));
                }
                numbers.insert(n);
            }
        }
    }
    if numbers.is_empty() {
        return Err(crate::error::EvalError::InvalidRecordSelection(spec.to_string()));
    }
    let normalized = numbers.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(",");
    let indexes = numbers.into_iter().map(|n| n - 1).collect();
    Ok(RecordSelection { indexes, normalized })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_record_selection_expands_ranges_and_normalizes() {
        let selection = parse_record_selection("1,3-4").unwrap();
        assert_eq!(selection.indexes, [0, 2, 3].into_iter().collect());
        assert_eq!(selection.normalized, "1,3,4");
    }

    #[test]
    fn parse_record_selection_dedupes_overlap() {
        let selection = parse_record_selection("2-3,3,1").unwrap();
        assert_eq!(selection.indexes, [0, 1, 2].into_iter().collect());
        assert_eq!(selection.normalized, "1,2,3");
    }

    #[test]
    fn parse_record_selection_rejects_zero_and_garbage() {
        assert!(parse_record_selection("0").is_err());
        assert!(parse_record_selection("abc").is_err());
        assert!(parse_record_selection("").is_err());
        assert!(parse_record_selection("3-1").is_err());
    }
}
