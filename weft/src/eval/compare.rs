//! Baseline-vs-candidate comparison (spec.md §4.5.3).

use std::collections::{HashMap, HashSet};

use super::store::EvalStore;
use super::Case;
use crate::error::EvalError;

/// `compareRuns` tuning knobs; defaults match spec.md §4.5.3.
#[derive(Clone, Copy, Debug)]
pub struct CompareOptions {
    pub tolerance: f64,
    pub regression_threshold: f64,
}

impl Default for CompareOptions {
    fn default() -> Self {
        CompareOptions {
            tolerance: 0.01,
            regression_threshold: 0.05,
        }
    }
}

/// One scorer's classified movement on one case.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Verdict {
    Improved,
    Regressed,
    Unchanged,
}

fn classify(delta: f64, tolerance: f64) -> Verdict {
    if delta > tolerance {
        Verdict::Improved
    } else if delta < -tolerance {
        Verdict::Regressed
    } else {
        Verdict::Unchanged
    }
}

/// Per-case, per-scorer deltas (`candidate - baseline`).
#[derive(Clone, Debug, PartialEq)]
pub struct CaseDelta {
    pub idx: usize,
    pub scorer_deltas: HashMap<String, (f64, Verdict)>,
}

/// A scorer's mean delta across all compared cases, flagged as a regression when the mean
/// drops below `-regression_threshold`.
#[derive(Clone, Debug, PartialEq)]
pub struct ScorerDelta {
    pub name: String,
    pub mean_delta: f64,
    pub regressed: bool,
}

/// Mean latency/token deltas across all compared cases.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CostDelta {
    pub latency_ms: f64,
    pub tokens_in: f64,
    pub tokens_out: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompareResult {
    pub baseline_run_id: String,
    pub candidate_run_id: String,
    pub compared_case_count: usize,
    pub case_deltas: Vec<CaseDelta>,
    pub scorer_deltas: Vec<ScorerDelta>,
    pub cost_delta: CostDelta,
}

/// Compares two runs case-by-case over the intersection of case indices present in both
/// (spec.md §4.5.3). A mismatched index set is logged, not returned as an error.
pub async fn compare_runs(
    store: &dyn EvalStore,
    baseline_run_id: &str,
    candidate_run_id: &str,
    options: CompareOptions,
) -> Result<CompareResult, EvalError> {
    let baseline_cases = store.list_cases(baseline_run_id).await?;
    let candidate_cases = store.list_cases(candidate_run_id).await?;

    let baseline_idx: HashSet<usize> = baseline_cases.iter().map(|c| c.idx).collect();
    let candidate_idx: HashSet<usize> = candidate_cases.iter().map(|c| c.idx).collect();
    if baseline_idx != candidate_idx {
        tracing::warn!(
            baseline_run_id,
            candidate_run_id,
            "baseline and candidate runs do not share the same case indices; comparing their intersection only"
        );
    }
    let mut shared: Vec<usize> = baseline_idx.intersection(&candidate_idx).copied().collect();
    shared.sort_unstable();

    let baseline_by_idx: HashMap<usize, &Case> = baseline_cases.iter().map(|c| (c.idx, c)).collect();
    let candidate_by_idx: HashMap<usize, &Case> = candidate_cases.iter().map(|c| (c.idx, c)).collect();

    let mut case_deltas = Vec::with_capacity(shared.len());
    let mut scorer_sums: HashMap<String, f64> = HashMap::new();
    let mut scorer_counts: HashMap<String, usize> = HashMap::new();
    let mut latency_sum = 0.0;
    let mut tokens_in_sum = 0.0;
    let mut tokens_out_sum = 0.0;

    for &idx in &shared {
        let baseline_case = baseline_by_idx[&idx];
        let candidate_case = candidate_by_idx[&idx];
        let baseline_scores: HashMap<String, f64> = store
            .list_scores(&baseline_case.id)
            .await?
            .into_iter()
            .map(|s| (s.scorer_name, s.score))
            .collect();
        let candidate_scores: HashMap<String, f64> = store
            .list_scores(&candidate_case.id)
            .await?
            .into_iter()
            .map(|s| (s.scorer_name, s.score))
            .collect();

        let mut scorer_deltas = HashMap::new();
        let mut scorer_names: Vec<&String> = baseline_scores.keys().chain(candidate_scores.keys()).collect();
        scorer_names.sort();
        scorer_names.dedup();
        for name in scorer_names {
            let baseline_score = baseline_scores.get(name).copied().unwrap_or(0.0);
            let candidate_score = candidate_scores.get(name).copied().unwrap_or(0.0);
            let delta = candidate_score - baseline_score;
            scorer_deltas.insert(name.clone(), (delta, classify(delta, options.tolerance)));
            *scorer_sums.entry(name.clone()).or_insert(0.0) += delta;
            *scorer_counts.entry(name.clone()).or_insert(0) += 1;
        }
        case_deltas.push(CaseDelta { idx, scorer_deltas });

        latency_sum += (candidate_case.latency_ms - baseline_case.latency_ms) as f64;
        tokens_in_sum += (candidate_case.tokens_in - baseline_case.tokens_in) as f64;
        tokens_out_sum += (candidate_case.tokens_out - baseline_case.tokens_out) as f64;
    }

    let n = shared.len().max(1) as f64;
    let scorer_deltas = scorer_sums
        .into_iter()
        .map(|(name, sum)| {
            let count = scorer_counts[&name].max(1) as f64;
            let mean_delta = sum / count;
            ScorerDelta {
                regressed: mean_delta < -options.regression_threshold,
                name,
                mean_delta,
            }
        })
        .collect();

    Ok(CompareResult {
        baseline_run_id: baseline_run_id.to_string(),
        candidate_run_id: candidate_run_id.to_string(),
        compared_case_count: shared.len(),
        case_deltas,
        scorer_deltas,
        cost_delta: CostDelta {
            latency_ms: latency_sum / n,
            tokens_in: tokens_in_sum / n,
            tokens_out: tokens_out_sum / n,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::{Case, InMemoryEvalStore, Score};

    async fn seed_run(store: &InMemoryEvalStore, name: &str, scores: &[(usize, f64, i64)]) -> String {
        let suite = store.get_or_create_suite("compare-suite").await.unwrap();
        let run = store.create_run(&suite.id, name, "openai/gpt-4o", serde_json::json!({})).await.unwrap();
        for &(idx, score, latency_ms) in scores {
            let case = Case {
                id: format!("{name}-{idx}"),
                run_id: run.id.clone(),
                idx,
                input: serde_json::json!(idx),
                output: serde_json::json!("x"),
                expected: serde_json::json!("x"),
                latency_ms,
                tokens_in: 1,
                tokens_out: 1,
                error: None,
            };
            let score = Score::new(case.id.clone(), "exact-match", score, None);
            store.insert_case(case, vec![score]).await.unwrap();
        }
        run.id
    }

    #[tokio::test]
    async fn flags_regression_when_mean_delta_drops_past_threshold() {
        let store = InMemoryEvalStore::new();
        let baseline = seed_run(&store, "baseline", &[(0, 1.0, 100), (1, 1.0, 100)]).await;
        let candidate = seed_run(&store, "candidate", &[(0, 0.8, 150), (1, 0.8, 150)]).await;

        let result = compare_runs(&store, &baseline, &candidate, CompareOptions::default()).await.unwrap();
        assert_eq!(result.compared_case_count, 2);
        let exact_match = result.scorer_deltas.iter().find(|d| d.name == "exact-match").unwrap();
        assert!((exact_match.mean_delta - (-0.2)).abs() < 1e-9);
        assert!(exact_match.regressed);
        assert_eq!(result.cost_delta.latency_ms, 50.0);
    }

    #[tokio::test]
    async fn unchanged_within_tolerance() {
        let store = InMemoryEvalStore::new();
        let baseline = seed_run(&store, "baseline", &[(0, 0.9, 100)]).await;
        let candidate = seed_run(&store, "candidate", &[(0, 0.905, 100)]).await;

        let result = compare_runs(&store, &baseline, &candidate, CompareOptions::default()).await.unwrap();
        let (_, verdict) = result.case_deltas[0].scorer_deltas["exact-match"];
        assert_eq!(verdict, Verdict::Unchanged);
    }

    #[tokio::test]
    async fn mismatched_indices_compare_only_the_intersection() {
        let store = InMemoryEvalStore::new();
        let baseline = seed_run(&store, "baseline", &[(0, 1.0, 100), (1, 1.0, 100)]).await;
        let candidate = seed_run(&store, "candidate", &[(0, 1.0, 100), (2, 1.0, 100)]).await;

        let result = compare_runs(&store, &baseline, &candidate, CompareOptions::default()).await.unwrap();
        assert_eq!(result.compared_case_count, 1);
    }
}
