//! Scorers (spec.md §4.5, GLOSSARY "Scorer"): functions from `(input, output, expected)`
//! to a score in `[0,1]` with an optional reason.

use async_trait::async_trait;
use serde_json::Value;

/// A scorer's verdict on one case's output. Clamped to `[0,1]` by the runner, not here.
#[derive(Clone, Debug, PartialEq)]
pub struct ScoreResult {
    pub score: f64,
    pub reason: Option<String>,
}

#[async_trait]
pub trait Scorer: Send + Sync {
    fn name(&self) -> &str;
    async fn score(&self, input: &Value, output: &Value, expected: &Value) -> ScoreResult;
}

/// Scores 1.0 when `output == expected` under `serde_json::Value` equality, else 0.0.
pub struct ExactMatchScorer;

#[async_trait]
impl Scorer for ExactMatchScorer {
    fn name(&self) -> &str {
        "exact-match"
    }

    async fn score(&self, _input: &Value, output: &Value, expected: &Value) -> ScoreResult {
        if output == expected {
            ScoreResult { score: 1.0, reason: None }
        } else {
            ScoreResult {
                score: 0.0,
                reason: Some(format!("expected {expected}, got {output}")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn exact_match_scores_one_on_equality() {
        let scorer = ExactMatchScorer;
        let result = scorer.score(&json!("2+2"), &json!("4"), &json!("4")).await;
        assert_eq!(result.score, 1.0);
        assert!(result.reason.is_none());
    }

    #[tokio::test]
    async fn exact_match_scores_zero_with_reason_on_mismatch() {
        let scorer = ExactMatchScorer;
        let result = scorer.score(&json!("2+2"), &json!("5"), &json!("4")).await;
        assert_eq!(result.score, 0.0);
        assert!(result.reason.unwrap().contains("expected"));
    }
}
