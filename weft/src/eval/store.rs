//! Eval Store (spec.md §4.5 expansion): persistence for suites/runs/cases/scores, plus a
//! prompt library sharing the same transactional discipline as [`crate::store::ContextStore`].

use async_trait::async_trait;
use serde_json::Value;

use super::{Case, Prompt, Run, RunStatus, Score, Suite, Summary};
use crate::error::EvalError;

#[async_trait]
pub trait EvalStore: Send + Sync {
    async fn get_or_create_suite(&self, name: &str) -> Result<Suite, EvalError>;
    async fn get_suite(&self, suite_id: &str) -> Result<Option<Suite>, EvalError>;

    async fn create_run(&self, suite_id: &str, name: &str, model: &str, config: Value) -> Result<Run, EvalError>;
    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, EvalError>;
    /// Sets `status`/`finishedAt`/`summary` in one write (spec.md §4.5.1 step 9).
    async fn finish_run(&self, run_id: &str, status: RunStatus, summary: Option<Summary>) -> Result<(), EvalError>;

    /// Persists a case and its scores inside one transaction (spec.md §4.5.1 step 7).
    async fn insert_case(&self, case: Case, scores: Vec<Score>) -> Result<(), EvalError>;
    async fn list_cases(&self, run_id: &str) -> Result<Vec<Case>, EvalError>;
    async fn list_scores(&self, case_id: &str) -> Result<Vec<Score>, EvalError>;

    /// Inserts the next version for `name` (1 if none exists yet).
    async fn put_prompt(&self, name: &str, content: &str) -> Result<Prompt, EvalError>;
    /// Latest version when `version` is `None`.
    async fn get_prompt(&self, name: &str, version: Option<i64>) -> Result<Option<Prompt>, EvalError>;
    async fn list_versions(&self, name: &str) -> Result<Vec<Prompt>, EvalError>;
}
