//! In-memory `EvalStore`: the backend used by tests and by one-off ad hoc eval runs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use super::store::EvalStore;
use super::{now_millis, Case, Prompt, Run, RunStatus, Score, Suite, Summary};
use crate::error::EvalError;
use crate::memory::uuid6;

#[derive(Default)]
struct State {
    suites: HashMap<String, Suite>,
    runs: HashMap<String, Run>,
    cases: HashMap<String, Case>,
    scores: HashMap<String, Vec<Score>>,
    prompts: HashMap<String, Vec<Prompt>>,
}

/// Embedded in-process `EvalStore`. Data does not survive process restart.
#[derive(Default)]
pub struct InMemoryEvalStore {
    state: Mutex<State>,
}

impl InMemoryEvalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EvalStore for InMemoryEvalStore {
    async fn get_or_create_suite(&self, name: &str) -> Result<Suite, EvalError> {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.suites.values().find(|s| s.name == name) {
            return Ok(existing.clone());
        }
        let suite = Suite::new(name);
        state.suites.insert(suite.id.clone(), suite.clone());
        Ok(suite)
    }

    async fn get_suite(&self, suite_id: &str) -> Result<Option<Suite>, EvalError> {
        Ok(self.state.lock().unwrap().suites.get(suite_id).cloned())
    }

    async fn create_run(&self, suite_id: &str, name: &str, model: &str, config: Value) -> Result<Run, EvalError> {
        let run = Run::new(suite_id, name, model, config);
        self.state.lock().unwrap().runs.insert(run.id.clone(), run.clone());
        Ok(run)
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, EvalError> {
        Ok(self.state.lock().unwrap().runs.get(run_id).cloned())
    }

    async fn finish_run(&self, run_id: &str, status: RunStatus, summary: Option<Summary>) -> Result<(), EvalError> {
        let mut state = self.state.lock().unwrap();
        let run = state
            .runs
            .get_mut(run_id)
            .ok_or_else(|| EvalError::RunNotFound(run_id.to_string()))?;
        run.status = status;
        run.finished_at = Some(now_millis());
        run.summary = summary;
        Ok(())
    }

    async fn insert_case(&self, case: Case, scores: Vec<Score>) -> Result<(), EvalError> {
        let mut state = self.state.lock().unwrap();
        state.scores.insert(case.id.clone(), scores);
        state.cases.insert(case.id.clone(), case);
        Ok(())
    }

    async fn list_cases(&self, run_id: &str) -> Result<Vec<Case>, EvalError> {
        let mut out: Vec<Case> = self
            .state
            .lock()
            .unwrap()
            .cases
            .values()
            .filter(|c| c.run_id == run_id)
            .cloned()
            .collect();
        out.sort_by_key(|c| c.idx);
        Ok(out)
    }

    async fn list_scores(&self, case_id: &str) -> Result<Vec<Score>, EvalError> {
        Ok(self.state.lock().unwrap().scores.get(case_id).cloned().unwrap_or_default())
    }

    async fn put_prompt(&self, name: &str, content: &str) -> Result<Prompt, EvalError> {
        let mut state = self.state.lock().unwrap();
        let versions = state.prompts.entry(name.to_string()).or_default();
        let next_version = versions.iter().map(|p| p.version).max().unwrap_or(0) + 1;
        let prompt = Prompt {
            id: uuid6::uuid6().to_string(),
            name: name.to_string(),
            version: next_version,
            content: content.to_string(),
            created_at: now_millis(),
        };
        versions.push(prompt.clone());
        Ok(prompt)
    }

    async fn get_prompt(&self, name: &str, version: Option<i64>) -> Result<Option<Prompt>, EvalError> {
        let state = self.state.lock().unwrap();
        let Some(versions) = state.prompts.get(name) else {
            return Ok(None);
        };
        Ok(match version {
            Some(v) => versions.iter().find(|p| p.version == v).cloned(),
            None => versions.iter().max_by_key(|p| p.version).cloned(),
        })
    }

    async fn list_versions(&self, name: &str) -> Result<Vec<Prompt>, EvalError> {
        let mut out = self.state.lock().unwrap().prompts.get(name).cloned().unwrap_or_default();
        out.sort_by_key(|p| p.version);
        Ok(out)
    }
}
