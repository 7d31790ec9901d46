//! Embedded relational `EvalStore` backed by `rusqlite` (bundled feature).
//!
//! Same single-connection-per-instance, `spawn_blocking`-wrapped shape as
//! [`crate::store::SqliteStore`], so case+score inserts commit inside one transaction.
//! Defaults to `./.evals/store.db` per spec.md §6 "Persistent storage paths".

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use super::store::EvalStore;
use super::{now_millis, Case, Prompt, Run, RunStatus, Score, Suite, Summary};
use crate::error::EvalError;
use crate::memory::uuid6;

pub const DEFAULT_EVAL_STORE_PATH: &str = "./.evals/store.db";

/// Resolves the eval store's on-disk path: `WEFT_EVAL_STORE_PATH` if set (loaded via the
/// `weft` XDG config / `.env` through [`crate::ambient::load_once`]), else
/// [`DEFAULT_EVAL_STORE_PATH`] (SPEC_FULL.md §2 "Config").
pub fn resolve_default_store_path() -> std::path::PathBuf {
    crate::ambient::load_once();
    std::env::var("WEFT_EVAL_STORE_PATH")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::path::PathBuf::from(DEFAULT_EVAL_STORE_PATH))
}

fn to_eval_err(e: impl std::fmt::Display) -> EvalError {
    EvalError::Store(crate::error::StoreError::Backend(e.to_string()))
}

fn status_to_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
    }
}

fn status_from_str(s: &str) -> RunStatus {
    match s {
        "completed" => RunStatus::Completed,
        "failed" => RunStatus::Failed,
        _ => RunStatus::Running,
    }
}

/// Embedded relational `EvalStore`. Durable across process restarts.
pub struct SqliteEvalStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEvalStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EvalError> {
        let conn = Connection::open(path).map_err(to_eval_err)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, EvalError> {
        let conn = Connection::open_in_memory().map_err(to_eval_err)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, EvalError> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;
            CREATE TABLE IF NOT EXISTS suites (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                suite_id TEXT NOT NULL REFERENCES suites(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                model TEXT NOT NULL,
                config TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                finished_at INTEGER,
                status TEXT NOT NULL,
                summary TEXT
            );
            CREATE TABLE IF NOT EXISTS cases (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                idx INTEGER NOT NULL,
                input TEXT NOT NULL,
                output TEXT NOT NULL,
                expected TEXT NOT NULL,
                latency_ms INTEGER NOT NULL,
                tokens_in INTEGER NOT NULL,
                tokens_out INTEGER NOT NULL,
                error TEXT
            );
            CREATE TABLE IF NOT EXISTS scores (
                id TEXT PRIMARY KEY,
                case_id TEXT NOT NULL REFERENCES cases(id) ON DELETE CASCADE,
                scorer_name TEXT NOT NULL,
                score REAL NOT NULL,
                reason TEXT
            );
            CREATE TABLE IF NOT EXISTS prompts (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                version INTEGER NOT NULL,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE(name, version)
            );
            "#,
        )
        .map_err(to_eval_err)?;
        Ok(SqliteEvalStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, EvalError>
    where
        F: FnOnce(&Connection) -> Result<T, EvalError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            f(&conn)
        })
        .await
        .map_err(to_eval_err)?
    }

    fn row_to_suite(row: &rusqlite::Row) -> rusqlite::Result<Suite> {
        Ok(Suite {
            id: row.get("id")?,
            name: row.get("name")?,
            created_at: row.get("created_at")?,
        })
    }

    fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<Run> {
        let config_text: String = row.get("config")?;
        let summary_text: Option<String> = row.get("summary")?;
        let status_text: String = row.get("status")?;
        Ok(Run {
            id: row.get("id")?,
            suite_id: row.get("suite_id")?,
            name: row.get("name")?,
            model: row.get("model")?,
            config: serde_json::from_str(&config_text).unwrap_or(Value::Null),
            started_at: row.get("started_at")?,
            finished_at: row.get("finished_at")?,
            status: status_from_str(&status_text),
            summary: summary_text.and_then(|t| serde_json::from_str(&t).ok()),
        })
    }

    fn row_to_case(row: &rusqlite::Row) -> rusqlite::Result<Case> {
        let input_text: String = row.get("input")?;
        let output_text: String = row.get("output")?;
        let expected_text: String = row.get("expected")?;
        Ok(Case {
            id: row.get("id")?,
            run_id: row.get("run_id")?,
            idx: row.get::<_, i64>("idx")? as usize,
            input: serde_json::from_str(&input_text).unwrap_or(Value::Null),
            output: serde_json::from_str(&output_text).unwrap_or(Value::Null),
            expected: serde_json::from_str(&expected_text).unwrap_or(Value::Null),
            latency_ms: row.get("latency_ms")?,
            tokens_in: row.get("tokens_in")?,
            tokens_out: row.get("tokens_out")?,
            error: row.get("error")?,
        })
    }

    fn row_to_score(row: &rusqlite::Row) -> rusqlite::Result<Score> {
        Ok(Score {
            id: row.get("id")?,
            case_id: row.get("case_id")?,
            scorer_name: row.get("scorer_name")?,
            score: row.get("score")?,
            reason: row.get("reason")?,
        })
    }

    fn row_to_prompt(row: &rusqlite::Row) -> rusqlite::Result<Prompt> {
        Ok(Prompt {
            id: row.get("id")?,
            name: row.get("name")?,
            version: row.get("version")?,
            content: row.get("content")?,
            created_at: row.get("created_at")?,
        })
    }
}

#[async_trait]
impl EvalStore for SqliteEvalStore {
    async fn get_or_create_suite(&self, name: &str) -> Result<Suite, EvalError> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction().map_err(to_eval_err)?;
            let existing = tx
                .query_row(
                    "SELECT id, name, created_at FROM suites WHERE name = ?1",
                    params![name],
                    Self::row_to_suite,
                )
                .optional()
                .map_err(to_eval_err)?;
            if let Some(suite) = existing {
                tx.commit().map_err(to_eval_err)?;
                return Ok(suite);
            }
            let suite = Suite::new(name.clone());
            tx.execute(
                "INSERT INTO suites (id, name, created_at) VALUES (?1, ?2, ?3)",
                params![suite.id, suite.name, suite.created_at],
            )
            .map_err(to_eval_err)?;
            tx.commit().map_err(to_eval_err)?;
            Ok(suite)
        })
        .await
    }

    async fn get_suite(&self, suite_id: &str) -> Result<Option<Suite>, EvalError> {
        let suite_id = suite_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, name, created_at FROM suites WHERE id = ?1",
                params![suite_id],
                Self::row_to_suite,
            )
            .optional()
            .map_err(to_eval_err)
        })
        .await
    }

    async fn create_run(&self, suite_id: &str, name: &str, model: &str, config: Value) -> Result<Run, EvalError> {
        let run = Run::new(suite_id, name, model, config);
        let run_clone = run.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO runs (id, suite_id, name, model, config, started_at, finished_at, status, summary)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    run_clone.id,
                    run_clone.suite_id,
                    run_clone.name,
                    run_clone.model,
                    run_clone.config.to_string(),
                    run_clone.started_at,
                    run_clone.finished_at,
                    status_to_str(run_clone.status),
                    run_clone.summary.as_ref().map(|s| serde_json::to_string(s).unwrap()),
                ],
            )
            .map_err(to_eval_err)?;
            Ok(())
        })
        .await?;
        Ok(run)
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, EvalError> {
        let run_id = run_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, suite_id, name, model, config, started_at, finished_at, status, summary
                 FROM runs WHERE id = ?1",
                params![run_id],
                Self::row_to_run,
            )
            .optional()
            .map_err(to_eval_err)
        })
        .await
    }

    async fn finish_run(&self, run_id: &str, status: RunStatus, summary: Option<Summary>) -> Result<(), EvalError> {
        let run_id = run_id.to_string();
        let finished_at = now_millis();
        let summary_text = summary.map(|s| serde_json::to_string(&s).unwrap());
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE runs SET status = ?1, finished_at = ?2, summary = ?3 WHERE id = ?4",
                    params![status_to_str(status), finished_at, summary_text, run_id],
                )
                .map_err(to_eval_err)?;
            if changed == 0 {
                return Err(EvalError::RunNotFound(run_id));
            }
            Ok(())
        })
        .await
    }

    async fn insert_case(&self, case: Case, scores: Vec<Score>) -> Result<(), EvalError> {
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction().map_err(to_eval_err)?;
            tx.execute(
                "INSERT INTO cases (id, run_id, idx, input, output, expected, latency_ms, tokens_in, tokens_out, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    case.id,
                    case.run_id,
                    case.idx as i64,
                    case.input.to_string(),
                    case.output.to_string(),
                    case.expected.to_string(),
                    case.latency_ms,
                    case.tokens_in,
                    case.tokens_out,
                    case.error,
                ],
            )
            .map_err(to_eval_err)?;
            for score in scores {
                tx.execute(
                    "INSERT INTO scores (id, case_id, scorer_name, score, reason) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![score.id, score.case_id, score.scorer_name, score.score, score.reason],
                )
                .map_err(to_eval_err)?;
            }
            tx.commit().map_err(to_eval_err)?;
            Ok(())
        })
        .await
    }

    async fn list_cases(&self, run_id: &str) -> Result<Vec<Case>, EvalError> {
        let run_id = run_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, run_id, idx, input, output, expected, latency_ms, tokens_in, tokens_out, error
                     FROM cases WHERE run_id = ?1 ORDER BY idx ASC",
                )
                .map_err(to_eval_err)?;
            let rows = stmt.query_map(params![run_id], Self::row_to_case).map_err(to_eval_err)?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r.map_err(to_eval_err)?);
            }
            Ok(out)
        })
        .await
    }

    async fn list_scores(&self, case_id: &str) -> Result<Vec<Score>, EvalError> {
        let case_id = case_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare("SELECT id, case_id, scorer_name, score, reason FROM scores WHERE case_id = ?1")
                .map_err(to_eval_err)?;
            let rows = stmt.query_map(params![case_id], Self::row_to_score).map_err(to_eval_err)?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r.map_err(to_eval_err)?);
            }
            Ok(out)
        })
        .await
    }

    async fn put_prompt(&self, name: &str, content: &str) -> Result<Prompt, EvalError> {
        let name = name.to_string();
        let content = content.to_string();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction().map_err(to_eval_err)?;
            let next_version: i64 = tx
                .query_row(
                    "SELECT COALESCE(MAX(version), 0) + 1 FROM prompts WHERE name = ?1",
                    params![name],
                    |r| r.get(0),
                )
                .map_err(to_eval_err)?;
            let prompt = Prompt {
                id: uuid6::uuid6().to_string(),
                name: name.clone(),
                version: next_version,
                content,
                created_at: now_millis(),
            };
            tx.execute(
                "INSERT INTO prompts (id, name, version, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![prompt.id, prompt.name, prompt.version, prompt.content, prompt.created_at],
            )
            .map_err(to_eval_err)?;
            tx.commit().map_err(to_eval_err)?;
            Ok(prompt)
        })
        .await
    }

    async fn get_prompt(&self, name: &str, version: Option<i64>) -> Result<Option<Prompt>, EvalError> {
        let name = name.to_string();
        self.with_conn(move |conn| match version {
            Some(v) => conn
                .query_row(
                    "SELECT id, name, version, content, created_at FROM prompts WHERE name = ?1 AND version = ?2",
                    params![name, v],
                    Self::row_to_prompt,
                )
                .optional()
                .map_err(to_eval_err),
            None => conn
                .query_row(
                    "SELECT id, name, version, content, created_at FROM prompts
                     WHERE name = ?1 ORDER BY version DESC LIMIT 1",
                    params![name],
                    Self::row_to_prompt,
                )
                .optional()
                .map_err(to_eval_err),
        })
        .await
    }

    async fn list_versions(&self, name: &str) -> Result<Vec<Prompt>, EvalError> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, name, version, content, created_at FROM prompts
                     WHERE name = ?1 ORDER BY version ASC",
                )
                .map_err(to_eval_err)?;
            let rows = stmt.query_map(params![name], Self::row_to_prompt).map_err(to_eval_err)?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r.map_err(to_eval_err)?);
            }
            Ok(out)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_default_store_path_falls_back_when_unset() {
        std::env::remove_var("WEFT_EVAL_STORE_PATH");
        assert_eq!(resolve_default_store_path(), std::path::PathBuf::from(DEFAULT_EVAL_STORE_PATH));
    }

    #[test]
    fn resolve_default_store_path_honors_env_override() {
        std::env::set_var("WEFT_EVAL_STORE_PATH", "/tmp/custom-evals.db");
        assert_eq!(resolve_default_store_path(), std::path::PathBuf::from("/tmp/custom-evals.db"));
        std::env::remove_var("WEFT_EVAL_STORE_PATH");
    }

    #[tokio::test]
    async fn get_or_create_suite_joins_existing_by_name() {
        let store = SqliteEvalStore::open_in_memory().unwrap();
        let a = store.get_or_create_suite("smoke").await.unwrap();
        let b = store.get_or_create_suite("smoke").await.unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn insert_case_persists_scores_in_one_transaction() {
        let store = SqliteEvalStore::open_in_memory().unwrap();
        let suite = store.get_or_create_suite("smoke").await.unwrap();
        let run = store
            .create_run(&suite.id, "r1", "openai/gpt-4o", serde_json::json!({}))
            .await
            .unwrap();
        let case = Case {
            id: "c1".to_string(),
            run_id: run.id.clone(),
            idx: 0,
            input: serde_json::json!("2+2"),
            output: serde_json::json!("4"),
            expected: serde_json::json!("4"),
            latency_ms: 5,
            tokens_in: 2,
            tokens_out: 1,
            error: None,
        };
        store.insert_case(case, vec![Score::new("c1", "exact-match", 1.0, None)]).await.unwrap();

        let cases = store.list_cases(&run.id).await.unwrap();
        assert_eq!(cases.len(), 1);
        let scores = store.list_scores("c1").await.unwrap();
        assert_eq!(scores.len(), 1);
    }

    #[tokio::test]
    async fn put_prompt_increments_version_per_name() {
        let store = SqliteEvalStore::open_in_memory().unwrap();
        store.put_prompt("greeting", "hi").await.unwrap();
        let v2 = store.put_prompt("greeting", "hi there").await.unwrap();
        assert_eq!(v2.version, 2);
        let latest = store.get_prompt("greeting", None).await.unwrap().unwrap();
        assert_eq!(latest.content, "hi there");
    }

    #[tokio::test]
    async fn finish_run_persists_status_and_summary() {
        let store = SqliteEvalStore::open_in_memory().unwrap();
        let suite = store.get_or_create_suite("smoke").await.unwrap();
        let run = store
            .create_run(&suite.id, "r1", "openai/gpt-4o", serde_json::json!({}))
            .await
            .unwrap();
        let summary = Summary {
            total_cases: 1,
            pass_count: 1,
            fail_count: 0,
            mean_scores: std::collections::HashMap::from([("exact-match".to_string(), 1.0)]),
        };
        store.finish_run(&run.id, RunStatus::Completed, Some(summary)).await.unwrap();
        let run = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.summary.unwrap().pass_count, 1);
    }
}
