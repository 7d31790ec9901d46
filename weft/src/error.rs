//! Error taxonomy for the context store, engine, agent/guardrail loop, and eval engine.
//!
//! One `thiserror` enum per failure class (spec.md §7): validation, not-found, storage,
//! model/guardrail, and eval errors are distinguished so callers can match on them instead
//! of string-sniffing. No `anyhow` at any library boundary.

use thiserror::Error;

/// Errors from a [`crate::store::ContextStore`] implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("chat not found: {0}")]
    ChatNotFound(String),
    #[error("branch not found: {0}")]
    BranchNotFound(String),
    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),
    #[error("message not found: {0}")]
    MessageNotFound(String),
    #[error("message cannot be its own parent: {0}")]
    SelfReferencingMessage(String),
    #[error("branch name already exists in chat: {0}")]
    DuplicateBranchName(String),
    #[error("checkpoint name already exists in chat, overwrite required: {0}")]
    DuplicateCheckpointName(String),
    #[error("message chain exceeded maximum walk depth (possible cycle) at {0}")]
    ChainTooDeep(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from [`crate::engine::ContextEngine`] operations.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("missing chatId")]
    MissingChatId,
    #[error("missing userId")]
    MissingUserId,
    #[error("pending message fragment has no codec after lazy resolution: {0}")]
    UnresolvedCodec(String),
    #[error("cannot rewind to the root of the chain (no parent to branch from)")]
    CannotRewindRoot,
    #[error("rewind target message belongs to a different chat")]
    CrossChatRewind,
    #[error("branch has no messages to checkpoint")]
    NoMessagesOnBranch,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Errors surfaced by the token/cost registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("invalid model string (expected \"provider/model\"): {0}")]
    InvalidModelString(String),
    #[error("model not found in catalog: {0}")]
    ModelNotFound(String),
    #[error("catalog fetch failed: {0}")]
    FetchFailed(String),
}

/// Errors from the agent / streaming guardrail loop.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("model stream error: {0}")]
    Model(String),
    #[error("guardrail retry budget exceeded ({0} retries)")]
    RetryBudgetExceeded(u32),
    #[error("stream cancelled")]
    Cancelled,
}

/// Errors from the eval engine / eval store.
#[derive(Error, Debug)]
pub enum EvalError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("task failed: {0}")]
    TaskFailed(String),
    #[error("run {0} not found")]
    RunNotFound(String),
    #[error("suite {0} not found")]
    SuiteNotFound(String),
    #[error("invalid record selection: {0}")]
    InvalidRecordSelection(String),
    #[error("eval run cancelled")]
    Cancelled,
}
