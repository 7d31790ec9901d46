//! # weft
//!
//! A context engine for LLM conversations: a persistent, branchable message DAG with a
//! streaming guardrail loop on top and an evaluation engine alongside.
//!
//! ## Design principles
//!
//! - **Fragments, not prompts.** Callers build a prompt out of named [`fragment::Fragment`]s
//!   — some render as text, some persist as messages — and the engine resolves them into a
//!   final prompt plus a durable chat history.
//! - **Branch like a VCS.** Rewriting history forks a new branch rather than mutating the
//!   old one; [`engine::ContextEngine::checkpoint`] and [`engine::ContextEngine::restore`]
//!   give named save points independent of branches.
//! - **Guardrails wrap the model, not the other way around.** [`agent::Agent`] drives a
//!   [`agent::ModelClient`] turn at a time and runs every turn through a
//!   [`agent::Guardrail`] chain that can pass, rewrite, retry, or stop.
//! - **One store trait, two backends.** [`store::ContextStore`] is implemented by an
//!   in-memory map for tests and a `rusqlite`-backed embedded relational store for
//!   production use.
//!
//! ## Main modules
//!
//! - [`fragment`]: [`fragment::Fragment`], [`fragment::FragmentData`], [`fragment::Lazy`] —
//!   the recursive prompt-building data model.
//! - [`codec`]: [`codec::Codec`] trait plus the built-in `user`/`assistant`/`tool-result`
//!   codecs, via [`codec::CodecRegistry`].
//! - [`chat`]: [`chat::Chat`], [`chat::MessageNode`], [`chat::Branch`], [`chat::Checkpoint`]
//!   — the persisted record types.
//! - [`store`]: [`store::ContextStore`] trait; [`store::InMemoryStore`] and
//!   [`store::SqliteStore`] backends.
//! - [`engine`]: [`engine::ContextEngine`] — `set`/`save`/`resolve`/`rewind`/`checkpoint`.
//! - [`renderer`]: [`renderer::FragmentRenderer`], [`renderer::XmlFragmentRenderer`].
//! - [`registry`]: [`registry::TokenRegistry`] — token/cost estimation over a
//!   [`model_spec::ModelLimitResolver`].
//! - [`model_spec`]: model context/price catalog resolution (models.dev, local file,
//!   config override, cache, composite).
//! - [`agent`]: [`agent::Agent`], [`agent::ModelClient`], [`agent::Guardrail`], built-in
//!   guardrails.
//! - [`eval`]: [`eval::run_eval`], [`eval::compare_runs`], [`eval::EvalStore`].
//! - [`memory`]: [`memory::uuid6`] — time-ordered id generation shared across stores.
//! - [`error`]: the `thiserror` taxonomy shared by every module above.

pub mod agent;
pub mod ambient;
pub mod chat;
pub mod codec;
pub mod engine;
pub mod error;
pub mod eval;
pub mod fragment;
pub mod memory;
pub mod model_spec;
pub mod registry;
pub mod renderer;
pub mod store;

pub use ambient::{load_ambient_config, AmbientConfig};
pub use agent::{
    Agent, AgentConfig, AgentOutcome, AgentPartStream, ChainResult, ErrorRecoveryGuardrail, Guardrail,
    GuardrailContext, GuardrailDecision, MaxLengthGuardrail, ModelClient, PartStream, ToolFailureKind,
};
pub use chat::{Branch, Chat, Checkpoint, GraphDump, GraphNode, MessageNode, SearchHit};
pub use codec::{Codec, CodecRegistry, DecodedMessage, MessagePart, TextCodec, ToolResultCodec};
pub use engine::{
    BranchInfo, CheckpointInfo, ContextEngine, EngineEstimate, Inspection, Resolved, SaveResult,
};
pub use error::{AgentError, EngineError, EvalError, RegistryError, StoreError};
pub use eval::{
    compare_runs, parse_record_selection, resolve_default_store_path, run_eval, CaseDelta,
    CompareOptions, CompareResult, CostDelta, DatasetItem, EvalEmitter, EvalEvent, EvalStore,
    ExactMatchScorer, InMemoryEvalStore, NoopEmitter, Prompt, RecordSelection, RunEvalConfig,
    RunStatus, Scorer, ScorerDelta, SqliteEvalStore, Suite, Summary, Task, TaskOutcome,
    DEFAULT_EVAL_STORE_PATH,
};
pub use fragment::{CodecHandle, Fragment, FragmentData, FragmentKind, Lazy, LazyTag, Scalar};
pub use model_spec::{
    CachedResolver, CompositeResolver, ConfigOverride, HttpClient, LocalFileResolver,
    ModelLimitResolver, ModelSpec, ModelsDevResolver, ReqwestHttpClient, ResolverRefresher,
    DEFAULT_MODELS_DEV_URL,
};
pub use registry::{parse_model_string, Estimate, FragmentBreakdown, TokenRegistry};
pub use renderer::{FragmentRenderer, XmlFragmentRenderer};
pub use store::{ContextStore, InMemoryStore, SqliteStore, MAX_CHAIN_DEPTH};

/// When running `cargo test -p weft`, initializes tracing from `RUST_LOG` so unit tests can
/// print logs with `--nocapture`.
#[cfg(test)]
mod test_logging {
    use ctor::ctor;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::Layer;

    #[ctor]
    fn init() {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_filter(filter),
            )
            .try_init();
    }
}
