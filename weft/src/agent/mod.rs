//! Agent / streaming guardrail loop (spec.md §5): drives a [`ModelClient`] against a
//! [`ContextEngine`], runs every forwarded part through a [`Guardrail`] chain live, and on
//! `fail` retries by folding feedback into the context rather than giving up.

pub mod builtin;
pub mod guardrail;
pub mod model;

pub use builtin::{ErrorRecoveryGuardrail, MaxLengthGuardrail};
pub use guardrail::{run_chain, ChainResult, Guardrail, GuardrailContext, GuardrailDecision, ToolFailureKind};
pub use model::{ModelClient, PartStream};

use std::pin::Pin;
use std::sync::Arc;

use async_stream::stream;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::engine::ContextEngine;
use crate::error::AgentError;
use crate::fragment::{Fragment, FragmentData, LazyTag};
use crate::renderer::FragmentRenderer;
use stream_event::StreamPart;

/// A boxed stream of [`StreamPart`]s borrowed from the call that produced it, returned by
/// [`Agent::stream`].
pub type AgentPartStream<'a> = Pin<Box<dyn Stream<Item = StreamPart> + Send + 'a>>;

/// Bounds on one `generate()`/`stream()` call: how many model turns may run, and how many
/// of those may be guardrail-triggered retries (spec.md §5 `stopWhen`).
#[derive(Clone, Copy, Debug)]
pub struct AgentConfig {
    pub max_steps: u32,
    pub max_retries: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            max_steps: 8,
            max_retries: 3,
        }
    }
}

/// The final text an agent turn produced, and how many guardrail retries it took.
#[derive(Clone, Debug, PartialEq)]
pub struct AgentOutcome {
    pub text: String,
    pub retries: u32,
}

/// Drives one model turn at a time against a [`ContextEngine`], checking each forwarded
/// part through a guardrail chain before it is accepted.
pub struct Agent {
    model: Arc<dyn ModelClient>,
    guardrails: Vec<Arc<dyn Guardrail>>,
    config: AgentConfig,
}

impl Agent {
    pub fn new(model: Arc<dyn ModelClient>, guardrails: Vec<Arc<dyn Guardrail>>, config: AgentConfig) -> Self {
        Agent {
            model,
            guardrails,
            config,
        }
    }

    /// Runs turns until a guardrail passes (or stops) the text, the retry budget is
    /// exhausted, or `max_steps` model turns have run (spec.md §5), without forwarding
    /// parts anywhere — only the final accepted text and retry count are returned.
    pub async fn generate(&self, engine: &ContextEngine, renderer: &dyn FragmentRenderer) -> Result<AgentOutcome, AgentError> {
        self.generate_with_abort(engine, renderer, &CancellationToken::new()).await
    }

    /// Like [`Agent::generate`], but checks `abort` at every retry boundary (spec.md §5
    /// "cancellation"); an already-cancelled token short-circuits before the first turn.
    pub async fn generate_with_abort(
        &self,
        engine: &ContextEngine,
        renderer: &dyn FragmentRenderer,
        abort: &CancellationToken,
    ) -> Result<AgentOutcome, AgentError> {
        let mut retries = 0u32;
        for step in 0..self.config.max_steps {
            if abort.is_cancelled() {
                tracing::info!(step, "abort requested before retry boundary, cancelling generate");
                return Err(AgentError::Cancelled);
            }

            let resolved = engine.resolve(renderer).await?;
            let mut upstream = self.model.stream(&resolved).await?;

            let mut accumulated = String::new();
            let mut failure_feedback = None;
            let mut stopped = false;

            while let Some(part) = upstream.next().await {
                let context = GuardrailContext {
                    step,
                    accumulated_text: accumulated.clone(),
                };
                let result = run_chain(&self.guardrails, &part, &context).await;
                match result.decision {
                    GuardrailDecision::Fail(feedback) => {
                        tracing::debug!(step, part_id = ?part.id(), "guardrail failed part, triggering retry");
                        failure_feedback = Some(feedback);
                        break;
                    }
                    GuardrailDecision::Stop => {
                        if let StreamPart::TextDelta { delta, .. } = &result.part {
                            accumulated.push_str(delta);
                        }
                        stopped = true;
                        break;
                    }
                    GuardrailDecision::Pass | GuardrailDecision::Modify(_) => {
                        if let StreamPart::TextDelta { delta, .. } = &result.part {
                            accumulated.push_str(delta);
                        }
                    }
                }
            }

            if stopped {
                tracing::info!(step, retries, "guardrail chain stopped generation");
                self.splice_last_assistant(engine, &accumulated).await?;
                return Ok(AgentOutcome { text: accumulated, retries });
            }

            match failure_feedback {
                None => {
                    tracing::debug!(step, retries, "guardrail chain passed, accepting turn");
                    self.splice_last_assistant(engine, &accumulated).await?;
                    return Ok(AgentOutcome { text: accumulated, retries });
                }
                Some(feedback) => {
                    if retries >= self.config.max_retries {
                        tracing::warn!(step, retries, "retry budget exceeded, giving up on turn");
                        return Err(AgentError::RetryBudgetExceeded(self.config.max_retries));
                    }
                    retries += 1;
                    tracing::debug!(step, retries, %feedback, "guardrail chain failed turn, retrying with feedback");
                    let corrected = format!("{accumulated} {feedback}");
                    self.splice_last_assistant(engine, &corrected).await?;
                }
            }
        }
        Err(AgentError::RetryBudgetExceeded(self.config.max_retries))
    }

    /// Runs the same turn/retry state machine as [`Agent::generate`], but forwards every
    /// accepted (and possibly `Modify`-rewritten) part to the caller live as it arrives,
    /// instead of accumulating the whole turn before returning anything (spec.md §4.3,
    /// the streaming guardrail loop). A guardrail `fail` writes a visible, id'd correction
    /// triplet into the outbound stream and reopens the upstream model stream; it never
    /// emits a second persisted message for the feedback (spec.md §4.3.3 / §8 scenario 3).
    pub fn stream<'a>(
        &'a self,
        engine: &'a ContextEngine,
        renderer: &'a dyn FragmentRenderer,
        abort: CancellationToken,
    ) -> AgentPartStream<'a> {
        Box::pin(stream! {
            let mut retries = 0u32;
            for step in 0..self.config.max_steps {
                if abort.is_cancelled() {
                    tracing::info!(step, "abort signal set before retry boundary, emitting finish");
                    yield StreamPart::Finish;
                    return;
                }

                let resolved = match engine.resolve(renderer).await {
                    Ok(r) => r,
                    Err(e) => {
                        yield StreamPart::Error { error_text: e.to_string() };
                        yield StreamPart::Finish;
                        return;
                    }
                };
                let mut upstream = match self.model.stream(&resolved).await {
                    Ok(s) => s,
                    Err(e) => {
                        yield StreamPart::Error { error_text: e.to_string() };
                        yield StreamPart::Finish;
                        return;
                    }
                };

                let mut accumulated = String::new();
                let mut failure_feedback = None;
                let mut stopped = false;

                while let Some(part) = upstream.next().await {
                    let context = GuardrailContext {
                        step,
                        accumulated_text: accumulated.clone(),
                    };
                    let result = run_chain(&self.guardrails, &part, &context).await;
                    match result.decision {
                        GuardrailDecision::Fail(feedback) => {
                            tracing::debug!(step, part_id = ?part.id(), "guardrail failed part, triggering retry");
                            failure_feedback = Some(feedback);
                            break;
                        }
                        GuardrailDecision::Stop => {
                            if let StreamPart::TextDelta { delta, .. } = &result.part {
                                accumulated.push_str(delta);
                            }
                            stopped = true;
                            yield result.part;
                            break;
                        }
                        GuardrailDecision::Pass | GuardrailDecision::Modify(_) => {
                            if let StreamPart::TextDelta { delta, .. } = &result.part {
                                accumulated.push_str(delta);
                            }
                            yield result.part;
                        }
                    }
                }

                if stopped {
                    tracing::info!(step, retries, "guardrail chain stopped generation");
                    if let Err(e) = self.splice_last_assistant(engine, &accumulated).await {
                        yield StreamPart::Error { error_text: e.to_string() };
                    }
                    yield StreamPart::Finish;
                    return;
                }

                match failure_feedback {
                    None => {
                        tracing::debug!(step, retries, "guardrail chain passed, accepting turn");
                        if let Err(e) = self.splice_last_assistant(engine, &accumulated).await {
                            yield StreamPart::Error { error_text: e.to_string() };
                        }
                        yield StreamPart::Finish;
                        return;
                    }
                    Some(feedback) => {
                        if retries >= self.config.max_retries {
                            tracing::warn!(step, retries, "retry budget exceeded, giving up on turn");
                            yield StreamPart::Finish;
                            return;
                        }
                        if abort.is_cancelled() {
                            tracing::info!(step, "abort signal set before retry, emitting finish");
                            yield StreamPart::Finish;
                            return;
                        }
                        retries += 1;
                        tracing::debug!(step, retries, %feedback, "guardrail chain failed turn, retrying with feedback");

                        let correction_id = format!("correction-{step}-{retries}");
                        yield StreamPart::TextStart { id: correction_id.clone() };
                        yield StreamPart::TextDelta { id: correction_id.clone(), delta: feedback.clone() };
                        yield StreamPart::TextEnd { id: correction_id };

                        let corrected = format!("{accumulated} {feedback}");
                        if let Err(e) = self.splice_last_assistant(engine, &corrected).await {
                            yield StreamPart::Error { error_text: e.to_string() };
                            yield StreamPart::Finish;
                            return;
                        }
                    }
                }
            }
            yield StreamPart::Finish;
        })
    }

    /// Writes (or rewrites in place) the assistant turn's accumulated text via the
    /// `last-assistant` lazy tag and `save({branch: false})`, never forking history
    /// (spec.md §4.2.2 / §5).
    async fn splice_last_assistant(&self, engine: &ContextEngine, text: &str) -> Result<(), AgentError> {
        engine
            .set([Fragment::lazy_message(
                "assistant",
                FragmentData::text(text.to_string()),
                LazyTag::LastAssistant,
            )])
            .await;
        engine.save(Some(false)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::model::mock::ScriptedModelClient;
    use super::*;
    use crate::codec::CodecRegistry;
    use crate::renderer::XmlFragmentRenderer;
    use crate::store::{ContextStore, InMemoryStore};

    fn text_parts(s: &str) -> Vec<StreamPart> {
        vec![
            StreamPart::TextStart { id: "t1".to_string() },
            StreamPart::TextDelta {
                id: "t1".to_string(),
                delta: s.to_string(),
            },
            StreamPart::TextEnd { id: "t1".to_string() },
            StreamPart::Finish,
        ]
    }

    #[tokio::test]
    async fn passes_through_when_no_guardrail_objects() {
        let model = Arc::new(ScriptedModelClient::new(vec![text_parts("hello there")]));
        let agent = Agent::new(model, vec![], AgentConfig::default());
        let store: Arc<dyn ContextStore> = Arc::new(InMemoryStore::new());
        let engine = ContextEngine::new(store, CodecRegistry::default(), "u1", None, None);
        let renderer = XmlFragmentRenderer::default();

        let outcome = agent.generate(&engine, &renderer).await.unwrap();
        assert_eq!(outcome.text, "hello there");
        assert_eq!(outcome.retries, 0);

        let resolved = engine.resolve(&renderer).await.unwrap();
        assert_eq!(resolved.messages.len(), 1);
        assert_eq!(resolved.messages[0].joined_text(), "hello there");
    }

    #[tokio::test]
    async fn stream_forwards_parts_live_and_ends_with_finish() {
        let model = Arc::new(ScriptedModelClient::new(vec![text_parts("hello there")]));
        let agent = Agent::new(model, vec![], AgentConfig::default());
        let store: Arc<dyn ContextStore> = Arc::new(InMemoryStore::new());
        let engine = ContextEngine::new(store, CodecRegistry::default(), "u1", None, None);
        let renderer = XmlFragmentRenderer::default();

        let parts: Vec<StreamPart> = agent.stream(&engine, &renderer, CancellationToken::new()).collect().await;
        assert_eq!(parts.last(), Some(&StreamPart::Finish));
        let deltas: String = parts
            .iter()
            .filter_map(|p| match p {
                StreamPart::TextDelta { delta, .. } => Some(delta.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, "hello there");
    }

    #[tokio::test]
    async fn stream_emits_clean_finish_when_already_cancelled() {
        let model = Arc::new(ScriptedModelClient::new(vec![text_parts("hello there")]));
        let agent = Agent::new(model.clone(), vec![], AgentConfig::default());
        let store: Arc<dyn ContextStore> = Arc::new(InMemoryStore::new());
        let engine = ContextEngine::new(store, CodecRegistry::default(), "u1", None, None);
        let renderer = XmlFragmentRenderer::default();

        let abort = CancellationToken::new();
        abort.cancel();
        let parts: Vec<StreamPart> = agent.stream(&engine, &renderer, abort).collect().await;
        assert_eq!(parts, vec![StreamPart::Finish]);
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn max_length_guardrail_stops_and_keeps_partial_text() {
        let model = Arc::new(ScriptedModelClient::new(vec![text_parts(
            "this response is deliberately much too long for the limit",
        )]));
        let agent = Agent::new(
            model,
            vec![Arc::new(MaxLengthGuardrail::new(10))],
            AgentConfig::default(),
        );
        let store: Arc<dyn ContextStore> = Arc::new(InMemoryStore::new());
        let engine = ContextEngine::new(store, CodecRegistry::default(), "u1", None, None);
        let renderer = XmlFragmentRenderer::default();

        let outcome = agent.generate(&engine, &renderer).await.unwrap();
        assert!(outcome.text.chars().count() > 10);

        let resolved = engine.resolve(&renderer).await.unwrap();
        assert_eq!(resolved.messages.len(), 1);
        assert_eq!(resolved.messages[0].role, "assistant");
    }

    #[tokio::test]
    async fn error_recovery_retries_then_succeeds() {
        let model = Arc::new(ScriptedModelClient::new(vec![
            text_parts("malformed attempt"),
            text_parts("corrected answer"),
        ]));

        struct FirstCallFails;
        #[async_trait::async_trait]
        impl Guardrail for FirstCallFails {
            fn name(&self) -> &str {
                "first-call-fails"
            }
            async fn handle(&self, _part: &StreamPart, context: &GuardrailContext) -> GuardrailDecision {
                if context.step == 0 {
                    GuardrailDecision::Fail("try again with a valid tool call".to_string())
                } else {
                    GuardrailDecision::Pass
                }
            }
        }

        let agent = Agent::new(model.clone(), vec![Arc::new(FirstCallFails)], AgentConfig::default());
        let store: Arc<dyn ContextStore> = Arc::new(InMemoryStore::new());
        let engine = ContextEngine::new(store, CodecRegistry::default(), "u1", None, None);
        let renderer = XmlFragmentRenderer::default();

        let outcome = agent.generate(&engine, &renderer).await.unwrap();
        assert_eq!(outcome.text, "corrected answer");
        assert_eq!(outcome.retries, 1);
        assert_eq!(model.call_count(), 2);

        let resolved = engine.resolve(&renderer).await.unwrap();
        // the lazy splice overwrites the same assistant id in place on every retry and on
        // the final success, so only one assistant message ever ends up persisted.
        assert_eq!(resolved.messages.len(), 1);
        assert_eq!(resolved.messages[0].role, "assistant");
        assert_eq!(resolved.messages[0].joined_text(), "corrected answer");
    }

    #[tokio::test]
    async fn retry_budget_exceeded_errors_out() {
        let model = Arc::new(ScriptedModelClient::new(vec![text_parts("nope")]));
        struct AlwaysFails;
        #[async_trait::async_trait]
        impl Guardrail for AlwaysFails {
            fn name(&self) -> &str {
                "always-fails"
            }
            async fn handle(&self, _part: &StreamPart, _context: &GuardrailContext) -> GuardrailDecision {
                GuardrailDecision::Fail("no".to_string())
            }
        }
        let agent = Agent::new(
            model,
            vec![Arc::new(AlwaysFails)],
            AgentConfig {
                max_steps: 8,
                max_retries: 2,
            },
        );
        let store: Arc<dyn ContextStore> = Arc::new(InMemoryStore::new());
        let engine = ContextEngine::new(store, CodecRegistry::default(), "u1", None, None);
        let renderer = XmlFragmentRenderer::default();

        let err = agent.generate(&engine, &renderer).await.unwrap_err();
        assert!(matches!(err, AgentError::RetryBudgetExceeded(2)));
    }

    #[tokio::test]
    async fn generate_with_abort_cancels_before_first_turn() {
        let model = Arc::new(ScriptedModelClient::new(vec![text_parts("hello")]));
        let agent = Agent::new(model.clone(), vec![], AgentConfig::default());
        let store: Arc<dyn ContextStore> = Arc::new(InMemoryStore::new());
        let engine = ContextEngine::new(store, CodecRegistry::default(), "u1", None, None);
        let renderer = XmlFragmentRenderer::default();

        let abort = CancellationToken::new();
        abort.cancel();
        let err = agent.generate_with_abort(&engine, &renderer, &abort).await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        assert_eq!(model.call_count(), 0);
    }
}
