//! Guardrails (spec.md §5): per-part checks run as the agent loop forwards a model
//! turn's [`StreamPart`]s one at a time. Each guardrail returns one of four decisions; a
//! chain runs guardrails in order over the same part and short-circuits on the first
//! non-`pass`.

use async_trait::async_trait;

use stream_event::StreamPart;

/// What a tool invocation failed with, classified for [`super::builtin::ErrorRecoveryGuardrail`].
#[derive(Clone, Debug, PartialEq)]
pub enum ToolFailureKind {
    NoToolsConfigured,
    UnknownTool(String),
    MalformedToolArgs,
    ParseFailure,
    Other(String),
}

impl ToolFailureKind {
    /// Classifies a model/transport error's text by substring match (spec.md §5).
    pub fn classify(error_text: &str) -> Self {
        let lower = error_text.to_lowercase();
        if lower.contains("no tools configured") {
            ToolFailureKind::NoToolsConfigured
        } else if let Some(name) = extract_quoted(&lower, "unknown tool") {
            ToolFailureKind::UnknownTool(name)
        } else if lower.contains("malformed") {
            ToolFailureKind::MalformedToolArgs
        } else if lower.contains("could not be parsed") || lower.contains("parse failure") {
            ToolFailureKind::ParseFailure
        } else {
            ToolFailureKind::Other(error_text.to_string())
        }
    }
}

/// Pulls the first `"..."`-quoted name out of text following a marker phrase.
fn extract_quoted(lower: &str, marker: &str) -> Option<String> {
    if !lower.contains(marker) {
        return None;
    }
    let start = lower.find('"')? + 1;
    let end = lower[start..].find('"')? + start;
    Some(lower[start..end].to_string())
}

/// What a guardrail observes about the turn it is checking: the step it belongs to and
/// the text accumulated from already-forwarded parts so far this step.
#[derive(Clone, Debug, Default)]
pub struct GuardrailContext {
    pub step: u32,
    pub accumulated_text: String,
}

/// A guardrail's verdict on one forwarded [`StreamPart`] (spec.md §5 / §4.3.2).
#[derive(Clone, Debug, PartialEq)]
pub enum GuardrailDecision {
    /// The part is acceptable as-is.
    Pass,
    /// The part is acceptable after substituting the given replacement.
    Modify(StreamPart),
    /// The turn is unacceptable; retry with this feedback folded into the next turn.
    Fail(String),
    /// Stop generating further turns; keep what has been forwarded so far.
    Stop,
}

/// The outcome of running a full guardrail chain over one part: the final decision, and
/// the part as left by any `Modify` steps that ran before it.
#[derive(Clone, Debug, PartialEq)]
pub struct ChainResult {
    pub decision: GuardrailDecision,
    pub part: StreamPart,
}

/// One guardrail check over a single forwarded part.
#[async_trait]
pub trait Guardrail: Send + Sync {
    fn name(&self) -> &str;
    async fn handle(&self, part: &StreamPart, context: &GuardrailContext) -> GuardrailDecision;
}

/// Runs guardrails in order, each seeing the (possibly `Modify`-rewritten) output of the
/// one before it. The chain forwards the first `Fail`/`Stop` it meets immediately, without
/// consulting later guardrails (spec.md §8 "guardrail forwarding").
pub async fn run_chain(guardrails: &[std::sync::Arc<dyn Guardrail>], part: &StreamPart, context: &GuardrailContext) -> ChainResult {
    let mut current = part.clone();
    for guardrail in guardrails {
        match guardrail.handle(&current, context).await {
            GuardrailDecision::Pass => continue,
            GuardrailDecision::Modify(next) => {
                current = next;
            }
            decision @ (GuardrailDecision::Fail(_) | GuardrailDecision::Stop) => {
                return ChainResult { decision, part: current };
            }
        }
    }
    ChainResult {
        decision: GuardrailDecision::Pass,
        part: current,
    }
}
