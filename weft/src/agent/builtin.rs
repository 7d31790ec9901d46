//! Built-in guardrails (spec.md §5): one worked example of each decision family beyond
//! `pass` — `ErrorRecoveryGuardrail` demonstrates `fail`, `MaxLengthGuardrail` demonstrates
//! `stop`.

use async_trait::async_trait;

use super::guardrail::{Guardrail, GuardrailContext, GuardrailDecision, ToolFailureKind};
use stream_event::StreamPart;

/// Turns a tool/model error part into retry feedback for the model (spec.md §5).
/// Passes every other part through untouched.
pub struct ErrorRecoveryGuardrail;

impl ErrorRecoveryGuardrail {
    fn feedback(kind: &ToolFailureKind) -> String {
        match kind {
            ToolFailureKind::NoToolsConfigured => {
                "No tools are configured for this turn; answer directly without calling one.".to_string()
            }
            ToolFailureKind::UnknownTool(name) => {
                format!("\"{name}\" is not a known tool; pick one of the tools actually offered.")
            }
            ToolFailureKind::MalformedToolArgs => {
                "The tool call's arguments did not match the tool's schema; reissue the call with valid arguments.".to_string()
            }
            ToolFailureKind::ParseFailure => {
                "The response could not be parsed as a tool call or plain text; reply in the expected format.".to_string()
            }
            ToolFailureKind::Other(detail) => format!("The previous attempt failed: {detail}"),
        }
    }
}

#[async_trait]
impl Guardrail for ErrorRecoveryGuardrail {
    fn name(&self) -> &str {
        "error-recovery"
    }

    async fn handle(&self, part: &StreamPart, _context: &GuardrailContext) -> GuardrailDecision {
        match part {
            StreamPart::Error { error_text } => GuardrailDecision::Fail(Self::feedback(&ToolFailureKind::classify(error_text))),
            _ => GuardrailDecision::Pass,
        }
    }
}

/// Stops generation once accumulated text exceeds `max_chars` (spec.md §5 "stop"). Only
/// considers the three parts that frame visible text; tool calls, results, and reasoning
/// deltas never count against the budget.
pub struct MaxLengthGuardrail {
    pub max_chars: usize,
}

impl MaxLengthGuardrail {
    pub fn new(max_chars: usize) -> Self {
        MaxLengthGuardrail { max_chars }
    }
}

#[async_trait]
impl Guardrail for MaxLengthGuardrail {
    fn name(&self) -> &str {
        "max-length"
    }

    async fn handle(&self, part: &StreamPart, context: &GuardrailContext) -> GuardrailDecision {
        if !part.is_text_framing() {
            return GuardrailDecision::Pass;
        }
        let projected = match part {
            StreamPart::TextDelta { delta, .. } => context.accumulated_text.chars().count() + delta.chars().count(),
            _ => context.accumulated_text.chars().count(),
        };
        if projected > self.max_chars {
            GuardrailDecision::Stop
        } else {
            GuardrailDecision::Pass
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_delta(s: &str) -> StreamPart {
        StreamPart::TextDelta {
            id: "t1".to_string(),
            delta: s.to_string(),
        }
    }

    #[tokio::test]
    async fn error_recovery_passes_non_error_parts() {
        let g = ErrorRecoveryGuardrail;
        let decision = g.handle(&text_delta("ok"), &GuardrailContext::default()).await;
        assert_eq!(decision, GuardrailDecision::Pass);
    }

    #[tokio::test]
    async fn error_recovery_fails_with_feedback_for_unknown_tool() {
        let g = ErrorRecoveryGuardrail;
        let part = StreamPart::Error {
            error_text: "unknown tool \"frobnicate\" requested".to_string(),
        };
        let decision = g.handle(&part, &GuardrailContext::default()).await;
        match decision {
            GuardrailDecision::Fail(msg) => assert!(msg.contains("frobnicate")),
            other => panic!("expected Fail, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn max_length_stops_past_the_limit() {
        let g = MaxLengthGuardrail::new(5);
        let context = GuardrailContext::default();
        assert_eq!(g.handle(&text_delta("short"), &context).await, GuardrailDecision::Pass);
        assert_eq!(g.handle(&text_delta("way too long"), &context).await, GuardrailDecision::Stop);
    }

    #[tokio::test]
    async fn max_length_ignores_non_text_framing_parts() {
        let g = MaxLengthGuardrail::new(5);
        let context = GuardrailContext {
            step: 0,
            accumulated_text: "already over budget".to_string(),
        };
        let tool_call = StreamPart::ToolCall {
            id: "c1".to_string(),
            name: "lookup".to_string(),
            arguments: serde_json::json!({}),
        };
        assert_eq!(g.handle(&tool_call, &context).await, GuardrailDecision::Pass);
    }
}
