//! Stream part union: the typed variants a UI message stream is made of (spec §6).
//!
//! Adapted from a flat `ProtocolEvent` tagged enum into the narrower set the
//! agent/guardrail loop and the eval event stream actually need: text and
//! reasoning deltas, tool invocations, an error carrier, and a terminal
//! `finish` sentinel. Guardrail handlers pattern-match on this type rather
//! than inspecting an ad-hoc JSON shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One part of a streamed model turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamPart {
    /// Opens a text block identified by `id`. Deltas with the same `id` belong together.
    TextStart { id: String },
    /// A chunk of text belonging to the block opened by `id`.
    TextDelta { id: String, delta: String },
    /// Closes the text block identified by `id`.
    TextEnd { id: String },
    /// A chunk of model reasoning/thinking text, not part of the visible answer.
    ReasoningDelta { id: String, delta: String },
    /// The model invoked a tool.
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    /// The result of a tool invocation being streamed back.
    ToolResult { id: String, result: Value },
    /// A model or transport error surfaced mid-stream.
    Error { error_text: String },
    /// Terminal sentinel: no more parts follow on this stream.
    Finish,
}

impl StreamPart {
    /// Convenience constructor for a text-delta part.
    pub fn text_delta(id: impl Into<String>, delta: impl Into<String>) -> Self {
        StreamPart::TextDelta {
            id: id.into(),
            delta: delta.into(),
        }
    }

    /// True for the three parts that together frame one text block.
    pub fn is_text_framing(&self) -> bool {
        matches!(
            self,
            StreamPart::TextStart { .. } | StreamPart::TextDelta { .. } | StreamPart::TextEnd { .. }
        )
    }

    /// The `id` field shared by text/reasoning/tool parts, if this variant carries one.
    pub fn id(&self) -> Option<&str> {
        match self {
            StreamPart::TextStart { id }
            | StreamPart::TextDelta { id, .. }
            | StreamPart::TextEnd { id }
            | StreamPart::ReasoningDelta { id, .. }
            | StreamPart::ToolCall { id, .. }
            | StreamPart::ToolResult { id, .. } => Some(id),
            StreamPart::Error { .. } | StreamPart::Finish => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_delta_round_trips_through_json() {
        let part = StreamPart::text_delta("m1", "hello");
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["type"], "text-delta");
        assert_eq!(json["id"], "m1");
        assert_eq!(json["delta"], "hello");

        let back: StreamPart = serde_json::from_value(json).unwrap();
        assert_eq!(back, part);
    }

    #[test]
    fn error_part_has_no_id() {
        let part = StreamPart::Error {
            error_text: "boom".into(),
        };
        assert_eq!(part.id(), None);
    }

    #[test]
    fn finish_serializes_as_tagged_unit() {
        let json = serde_json::to_value(StreamPart::Finish).unwrap();
        assert_eq!(json, serde_json::json!({"type": "finish"}));
    }
}
