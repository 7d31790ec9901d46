//! Message codecs: each message kind (user, assistant, tool-result) implements
//! `encode()`/`decode()` (spec.md §3). `encode()` produces the JSON-serializable storage
//! representation; `decode()` produces the LLM-SDK-shaped message (role + parts) the
//! agent hands to the model client.
//!
//! Fragments carry only a [`crate::fragment::CodecHandle`] (a name); the actual codec
//! implementation is looked up in a [`CodecRegistry`] so fragments stay plain data.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::EngineError;
use crate::fragment::FragmentData;

/// One part of a decoded LLM-SDK message (a minimal stand-in for the opaque model
/// SDK's message shape, per spec.md §1's "consumed as an opaque ... interface").
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MessagePart {
    pub kind: String,
    pub text: String,
}

/// The LLM-SDK-shaped decoded form of one persisted message: role + ordered parts.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DecodedMessage {
    pub role: String,
    pub parts: Vec<MessagePart>,
}

impl DecodedMessage {
    pub fn text(role: impl Into<String>, text: impl Into<String>) -> Self {
        DecodedMessage {
            role: role.into(),
            parts: vec![MessagePart {
                kind: "text".to_string(),
                text: text.into(),
            }],
        }
    }

    /// Concatenation of all text parts, used by the retry protocol's `accumulatedText`.
    pub fn joined_text(&self) -> String {
        self.parts
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Per-message-kind encode/decode pair.
pub trait Codec: Send + Sync {
    /// Produce the storage representation (JSON-serializable) for a fragment's data.
    fn encode(&self, data: &FragmentData) -> Result<Value, EngineError>;
    /// Produce the LLM-SDK-shaped message from the stored representation.
    fn decode(&self, stored: &Value) -> Result<DecodedMessage, EngineError>;
}

/// Text-only codec shared by `user` and `assistant` message kinds: stores `{ "text": ... }`,
/// decodes to a single text part tagged with the given role.
pub struct TextCodec {
    role: &'static str,
}

impl TextCodec {
    pub fn new(role: &'static str) -> Self {
        TextCodec { role }
    }
}

impl Codec for TextCodec {
    fn encode(&self, data: &FragmentData) -> Result<Value, EngineError> {
        let text = match data {
            FragmentData::Scalar(crate::fragment::Scalar::String(s)) => s.clone(),
            other => serde_json::to_string(other).map_err(|e| {
                EngineError::UnresolvedCodec(format!("text codec cannot encode: {e}"))
            })?,
        };
        Ok(serde_json::json!({ "text": text }))
    }

    fn decode(&self, stored: &Value) -> Result<DecodedMessage, EngineError> {
        let text = stored
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(DecodedMessage::text(self.role, text))
    }
}

/// Tool-result codec: stores `{ "tool_name": ..., "result": ... }`, decodes to a single
/// part tagged `"tool-result"` whose text is the result rendered as JSON text.
pub struct ToolResultCodec;

impl Codec for ToolResultCodec {
    fn encode(&self, data: &FragmentData) -> Result<Value, EngineError> {
        serde_json::to_value(data)
            .map_err(|e| EngineError::UnresolvedCodec(format!("tool-result encode: {e}")))
    }

    fn decode(&self, stored: &Value) -> Result<DecodedMessage, EngineError> {
        let text = stored.to_string();
        Ok(DecodedMessage {
            role: "tool".to_string(),
            parts: vec![MessagePart {
                kind: "tool-result".to_string(),
                text,
            }],
        })
    }
}

/// Looks up a [`Codec`] implementation by the handle name a fragment carries.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn Codec>>,
}

impl Default for CodecRegistry {
    /// Registers the three built-in kinds spec.md §3 names: `user`, `assistant`, `tool-result`.
    fn default() -> Self {
        let mut codecs: HashMap<String, Arc<dyn Codec>> = HashMap::new();
        codecs.insert("user".to_string(), Arc::new(TextCodec::new("user")));
        codecs.insert(
            "assistant".to_string(),
            Arc::new(TextCodec::new("assistant")),
        );
        codecs.insert("tool-result".to_string(), Arc::new(ToolResultCodec));
        CodecRegistry { codecs }
    }
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, codec: Arc<dyn Codec>) {
        self.codecs.insert(name.into(), codec);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Codec>> {
        self.codecs.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::Scalar;

    #[test]
    fn text_codec_round_trips_role_and_content() {
        let codec = TextCodec::new("user");
        let encoded = codec
            .encode(&FragmentData::Scalar(Scalar::String("hi".to_string())))
            .unwrap();
        let decoded = codec.decode(&encoded).unwrap();
        assert_eq!(decoded.role, "user");
        assert_eq!(decoded.joined_text(), "hi");
    }

    #[test]
    fn registry_resolves_built_in_handles() {
        let registry = CodecRegistry::default();
        assert!(registry.get("user").is_some());
        assert!(registry.get("assistant").is_some());
        assert!(registry.get("tool-result").is_some());
        assert!(registry.get("nope").is_none());
    }
}
