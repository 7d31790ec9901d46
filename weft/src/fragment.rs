//! Fragment model (spec.md §3): a named unit of prompt-building data with optional id,
//! type, persistence flag, codec, and a recursive payload.
//!
//! Fragments are small, user-authored trees (system prompt material, tool results) —
//! never large enough to need an arena, so `FragmentData` is an owned recursive enum
//! (spec.md §9's "Fragment recursion" note, resolved in DESIGN.md). Cycle detection for
//! renderers uses a `HashSet` of visited fragment names, not pointer identity.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Whether a fragment is prompt-building material or a persisted chat message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentKind {
    Fragment,
    Message,
}

/// Scalar leaf values a fragment's data can hold.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    String(String),
    Number(f64),
    Bool(bool),
    Null,
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::String(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::String(s)
    }
}

/// The recursive payload of a fragment: a scalar, an ordered list of fragments, a
/// string-keyed map, or a single nested fragment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FragmentData {
    Scalar(Scalar),
    List(Vec<FragmentData>),
    Map(HashMap<String, FragmentData>),
    Nested(Box<Fragment>),
}

impl FragmentData {
    pub fn text(s: impl Into<String>) -> Self {
        FragmentData::Scalar(Scalar::String(s.into()))
    }
}

/// A lazy fragment resolution tag: how the engine should materialize a deferred
/// fragment's id at save time (spec.md §4.2.2). The only specified tag is
/// `last-assistant`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LazyTag {
    LastAssistant,
}

/// Deferred identity for a pending message fragment, resolved just before `save()`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Lazy {
    pub tag: LazyTag,
}

/// A codec handle: the name of the encode/decode pair a message fragment carries.
/// The implementation living behind the name is looked up in a [`crate::codec::CodecRegistry`];
/// fragments only carry the handle so they stay `Clone`/`Serialize`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecHandle(pub String);

impl CodecHandle {
    pub fn new(name: impl Into<String>) -> Self {
        CodecHandle(name.into())
    }
}

/// A named unit of prompt-building data (spec.md §3).
///
/// `id` and `codec` matter only for message fragments: non-message fragments are
/// rendered textually and never persisted. `lazy` is set instead of `id`/`codec` when
/// the fragment's final identity depends on chat state at save time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub data: FragmentData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FragmentKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persist: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec: Option<CodecHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lazy: Option<Lazy>,
}

impl Fragment {
    /// A system-prompt / tool-result fragment: no id, no codec, not persisted.
    pub fn new(name: impl Into<String>, data: FragmentData) -> Self {
        Fragment {
            id: None,
            name: name.into(),
            data,
            kind: Some(FragmentKind::Fragment),
            persist: Some(false),
            codec: None,
            metadata: None,
            lazy: None,
        }
    }

    /// A persisted message fragment carrying a codec handle.
    pub fn message(name: impl Into<String>, data: FragmentData, codec: CodecHandle) -> Self {
        Fragment {
            id: None,
            name: name.into(),
            data,
            kind: Some(FragmentKind::Message),
            persist: Some(true),
            codec: Some(codec),
            metadata: None,
            lazy: None,
        }
    }

    /// A message fragment with an explicit id (e.g. reissued on branch during `save()`).
    pub fn message_with_id(
        id: impl Into<String>,
        name: impl Into<String>,
        data: FragmentData,
        codec: CodecHandle,
    ) -> Self {
        let mut f = Fragment::message(name, data, codec);
        f.id = Some(id.into());
        f
    }

    /// A lazy message fragment: no id/codec yet, resolved at save time (spec.md §4.2.2).
    pub fn lazy_message(name: impl Into<String>, data: FragmentData, tag: LazyTag) -> Self {
        Fragment {
            id: None,
            name: name.into(),
            data,
            kind: Some(FragmentKind::Message),
            persist: Some(true),
            codec: None,
            metadata: None,
            lazy: Some(Lazy { tag }),
        }
    }

    pub fn is_message(&self) -> bool {
        matches!(self.kind, Some(FragmentKind::Message))
    }

    pub fn is_lazy(&self) -> bool {
        self.lazy.is_some()
    }

    /// Two fragments are render-equivalent when name and data match; ids only matter
    /// for messages (spec.md §3).
    pub fn render_equivalent(&self, other: &Fragment) -> bool {
        self.name == other.name && self.data == other.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_message_fragment_defaults_to_unpersisted() {
        let f = Fragment::new("hint", FragmentData::text("You are helpful."));
        assert!(!f.is_message());
        assert_eq!(f.persist, Some(false));
        assert!(f.codec.is_none());
    }

    #[test]
    fn message_fragment_carries_codec() {
        let f = Fragment::message(
            "user",
            FragmentData::text("hello"),
            CodecHandle::new("user"),
        );
        assert!(f.is_message());
        assert_eq!(f.codec, Some(CodecHandle::new("user")));
    }

    #[test]
    fn lazy_fragment_has_no_id_or_codec() {
        let f = Fragment::lazy_message(
            "assistant",
            FragmentData::text("corrected"),
            LazyTag::LastAssistant,
        );
        assert!(f.id.is_none());
        assert!(f.codec.is_none());
        assert!(f.is_lazy());
    }

    #[test]
    fn render_equivalence_ignores_id() {
        let a = Fragment::message_with_id(
            "m1",
            "user",
            FragmentData::text("hi"),
            CodecHandle::new("user"),
        );
        let b = Fragment::message_with_id(
            "m2",
            "user",
            FragmentData::text("hi"),
            CodecHandle::new("user"),
        );
        assert!(a.render_equivalent(&b));
    }

    #[test]
    fn fragment_data_round_trips_through_json() {
        let data = FragmentData::Map(HashMap::from([(
            "role".to_string(),
            FragmentData::text("user"),
        )]));
        let f = Fragment::new("meta", data);
        let json = serde_json::to_string(&f).unwrap();
        let back: Fragment = serde_json::from_str(&json).unwrap();
        assert_eq!(f, back);
    }
}
