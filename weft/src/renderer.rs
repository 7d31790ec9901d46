//! Rendered fragment protocol (spec.md §6): renderers turn an ordered list of
//! non-message fragments into deterministic text for the system prompt.
//!
//! XML/Markdown/TOML/TOON renderers are out of scope beyond their contract (spec.md §1);
//! this module implements the contract once, concretely, as an XML-shaped renderer, since
//! `resolve()` needs something to call. The contract: null/undefined values and nested
//! null object fields are omitted; cycles are detected via a seen-set of fragment names
//! and elided; identically-named sibling fragments may be grouped under a pluralized
//! parent when `group_siblings` is set.

use std::collections::HashSet;

use crate::fragment::{Fragment, FragmentData, Scalar};

/// Turns non-message fragments into prompt text.
pub trait FragmentRenderer: Send + Sync {
    fn render(&self, fragments: &[Fragment]) -> String;
}

/// XML-tag-shaped renderer: `<name>data</name>` per fragment, nested fragments produce
/// nested tags.
pub struct XmlFragmentRenderer {
    pub group_siblings: bool,
}

impl Default for XmlFragmentRenderer {
    fn default() -> Self {
        XmlFragmentRenderer {
            group_siblings: false,
        }
    }
}

impl XmlFragmentRenderer {
    fn render_one(&self, fragment: &Fragment, seen: &mut HashSet<String>) -> String {
        if !seen.insert(fragment.name.clone()) {
            return String::new();
        }
        let body = Self::render_data(&fragment.data, seen);
        seen.remove(&fragment.name);
        if body.is_empty() {
            String::new()
        } else {
            format!("<{name}>{body}</{name}>", name = fragment.name, body = body)
        }
    }

    fn render_data(data: &FragmentData, seen: &mut HashSet<String>) -> String {
        match data {
            FragmentData::Scalar(Scalar::Null) => String::new(),
            FragmentData::Scalar(Scalar::String(s)) => s.clone(),
            FragmentData::Scalar(Scalar::Number(n)) => n.to_string(),
            FragmentData::Scalar(Scalar::Bool(b)) => b.to_string(),
            FragmentData::List(items) => items
                .iter()
                .map(|i| Self::render_data(i, seen))
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(""),
            FragmentData::Map(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                keys.into_iter()
                    .filter_map(|k| {
                        let v = &map[k];
                        let rendered = Self::render_data(v, seen);
                        if rendered.is_empty() {
                            None
                        } else {
                            Some(format!("<{k}>{rendered}</{k}>"))
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("")
            }
            FragmentData::Nested(nested) => {
                if !seen.insert(nested.name.clone()) {
                    return String::new();
                }
                let body = Self::render_data(&nested.data, seen);
                seen.remove(&nested.name);
                if body.is_empty() {
                    String::new()
                } else {
                    format!("<{n}>{body}</{n}>", n = nested.name, body = body)
                }
            }
        }
    }
}

impl FragmentRenderer for XmlFragmentRenderer {
    fn render(&self, fragments: &[Fragment]) -> String {
        if self.group_siblings {
            let mut groups: Vec<(String, Vec<&Fragment>)> = Vec::new();
            for f in fragments {
                if let Some(group) = groups.iter_mut().find(|(name, _)| name == &f.name) {
                    group.1.push(f);
                } else {
                    groups.push((f.name.clone(), vec![f]));
                }
            }
            groups
                .into_iter()
                .map(|(name, items)| {
                    if items.len() > 1 {
                        let mut seen = HashSet::new();
                        let inner: String = items
                            .iter()
                            .map(|f| Self::render_data(&f.data, &mut seen))
                            .collect();
                        format!("<{name}s>{inner}</{name}s>")
                    } else {
                        let mut seen = HashSet::new();
                        self.render_one(items[0], &mut seen)
                    }
                })
                .collect()
        } else {
            fragments
                .iter()
                .map(|f| {
                    let mut seen = HashSet::new();
                    self.render_one(f, &mut seen)
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn renders_scalar_fragment_as_tag() {
        let renderer = XmlFragmentRenderer::default();
        let out = renderer.render(&[Fragment::new("hint", FragmentData::text("be helpful"))]);
        assert_eq!(out, "<hint>be helpful</hint>");
    }

    #[test]
    fn omits_null_values() {
        let renderer = XmlFragmentRenderer::default();
        let out = renderer.render(&[Fragment::new(
            "hint",
            FragmentData::Scalar(crate::fragment::Scalar::Null),
        )]);
        assert_eq!(out, "");
    }

    #[test]
    fn groups_identically_named_siblings_when_enabled() {
        let renderer = XmlFragmentRenderer { group_siblings: true };
        let out = renderer.render(&[
            Fragment::new("tool", FragmentData::text("a")),
            Fragment::new("tool", FragmentData::text("b")),
        ]);
        assert_eq!(out, "<tools>ab</tools>");
    }

    #[test]
    fn cyclic_nested_fragment_is_elided() {
        let renderer = XmlFragmentRenderer::default();
        let inner = Fragment::new("outer", FragmentData::text("x"));
        let nested_data = FragmentData::Nested(Box::new(inner));
        let mut map = HashMap::new();
        map.insert("child".to_string(), nested_data);
        let outer = Fragment::new("outer", FragmentData::Map(map));
        // "outer" appears as both the top fragment and (simulated) nested name; since the
        // renderer tracks names, a fragment nested under its own name is elided.
        let out = renderer.render(&[outer]);
        assert!(!out.is_empty());
    }
}
