//! Token/Cost Registry (spec.md §4.4): counts tokens per fragment/text and prices them
//! against a [`crate::model_spec::ModelSpec`] resolved by any [`crate::model_spec::ModelLimitResolver`].

use std::sync::Arc;

use crate::error::RegistryError;
use crate::fragment::{Fragment, FragmentData, Scalar};
use crate::model_spec::{ModelLimitResolver, ModelSpec};

/// Result of estimating one piece of text/fragments against a model (spec.md §4.4,
/// testable property "Estimate linearity").
#[derive(Clone, Debug, PartialEq)]
pub struct Estimate {
    pub tokens: u64,
    pub cost: f64,
    pub limits: Option<ModelSpec>,
    pub exceeds_context: bool,
}

/// Per-fragment token breakdown alongside the joint total (spec.md §4.4: "both numbers
/// are reported").
#[derive(Clone, Debug, PartialEq)]
pub struct FragmentBreakdown {
    pub per_fragment: Vec<(String, u64)>,
    pub sum_of_fragments: u64,
    pub joint_tokens: u64,
}

/// Splits `"provider/model"` or `"provider:model"` into `(provider, model)`.
pub fn parse_model_string(model: &str) -> Result<(&str, &str), RegistryError> {
    model
        .split_once('/')
        .or_else(|| model.split_once(':'))
        .filter(|(p, m)| !p.is_empty() && !m.is_empty())
        .ok_or_else(|| RegistryError::InvalidModelString(model.to_string()))
}

/// Default byte-pair-style tokenizer: ~4 characters per token, the common `cl100k`
/// approximation (±5-10% tolerance per spec.md §4.4).
fn count_cl100k(text: &str) -> u64 {
    ((text.chars().count() as f64) / 4.0).ceil() as u64
}

/// `gpt2`-style fallback: roughly 1.3 tokens per whitespace-separated word.
fn count_gpt2(text: &str) -> u64 {
    ((text.split_whitespace().count() as f64) * 1.3).ceil() as u64
}

/// Raw word-count estimator used when a model's `family` is absent from the catalog.
fn count_words(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

/// Counts tokens for `text` using the tokenizer mapped from `family` (`None` uses the
/// default `cl100k`-style tokenizer).
pub fn count_tokens(text: &str, family: Option<&str>) -> u64 {
    match family {
        Some("gpt2") => count_gpt2(text),
        Some("cl100k") | None => count_cl100k(text),
        Some(_) => count_words(text),
    }
}

pub(crate) fn fragment_text(fragment: &Fragment) -> String {
    render_data_text(&fragment.data)
}

pub(crate) fn render_data_text(data: &FragmentData) -> String {
    match data {
        FragmentData::Scalar(Scalar::String(s)) => s.clone(),
        FragmentData::Scalar(Scalar::Number(n)) => n.to_string(),
        FragmentData::Scalar(Scalar::Bool(b)) => b.to_string(),
        FragmentData::Scalar(Scalar::Null) => String::new(),
        FragmentData::List(items) => items.iter().map(render_data_text).collect::<Vec<_>>().join(" "),
        FragmentData::Map(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            keys.into_iter()
                .map(|k| render_data_text(&map[k]))
                .collect::<Vec<_>>()
                .join(" ")
        }
        FragmentData::Nested(f) => fragment_text(f),
    }
}

/// Token/Cost Registry: resolves model catalog entries and counts tokens against them.
pub struct TokenRegistry {
    resolver: Arc<dyn ModelLimitResolver>,
}

impl TokenRegistry {
    pub fn new(resolver: Arc<dyn ModelLimitResolver>) -> Self {
        TokenRegistry { resolver }
    }

    async fn resolve_spec(&self, model: &str) -> Result<Option<ModelSpec>, RegistryError> {
        let (provider, model_id) = parse_model_string(model)?;
        Ok(self.resolver.resolve(provider, model_id).await)
    }

    /// Estimates a single block of text against a model's context limit and input price.
    pub async fn estimate(&self, model: &str, text: &str) -> Result<Estimate, RegistryError> {
        let spec = self.resolve_spec(model).await?;
        let tokens = count_tokens(text, spec.as_ref().and_then(|s| s.family.as_deref()));
        let cost = spec
            .as_ref()
            .map(|s| (tokens as f64 / 1_000_000.0) * s.input_price)
            .unwrap_or(0.0);
        let exceeds_context = spec
            .as_ref()
            .map(|s| tokens > s.context_limit as u64)
            .unwrap_or(false);
        Ok(Estimate {
            tokens,
            cost,
            limits: spec,
            exceeds_context,
        })
    }

    /// Estimates a list of fragments both jointly (concatenated) and per-fragment
    /// (spec.md §4.4 / §8 "Estimate linearity").
    pub async fn estimate_fragments(
        &self,
        model: &str,
        fragments: &[Fragment],
        rendered_joint: &str,
    ) -> Result<(Estimate, FragmentBreakdown), RegistryError> {
        let joint = self.estimate(model, rendered_joint).await?;
        let spec = self.resolve_spec(model).await?;
        let family = spec.as_ref().and_then(|s| s.family.as_deref());
        let per_fragment: Vec<(String, u64)> = fragments
            .iter()
            .map(|f| (f.name.clone(), count_tokens(&fragment_text(f), family)))
            .collect();
        let sum_of_fragments: u64 = per_fragment.iter().map(|(_, t)| *t).sum();
        Ok((
            joint,
            FragmentBreakdown {
                per_fragment,
                sum_of_fragments,
                joint_tokens: joint.tokens,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FixedResolver(ModelSpec);

    #[async_trait]
    impl ModelLimitResolver for FixedResolver {
        async fn resolve(&self, _provider_id: &str, _model_id: &str) -> Option<ModelSpec> {
            Some(self.0.clone())
        }
    }

    #[test]
    fn parse_model_string_accepts_slash_and_colon() {
        assert_eq!(parse_model_string("openai/gpt-4o").unwrap(), ("openai", "gpt-4o"));
        assert_eq!(parse_model_string("openai:gpt-4o").unwrap(), ("openai", "gpt-4o"));
    }

    #[test]
    fn parse_model_string_rejects_bad_format() {
        assert!(parse_model_string("gpt-4o").is_err());
    }

    #[tokio::test]
    async fn estimate_computes_positive_tokens_and_cost() {
        let spec = ModelSpec::new(128_000, 4096).with_prices(0.000003, 0.000015);
        let registry = TokenRegistry::new(Arc::new(FixedResolver(spec)));
        let estimate = registry
            .estimate("openai:gpt-4o", "You are helpful.")
            .await
            .unwrap();
        assert!(estimate.tokens > 0);
        assert!(!estimate.exceeds_context);
        assert!((estimate.cost - (estimate.tokens as f64 / 1e6) * 0.000003).abs() < 1e-12);
    }

    #[tokio::test]
    async fn estimate_flags_exceeds_context_for_tiny_limit() {
        let spec = ModelSpec::new(1, 1);
        let registry = TokenRegistry::new(Arc::new(FixedResolver(spec)));
        let estimate = registry
            .estimate("local:tiny", "this text is definitely more than one token")
            .await
            .unwrap();
        assert!(estimate.exceeds_context);
    }
}
