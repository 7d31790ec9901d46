//! ConfigOverride: explicit, caller-supplied model specs that win over any network lookup.

use std::collections::HashMap;

use async_trait::async_trait;

use super::resolver::ModelLimitResolver;
use super::spec::ModelSpec;

/// A fixed map of `"provider/model"` to [`ModelSpec`], for pinning limits/prices that the
/// caller knows are correct (e.g. a local or fine-tuned model absent from models.dev).
#[derive(Default)]
pub struct ConfigOverride {
    overrides: HashMap<String, ModelSpec>,
}

impl ConfigOverride {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider_id: &str, model_id: &str, spec: ModelSpec) -> Self {
        self.overrides
            .insert(format!("{}/{}", provider_id, model_id), spec);
        self
    }
}

#[async_trait]
impl ModelLimitResolver for ConfigOverride {
    async fn resolve(&self, provider_id: &str, model_id: &str) -> Option<ModelSpec> {
        self.overrides
            .get(&format!("{}/{}", provider_id, model_id))
            .cloned()
    }
}
