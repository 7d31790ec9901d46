//! CompositeResolver: tries each resolver in order, returns the first hit.

use async_trait::async_trait;

use super::resolver::ModelLimitResolver;
use super::spec::ModelSpec;

/// Chains resolvers with first-match-wins semantics. Typical order: a config override,
/// then a cached models.dev resolver, then a local file fallback for offline use.
pub struct CompositeResolver {
    resolvers: Vec<Box<dyn ModelLimitResolver>>,
}

impl CompositeResolver {
    pub fn new(resolvers: Vec<Box<dyn ModelLimitResolver>>) -> Self {
        Self { resolvers }
    }
}

#[async_trait]
impl ModelLimitResolver for CompositeResolver {
    async fn resolve(&self, provider_id: &str, model_id: &str) -> Option<ModelSpec> {
        for r in &self.resolvers {
            if let Some(spec) = r.resolve(provider_id, model_id).await {
                return Some(spec);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FixedResolver(Option<ModelSpec>);

    #[async_trait]
    impl ModelLimitResolver for FixedResolver {
        async fn resolve(&self, _provider_id: &str, _model_id: &str) -> Option<ModelSpec> {
            self.0.clone()
        }
    }

    struct CountingMiss(Mutex<u32>);

    #[async_trait]
    impl ModelLimitResolver for CountingMiss {
        async fn resolve(&self, _provider_id: &str, _model_id: &str) -> Option<ModelSpec> {
            *self.0.lock().unwrap() += 1;
            None
        }
    }

    #[tokio::test]
    async fn first_hit_wins() {
        let miss = CountingMiss(Mutex::new(0));
        let hit = FixedResolver(Some(ModelSpec::new(1000, 100)));
        let composite = CompositeResolver::new(vec![Box::new(miss), Box::new(hit)]);
        let spec = composite.resolve("p", "m").await.unwrap();
        assert_eq!(spec.context_limit, 1000);
    }

    #[tokio::test]
    async fn all_miss_returns_none() {
        let composite = CompositeResolver::new(vec![
            Box::new(FixedResolver(None)),
            Box::new(FixedResolver(None)),
        ]);
        assert!(composite.resolve("p", "m").await.is_none());
    }
}
