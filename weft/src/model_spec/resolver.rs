//! ModelLimitResolver: pluggable source of model catalog entries.

use async_trait::async_trait;

use super::spec::ModelSpec;

/// Resolves `(provider_id, model_id)` to a [`ModelSpec`].
///
/// Implementations: [`super::ModelsDevResolver`] (network), [`super::LocalFileResolver`]
/// (offline JSON fixture), [`super::CachedResolver`] (in-memory cache wrapper),
/// [`super::CompositeResolver`] (first-match chain).
#[async_trait]
pub trait ModelLimitResolver: Send + Sync {
    /// Looks up the spec for one model. Returns `None` on any miss — unknown provider,
    /// unknown model, or a fetch/parse failure are all folded into "not found" rather than
    /// an error, mirroring spec.md's Token/Cost Registry, which never surfaces a catalog
    /// lookup failure to the caller beyond "limits unknown".
    async fn resolve(&self, provider_id: &str, model_id: &str) -> Option<ModelSpec>;
}
