//! Models.dev resolver: fetch model specs from https://models.dev/api.json

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::resolver::ModelLimitResolver;
use super::spec::ModelSpec;

/// Default models.dev API URL.
pub const DEFAULT_MODELS_DEV_URL: &str = "https://models.dev/api.json";

/// Fetches JSON from a URL. Abstraction for testing.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// GET the URL and return the response body as string.
    async fn get(&self, url: &str) -> Result<String, String>;
}

/// Reqwest-based HTTP client.
pub struct ReqwestHttpClient;

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn get(&self, url: &str) -> Result<String, String> {
        let client = reqwest::Client::new();
        let body = client
            .get(url)
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?
            .text()
            .await
            .map_err(|e| e.to_string())?;
        Ok(body)
    }
}

/// Resolves model specs from models.dev API.
pub struct ModelsDevResolver {
    base_url: String,
    http_client: Arc<dyn HttpClient>,
}

impl ModelsDevResolver {
    /// Create with default URL and reqwest client.
    pub fn new() -> Self {
        Self {
            base_url: DEFAULT_MODELS_DEV_URL.to_string(),
            http_client: Arc::new(ReqwestHttpClient),
        }
    }

    /// Create with custom URL and HTTP client.
    pub fn with_client(base_url: String, http_client: Arc<dyn HttpClient>) -> Self {
        Self {
            base_url,
            http_client,
        }
    }

    /// Create using [`crate::ambient::load_ambient_config`]'s `models_dev_base_url`
    /// override if set (`MODELS_DEV_BASE_URL`, loaded via the `weft` XDG config / `.env`),
    /// falling back to [`DEFAULT_MODELS_DEV_URL`] (SPEC_FULL.md §2 "Config").
    pub fn from_ambient_config() -> Self {
        let ambient = crate::ambient::load_ambient_config();
        Self {
            base_url: ambient.models_dev_base_url.unwrap_or_else(|| DEFAULT_MODELS_DEV_URL.to_string()),
            http_client: Arc::new(ReqwestHttpClient),
        }
    }

    /// Fetch full JSON and parse into provider -> model_id -> ModelSpec map.
    /// Key format: "provider_id/model_id".
    pub async fn fetch_all(&self) -> Result<std::collections::HashMap<String, ModelSpec>, String> {
        let body = self.http_client.get(&self.base_url).await?;
        parse_all_models(&body)
    }

    fn resolve_from_json(&self, json: &Value, provider_id: &str, model_id: &str) -> Option<ModelSpec> {
        let provider = json.get(provider_id)?;
        let models = provider.get("models")?.as_object()?;

        // Try model_id as-is first (e.g. "openai/gpt-5")
        let model = models.get(model_id).or_else(|| {
            // Try "provider_id/model_id" if model_id has no slash
            if !model_id.contains('/') {
                models.get(&format!("{}/{}", provider_id, model_id))
            } else {
                None
            }
        })?;

        parse_model_limit(model)
    }
}

impl Default for ModelsDevResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelLimitResolver for ModelsDevResolver {
    async fn resolve(&self, provider_id: &str, model_id: &str) -> Option<ModelSpec> {
        let body = self.http_client.get(&self.base_url).await.ok()?;
        let json: Value = serde_json::from_str(&body).ok()?;
        self.resolve_from_json(&json, provider_id, model_id)
    }
}

/// Parse ModelSpec from a model JSON object (has "limit" with "context" and "output",
/// and optionally "cost" with per-unit USD prices and a tokenizer "family").
pub(crate) fn parse_model_limit(model: &Value) -> Option<ModelSpec> {
    let limit = model.get("limit")?;
    let context = limit.get("context")?.as_u64()? as u32;
    let output = limit.get("output")?.as_u64()? as u32;

    let cache_read = limit
        .get("cache_read")
        .and_then(|v| v.as_u64())
        .map(|v| v as u32);
    let cache_write = limit
        .get("cache_write")
        .and_then(|v| v.as_u64())
        .map(|v| v as u32);

    let mut spec = ModelSpec::new(context, output);
    if let Some(v) = cache_read {
        spec.cache_read = Some(v);
    }
    if let Some(v) = cache_write {
        spec.cache_write = Some(v);
    }

    if let Some(cost) = model.get("cost") {
        spec.input_price = cost.get("input").and_then(|v| v.as_f64()).unwrap_or(0.0);
        spec.output_price = cost.get("output").and_then(|v| v.as_f64()).unwrap_or(0.0);
        spec.cache_read_price = cost.get("cache_read").and_then(|v| v.as_f64());
        spec.cache_write_price = cost.get("cache_write").and_then(|v| v.as_f64());
        spec.reasoning_price = cost.get("reasoning").and_then(|v| v.as_f64());
    }

    spec.family = model
        .get("family")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    Some(spec)
}

fn parse_all_models(body: &str) -> Result<std::collections::HashMap<String, ModelSpec>, String> {
    let json: Value = serde_json::from_str(body).map_err(|e| e.to_string())?;
    let mut out = std::collections::HashMap::new();

    let providers = json.as_object().ok_or("root is not an object")?;
    for (provider_id, provider) in providers {
        let models = match provider.get("models").and_then(|m| m.as_object()) {
            Some(m) => m,
            None => continue,
        };
        for (model_id, model) in models {
            if let Some(spec) = parse_model_limit(model) {
                let key = format!("{}/{}", provider_id, model_id);
                out.insert(key, spec);
            }
        }
    }
    Ok(out)
}
