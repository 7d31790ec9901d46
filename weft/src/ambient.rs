//! Ambient environment knobs (spec.md §2 / SPEC_FULL.md §2 "Config"): loads the `weft`
//! XDG config + project `.env` exactly once, then exposes the env vars that downstream
//! constructors (the eval store's default path, `ModelsDevResolver`'s base URL, a
//! caller-supplied `ModelClient` pointed at a local model server) read from.
//!
//! `weft` treats [`crate::agent::ModelClient`] as an opaque SDK boundary (spec.md §1
//! non-goals), so `OLLAMA_BASE_URL` / `LM_STUDIO_BASE_URL` are not consumed here — they
//! are surfaced for whatever `ModelClient` implementation a caller wires up.

use std::sync::Once;

static INIT: Once = Once::new();

/// Loads `$XDG_CONFIG_HOME/weft/config.toml` and `./.env` into the process environment,
/// for any key not already set there. Idempotent; safe to call from every entry point
/// that needs ambient config (the eval runner, `ModelsDevResolver::from_ambient_config`).
pub fn load_once() {
    INIT.call_once(|| {
        if let Err(e) = weft_config::load_and_apply("weft", None) {
            tracing::warn!(error = %e, "failed to load ambient weft config; continuing with process env only");
        }
    });
}

/// The ambient env knobs this crate's constructors look at, after [`load_once`] has run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AmbientConfig {
    /// Overrides [`crate::model_spec::DEFAULT_MODELS_DEV_URL`] when set.
    pub models_dev_base_url: Option<String>,
    /// Base URL of a local Ollama server, for callers building their own `ModelClient`.
    pub ollama_base_url: Option<String>,
    /// Base URL of a local LM Studio server, for callers building their own `ModelClient`.
    pub lm_studio_base_url: Option<String>,
}

/// Loads ambient config (once per process) and reads the env vars it populates.
pub fn load_ambient_config() -> AmbientConfig {
    load_once();
    AmbientConfig {
        models_dev_base_url: std::env::var("MODELS_DEV_BASE_URL").ok(),
        ollama_base_url: std::env::var("OLLAMA_BASE_URL").ok(),
        lm_studio_base_url: std::env::var("LM_STUDIO_BASE_URL").ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_env_vars_resolve_to_none() {
        std::env::remove_var("MODELS_DEV_BASE_URL");
        std::env::remove_var("OLLAMA_BASE_URL");
        std::env::remove_var("LM_STUDIO_BASE_URL");
        let config = load_ambient_config();
        assert_eq!(config.models_dev_base_url, None);
        assert_eq!(config.ollama_base_url, None);
    }

    #[test]
    fn present_env_var_is_surfaced() {
        std::env::set_var("OLLAMA_BASE_URL", "http://localhost:11434");
        let config = load_ambient_config();
        assert_eq!(config.ollama_base_url.as_deref(), Some("http://localhost:11434"));
        std::env::remove_var("OLLAMA_BASE_URL");
    }
}
