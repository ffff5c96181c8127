//! Read-only configuration stores.
//!
//! The gateway consumes `models.json`, `apps.json`, `platform.json` and
//! `locales/<lang>.json` from a config directory. A [`ConfigStore`] is an
//! immutable snapshot loaded at startup and shared as `Arc`; refresh is an
//! external concern; readers always see one consistent snapshot.

use crate::llm::adapter::{Provider, ProviderConfig};
use crate::llm::error::GatewayError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub const FALLBACK_LANGUAGE: &str = "en";

// ============================================================================
// Model specs
// ============================================================================

/// One upstream model deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    pub id: String,
    pub provider: Provider,
    /// Upstream base URL.
    pub url: String,
    /// Environment variable holding the API key. Falls back to the
    /// provider's conventional variable when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_tools: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_streaming: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_images: Option<bool>,
    #[serde(default = "default_context_length")]
    pub context_length: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing: Option<serde_json::Value>,
    /// Per-upstream concurrency override for the throttler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
}

fn default_context_length() -> u32 {
    128_000
}

impl ModelSpec {
    fn default_key_env(&self) -> &'static str {
        match self.provider {
            Provider::OpenAi => "OPENAI_API_KEY",
            Provider::Anthropic => "ANTHROPIC_API_KEY",
            Provider::Google => "GEMINI_API_KEY",
            Provider::Mistral => "MISTRAL_API_KEY",
            Provider::VLlm => "VLLM_API_KEY",
        }
    }

    /// Resolve endpoint credentials from the environment. A missing key is
    /// acceptable here; `validate_config` on the adapter decides whether the
    /// vendor requires one.
    pub fn provider_config(&self) -> ProviderConfig {
        let env_name = self
            .api_key_env
            .as_deref()
            .unwrap_or_else(|| self.default_key_env());
        let api_key = std::env::var(env_name).unwrap_or_default();
        ProviderConfig::new(api_key, self.url.clone())
    }
}

// ============================================================================
// App specs
// ============================================================================

/// Application-level configuration referenced by chat requests. The
/// orchestrator treats unknown keys as opaque; only the fields below are
/// recognized.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    pub id: String,
    /// Localized system prompt, keyed by language tag.
    #[serde(default)]
    pub system_prompt: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_limit: Option<u32>,
    /// Tools this app may offer to the model.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    #[serde(default)]
    pub compatible_models: Vec<String>,
    /// Template variables expanded into the system prompt.
    #[serde(default)]
    pub variables: HashMap<String, String>,
    /// Workflows that may be addressed with an `@name` token.
    #[serde(default)]
    pub workflows: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherits: Option<String>,
}

impl AppSpec {
    /// Localized system prompt with English fallback.
    pub fn prompt_for(&self, language: &str) -> Option<&str> {
        self.system_prompt
            .get(language)
            .or_else(|| self.system_prompt.get(FALLBACK_LANGUAGE))
            .map(String::as_str)
    }

    /// True when `model_id` may serve this app.
    pub fn accepts_model(&self, model_id: &str) -> bool {
        self.compatible_models.is_empty()
            || self.compatible_models.iter().any(|id| id == model_id)
            || self.default_model.as_deref() == Some(model_id)
    }

    /// Fill unset fields from `parent` (single-level inheritance).
    fn merge_parent(&mut self, parent: &AppSpec) {
        for (lang, prompt) in &parent.system_prompt {
            self.system_prompt
                .entry(lang.clone())
                .or_insert_with(|| prompt.clone());
        }
        if self.token_limit.is_none() {
            self.token_limit = parent.token_limit;
        }
        if self.tools.is_empty() {
            self.tools = parent.tools.clone();
        }
        if self.default_model.is_none() {
            self.default_model = parent.default_model.clone();
        }
        if self.compatible_models.is_empty() {
            self.compatible_models = parent.compatible_models.clone();
        }
        for (name, value) in &parent.variables {
            self.variables
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
        if self.workflows.is_empty() {
            self.workflows = parent.workflows.clone();
        }
    }
}

// ============================================================================
// Platform and locales
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformSpec {
    #[serde(default = "default_language")]
    pub default_language: String,
    /// Default permit count per upstream endpoint.
    #[serde(default = "default_upstream_concurrency")]
    pub upstream_concurrency: usize,
}

fn default_language() -> String {
    FALLBACK_LANGUAGE.to_string()
}

fn default_upstream_concurrency() -> usize {
    crate::llm::throttle::DEFAULT_UPSTREAM_LIMIT
}

impl Default for PlatformSpec {
    fn default() -> Self {
        PlatformSpec {
            default_language: default_language(),
            upstream_concurrency: default_upstream_concurrency(),
        }
    }
}

// ============================================================================
// Store
// ============================================================================

/// Immutable configuration snapshot.
#[derive(Debug, Default)]
pub struct ConfigStore {
    models: HashMap<String, ModelSpec>,
    apps: HashMap<String, AppSpec>,
    platform: PlatformSpec,
    /// language tag → (error code → localized message)
    locales: HashMap<String, HashMap<String, String>>,
}

impl ConfigStore {
    /// Load a snapshot from `dir`. Missing files default to empty; malformed
    /// files are configuration errors.
    pub fn load(dir: &Path) -> Result<Self, GatewayError> {
        let models: Vec<ModelSpec> = read_json_or_default(&dir.join("models.json"))?;
        let apps: Vec<AppSpec> = read_json_or_default(&dir.join("apps.json"))?;
        let platform: PlatformSpec = read_json_or_default(&dir.join("platform.json"))?;

        let mut locales = HashMap::new();
        let locales_dir = dir.join("locales");
        if locales_dir.is_dir() {
            for entry in fs::read_dir(&locales_dir)
                .map_err(|err| GatewayError::Configuration(err.to_string()))?
            {
                let entry = entry.map_err(|err| GatewayError::Configuration(err.to_string()))?;
                let path = entry.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                    continue;
                }
                let Some(lang) = path.file_stem().and_then(|stem| stem.to_str()) else {
                    continue;
                };
                let bundle: HashMap<String, String> = read_json_or_default(&path)?;
                locales.insert(lang.to_string(), bundle);
            }
        }

        let mut store = ConfigStore {
            models: models.into_iter().map(|m| (m.id.clone(), m)).collect(),
            apps: apps.into_iter().map(|a| (a.id.clone(), a)).collect(),
            platform,
            locales,
        };
        store.resolve_inheritance();
        Ok(store)
    }

    pub fn from_parts(models: Vec<ModelSpec>, apps: Vec<AppSpec>, platform: PlatformSpec) -> Self {
        let mut store = ConfigStore {
            models: models.into_iter().map(|m| (m.id.clone(), m)).collect(),
            apps: apps.into_iter().map(|a| (a.id.clone(), a)).collect(),
            platform,
            locales: HashMap::new(),
        };
        store.resolve_inheritance();
        store
    }

    fn resolve_inheritance(&mut self) {
        let parents = self.apps.clone();
        for app in self.apps.values_mut() {
            if let Some(parent) = app.inherits.as_ref().and_then(|id| parents.get(id)) {
                app.merge_parent(parent);
            }
        }
    }

    pub fn model(&self, id: &str) -> Option<&ModelSpec> {
        self.models.get(id)
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn app(&self, id: &str) -> Option<&AppSpec> {
        self.apps.get(id)
    }

    pub fn platform(&self) -> &PlatformSpec {
        &self.platform
    }

    /// Localized user-visible message for an error code, with English then
    /// raw-code fallback.
    pub fn message_for(&self, language: &str, code: &str) -> String {
        self.locales
            .get(language)
            .and_then(|bundle| bundle.get(code))
            .or_else(|| {
                self.locales
                    .get(FALLBACK_LANGUAGE)
                    .and_then(|bundle| bundle.get(code))
            })
            .cloned()
            .unwrap_or_else(|| code.to_string())
    }
}

fn read_json_or_default<T: serde::de::DeserializeOwned + Default>(
    path: &Path,
) -> Result<T, GatewayError> {
    if !path.exists() {
        return Ok(T::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| GatewayError::Configuration(format!("{}: {err}", path.display())))?;
    serde_json::from_str(&raw)
        .map_err(|err| GatewayError::Configuration(format!("{}: {err}", path.display())))
}
