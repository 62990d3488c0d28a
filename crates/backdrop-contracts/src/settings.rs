use std::env;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub const DEFAULT_OPENROUTER_BASE: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_GEMINI_BASE: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";
pub const DEFAULT_NOVELAI_BASE: &str = "https://image.novelai.net";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 90;

/// Credentials and endpoints for the text and image collaborators.
///
/// Loaded from a JSON file (every field optional), then overlaid with
/// non-empty environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub openrouter: OpenRouterSettings,
    pub openai_compatible: OpenAiCompatibleSettings,
    pub gemini: GeminiSettings,
    pub cloud_relay: CloudRelaySettings,
    pub novelai: NovelAiCredentials,
    pub request_timeout_secs: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            openrouter: OpenRouterSettings::default(),
            openai_compatible: OpenAiCompatibleSettings::default(),
            gemini: GeminiSettings::default(),
            cloud_relay: CloudRelaySettings::default(),
            novelai: NovelAiCredentials::default(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenRouterSettings {
    pub enabled: bool,
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

impl Default for OpenRouterSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: String::new(),
            model: String::new(),
            base_url: DEFAULT_OPENROUTER_BASE.to_string(),
        }
    }
}

impl OpenRouterSettings {
    pub fn is_usable(&self) -> bool {
        self.enabled && non_blank(&self.api_key) && non_blank(&self.model)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiCompatibleSettings {
    pub enabled: bool,
    pub api_key: String,
    pub endpoint: String,
    pub model: String,
}

impl OpenAiCompatibleSettings {
    pub fn is_usable(&self) -> bool {
        self.enabled
            && non_blank(&self.api_key)
            && non_blank(&self.endpoint)
            && non_blank(&self.model)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiSettings {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

impl Default for GeminiSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: DEFAULT_GEMINI_MODEL.to_string(),
            base_url: DEFAULT_GEMINI_BASE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudRelaySettings {
    pub endpoint: String,
    pub api_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NovelAiCredentials {
    pub token: String,
    pub base_url: String,
}

impl Default for NovelAiCredentials {
    fn default() -> Self {
        Self {
            token: String::new(),
            base_url: DEFAULT_NOVELAI_BASE.to_string(),
        }
    }
}

impl ProviderSettings {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid settings JSON in {}", path.display()))
    }

    /// Settings from `path` when given, defaults otherwise, with env overrides applied.
    pub fn resolve(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut settings = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        settings.apply_env_overrides();
        Ok(settings)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(non_empty_env);
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("OPENROUTER_API_KEY") {
            self.openrouter.api_key = value;
        }
        if let Some(value) = lookup("OPENROUTER_MODEL") {
            self.openrouter.model = value;
        }
        if let Some(value) = lookup("OPENAI_COMPAT_API_KEY") {
            self.openai_compatible.api_key = value;
        }
        if let Some(value) = lookup("OPENAI_COMPAT_ENDPOINT") {
            self.openai_compatible.endpoint = value;
        }
        if let Some(value) = lookup("OPENAI_COMPAT_MODEL") {
            self.openai_compatible.model = value;
        }
        if let Some(value) = lookup("GEMINI_API_KEY") {
            self.gemini.api_key = value;
        }
        if let Some(value) = lookup("BACKDROP_RELAY_ENDPOINT") {
            self.cloud_relay.endpoint = value;
        }
        if let Some(value) = lookup("BACKDROP_RELAY_API_KEY") {
            self.cloud_relay.api_key = value;
        }
        if let Some(value) = lookup("NOVELAI_TOKEN") {
            self.novelai.token = value;
        }
    }
}

fn non_blank(value: &str) -> bool {
    !value.trim().is_empty()
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
