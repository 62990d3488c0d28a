use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// The slice of a character record the background generator reads and writes.
///
/// Unknown fields are preserved in `extra` so a character file can be rewritten
/// after a commit without dropping data owned by other parts of the app.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Character {
    pub id: String,
    pub name: String,
    pub background_image: Option<String>,
    pub enable_auto_extra_background: bool,
    pub background_image_config: Option<BackgroundImageConfig>,
    pub extra_background_image: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Character {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read character file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid character JSON in {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn has_background_image(&self) -> bool {
        self.background_image
            .as_deref()
            .map(|value| !value.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn uses_backend(&self, backend: ImageBackend) -> bool {
        self.background_image_config
            .as_ref()
            .and_then(|config| config.backend)
            .map(|value| value == backend)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageBackend {
    #[serde(rename = "novelai")]
    NovelAi,
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundImageConfig {
    pub backend: Option<ImageBackend>,
    pub gender_tags: Vec<String>,
    pub character_tags: Vec<String>,
    pub quality_tags: Vec<String>,
    pub positive_tags: Vec<String>,
    pub negative_tags: Vec<String>,
    pub fixed_tags: Vec<String>,
    pub artist_prompt: Option<String>,
    pub seed: Option<u64>,
    pub size_preset: Option<SizePreset>,
    pub novelai_settings: NovelAiSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizePreset {
    pub width: u32,
    pub height: u32,
}

impl Default for SizePreset {
    fn default() -> Self {
        Self {
            width: 832,
            height: 1216,
        }
    }
}

/// Per-character sampler overrides. Unset fields fall back to the generator defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NovelAiSettings {
    pub model: Option<String>,
    pub steps: Option<u32>,
    pub scale: Option<f32>,
    pub sampler: Option<String>,
    pub noise_schedule: Option<String>,
    pub seed: Option<u64>,
    pub use_coords: Option<bool>,
    pub use_order: Option<bool>,
}
