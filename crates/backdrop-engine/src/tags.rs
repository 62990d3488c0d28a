use backdrop_contracts::character::{BackgroundImageConfig, Character, SizePreset};
use rand::Rng;

use crate::image::{CharacterPrompt, ImageRequest, PromptPosition};

pub const DEFAULT_POSITIVE_TAGS: [&str; 3] = ["masterpiece", "best quality", "scenery"];
pub const DEFAULT_NEGATIVE_TAGS: [&str; 10] = [
    "lowres",
    "bad anatomy",
    "bad hands",
    "text",
    "error",
    "worst quality",
    "low quality",
    "jpeg artifacts",
    "signature",
    "watermark",
];

pub const DEFAULT_MODEL: &str = "NAI Diffusion V4 Curated";
pub const DEFAULT_STEPS: u32 = 28;
pub const DEFAULT_SCALE: f32 = 5.0;
pub const DEFAULT_SAMPLER: &str = "k_euler_ancestral";
pub const DEFAULT_NOISE_SCHEDULE: &str = "karras";

/// Builds the image request for a character's background from its tag
/// configuration and the scene caption (which may be empty).
pub fn build_image_request(character: &Character, caption: &str) -> ImageRequest {
    let config = character
        .background_image_config
        .clone()
        .unwrap_or_default();
    let settings = &config.novelai_settings;
    let size = size_or_default(config.size_preset.unwrap_or_default());

    ImageRequest {
        prompt: positive_tags(&config, caption).join(", "),
        negative_prompt: negative_tags(&config).join(", "),
        model: non_empty(settings.model.as_deref()).unwrap_or(DEFAULT_MODEL).to_string(),
        width: size.width,
        height: size.height,
        steps: settings.steps.filter(|steps| *steps > 0).unwrap_or(DEFAULT_STEPS),
        scale: settings
            .scale
            .filter(|scale| *scale > 0.0)
            .unwrap_or(DEFAULT_SCALE),
        sampler: non_empty(settings.sampler.as_deref())
            .unwrap_or(DEFAULT_SAMPLER)
            .to_string(),
        seed: resolve_seed(&config),
        noise_schedule: non_empty(settings.noise_schedule.as_deref())
            .unwrap_or(DEFAULT_NOISE_SCHEDULE)
            .to_string(),
        character_prompts: character_prompts(&config),
        use_coords: settings.use_coords.unwrap_or(false),
        use_order: settings.use_order.unwrap_or(true),
    }
}

/// Gender, character and quality tags, artist, defaults, the character's own
/// positive tags, then the fixed tags and caption.
pub fn positive_tags(config: &BackgroundImageConfig, caption: &str) -> Vec<String> {
    let mut normal_tags = config.fixed_tags.clone();
    if !caption.trim().is_empty() {
        normal_tags.push(caption.trim().to_string());
    }

    let mut tags = Vec::new();
    tags.extend(config.gender_tags.iter().cloned());
    tags.extend(config.character_tags.iter().cloned());
    tags.extend(config.quality_tags.iter().cloned());
    if let Some(artist) = non_empty(config.artist_prompt.as_deref()) {
        tags.push(artist.to_string());
    }
    tags.extend(DEFAULT_POSITIVE_TAGS.iter().map(|tag| tag.to_string()));
    tags.extend(config.positive_tags.iter().cloned());
    tags.extend(normal_tags);
    clean_tags(tags)
}

pub fn negative_tags(config: &BackgroundImageConfig) -> Vec<String> {
    let mut tags: Vec<String> = DEFAULT_NEGATIVE_TAGS
        .iter()
        .map(|tag| tag.to_string())
        .collect();
    tags.extend(config.negative_tags.iter().cloned());
    clean_tags(tags)
}

/// Character seed, then sampler-settings seed, else a fresh random 32-bit value.
pub fn resolve_seed(config: &BackgroundImageConfig) -> u64 {
    config
        .seed
        .or(config.novelai_settings.seed)
        .unwrap_or_else(|| u64::from(rand::thread_rng().gen::<u32>()))
}

fn character_prompts(config: &BackgroundImageConfig) -> Vec<CharacterPrompt> {
    let tags = clean_tags(config.character_tags.clone());
    if tags.is_empty() {
        return Vec::new();
    }
    vec![CharacterPrompt {
        prompt: tags.join(", "),
        positions: vec![PromptPosition { x: 0.0, y: 0.0 }],
    }]
}

fn clean_tags(tags: Vec<String>) -> Vec<String> {
    tags.into_iter()
        .map(|tag| tag.trim().to_string())
        .filter(|tag| !tag.is_empty())
        .collect()
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn size_or_default(size: SizePreset) -> SizePreset {
    if size.width == 0 || size.height == 0 {
        SizePreset::default()
    } else {
        size
    }
}
