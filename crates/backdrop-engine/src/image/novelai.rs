use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use backdrop_contracts::settings::NovelAiCredentials;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client as HttpClient, StatusCode};
use serde_json::{json, Map, Value};

use super::{ImageClient, ImageOutput, ImageRequest};
use crate::error::ImageError;
use crate::http::{build_client, truncate_text};

const MODEL_ALIASES: [(&str, &str); 2] = [
    ("NAI Diffusion V4 Curated", "nai-diffusion-4-curated-preview"),
    ("NAI Diffusion V4", "nai-diffusion-4-full"),
];

/// Maps a display model name to the id the API expects; unknown names pass through.
pub fn official_model_id(model: &str) -> String {
    MODEL_ALIASES
        .iter()
        .find(|(alias, _)| *alias == model)
        .map(|(_, id)| id.to_string())
        .unwrap_or_else(|| model.to_string())
}

/// NovelAI image endpoint. Generated images are written into `output_dir` and
/// their file paths are returned as the image URLs.
pub struct NovelAiClient {
    endpoint: String,
    token: String,
    output_dir: PathBuf,
    http: HttpClient,
}

impl NovelAiClient {
    pub fn new(
        credentials: &NovelAiCredentials,
        output_dir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            endpoint: format!(
                "{}/ai/generate-image",
                credentials.base_url.trim().trim_end_matches('/')
            ),
            token: credentials.token.trim().to_string(),
            output_dir: output_dir.into(),
            http: build_client(timeout)?,
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    async fn persist(
        &self,
        images: Vec<(Vec<u8>, &'static str)>,
        seed: u64,
    ) -> anyhow::Result<Vec<String>> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .with_context(|| {
                format!("failed to create output dir {}", self.output_dir.display())
            })?;
        let stamp = chrono::Utc::now().timestamp_millis();
        let mut urls = Vec::new();
        for (idx, (bytes, ext)) in images.into_iter().enumerate() {
            let path = self
                .output_dir
                .join(format!("novelai-{stamp}-{seed}-{idx:02}.{ext}"));
            tokio::fs::write(&path, bytes)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            urls.push(path.to_string_lossy().to_string());
        }
        Ok(urls)
    }
}

#[async_trait]
impl ImageClient for NovelAiClient {
    fn name(&self) -> &str {
        "novelai"
    }

    async fn generate(&self, request: &ImageRequest) -> Result<ImageOutput, ImageError> {
        if self.token.is_empty() {
            return Err(ImageError::Transport(anyhow::anyhow!(
                "NovelAI token is required"
            )));
        }
        let payload = build_request_body(request);
        let response = self
            .http
            .post(&self.endpoint)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .header(
                ACCEPT,
                "application/x-zip-compressed, image/png, image/jpeg, image/webp",
            )
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("NovelAI request failed ({})", self.endpoint))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            return Err(ImageError::RateLimited(truncate_text(&body, 512)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ImageError::Http {
                status: status.as_u16(),
                body: truncate_text(&body, 512),
            });
        }
        let bytes = response
            .bytes()
            .await
            .context("NovelAI response body read failed")?;
        let images = extract_images(&bytes)?;
        if images.is_empty() {
            return Err(ImageError::EmptyResponse);
        }
        let image_urls = self.persist(images, request.seed).await?;
        Ok(ImageOutput { image_urls })
    }
}

fn build_request_body(request: &ImageRequest) -> Value {
    let model = official_model_id(&request.model);
    let is_v4 = model.contains("nai-diffusion-4");

    let mut parameters = Map::new();
    parameters.insert("width".to_string(), json!(request.width));
    parameters.insert("height".to_string(), json!(request.height));
    parameters.insert("scale".to_string(), json!(request.scale));
    parameters.insert("sampler".to_string(), json!(request.sampler));
    parameters.insert("steps".to_string(), json!(request.steps));
    parameters.insert("n_samples".to_string(), json!(1));
    parameters.insert("ucPreset".to_string(), json!(0));
    parameters.insert("seed".to_string(), json!(request.seed));
    parameters.insert("sm".to_string(), json!(false));
    parameters.insert("sm_dyn".to_string(), json!(false));
    parameters.insert("add_original_image".to_string(), json!(true));
    parameters.insert("legacy".to_string(), json!(false));

    if is_v4 {
        parameters.insert("params_version".to_string(), json!(3));
        parameters.insert("qualityToggle".to_string(), json!(true));
        parameters.insert("prefer_brownian".to_string(), json!(true));
        parameters.insert("autoSmea".to_string(), json!(false));
        parameters.insert("dynamic_thresholding".to_string(), json!(false));
        parameters.insert("controlnet_strength".to_string(), json!(1));
        parameters.insert("legacy_v3_extend".to_string(), json!(false));
        parameters.insert("deliberate_euler_ancestral_bug".to_string(), json!(false));
        parameters.insert("noise_schedule".to_string(), json!(request.noise_schedule));

        let char_captions: Vec<Value> = if request.character_prompts.is_empty() {
            vec![json!({"char_caption": "", "centers": [{"x": 0, "y": 0}]})]
        } else {
            request
                .character_prompts
                .iter()
                .map(|character| {
                    json!({
                        "char_caption": character.prompt,
                        "centers": character
                            .positions
                            .iter()
                            .map(|pos| json!({"x": pos.x, "y": pos.y}))
                            .collect::<Vec<Value>>(),
                    })
                })
                .collect()
        };
        parameters.insert(
            "v4_prompt".to_string(),
            json!({
                "caption": {"base_caption": request.prompt, "char_captions": char_captions},
                "use_coords": request.use_coords,
                "use_order": request.use_order,
            }),
        );
        parameters.insert(
            "v4_negative_prompt".to_string(),
            json!({
                "caption": {
                    "base_caption": request.negative_prompt,
                    "char_captions": [{"char_caption": "", "centers": [{"x": 0, "y": 0}]}],
                }
            }),
        );
    } else if !request.negative_prompt.is_empty() {
        parameters.insert(
            "negative_prompt".to_string(),
            json!(request.negative_prompt),
        );
    }

    json!({
        "action": "generate",
        "input": request.prompt,
        "model": model,
        "parameters": Value::Object(parameters),
    })
}

/// The API answers with a zip of images; some proxies return the image itself.
fn extract_images(bytes: &[u8]) -> anyhow::Result<Vec<(Vec<u8>, &'static str)>> {
    if let Ok(mut archive) = zip::ZipArchive::new(Cursor::new(bytes)) {
        let mut images = Vec::new();
        for idx in 0..archive.len() {
            let mut entry = archive
                .by_index(idx)
                .with_context(|| format!("NovelAI archive entry {idx} unreadable"))?;
            if entry.is_dir() {
                continue;
            }
            let mut data = Vec::new();
            entry
                .read_to_end(&mut data)
                .with_context(|| format!("NovelAI archive entry {idx} unreadable"))?;
            if let Some(ext) = sniff_image_extension(&data) {
                images.push((data, ext));
            }
        }
        return Ok(images);
    }
    Ok(sniff_image_extension(bytes)
        .map(|ext| vec![(bytes.to_vec(), ext)])
        .unwrap_or_default())
}

fn sniff_image_extension(data: &[u8]) -> Option<&'static str> {
    if data.starts_with(&[0x89, b'P', b'N', b'G']) {
        Some("png")
    } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("jpg")
    } else if data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        Some("webp")
    } else {
        None
    }
}
