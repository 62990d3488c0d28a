use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use backdrop_contracts::chat::ChatTurn;
use backdrop_contracts::settings::GeminiSettings;
use reqwest::Client as HttpClient;
use serde_json::{json, Value};

use super::{scene_instruction, CaptionProvider};
use crate::http::{build_client, response_json_or_error};

/// Default first-party adapter. Always part of the chain; without a key it
/// fails fast and the chain moves on to the relay.
pub struct GeminiProvider {
    api_base: String,
    api_key: String,
    model: String,
    http: HttpClient,
}

impl GeminiProvider {
    pub fn new(settings: &GeminiSettings, timeout: Duration) -> Result<Self> {
        Ok(Self {
            api_base: settings.base_url.trim().trim_end_matches('/').to_string(),
            api_key: settings.api_key.trim().to_string(),
            model: settings.model.trim().to_string(),
            http: build_client(timeout)?,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.api_base, self.model
        )
    }
}

#[async_trait]
impl CaptionProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn try_caption(&self, history: &[ChatTurn]) -> Result<String> {
        if self.api_key.is_empty() {
            bail!("GEMINI_API_KEY not set");
        }
        let endpoint = self.endpoint();
        let payload = json!({
            "contents": [{"role": "user", "parts": [{"text": scene_instruction(history)}]}],
            "generationConfig": {"temperature": 0.7, "maxOutputTokens": 256},
        });
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        let body = response_json_or_error("Gemini", response).await?;
        extract_candidate_text(&body).context("Gemini response carried no text candidate")
    }
}

fn extract_candidate_text(body: &Value) -> Option<String> {
    let parts = body
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)?;
    let text = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Vec<&str>>()
        .join("");
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}
