use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use backdrop_contracts::chat::ChatTurn;
use backdrop_contracts::settings::{
    CloudRelaySettings, OpenAiCompatibleSettings, OpenRouterSettings,
};
use reqwest::header::AUTHORIZATION;
use reqwest::Client as HttpClient;
use serde_json::{json, Value};

use super::{relay_instruction, scene_instruction, CaptionProvider};
use crate::http::{build_client, response_json_or_error};

/// Any endpoint speaking the `/chat/completions` dialect (OpenRouter, OpenAI-compatible servers).
pub struct ChatCompletionsProvider {
    name: String,
    endpoint: String,
    api_key: String,
    model: String,
    extra_headers: Vec<(&'static str, String)>,
    http: HttpClient,
}

impl ChatCompletionsProvider {
    pub fn openrouter(settings: &OpenRouterSettings, timeout: Duration) -> Result<Self> {
        Ok(Self {
            name: "openrouter".to_string(),
            endpoint: completions_endpoint(&settings.base_url),
            api_key: settings.api_key.trim().to_string(),
            model: settings.model.trim().to_string(),
            extra_headers: vec![
                ("HTTP-Referer", "https://github.com".to_string()),
                ("X-Title", "Backdrop".to_string()),
            ],
            http: build_client(timeout)?,
        })
    }

    pub fn openai_compatible(settings: &OpenAiCompatibleSettings, timeout: Duration) -> Result<Self> {
        Ok(Self {
            name: "openai-compatible".to_string(),
            endpoint: completions_endpoint(&settings.endpoint),
            api_key: settings.api_key.trim().to_string(),
            model: settings.model.trim().to_string(),
            extra_headers: Vec::new(),
            http: build_client(timeout)?,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl CaptionProvider for ChatCompletionsProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_caption(&self, history: &[ChatTurn]) -> Result<String> {
        let payload = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": scene_instruction(history)}],
            "temperature": 0.7,
            "max_tokens": 1024,
        });
        let mut request = self
            .http
            .post(&self.endpoint)
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .json(&payload);
        for (header, value) in &self.extra_headers {
            request = request.header(*header, value);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("{} request failed ({})", self.name, self.endpoint))?;
        let body = response_json_or_error(&self.name, response).await?;
        extract_message_content(&body)
            .with_context(|| format!("{} response carried no message content", self.name))
    }
}

/// Last-resort relay: a hosted completions endpoint asked to wrap its answer in `{ }`.
pub struct CloudRelayProvider {
    endpoint: String,
    api_key: String,
    http: HttpClient,
}

impl CloudRelayProvider {
    pub fn new(settings: &CloudRelaySettings, timeout: Duration) -> Result<Self> {
        Ok(Self {
            endpoint: settings.endpoint.trim().to_string(),
            api_key: settings.api_key.trim().to_string(),
            http: build_client(timeout)?,
        })
    }
}

#[async_trait]
impl CaptionProvider for CloudRelayProvider {
    fn name(&self) -> &str {
        "cloud-relay"
    }

    async fn try_caption(&self, history: &[ChatTurn]) -> Result<String> {
        if self.endpoint.is_empty() {
            bail!("cloud relay endpoint is not configured");
        }
        let payload = json!({
            "messages": [{"role": "user", "content": relay_instruction(history)}],
            "max_tokens": 32,
            "temperature": 0.7,
        });
        let mut request = self.http.post(&self.endpoint).json(&payload);
        if !self.api_key.is_empty() {
            request = request.header(AUTHORIZATION, format!("Bearer {}", self.api_key));
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("cloud relay request failed ({})", self.endpoint))?;
        let body = response_json_or_error("cloud relay", response).await?;
        extract_message_content(&body).context("cloud relay response carried no message content")
    }
}

fn completions_endpoint(base: &str) -> String {
    let trimmed = base.trim().trim_end_matches('/');
    if trimmed.ends_with("/chat/completions") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/chat/completions")
    }
}

fn extract_message_content(body: &Value) -> Option<String> {
    let content = body
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))?;
    match content {
        Value::String(text) => Some(text.clone()),
        // Some servers return content parts instead of a plain string.
        Value::Array(parts) => {
            let text = parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<&str>>()
                .join("");
            Some(text)
        }
        _ => None,
    }
}
