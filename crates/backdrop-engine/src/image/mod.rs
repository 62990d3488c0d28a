//! Image generation: the client seam and the rate-limit aware retry loop.

mod novelai;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{ImageError, TaskError};
use crate::state::TaskContext;

pub use novelai::{official_model_id, NovelAiClient};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PromptPosition {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CharacterPrompt {
    pub prompt: String,
    pub positions: Vec<PromptPosition>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub model: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub scale: f32,
    pub sampler: String,
    pub seed: u64,
    pub noise_schedule: String,
    pub character_prompts: Vec<CharacterPrompt>,
    pub use_coords: bool,
    pub use_order: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageOutput {
    pub image_urls: Vec<String>,
}

impl ImageOutput {
    pub fn first_url(&self) -> Option<&str> {
        self.image_urls
            .iter()
            .map(String::as_str)
            .find(|url| !url.trim().is_empty())
    }
}

#[async_trait]
pub trait ImageClient: Send + Sync {
    fn name(&self) -> &str;
    async fn generate(&self, request: &ImageRequest) -> Result<ImageOutput, ImageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts allowed after a rate-limited one.
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            delay: Duration::from_secs(8),
        }
    }
}

/// Calls the image client, retrying only rate-limited attempts and only up to
/// `RetryPolicy::max_retries` times.
#[derive(Clone)]
pub struct RetryingImageInvoker {
    client: Arc<dyn ImageClient>,
    policy: RetryPolicy,
    attempt_timeout: Option<Duration>,
}

impl RetryingImageInvoker {
    pub fn new(client: Arc<dyn ImageClient>, policy: RetryPolicy) -> Self {
        Self {
            client,
            policy,
            attempt_timeout: None,
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn invoke(&self, ctx: &TaskContext, request: &ImageRequest) -> Result<String, TaskError> {
        let mut retries_used = 0;
        loop {
            ctx.checkpoint()?;
            let err = match self.attempt(request).await {
                Ok(output) => match output.first_url() {
                    Some(url) => return Ok(url.to_string()),
                    None => ImageError::EmptyResponse,
                },
                Err(err) => err,
            };

            if !err.is_rate_limited() || retries_used >= self.policy.max_retries {
                tracing::warn!(
                    character_id = ctx.character_id(),
                    task_id = %ctx.task_id(),
                    client = self.client.name(),
                    retries_used,
                    error = %err,
                    "image generation failed"
                );
                return Err(TaskError::Image(err));
            }

            retries_used += 1;
            tracing::warn!(
                character_id = ctx.character_id(),
                task_id = %ctx.task_id(),
                delay_s = self.policy.delay.as_secs_f64(),
                "image provider rate limited; retry {}/{}",
                retries_used,
                self.policy.max_retries
            );
            tokio::select! {
                _ = tokio::time::sleep(self.policy.delay) => {}
                _ = ctx.cancelled() => {}
            }
        }
    }

    async fn attempt(&self, request: &ImageRequest) -> Result<ImageOutput, ImageError> {
        match self.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, self.client.generate(request))
                .await
                .unwrap_or(Err(ImageError::TimedOut)),
            None => self.client.generate(request).await,
        }
    }
}
