//! Scene captioning: an ordered chain of text providers, first success wins.

mod chat_completions;
mod gemini;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backdrop_contracts::chat::{render_dialogue, ChatTurn};
use backdrop_contracts::settings::ProviderSettings;

use crate::error::TaskError;
use crate::state::TaskContext;

pub use chat_completions::{ChatCompletionsProvider, CloudRelayProvider};
pub use gemini::GeminiProvider;

pub const MAX_CAPTION_WORDS: usize = 20;

/// One text provider able to turn recent dialogue into a scene caption.
#[async_trait]
pub trait CaptionProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn try_caption(&self, history: &[ChatTurn]) -> anyhow::Result<String>;
}

/// Instruction for the primary providers: one short English sentence.
pub fn scene_instruction(history: &[ChatTurn]) -> String {
    format!(
        "Based on the dialogue below, describe the character's current facial expression, action and scene (time, place, visuals) in one coherent English sentence of no more than 15 words. Do not describe appearance or clothing. Output only the English sentence.\nDialogue:\n{}",
        render_dialogue(history)
    )
}

/// Instruction for the relay fallback, with a brace-delimited output contract.
pub fn relay_instruction(history: &[ChatTurn]) -> String {
    format!(
        "Based on the dialogue, describe the character's current expression, action, and setting (time, place, visuals) in one coherent sentence of no more than 20 words. Exclude appearance, clothing, and names. Use \"he/she\" to refer to the character. Output the sentence enclosed in curly braces: {{ }}. Dialogue:\n{}",
        render_dialogue(history)
    )
}

/// Normalizes raw provider output into a single-line caption.
pub fn sanitize_caption(raw: &str) -> String {
    let mut cleaned = raw.replace(['\r', '\n', '\t'], " ");
    cleaned = cleaned.split_whitespace().collect::<Vec<&str>>().join(" ");

    if let (Some(start), Some(end)) = (cleaned.find('{'), cleaned.rfind('}')) {
        if end > start {
            cleaned = cleaned[start + 1..end].to_string();
        }
    }
    cleaned = cleaned.replace(['{', '}'], " ");

    let lower = cleaned.trim().to_ascii_lowercase();
    for prefix in ["caption:", "scene:", "description:"] {
        if lower.starts_with(prefix) {
            cleaned = cleaned.trim()[prefix.len()..].to_string();
            break;
        }
    }

    cleaned = cleaned
        .trim()
        .trim_matches(|ch: char| matches!(ch, '"' | '\'' | '`'))
        .trim()
        .trim_end_matches(|ch: char| matches!(ch, '.' | ',' | ':' | ';' | '!'))
        .trim()
        .to_string();

    let words: Vec<&str> = cleaned.split_whitespace().collect();
    if words.len() > MAX_CAPTION_WORDS {
        return words[..MAX_CAPTION_WORDS]
            .join(" ")
            .trim_end_matches(|ch: char| matches!(ch, '.' | ',' | ':' | ';'))
            .to_string();
    }
    words.join(" ")
}

/// Ordered fallback chain. Each attempt is isolated: a failure is logged and
/// the next provider runs. An exhausted chain yields an empty caption.
#[derive(Clone, Default)]
pub struct CaptionChain {
    providers: Vec<Arc<dyn CaptionProvider>>,
    attempt_timeout: Option<Duration>,
}

impl CaptionChain {
    pub fn new(providers: Vec<Arc<dyn CaptionProvider>>) -> Self {
        Self {
            providers,
            attempt_timeout: None,
        }
    }

    /// Chain built from settings: OpenRouter and the OpenAI-compatible endpoint
    /// only when enabled and fully configured, then Gemini, then the relay.
    pub fn from_settings(settings: &ProviderSettings) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(settings.request_timeout_secs.max(1));
        let mut providers: Vec<Arc<dyn CaptionProvider>> = Vec::new();
        if settings.openrouter.is_usable() {
            providers.push(Arc::new(ChatCompletionsProvider::openrouter(
                &settings.openrouter,
                timeout,
            )?));
        }
        if settings.openai_compatible.is_usable() {
            providers.push(Arc::new(ChatCompletionsProvider::openai_compatible(
                &settings.openai_compatible,
                timeout,
            )?));
        }
        providers.push(Arc::new(GeminiProvider::new(&settings.gemini, timeout)?));
        providers.push(Arc::new(CloudRelayProvider::new(
            &settings.cloud_relay,
            timeout,
        )?));
        Ok(Self::new(providers))
    }

    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn names(&self) -> Vec<String> {
        self.providers
            .iter()
            .map(|provider| provider.name().to_string())
            .collect()
    }

    /// Runs the chain. Only cancellation is an error; provider failures are not.
    pub async fn caption(&self, ctx: &TaskContext, history: &[ChatTurn]) -> Result<String, TaskError> {
        for provider in &self.providers {
            ctx.checkpoint()?;
            match self.attempt(provider.as_ref(), history).await {
                Ok(caption) if !caption.is_empty() => {
                    tracing::info!(
                        character_id = ctx.character_id(),
                        provider = provider.name(),
                        caption = %caption,
                        "scene caption generated"
                    );
                    return Ok(caption);
                }
                Ok(_) => {
                    tracing::warn!(
                        character_id = ctx.character_id(),
                        provider = provider.name(),
                        "caption provider returned empty text"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        character_id = ctx.character_id(),
                        provider = provider.name(),
                        error = %format!("{err:#}"),
                        "caption provider failed; trying next"
                    );
                }
            }
        }
        tracing::warn!(
            character_id = ctx.character_id(),
            "every caption provider failed; continuing without scene caption"
        );
        Ok(String::new())
    }

    async fn attempt(&self, provider: &dyn CaptionProvider, history: &[ChatTurn]) -> anyhow::Result<String> {
        let raw = match self.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, provider.try_caption(history))
                .await
                .map_err(|_| anyhow::anyhow!("{} timed out after {:?}", provider.name(), limit))??,
            None => provider.try_caption(history).await?,
        };
        Ok(sanitize_caption(&raw))
    }
}
