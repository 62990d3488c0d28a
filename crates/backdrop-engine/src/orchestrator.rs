use std::sync::Arc;

use async_trait::async_trait;
use backdrop_contracts::character::{Character, ImageBackend};
use backdrop_contracts::chat::{ChatMessage, ChatTurn};
use backdrop_contracts::events::{EventKind, EventPayload, EventWriter};
use backdrop_contracts::store::KeyValueStore;
use serde::Serialize;
use serde_json::{json, Value};

use crate::caption::CaptionChain;
use crate::error::{SkipReason, TaskError};
use crate::history::ChatHistory;
use crate::image::{ImageClient, RetryingImageInvoker};
use crate::ledger::ProcessedLedger;
use crate::state::{GenerationState, TaskContext, TaskStateStore};
use crate::tags::build_image_request;
use crate::EngineConfig;

/// Outcome of one trigger. Returned to the caller, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationTaskResult {
    pub success: bool,
    pub image_url: Option<String>,
    pub error: Option<String>,
}

impl GenerationTaskResult {
    pub fn succeeded(image_url: impl Into<String>) -> Self {
        Self {
            success: true,
            image_url: Some(image_url.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            image_url: None,
            error: Some(error.into()),
        }
    }
}

/// Receives the generated image for a character. Called at most once per
/// successful task.
#[async_trait]
pub trait BackgroundCommit: Send + Sync {
    async fn commit(&self, character_id: &str, image_url: &str) -> anyhow::Result<()>;
}

/// Sequences precondition checks, captioning, image generation and commit for
/// one character at a time. Owns both per-character registries.
pub struct BackgroundOrchestrator {
    states: TaskStateStore,
    ledger: ProcessedLedger,
    history: Arc<dyn ChatHistory>,
    captioner: CaptionChain,
    images: RetryingImageInvoker,
    config: EngineConfig,
    events: Option<EventWriter>,
}

impl BackgroundOrchestrator {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        history: Arc<dyn ChatHistory>,
        captioner: CaptionChain,
        image_client: Arc<dyn ImageClient>,
        config: EngineConfig,
    ) -> Self {
        Self {
            states: TaskStateStore::new(),
            ledger: ProcessedLedger::new(store),
            history,
            captioner: captioner.with_attempt_timeout(config.call_timeout),
            images: RetryingImageInvoker::new(image_client, config.retry)
                .with_attempt_timeout(config.call_timeout),
            config,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &ProcessedLedger {
        &self.ledger
    }

    pub fn current_state(&self, character_id: &str) -> GenerationState {
        self.states.current_state(character_id)
    }

    pub fn abort_current_task(&self, character_id: &str) -> bool {
        self.states.abort_current_task(character_id)
    }

    pub fn reset(&self, character_id: &str) {
        self.states.reset(character_id);
    }

    /// Forgets every processed message for the character and persists the
    /// empty set. Returns false when persisting failed.
    pub async fn clear_processed(&self, character_id: &str) -> bool {
        self.ledger.clear(character_id).await
    }

    /// Runs one generation for the character after a chat turn. Every outcome,
    /// including skips and cancellation, is reported through the result.
    pub async fn trigger(
        &self,
        character: &Character,
        messages: &[ChatMessage],
        commit: &dyn BackgroundCommit,
    ) -> GenerationTaskResult {
        let character_id = character.id.as_str();
        let latest = messages.last().map(|message| message.id.as_str());

        if let Err(reason) = self.check_preconditions(character, latest).await {
            return self.skipped(character_id, latest, reason);
        }
        let ctx = match self.states.try_begin(character_id) {
            Ok(ctx) => ctx,
            Err(reason) => return self.skipped(character_id, latest, reason),
        };
        if let Some(message_id) = latest {
            if self.ledger.has(character_id, message_id) {
                self.states.release(&ctx);
                return self.skipped(character_id, latest, SkipReason::AlreadyProcessed);
            }
        }

        tracing::info!(
            character_id,
            task_id = %ctx.task_id(),
            message_id = latest.unwrap_or(""),
            "background generation started"
        );
        self.emit(
            EventKind::GenerationStarted,
            character_id,
            json!({
                "task_id": ctx.task_id().to_string(),
                "message_id": latest,
            }),
        );

        match self.run(&ctx, character, commit).await {
            Ok(image_url) => {
                // Keep the claim until the turn is recorded; a trigger that
                // arrives mid-commit must see InProgress or the ledger entry.
                if let Some(message_id) = latest {
                    self.ledger.add(character_id, message_id);
                }
                self.states.finish_success(&ctx, &image_url);
                if latest.is_some() {
                    self.ledger.save(character_id).await;
                }
                tracing::info!(
                    character_id,
                    task_id = %ctx.task_id(),
                    image_url = %image_url,
                    "background generation committed"
                );
                self.emit(
                    EventKind::GenerationSucceeded,
                    character_id,
                    json!({
                        "task_id": ctx.task_id().to_string(),
                        "message_id": latest,
                        "image_url": image_url,
                    }),
                );
                GenerationTaskResult::succeeded(image_url)
            }
            Err(err) => {
                let message = err.to_string();
                self.states.finish_failure(&ctx, &message);
                match &err {
                    TaskError::Aborted => tracing::info!(
                        character_id,
                        task_id = %ctx.task_id(),
                        "background generation aborted"
                    ),
                    _ => tracing::warn!(
                        character_id,
                        task_id = %ctx.task_id(),
                        error = %message,
                        "background generation failed"
                    ),
                }
                self.emit(
                    EventKind::GenerationFailed,
                    character_id,
                    json!({
                        "task_id": ctx.task_id().to_string(),
                        "message_id": latest,
                        "error": message,
                        "aborted": matches!(err, TaskError::Aborted),
                    }),
                );
                GenerationTaskResult::failed(message)
            }
        }
    }

    async fn check_preconditions(
        &self,
        character: &Character,
        latest: Option<&str>,
    ) -> Result<(), SkipReason> {
        if !character.has_background_image() {
            return Err(SkipReason::MissingBackground);
        }
        if !character.enable_auto_extra_background {
            return Err(SkipReason::AutoBackgroundDisabled);
        }
        if !character.uses_backend(ImageBackend::NovelAi) {
            return Err(SkipReason::UnsupportedBackend);
        }
        if let Some(message_id) = latest {
            self.ledger.ensure_loaded(&character.id).await;
            if self.ledger.has(&character.id, message_id) {
                return Err(SkipReason::AlreadyProcessed);
            }
        }
        Ok(())
    }

    async fn run(
        &self,
        ctx: &TaskContext,
        character: &Character,
        commit: &dyn BackgroundCommit,
    ) -> Result<String, TaskError> {
        ctx.checkpoint()?;
        let turns = self.recent_turns(&character.id).await;
        let caption = self.captioner.caption(ctx, &turns).await?;
        ctx.checkpoint()?;
        self.emit(
            EventKind::CaptionResolved,
            &character.id,
            json!({
                "task_id": ctx.task_id().to_string(),
                "caption": caption,
            }),
        );

        let request = build_image_request(character, &caption);
        let image_url = self.images.invoke(ctx, &request).await?;
        // A result that lands after an abort is discarded.
        ctx.checkpoint()?;

        commit
            .commit(&character.id, &image_url)
            .await
            .map_err(TaskError::Commit)?;
        Ok(image_url)
    }

    async fn recent_turns(&self, character_id: &str) -> Vec<ChatTurn> {
        match self
            .history
            .recent_turns(character_id, self.config.history_window)
            .await
        {
            Ok(turns) => turns,
            Err(err) => {
                tracing::warn!(
                    character_id,
                    error = %format!("{err:#}"),
                    "chat history unavailable; captioning without context"
                );
                Vec::new()
            }
        }
    }

    fn skipped(
        &self,
        character_id: &str,
        message_id: Option<&str>,
        reason: SkipReason,
    ) -> GenerationTaskResult {
        tracing::debug!(character_id, reason = %reason, "background generation skipped");
        self.emit(
            EventKind::GenerationSkipped,
            character_id,
            json!({
                "message_id": message_id,
                "reason": reason.to_string(),
            }),
        );
        GenerationTaskResult::failed(reason.to_string())
    }

    fn emit(&self, kind: EventKind, character_id: &str, details: Value) {
        let Some(events) = &self.events else {
            return;
        };
        if let Err(err) = events.record(kind, character_id, map_object(details)) {
            tracing::warn!(
                event = kind.as_str(),
                error = %format!("{err:#}"),
                "failed to record event"
            );
        }
    }
}

fn map_object(value: Value) -> EventPayload {
    match value {
        Value::Object(map) => map,
        _ => EventPayload::new(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::GenerationTaskResult;

    #[test]
    fn result_serializes_for_callers() -> anyhow::Result<()> {
        let value = serde_json::to_value(GenerationTaskResult::succeeded("https://img/1.png"))?;
        assert_eq!(
            value,
            json!({"success": true, "image_url": "https://img/1.png", "error": null})
        );
        let failed = GenerationTaskResult::failed("Task aborted");
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("Task aborted"));
        Ok(())
    }
}
