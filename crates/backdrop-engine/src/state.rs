use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::{SkipReason, TaskError};

/// Identifier of one generation attempt. Ids only ever grow within a store,
/// so a stale attempt can always be told apart from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TaskId(u64);

impl TaskId {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Status of the current (or last) attempt for one character. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GenerationState {
    pub is_generating: bool,
    pub task_id: Option<TaskId>,
    pub error: Option<String>,
    pub image: Option<String>,
    pub aborted: bool,
}

#[derive(Debug, Default)]
struct TaskSlot {
    state: GenerationState,
    cancel: Option<CancellationToken>,
    /// State before the running claim, restored if the claim is released.
    previous: Option<GenerationState>,
}

/// Handle given to a running task. Every stage polls it at its checkpoints.
#[derive(Debug, Clone)]
pub struct TaskContext {
    character_id: String,
    task_id: TaskId,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn character_id(&self) -> &str {
        &self.character_id
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn checkpoint(&self) -> Result<(), TaskError> {
        if self.is_cancelled() {
            return Err(TaskError::Aborted);
        }
        Ok(())
    }

    /// Resolves once the task has been aborted.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    #[cfg(test)]
    pub(crate) fn detached(character_id: &str) -> Self {
        Self {
            character_id: character_id.to_string(),
            task_id: TaskId(0),
            cancel: CancellationToken::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn abort(&self) {
        self.cancel.cancel();
    }
}

/// Per-character generation status, partitioned strictly by character id.
#[derive(Debug, Default)]
pub struct TaskStateStore {
    slots: Mutex<HashMap<String, TaskSlot>>,
    next_task: AtomicU64,
}

impl TaskStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_state(&self, character_id: &str) -> GenerationState {
        self.slots()
            .get(character_id)
            .map(|slot| slot.state.clone())
            .unwrap_or_default()
    }

    /// Flags the running task as aborted. Returns false when nothing was running.
    pub fn abort_current_task(&self, character_id: &str) -> bool {
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(character_id) else {
            return false;
        };
        if !slot.state.is_generating || slot.state.task_id.is_none() {
            return false;
        }
        slot.state.aborted = true;
        if let Some(token) = &slot.cancel {
            token.cancel();
        }
        tracing::info!(
            character_id,
            task_id = ?slot.state.task_id,
            "current background task marked as aborted"
        );
        true
    }

    pub fn reset(&self, character_id: &str) {
        self.slots()
            .insert(character_id.to_string(), TaskSlot::default());
    }

    /// Claims the character for a new task unless one is already running.
    ///
    /// The check and the claim happen under one lock, so two racing triggers
    /// for the same character cannot both start.
    pub fn try_begin(&self, character_id: &str) -> Result<TaskContext, SkipReason> {
        let mut slots = self.slots();
        let slot = slots.entry(character_id.to_string()).or_default();
        if slot.state.is_generating {
            return Err(SkipReason::InProgress);
        }
        let task_id = TaskId(self.next_task.fetch_add(1, Ordering::SeqCst) + 1);
        let cancel = CancellationToken::new();
        let previous = std::mem::take(&mut slot.state);
        slot.state = GenerationState {
            is_generating: true,
            task_id: Some(task_id),
            error: None,
            image: previous.image.clone(),
            aborted: false,
        };
        slot.cancel = Some(cancel.clone());
        slot.previous = Some(previous);
        Ok(TaskContext {
            character_id: character_id.to_string(),
            task_id,
            cancel,
        })
    }

    pub fn finish_success(&self, ctx: &TaskContext, image_url: &str) {
        self.finish(ctx, |state| {
            state.image = Some(image_url.to_string());
            state.error = None;
        });
    }

    pub fn finish_failure(&self, ctx: &TaskContext, error: &str) {
        self.finish(ctx, |state| {
            state.error = Some(error.to_string());
        });
    }

    /// Drops a claim that never got past its own re-check, restoring the
    /// state seen before the claim.
    pub(crate) fn release(&self, ctx: &TaskContext) {
        let mut slots = self.slots();
        let Some(slot) = Self::owned_slot(&mut slots, ctx) else {
            return;
        };
        slot.state = slot.previous.take().unwrap_or_default();
        slot.cancel = None;
    }

    fn finish(&self, ctx: &TaskContext, update: impl FnOnce(&mut GenerationState)) {
        let mut slots = self.slots();
        let Some(slot) = Self::owned_slot(&mut slots, ctx) else {
            return;
        };
        slot.state.is_generating = false;
        slot.cancel = None;
        slot.previous = None;
        update(&mut slot.state);
    }

    /// The character's slot, if `ctx` is still its current task.
    fn owned_slot<'a>(
        slots: &'a mut HashMap<String, TaskSlot>,
        ctx: &TaskContext,
    ) -> Option<&'a mut TaskSlot> {
        let slot = slots.get_mut(&ctx.character_id)?;
        if slot.state.task_id != Some(ctx.task_id) {
            tracing::debug!(
                character_id = %ctx.character_id,
                task_id = %ctx.task_id,
                "stale task finished; current state left untouched"
            );
            return None;
        }
        Some(slot)
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, TaskSlot>> {
        // The map holds plain data, so a poisoned guard is still consistent.
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
