pub mod caption;
pub mod error;
pub mod history;
mod http;
pub mod image;
pub mod ledger;
pub mod orchestrator;
pub mod state;
pub mod tags;

use std::time::Duration;

pub use caption::{CaptionChain, CaptionProvider};
pub use error::{ImageError, SkipReason, TaskError, TASK_ABORTED};
pub use history::{ChatHistory, TranscriptHistory};
pub use image::{ImageClient, ImageOutput, ImageRequest, NovelAiClient, RetryPolicy, RetryingImageInvoker};
pub use ledger::ProcessedLedger;
pub use orchestrator::{BackgroundCommit, BackgroundOrchestrator, GenerationTaskResult};
pub use state::{GenerationState, TaskContext, TaskId, TaskStateStore};

/// Engine-wide knobs that are not provider credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// How many recent chat turns feed the captioner.
    pub history_window: usize,
    pub retry: RetryPolicy,
    /// Upper bound for a single caption or image attempt. `None` waits as long
    /// as the HTTP client does.
    pub call_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_window: 10,
            retry: RetryPolicy::default(),
            call_timeout: None,
        }
    }
}
