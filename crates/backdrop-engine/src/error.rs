use thiserror::Error;

pub const TASK_ABORTED: &str = "Task aborted";

/// Why a trigger was declined before any work started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SkipReason {
    #[error("Missing character or background image")]
    MissingBackground,
    #[error("Auto background generation disabled")]
    AutoBackgroundDisabled,
    #[error("Not using NovelAI for background generation")]
    UnsupportedBackend,
    #[error("Message already processed")]
    AlreadyProcessed,
    #[error("Generation already in progress")]
    InProgress,
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image provider rate limited (429): {0}")]
    RateLimited(String),
    #[error("image provider request failed ({status}): {body}")]
    Http { status: u16, body: String },
    #[error("image provider returned no image")]
    EmptyResponse,
    #[error("image attempt timed out")]
    TimedOut,
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl ImageError {
    /// Rate limits are the only failures worth a delayed retry.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            Self::RateLimited(_) => true,
            Self::Http { status, .. } => *status == 429,
            Self::EmptyResponse | Self::TimedOut => false,
            Self::Transport(err) => message_signals_rate_limit(&format!("{err:#}")),
        }
    }
}

pub(crate) fn message_signals_rate_limit(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests")
}

/// A started task that ended without committing an image.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{}", TASK_ABORTED)]
    Aborted,
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error("failed to commit background: {0:#}")]
    Commit(anyhow::Error),
}
