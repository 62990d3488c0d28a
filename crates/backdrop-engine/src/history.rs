use async_trait::async_trait;
use backdrop_contracts::chat::{ChatMessage, ChatTurn};

/// Read access to a character's stored conversation.
#[async_trait]
pub trait ChatHistory: Send + Sync {
    /// The last `limit` turns, oldest first.
    async fn recent_turns(&self, character_id: &str, limit: usize) -> anyhow::Result<Vec<ChatTurn>>;
}

/// History backed by an in-memory transcript, regardless of character id.
#[derive(Debug, Clone, Default)]
pub struct TranscriptHistory {
    turns: Vec<ChatTurn>,
}

impl TranscriptHistory {
    pub fn new(turns: Vec<ChatTurn>) -> Self {
        Self { turns }
    }

    pub fn from_messages(messages: &[ChatMessage]) -> Self {
        Self::new(messages.iter().map(ChatTurn::from).collect())
    }
}

#[async_trait]
impl ChatHistory for TranscriptHistory {
    async fn recent_turns(&self, _character_id: &str, limit: usize) -> anyhow::Result<Vec<ChatTurn>> {
        let start = self.turns.len().saturating_sub(limit);
        Ok(self.turns[start..].to_vec())
    }
}
