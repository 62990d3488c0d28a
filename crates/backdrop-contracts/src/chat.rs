use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// A stored chat message as the host app hands it to the generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: String,
    pub content: String,
}

/// One dialogue turn as exported from chat history, without storage identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

impl From<&ChatMessage> for ChatTurn {
    fn from(message: &ChatMessage) -> Self {
        Self::new(message.role.clone(), message.content.clone())
    }
}

/// Reads a JSON array of messages, e.g. a conversation export.
pub fn load_messages(path: &Path) -> anyhow::Result<Vec<ChatMessage>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read chat history {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("invalid chat history JSON in {}", path.display()))
}

/// Renders turns as `role: content` lines, oldest first.
pub fn render_dialogue(turns: &[ChatTurn]) -> String {
    turns
        .iter()
        .map(|turn| format!("{}: {}", turn.role, turn.content))
        .collect::<Vec<String>>()
        .join("\n")
}
