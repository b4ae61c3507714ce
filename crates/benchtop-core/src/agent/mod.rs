//! Conversational tool-call workflow against the hosted assistant service.
//!
//! The caller owns a `Conversation` and passes it into
//! `run_conversation_turn`, which streams the assistant's reply, resolves any
//! requested tool calls through the local registry, and appends the finished
//! turn. The assistant's instructions and retrieval pipeline live on the
//! hosted side; the conversation log here holds only user and assistant
//! turns.

pub mod backend;
pub mod client;
pub mod dispatcher;
pub mod tools;

pub use backend::{AssistantBackend, EventStream, RunEvent, ToolCallRequest};
pub use client::{AssistantClient, AssistantSpec};
pub use dispatcher::run_conversation_turn;
pub use tools::{
    assistant_tool_specs, execute_tool, MaterialRecord, ToolCall, ToolContext, ToolOutput,
};

use serde::{Deserialize, Serialize};

/// Message role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// A content block within a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

/// A message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: Vec<ContentBlock>,
}

/// A conversation bound to a remote thread.
///
/// Append-only: finished turns are never mutated. Streamed fragments
/// accumulate only inside the dispatcher until the turn is appended whole.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    /// Thread identifier on the assistant service.
    pub thread_id: String,
    pub title: String,
    pub messages: Vec<Message>,
    pub created_at: String,
    pub updated_at: String,
}

impl Conversation {
    pub fn new(thread_id: String) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            thread_id,
            title: "New conversation".to_string(),
            messages: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Derive the title from the first user message, capped at 50 chars.
    pub fn generate_title(&mut self) {
        let Some(first_user) = self.messages.iter().find(|m| m.role == MessageRole::User) else {
            return;
        };
        let text: String = first_user
            .content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();

        self.title = if text.chars().count() > 50 {
            let head: String = text.chars().take(47).collect();
            format!("{head}...")
        } else {
            text
        };
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().to_rfc3339();
    }

    pub fn add_user_message(&mut self, text: String) {
        self.messages.push(Message {
            role: MessageRole::User,
            content: vec![ContentBlock::Text { text }],
        });
        self.touch();
    }

    /// Append an assistant message with content blocks.
    pub fn add_assistant_message(&mut self, content: Vec<ContentBlock>) {
        self.messages.push(Message {
            role: MessageRole::Assistant,
            content,
        });
        self.touch();
    }

    /// Text of the most recent assistant message, concatenated across blocks.
    pub fn last_assistant_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Assistant)
            .map(|m| {
                m.content
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect()
            })
    }
}

/// Delta content for streaming blocks.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentDelta {
    Text { text: String },
}

/// Events surfaced to the caller while a turn is running.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A new block has started streaming.
    ContentBlockStart { block: ContentBlock },
    /// Delta content for the current block.
    ContentBlockDelta { delta: ContentDelta },
    /// Current block streaming is complete.
    ContentBlockStop,
    /// The turn is complete.
    Done,
    /// An error occurred.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_from_first_user_message() {
        let mut conversation = Conversation::new("thread-1".to_string());
        conversation.add_user_message(
            "What host materials pair well with deep-blue emitters in vacuum-deposited stacks?"
                .to_string(),
        );
        conversation.generate_title();

        assert_eq!(conversation.title.len(), 50);
        assert!(conversation.title.ends_with("..."));
    }

    #[test]
    fn title_truncation_respects_char_boundaries() {
        let mut conversation = Conversation::new("thread-1".to_string());
        conversation.add_user_message(
            "什么主体材料适合与深蓝色发光体在真空蒸镀器件堆叠中搭配使用？请给出依据和文献，以及每种组合报告过的最大外量子效率数值"
                .to_string(),
        );
        conversation.generate_title();

        assert_eq!(conversation.title.chars().count(), 50);
        assert!(conversation.title.ends_with("..."));
    }

    #[test]
    fn last_assistant_text_skips_tool_blocks() {
        let mut conversation = Conversation::new("thread-1".to_string());
        conversation.add_user_message("hi".to_string());
        conversation.add_assistant_message(vec![
            ContentBlock::ToolUse {
                id: "call_1".to_string(),
                name: "search_similar_materials".to_string(),
                arguments: serde_json::json!({}),
            },
            ContentBlock::ToolResult {
                tool_use_id: "call_1".to_string(),
                content: "{}".to_string(),
            },
            ContentBlock::Text {
                text: "answer".to_string(),
            },
        ]);

        assert_eq!(conversation.last_assistant_text().as_deref(), Some("answer"));
    }
}
