//! Trait seam over the assistant service.
//!
//! `AssistantClient` is the HTTP implementation; tests script the event
//! streams directly.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use super::tools::ToolOutput;
use crate::error::Result;

/// A tool call requested by a `RequiresAction` event, normalized from the
/// wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    /// Tool kind reported by the service ("function" for local dispatch;
    /// other kinds are acknowledged with a placeholder output).
    pub kind: String,
    pub name: Option<String>,
    /// Raw JSON argument string as sent by the service.
    pub arguments: Option<String>,
}

/// Typed events from a streamed assistant run.
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// Text fragment for the in-progress assistant message.
    MessageDelta { text: String },
    /// The run is paused until every requested tool call is answered.
    RequiresAction {
        run_id: String,
        tool_calls: Vec<ToolCallRequest>,
    },
    /// The run finished normally.
    Completed,
    /// Terminal failure reported by the service.
    Failed { reason: String },
    /// The service cancelled the run.
    Cancelled,
    /// The run expired before completing.
    Expired,
}

/// Stream of run events as produced by a backend.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<RunEvent>> + Send>>;

/// Unified interface to the hosted assistant service.
#[async_trait]
pub trait AssistantBackend: Send + Sync {
    /// Append a user message to a thread.
    async fn create_message(&self, thread_id: &str, content: &str) -> Result<()>;

    /// Open a streamed run for a thread.
    async fn create_run(&self, thread_id: &str) -> Result<EventStream>;

    /// Submit tool outputs for a paused run and resume its stream.
    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<EventStream>;

    /// Text of the most recent message in a thread.
    async fn last_message_text(&self, thread_id: &str) -> Result<String>;
}
