//! HTTP client for the hosted assistant service.
//!
//! Uses reqwest for streamed runs with tool calling via SSE. Events arrive as
//! `event:` / `data:` framed blocks; unknown event kinds are skipped so
//! additions on the service side do not break the stream.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::backend::{AssistantBackend, EventStream, RunEvent, ToolCallRequest};
use super::tools::ToolOutput;
use crate::error::{ensure_success, Error, Result};

/// Definition used to create a hosted assistant.
#[derive(Debug, Clone, Serialize)]
pub struct AssistantSpec {
    pub model: String,
    pub name: String,
    pub description: String,
    pub instructions: String,
    /// Tool declarations in the service's wire format; see
    /// `tools::assistant_tool_specs`.
    pub tools: Vec<serde_json::Value>,
}

/// Typed client over the assistant service endpoints.
pub struct AssistantClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    assistant_id: String,
}

impl AssistantClient {
    pub fn new(base_url: &str, api_key: &str, assistant_id: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            assistant_id: assistant_id.to_string(),
        }
    }

    /// Create a hosted assistant and return a client bound to it.
    pub async fn create_assistant(
        base_url: &str,
        api_key: &str,
        spec: &AssistantSpec,
    ) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{base_url}/assistants"))
            .bearer_auth(api_key)
            .json(spec)
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let text = response.text().await?;
        let body: CreatedObject = serde_json::from_str(&text)
            .map_err(|e| Error::malformed(format!("assistant creation payload: {e}")))?;
        debug!(assistant_id = %body.id, "Assistant created");

        Ok(Self {
            client,
            base_url,
            api_key: api_key.to_string(),
            assistant_id: body.id,
        })
    }

    pub fn assistant_id(&self) -> &str {
        &self.assistant_id
    }

    /// Create a thread for a new conversation.
    pub async fn create_thread(&self) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/threads", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({}))
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let text = response.text().await?;
        let body: CreatedObject = serde_json::from_str(&text)
            .map_err(|e| Error::malformed(format!("thread creation payload: {e}")))?;
        Ok(body.id)
    }

    /// Open an SSE response and relay its parsed events through a channel.
    async fn open_stream(&self, request: reqwest::RequestBuilder) -> Result<EventStream> {
        let response = request.send().await?;
        let response = ensure_success(response).await?;

        let (tx, rx) = mpsc::channel::<Result<RunEvent>>(32);
        let mut bytes = response.bytes_stream();

        tokio::spawn(async move {
            let mut buffer = String::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(Error::Transport(e))).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                for event in drain_events(&mut buffer) {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[async_trait]
impl AssistantBackend for AssistantClient {
    async fn create_message(&self, thread_id: &str, content: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/threads/{}/messages", self.base_url, thread_id))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "role": "user", "content": content }))
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn create_run(&self, thread_id: &str) -> Result<EventStream> {
        debug!(thread_id = %thread_id, "Opening streamed run");
        let request = self
            .client
            .post(format!("{}/threads/{}/runs", self.base_url, thread_id))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "assistant_id": self.assistant_id,
                "stream": true,
            }));
        self.open_stream(request).await
    }

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<EventStream> {
        debug!(run_id = %run_id, count = outputs.len(), "Submitting tool outputs");
        let request = self
            .client
            .post(format!(
                "{}/threads/{}/runs/{}/submit_tool_outputs",
                self.base_url, thread_id, run_id
            ))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "tool_outputs": outputs,
                "stream": true,
            }));
        self.open_stream(request).await
    }

    async fn last_message_text(&self, thread_id: &str) -> Result<String> {
        let response = self
            .client
            .get(format!("{}/threads/{}/messages", self.base_url, thread_id))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let text = response.text().await?;
        let body: MessageListResponse = serde_json::from_str(&text)
            .map_err(|e| Error::malformed(format!("message list payload: {e}")))?;

        // The service returns newest-first.
        let message = body
            .data
            .into_iter()
            .next()
            .ok_or_else(|| Error::malformed("thread contained no messages"))?;
        let value = message
            .content
            .into_iter()
            .filter_map(|c| c.text.map(|t| t.value))
            .collect::<Vec<_>>()
            .join("");
        Ok(value)
    }
}

/// Split complete SSE blocks out of the buffer and parse them.
///
/// Partial blocks stay in the buffer until the next chunk arrives.
fn drain_events(buffer: &mut String) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Some(end) = buffer.find("\n\n") {
        let block: String = buffer.drain(..end + 2).collect();
        if let Some(event) = parse_sse_block(block.trim_end()) {
            events.push(event);
        }
    }
    events
}

/// Parse one SSE block (`event:` + `data:` lines) into a typed run event.
///
/// Returns None for unknown event kinds and blocks without a usable payload.
fn parse_sse_block(block: &str) -> Option<RunEvent> {
    let mut kind: Option<&str> = None;
    let mut data = String::new();

    for line in block.lines() {
        if let Some(v) = line.strip_prefix("event:") {
            kind = Some(v.trim());
        } else if let Some(v) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(v.trim_start());
        }
    }

    match kind? {
        "thread.message.delta" => {
            let payload: MessageDeltaPayload = serde_json::from_str(&data).ok()?;
            Some(RunEvent::MessageDelta {
                text: payload.delta.content.text.value,
            })
        }
        "thread.run.requires_action" => {
            let payload: RequiresActionPayload = match serde_json::from_str(&data) {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "Unparseable requires_action payload");
                    return None;
                }
            };
            let tool_calls = payload
                .required_action
                .submit_tool_outputs
                .tool_calls
                .into_iter()
                .map(|tc| ToolCallRequest {
                    id: tc.id,
                    kind: tc.kind,
                    name: tc.function.as_ref().map(|f| f.name.clone()),
                    arguments: tc.function.map(|f| f.arguments),
                })
                .collect();
            Some(RunEvent::RequiresAction {
                run_id: payload.id,
                tool_calls,
            })
        }
        "thread.run.completed" => Some(RunEvent::Completed),
        "thread.run.failed" => {
            let reason = serde_json::from_str::<RunErrorPayload>(&data)
                .ok()
                .and_then(|p| p.last_error)
                .map(|e| e.message)
                .unwrap_or_else(|| "run failed".to_string());
            Some(RunEvent::Failed { reason })
        }
        "thread.run.cancelled" => Some(RunEvent::Cancelled),
        "thread.run.expired" => Some(RunEvent::Expired),
        _ => None,
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct CreatedObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaPayload {
    delta: DeltaBody,
}

#[derive(Debug, Deserialize)]
struct DeltaBody {
    content: DeltaContent,
}

#[derive(Debug, Deserialize)]
struct DeltaContent {
    text: DeltaText,
}

#[derive(Debug, Deserialize)]
struct DeltaText {
    value: String,
}

#[derive(Debug, Deserialize)]
struct RequiresActionPayload {
    id: String,
    required_action: RequiredAction,
}

#[derive(Debug, Deserialize)]
struct RequiredAction {
    submit_tool_outputs: SubmitToolOutputs,
}

#[derive(Debug, Deserialize)]
struct SubmitToolOutputs {
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    function: Option<WireFunction>,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct RunErrorPayload {
    #[serde(default)]
    last_error: Option<LastError>,
}

#[derive(Debug, Deserialize)]
struct LastError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct MessageListResponse {
    data: Vec<ListedMessage>,
}

#[derive(Debug, Deserialize)]
struct ListedMessage {
    content: Vec<ListedContent>,
}

#[derive(Debug, Deserialize)]
struct ListedContent {
    #[serde(default)]
    text: Option<DeltaText>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_message_delta() {
        let block = concat!(
            "event: thread.message.delta\n",
            r#"data: {"delta": {"content": {"text": {"value": "Hel"}}}}"#,
        );
        let event = parse_sse_block(block).unwrap();
        assert!(matches!(event, RunEvent::MessageDelta { ref text } if text == "Hel"));
    }

    #[test]
    fn parses_requires_action_with_two_calls() {
        let block = concat!(
            "event: thread.run.requires_action\n",
            "data: {\"id\": \"run_1\", \"required_action\": {\"submit_tool_outputs\": {\"tool_calls\": [",
            "{\"id\": \"call_1\", \"type\": \"function\", \"function\": {\"name\": \"search_similar_materials\", \"arguments\": \"{}\"}},",
            "{\"id\": \"call_2\", \"type\": \"rag\"}",
            "]}}}",
        );
        let event = parse_sse_block(block).unwrap();
        match event {
            RunEvent::RequiresAction { run_id, tool_calls } => {
                assert_eq!(run_id, "run_1");
                assert_eq!(tool_calls.len(), 2);
                assert_eq!(
                    tool_calls[0].name.as_deref(),
                    Some("search_similar_materials")
                );
                assert_eq!(tool_calls[1].kind, "rag");
                assert!(tool_calls[1].name.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_kinds_are_skipped() {
        let block = "event: thread.run.step.created\ndata: {}";
        assert!(parse_sse_block(block).is_none());
    }

    #[test]
    fn terminal_events_map_to_variants() {
        assert!(matches!(
            parse_sse_block("event: thread.run.completed\ndata: {}"),
            Some(RunEvent::Completed)
        ));
        assert!(matches!(
            parse_sse_block("event: thread.run.cancelled\ndata: {}"),
            Some(RunEvent::Cancelled)
        ));
        assert!(matches!(
            parse_sse_block("event: thread.run.expired\ndata: {}"),
            Some(RunEvent::Expired)
        ));

        let failed = parse_sse_block(concat!(
            "event: thread.run.failed\n",
            r#"data: {"last_error": {"message": "rate limited"}}"#,
        ));
        assert!(matches!(
            failed,
            Some(RunEvent::Failed { ref reason }) if reason == "rate limited"
        ));
    }

    #[test]
    fn drain_handles_blocks_split_across_chunks() {
        let mut buffer = String::new();

        buffer.push_str("event: thread.message.delta\ndata: {\"delta\": {\"content\": ");
        assert!(drain_events(&mut buffer).is_empty());

        buffer.push_str("{\"text\": {\"value\": \"lo\"}}}}\n\nevent: thread.run.completed\ndata: {}\n\n");
        let events = drain_events(&mut buffer);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], RunEvent::MessageDelta { ref text } if text == "lo"));
        assert!(matches!(events[1], RunEvent::Completed));
        assert!(buffer.is_empty());
    }
}
