//! Turn dispatcher for streamed assistant runs.
//!
//! One call drives one full conversation turn: open the run stream, relay
//! text deltas, resolve tool pauses by submitting outputs (which replaces
//! the stream), and append the finished assistant message. Partial
//! transcripts are preserved on failure and cancellation.

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backend::{AssistantBackend, RunEvent, ToolCallRequest};
use super::tools::{execute_tool, ToolCall, ToolContext, ToolOutput};
use super::{AgentEvent, ContentBlock, ContentDelta, Conversation};
use crate::error::{Error, Result};

/// Maximum number of tool-resolution rounds in one turn.
const MAX_TOOL_ROUNDS: usize = 10;

/// Run one conversation turn against the assistant service.
///
/// The user message is appended to the thread and a streamed run is opened.
/// `RequiresAction` pauses are resolved through the local tool registry; the
/// resumed stream replaces the paused one. On success the assistant message
/// (tool blocks first, text last) is appended to the conversation.
pub async fn run_conversation_turn(
    backend: &dyn AssistantBackend,
    conversation: &mut Conversation,
    user_message: String,
    tool_ctx: &ToolContext,
    event_tx: mpsc::Sender<AgentEvent>,
    cancel_token: CancellationToken,
) -> Result<()> {
    info!(
        conversation_id = %conversation.id,
        thread_id = %conversation.thread_id,
        message_len = user_message.len(),
        "Starting conversation turn"
    );
    conversation.add_user_message(user_message.clone());
    backend
        .create_message(&conversation.thread_id, &user_message)
        .await?;

    let mut stream = backend.create_run(&conversation.thread_id).await?;

    let mut text_started = false;
    let mut text_content = String::new();
    let mut tool_blocks: Vec<ContentBlock> = Vec::new();
    let mut tool_rounds = 0usize;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                info!(conversation_id = %conversation.id, "Turn cancelled");
                finish_turn(conversation, tool_blocks, text_content, text_started, &event_tx).await;
                return Err(Error::Cancelled);
            }
            next = stream.next() => next,
        };

        // Stream end without a terminal event counts as completion; the
        // service is allowed to just close the connection.
        let Some(event) = next else {
            debug!("Run stream ended");
            break;
        };

        let event = match event {
            Ok(event) => event,
            Err(e) => {
                warn!(conversation_id = %conversation.id, error = %e, "Run stream broke");
                finish_turn(conversation, tool_blocks, text_content, text_started, &event_tx).await;
                let _ = event_tx
                    .send(AgentEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return Err(e);
            }
        };

        match event {
            RunEvent::MessageDelta { text } => {
                if text.is_empty() {
                    continue;
                }
                if !text_started {
                    let _ = event_tx
                        .send(AgentEvent::ContentBlockStart {
                            block: ContentBlock::Text {
                                text: String::new(),
                            },
                        })
                        .await;
                    text_started = true;
                }
                let _ = event_tx
                    .send(AgentEvent::ContentBlockDelta {
                        delta: ContentDelta::Text { text: text.clone() },
                    })
                    .await;
                text_content.push_str(&text);
            }
            RunEvent::RequiresAction { run_id, tool_calls } => {
                tool_rounds += 1;
                if tool_rounds > MAX_TOOL_ROUNDS {
                    warn!(
                        conversation_id = %conversation.id,
                        max_rounds = MAX_TOOL_ROUNDS,
                        "Turn reached maximum tool rounds"
                    );
                    finish_turn(conversation, tool_blocks, text_content, text_started, &event_tx)
                        .await;
                    let _ = event_tx
                        .send(AgentEvent::Error {
                            message: "Maximum tool rounds reached".to_string(),
                        })
                        .await;
                    return Ok(());
                }

                info!(
                    run_id = %run_id,
                    tool_count = tool_calls.len(),
                    round = tool_rounds,
                    "Run paused for tool calls"
                );
                let outputs =
                    resolve_tool_calls(&tool_calls, tool_ctx, &mut tool_blocks, &event_tx).await;

                // Submitting outputs replaces the paused stream.
                stream = backend
                    .submit_tool_outputs(&conversation.thread_id, &run_id, &outputs)
                    .await?;
            }
            RunEvent::Completed => {
                debug!("Run completed");
                break;
            }
            RunEvent::Failed { reason } => {
                warn!(conversation_id = %conversation.id, reason = %reason, "Run failed");
                finish_turn(conversation, tool_blocks, text_content, text_started, &event_tx).await;
                let _ = event_tx
                    .send(AgentEvent::Error {
                        message: reason.clone(),
                    })
                    .await;
                return Err(Error::RunFailed { reason });
            }
            RunEvent::Cancelled => {
                info!(conversation_id = %conversation.id, "Run cancelled by the service");
                finish_turn(conversation, tool_blocks, text_content, text_started, &event_tx).await;
                return Err(Error::Cancelled);
            }
            RunEvent::Expired => {
                warn!(conversation_id = %conversation.id, "Run expired");
                finish_turn(conversation, tool_blocks, text_content, text_started, &event_tx).await;
                let reason = "run expired".to_string();
                let _ = event_tx
                    .send(AgentEvent::Error {
                        message: reason.clone(),
                    })
                    .await;
                return Err(Error::RunFailed { reason });
            }
        }
    }

    // Some runs complete without streaming any text. Fall back to the
    // thread's message list so the turn still has content.
    if text_content.is_empty() {
        debug!("No streamed text, fetching final message");
        match backend.last_message_text(&conversation.thread_id).await {
            Ok(text) if !text.is_empty() => {
                let _ = event_tx
                    .send(AgentEvent::ContentBlockStart {
                        block: ContentBlock::Text {
                            text: String::new(),
                        },
                    })
                    .await;
                let _ = event_tx
                    .send(AgentEvent::ContentBlockDelta {
                        delta: ContentDelta::Text { text: text.clone() },
                    })
                    .await;
                text_started = true;
                text_content = text;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Could not fetch final message, keeping streamed content");
            }
        }
    }

    info!(
        conversation_id = %conversation.id,
        tool_rounds,
        reply_len = text_content.len(),
        "Conversation turn completed"
    );
    finish_turn(conversation, tool_blocks, text_content, text_started, &event_tx).await;
    let _ = event_tx.send(AgentEvent::Done).await;
    Ok(())
}

/// Execute every requested tool call and collect outputs for submission.
///
/// All calls in a pause are resolved before anything is submitted; the
/// service rejects partial submissions.
async fn resolve_tool_calls(
    requests: &[ToolCallRequest],
    tool_ctx: &ToolContext,
    tool_blocks: &mut Vec<ContentBlock>,
    event_tx: &mpsc::Sender<AgentEvent>,
) -> Vec<ToolOutput> {
    let mut outputs = Vec::with_capacity(requests.len());
    for request in requests {
        let call = ToolCall::from_request(request);
        info!(tool_name = %call.name, tool_id = %call.id, "Executing tool");
        debug!(arguments = %call.arguments, "Tool arguments");

        let tool_use_block = ContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        };
        let _ = event_tx
            .send(AgentEvent::ContentBlockStart {
                block: tool_use_block.clone(),
            })
            .await;
        let _ = event_tx.send(AgentEvent::ContentBlockStop).await;
        tool_blocks.push(tool_use_block);

        let output = execute_tool(&call, tool_ctx);
        debug!(
            tool_name = %call.name,
            result_len = output.output.len(),
            "Tool execution finished"
        );

        let tool_result_block = ContentBlock::ToolResult {
            tool_use_id: call.id.clone(),
            content: output.output.clone(),
        };
        let _ = event_tx
            .send(AgentEvent::ContentBlockStart {
                block: tool_result_block.clone(),
            })
            .await;
        let _ = event_tx.send(AgentEvent::ContentBlockStop).await;
        tool_blocks.push(tool_result_block);

        outputs.push(output);
    }
    outputs
}

/// Append the turn's assistant message, tool blocks first.
///
/// Called on every exit path so partial work is never lost.
async fn finish_turn(
    conversation: &mut Conversation,
    tool_blocks: Vec<ContentBlock>,
    text_content: String,
    text_started: bool,
    event_tx: &mpsc::Sender<AgentEvent>,
) {
    if text_started {
        let _ = event_tx.send(AgentEvent::ContentBlockStop).await;
    }

    let mut content_blocks = tool_blocks;
    if !text_content.is_empty() {
        content_blocks.push(ContentBlock::Text { text: text_content });
    }
    if content_blocks.is_empty() {
        content_blocks.push(ContentBlock::Text {
            text: String::new(),
        });
    }
    conversation.add_assistant_message(content_blocks);
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::super::backend::EventStream;
    use super::super::MessageRole;
    use super::*;

    /// Backend that replays scripted event streams and records calls.
    struct ScriptedBackend {
        streams: Mutex<std::collections::VecDeque<Vec<Result<RunEvent>>>>,
        submitted: Mutex<Vec<Vec<ToolOutput>>>,
        final_message: Option<String>,
    }

    impl ScriptedBackend {
        fn new(streams: Vec<Vec<Result<RunEvent>>>) -> Self {
            Self {
                streams: Mutex::new(streams.into_iter().collect()),
                submitted: Mutex::new(Vec::new()),
                final_message: None,
            }
        }

        fn next_stream(&self) -> EventStream {
            let events = self
                .streams
                .lock()
                .unwrap()
                .pop_front()
                .expect("script exhausted");
            Box::pin(futures::stream::iter(events))
        }
    }

    #[async_trait]
    impl AssistantBackend for ScriptedBackend {
        async fn create_message(&self, _thread_id: &str, _content: &str) -> Result<()> {
            Ok(())
        }

        async fn create_run(&self, _thread_id: &str) -> Result<EventStream> {
            Ok(self.next_stream())
        }

        async fn submit_tool_outputs(
            &self,
            _thread_id: &str,
            _run_id: &str,
            outputs: &[ToolOutput],
        ) -> Result<EventStream> {
            self.submitted.lock().unwrap().push(outputs.to_vec());
            Ok(self.next_stream())
        }

        async fn last_message_text(&self, _thread_id: &str) -> Result<String> {
            match &self.final_message {
                Some(text) => Ok(text.clone()),
                None => Ok(String::new()),
            }
        }
    }

    fn delta(text: &str) -> Result<RunEvent> {
        Ok(RunEvent::MessageDelta {
            text: text.to_string(),
        })
    }

    async fn drain(mut rx: mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn plain_text_turn_appends_assistant_message() {
        let backend = ScriptedBackend::new(vec![vec![
            delta("Hel"),
            delta("lo"),
            Ok(RunEvent::Completed),
        ]]);
        let mut conversation = Conversation::new("thread-1".to_string());
        let (tx, rx) = mpsc::channel(64);

        run_conversation_turn(
            &backend,
            &mut conversation,
            "hi".to_string(),
            &ToolContext::default(),
            tx,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.last_assistant_text().as_deref(), Some("Hello"));

        let events = drain(rx).await;
        assert!(matches!(events.last(), Some(AgentEvent::Done)));
    }

    #[tokio::test]
    async fn tool_pause_is_resolved_and_stream_replaced() {
        let backend = ScriptedBackend::new(vec![
            vec![
                delta("Looking up "),
                Ok(RunEvent::RequiresAction {
                    run_id: "run-1".to_string(),
                    tool_calls: vec![ToolCallRequest {
                        id: "call_1".to_string(),
                        kind: "function".to_string(),
                        name: Some("search_similar_materials".to_string()),
                        arguments: Some(r#"{"structure": "c1ccccc1"}"#.to_string()),
                    }],
                }),
            ],
            vec![delta("a candidate."), Ok(RunEvent::Completed)],
        ]);
        let mut conversation = Conversation::new("thread-1".to_string());
        let (tx, _rx) = mpsc::channel(64);

        run_conversation_turn(
            &backend,
            &mut conversation,
            "find a match".to_string(),
            &ToolContext::default(),
            tx,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let submitted = backend.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0][0].tool_call_id, "call_1");

        let assistant = conversation.messages.last().unwrap();
        assert_eq!(assistant.role, MessageRole::Assistant);
        assert!(matches!(
            assistant.content[0],
            ContentBlock::ToolUse { .. }
        ));
        assert!(matches!(
            assistant.content[1],
            ContentBlock::ToolResult { .. }
        ));
        assert!(matches!(
            &assistant.content[2],
            ContentBlock::Text { text } if text == "Looking up a candidate."
        ));
    }

    #[tokio::test]
    async fn multiple_calls_in_one_pause_submit_together() {
        let backend = ScriptedBackend::new(vec![
            vec![Ok(RunEvent::RequiresAction {
                run_id: "run-1".to_string(),
                tool_calls: vec![
                    ToolCallRequest {
                        id: "call_1".to_string(),
                        kind: "function".to_string(),
                        name: Some("search_similar_materials".to_string()),
                        arguments: Some(r#"{"structure": "CCO"}"#.to_string()),
                    },
                    ToolCallRequest {
                        id: "call_2".to_string(),
                        kind: "rag".to_string(),
                        name: None,
                        arguments: None,
                    },
                ],
            })],
            vec![delta("done"), Ok(RunEvent::Completed)],
        ]);
        let mut conversation = Conversation::new("thread-1".to_string());
        let (tx, _rx) = mpsc::channel(64);

        run_conversation_turn(
            &backend,
            &mut conversation,
            "go".to_string(),
            &ToolContext::default(),
            tx,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let submitted = backend.submitted.lock().unwrap();
        assert_eq!(submitted[0].len(), 2);
        // The pipeline pseudo-call gets a placeholder output.
        assert_eq!(submitted[0][1].output, "acknowledged");
    }

    #[tokio::test]
    async fn failed_run_preserves_partial_transcript() {
        let backend = ScriptedBackend::new(vec![vec![
            delta("partial "),
            Ok(RunEvent::Failed {
                reason: "backend overloaded".to_string(),
            }),
        ]]);
        let mut conversation = Conversation::new("thread-1".to_string());
        let (tx, rx) = mpsc::channel(64);

        let err = run_conversation_turn(
            &backend,
            &mut conversation,
            "hi".to_string(),
            &ToolContext::default(),
            tx,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::RunFailed { .. }));
        assert_eq!(
            conversation.last_assistant_text().as_deref(),
            Some("partial ")
        );

        let events = drain(rx).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::Error { message } if message == "backend overloaded")));
    }

    #[tokio::test]
    async fn broken_stream_preserves_partial_transcript() {
        let backend = ScriptedBackend::new(vec![vec![
            delta("partial "),
            Err(Error::malformed("stream broke mid-run")),
        ]]);
        let mut conversation = Conversation::new("thread-1".to_string());
        let (tx, rx) = mpsc::channel(64);

        let err = run_conversation_turn(
            &backend,
            &mut conversation,
            "hi".to_string(),
            &ToolContext::default(),
            tx,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Malformed { .. }));
        assert_eq!(
            conversation.last_assistant_text().as_deref(),
            Some("partial ")
        );

        let events = drain(rx).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::Error { .. })));
    }

    #[tokio::test]
    async fn completion_without_text_falls_back_to_message_list() {
        let mut backend = ScriptedBackend::new(vec![vec![Ok(RunEvent::Completed)]]);
        backend.final_message = Some("full reply".to_string());
        let mut conversation = Conversation::new("thread-1".to_string());
        let (tx, _rx) = mpsc::channel(64);

        run_conversation_turn(
            &backend,
            &mut conversation,
            "hi".to_string(),
            &ToolContext::default(),
            tx,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(
            conversation.last_assistant_text().as_deref(),
            Some("full reply")
        );
    }

    #[tokio::test]
    async fn pre_cancelled_token_stops_the_turn() {
        let backend =
            ScriptedBackend::new(vec![vec![delta("never seen"), Ok(RunEvent::Completed)]]);
        let mut conversation = Conversation::new("thread-1".to_string());
        let (tx, _rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = run_conversation_turn(
            &backend,
            &mut conversation,
            "hi".to_string(),
            &ToolContext::default(),
            tx,
            cancel,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        // The user message and an empty assistant turn are still recorded.
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.last_assistant_text().as_deref(), Some(""));
    }

    #[tokio::test]
    async fn expired_run_is_a_failure() {
        let backend = ScriptedBackend::new(vec![vec![Ok(RunEvent::Expired)]]);
        let mut conversation = Conversation::new("thread-1".to_string());
        let (tx, _rx) = mpsc::channel(64);

        let err = run_conversation_turn(
            &backend,
            &mut conversation,
            "hi".to_string(),
            &ToolContext::default(),
            tx,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::RunFailed { reason } if reason == "run expired"));
    }
}
