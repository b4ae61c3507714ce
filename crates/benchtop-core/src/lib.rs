//! Benchtop Core - integration workflows for a lab literature assistant
//!
//! This crate contains the remote-service plumbing behind Benchtop, including:
//! - Batch document extraction (upload, bounded status polling, archive
//!   materialization)
//! - Conversational runs against the hosted assistant, with streamed tool
//!   calling resolved through a local registry
//! - Structured-record refinement over a chat-completion API
//! - Screen parsing via the vision service
//!
//! All workflows are async, emit progress over mpsc channels, and accept a
//! `CancellationToken`. Conversation state is an explicit object owned by the
//! caller; nothing in this crate holds global session state.

pub mod agent;
pub mod config;
pub mod error;
pub mod extract;
pub mod refine;
pub mod vision;

pub use agent::{
    run_conversation_turn, AgentEvent, AssistantBackend, AssistantClient, Conversation, RunEvent,
};
pub use config::Config;
pub use error::{Error, Result};
pub use extract::{
    ingest_document, materialize, poll_until_terminal, ExtractionClient, ExtractionResult,
    IngestionJob, JobState, PollPolicy,
};
pub use refine::RefineClient;
pub use vision::{VisionClient, VisionParams};
