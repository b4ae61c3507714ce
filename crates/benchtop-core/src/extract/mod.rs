//! Batch document extraction workflow.
//!
//! A document goes through a linear pipeline: request an upload slot from the
//! extraction service, PUT the file bytes to the issued storage URL, poll the
//! batch until it reaches a terminal state, then download the result archive
//! and materialize its contents.

pub mod client;
pub mod materialize;
pub mod poller;

pub use client::ExtractionClient;
pub use materialize::{materialize, AssetEntry, ExtractionResult};
pub use poller::{poll_until_terminal, JobStatusSource, PollPolicy, PollProgress};

use std::path::Path;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// State of a submitted extraction job, as reported by the polling endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Done,
    Failed,
    /// Any state string the service adds later; treated as non-terminal.
    #[serde(other)]
    Other,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }
}

/// A job accepted by the extraction service.
///
/// Created when the upload slot is acquired. The state only advances through
/// polling and is terminal on `Done` or `Failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionJob {
    pub batch_id: String,
    pub file_name: String,
    pub data_id: String,
    pub state: JobState,
    /// Result archive URL, set when the job reaches `Done`.
    pub result_url: Option<String>,
    /// Remote-reported reason, set when the job reaches `Failed`.
    pub error: Option<String>,
}

/// Upload a single document and return the accepted job.
pub async fn submit_document(
    client: &ExtractionClient,
    file_name: &str,
    bytes: Bytes,
) -> Result<IngestionJob> {
    let data_id = file_name
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(file_name)
        .to_string();

    let accepted = client.request_upload(file_name, &data_id).await?;
    client.upload_file(&accepted.upload_url, bytes).await?;

    Ok(IngestionJob {
        batch_id: accepted.batch_id,
        file_name: file_name.to_string(),
        data_id,
        state: JobState::Pending,
        result_url: None,
        error: None,
    })
}

/// Full ingestion workflow for a single document.
///
/// Composes submit, poll, download, and materialize. Progress observations
/// are emitted on every poll; the token cancels the wait between polls.
#[allow(clippy::too_many_arguments)]
pub async fn ingest_document(
    client: &ExtractionClient,
    file_name: &str,
    bytes: Bytes,
    policy: &PollPolicy,
    output_dir: &Path,
    progress_tx: mpsc::Sender<PollProgress>,
    cancel: CancellationToken,
) -> Result<(IngestionJob, ExtractionResult)> {
    let mut job = submit_document(client, file_name, bytes).await?;
    let result_url = poll_until_terminal(client, &mut job, policy, progress_tx, cancel).await?;
    let archive = client.download_archive(&result_url).await?;
    let result = materialize(&archive, &job.data_id, output_dir)?;
    Ok((job, result))
}
