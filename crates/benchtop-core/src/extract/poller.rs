//! Bounded polling loop for extraction jobs.
//!
//! The service exposes no push channel; completion is observed by polling the
//! batch status endpoint at a fixed interval. The loop is always bounded: a
//! job that never reaches a terminal state surfaces as `Error::PollTimeout`
//! instead of blocking the caller forever.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::{ExtractionClient, FileStatus};
use super::{IngestionJob, JobState};
use crate::error::{Error, Result};

/// Bounded retry policy for the status poll.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    /// Delay between polls.
    pub interval: Duration,
    /// Maximum number of polls before giving up.
    pub max_attempts: u32,
    /// Multiplier applied to the delay after a transport failure. The delay
    /// resets to `interval` once a poll succeeds.
    pub backoff: f64,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            max_attempts: 100,
            backoff: 1.5,
        }
    }
}

/// Progress observation emitted on every poll.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum PollProgress {
    Polled { attempt: u32, state: JobState },
    TransportRetry { attempt: u32, error: String },
}

/// Source of per-file status records, keyed by batch id.
///
/// `ExtractionClient` is the production implementation; tests use scripted
/// fakes.
#[async_trait]
pub trait JobStatusSource: Send + Sync {
    async fn batch_status(&self, batch_id: &str) -> Result<Vec<FileStatus>>;
}

#[async_trait]
impl JobStatusSource for ExtractionClient {
    async fn batch_status(&self, batch_id: &str) -> Result<Vec<FileStatus>> {
        ExtractionClient::batch_status(self, batch_id).await
    }
}

/// Poll a job until it reaches a terminal state.
///
/// Emits a `PollProgress` observation per poll and updates the job in place.
/// On `Done` the result archive URL is returned; on `Failed` the
/// remote-reported reason surfaces immediately as `Error::JobFailed` and is
/// never retried. Transport failures count against the same attempt budget,
/// with the backoff multiplier applied to the delay. Terminal states stop the
/// loop; the job is never re-polled after one.
pub async fn poll_until_terminal<S: JobStatusSource + ?Sized>(
    source: &S,
    job: &mut IngestionJob,
    policy: &PollPolicy,
    progress_tx: mpsc::Sender<PollProgress>,
    cancel: CancellationToken,
) -> Result<String> {
    let mut delay = policy.interval;

    for attempt in 1..=policy.max_attempts {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(batch_id = %job.batch_id, "Polling cancelled");
                return Err(Error::Cancelled);
            }
            _ = tokio::time::sleep(delay) => {}
        }

        match source.batch_status(&job.batch_id).await {
            Ok(statuses) => {
                let status = statuses
                    .into_iter()
                    .next()
                    .ok_or_else(|| Error::malformed("status response contained no records"))?;
                job.state = status.state.clone();
                let _ = progress_tx
                    .send(PollProgress::Polled {
                        attempt,
                        state: status.state.clone(),
                    })
                    .await;

                match status.state {
                    JobState::Done => {
                        let url = status
                            .full_zip_url
                            .ok_or_else(|| Error::malformed("done status without a result URL"))?;
                        job.result_url = Some(url.clone());
                        info!(batch_id = %job.batch_id, attempts = attempt, "Extraction complete");
                        return Ok(url);
                    }
                    JobState::Failed => {
                        let reason = status
                            .err_msg
                            .unwrap_or_else(|| "unknown error".to_string());
                        job.error = Some(reason.clone());
                        warn!(batch_id = %job.batch_id, reason = %reason, "Extraction failed");
                        return Err(Error::JobFailed { reason });
                    }
                    ref state => {
                        debug!(batch_id = %job.batch_id, attempt, state = ?state, "Job still in progress");
                        delay = policy.interval;
                    }
                }
            }
            Err(Error::Transport(e)) => {
                warn!(batch_id = %job.batch_id, attempt, error = %e, "Status poll transport error, backing off");
                let _ = progress_tx
                    .send(PollProgress::TransportRetry {
                        attempt,
                        error: e.to_string(),
                    })
                    .await;
                delay = delay.mul_f64(policy.backoff);
            }
            Err(e) => return Err(e),
        }
    }

    warn!(batch_id = %job.batch_id, attempts = policy.max_attempts, "Polling bound exhausted");
    Err(Error::PollTimeout {
        attempts: policy.max_attempts,
    })
}
