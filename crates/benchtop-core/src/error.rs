//! Error taxonomy for remote-service interactions.
//!
//! Remote-reported terminal failures (`JobFailed`, `RunFailed`) are surfaced
//! immediately and never retried. Transient transport errors are retried with
//! backoff where a policy applies (see `extract::poller`). Malformed payloads
//! are fatal for the operation that hit them, not for the process.
//!
//! Two conditions are deliberately not errors: a missing document entry in a
//! result archive is a soft warning on the `ExtractionResult`, and an
//! unresolvable tool name gets a placeholder output.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Network/transport failure (DNS, connect, TLS, body read).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Remote returned a non-2xx status.
    #[error("unexpected status {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    /// The extraction service reported the job as failed.
    #[error("extraction job failed: {reason}")]
    JobFailed { reason: String },

    /// Polling bound exhausted without reaching a terminal state.
    #[error("job did not reach a terminal state after {attempts} polls")]
    PollTimeout { attempts: u32 },

    /// Response payload did not match the expected shape.
    #[error("malformed response: {context}")]
    Malformed { context: String },

    /// Health probe failed; the service is not reachable.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The assistant run ended with a failure, cancellation, or expiry event.
    #[error("assistant run failed: {reason}")]
    RunFailed { reason: String },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn malformed(context: impl Into<String>) -> Self {
        Self::Malformed {
            context: context.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Check a response status, consuming the body into the error on non-2xx.
pub(crate) async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::Status { status, body })
}
