//! HTTP client for the hosted document-extraction service.
//!
//! Three endpoints: request upload URLs for a batch of files, an opaque
//! pre-signed storage PUT target, and a status poll keyed by batch id.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::JobState;
use crate::error::{ensure_success, Error, Result};

/// Typed client over the extraction service endpoints.
pub struct ExtractionClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

/// Upload slot returned by `request_upload`.
#[derive(Debug, Clone)]
pub struct AcceptedUpload {
    pub batch_id: String,
    pub upload_url: String,
}

/// Per-file status record from the polling endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct FileStatus {
    pub state: JobState,
    #[serde(default)]
    pub full_zip_url: Option<String>,
    #[serde(default)]
    pub err_msg: Option<String>,
}

impl ExtractionClient {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    /// Request an upload slot for a single file.
    ///
    /// The batch endpoint accepts an array of files; we submit one per job so
    /// each document polls independently.
    pub async fn request_upload(&self, file_name: &str, data_id: &str) -> Result<AcceptedUpload> {
        let request = UploadLinkRequest {
            enable_formula: true,
            enable_table: true,
            language: "en".to_string(),
            files: vec![UploadFileSpec {
                name: file_name.to_string(),
                is_ocr: true,
                data_id: data_id.to_string(),
            }],
        };

        debug!(file = %file_name, "Requesting upload link");
        let response = self
            .client
            .post(format!("{}/file-urls/batch", self.base_url))
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let text = response.text().await?;
        let body: UploadLinkResponse = serde_json::from_str(&text)
            .map_err(|e| Error::malformed(format!("upload-link payload: {e}")))?;

        let upload_url = body
            .data
            .file_urls
            .into_iter()
            .next()
            .ok_or_else(|| Error::malformed("upload-link response contained no file URLs"))?;

        info!(batch_id = %body.data.batch_id, file = %file_name, "Upload link acquired");
        Ok(AcceptedUpload {
            batch_id: body.data.batch_id,
            upload_url,
        })
    }

    /// PUT the raw file bytes to the storage URL issued by `request_upload`.
    ///
    /// The target is pre-signed; no auth header is sent.
    pub async fn upload_file(&self, upload_url: &str, bytes: Bytes) -> Result<()> {
        let size = bytes.len();
        let response = self.client.put(upload_url).body(bytes).send().await?;
        ensure_success(response).await?;
        debug!(bytes = size, "File uploaded");
        Ok(())
    }

    /// Fetch one status record per submitted file for a batch.
    pub async fn batch_status(&self, batch_id: &str) -> Result<Vec<FileStatus>> {
        let response = self
            .client
            .get(format!("{}/extract-results/batch/{}", self.base_url, batch_id))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let text = response.text().await?;
        let body: BatchStatusResponse = serde_json::from_str(&text)
            .map_err(|e| Error::malformed(format!("batch status payload: {e}")))?;
        Ok(body.data.extract_result)
    }

    /// Download the result archive for a completed job.
    pub async fn download_archive(&self, url: &str) -> Result<Bytes> {
        debug!(url = %url, "Downloading result archive");
        let response = self.client.get(url).send().await?;
        let response = ensure_success(response).await?;
        Ok(response.bytes().await?)
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct UploadLinkRequest {
    enable_formula: bool,
    enable_table: bool,
    language: String,
    files: Vec<UploadFileSpec>,
}

#[derive(Debug, Serialize)]
struct UploadFileSpec {
    name: String,
    is_ocr: bool,
    data_id: String,
}

#[derive(Debug, Deserialize)]
struct UploadLinkResponse {
    data: UploadLinkData,
}

#[derive(Debug, Deserialize)]
struct UploadLinkData {
    batch_id: String,
    file_urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct BatchStatusResponse {
    data: BatchStatusData,
}

#[derive(Debug, Deserialize)]
struct BatchStatusData {
    extract_result: Vec<FileStatus>,
}
