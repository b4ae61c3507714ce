//! Screen-parsing vision service client.
//!
//! Screenshots go up base64-encoded, an annotated image and a list of
//! detected elements come back. A health probe gates use of the service.

use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ensure_success, Error, Result};

/// Detection thresholds for a parse request.
#[derive(Debug, Clone, Serialize)]
pub struct VisionParams {
    pub box_threshold: f64,
    pub iou_threshold: f64,
    pub use_paddleocr: bool,
}

impl Default for VisionParams {
    fn default() -> Self {
        Self {
            box_threshold: 0.01,
            iou_threshold: 0.1,
            use_paddleocr: true,
        }
    }
}

/// One detected screen element.
///
/// The service's element schema varies by detector version, so every field
/// is optional-with-default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedElement {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub bbox: Vec<f64>,
    #[serde(default)]
    pub interactivity: bool,
    #[serde(default)]
    pub source: String,
}

/// Result of parsing one screenshot.
#[derive(Debug, Clone)]
pub struct ParseOutcome {
    /// Annotated copy of the input image, decoded.
    pub annotated_image: Vec<u8>,
    pub elements: Vec<ParsedElement>,
    /// Server-side processing time in seconds.
    pub latency: f64,
}

/// Client for the screen-parsing service.
#[derive(Debug, Clone)]
pub struct VisionClient {
    client: reqwest::Client,
    base_url: String,
}

impl VisionClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Health probe. Errors with `ServiceUnavailable` when the service does
    /// not answer with a success status.
    pub async fn probe(&self) -> Result<()> {
        let url = format!("{}/probe/", self.base_url);
        debug!(url = %url, "Probing vision service");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::ServiceUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::ServiceUnavailable(format!(
                "probe returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Parse a screenshot into an annotated image and element list.
    pub async fn parse_image(&self, image: &[u8], params: &VisionParams) -> Result<ParseOutcome> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(image);
        info!(
            image_bytes = image.len(),
            box_threshold = params.box_threshold,
            "Submitting screenshot for parsing"
        );

        let request = ParseRequest {
            base64_image: &encoded,
            params,
        };
        let response = self
            .client
            .post(format!("{}/parse/", self.base_url))
            .json(&request)
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let body = response.text().await?;
        let parsed: ParseResponse = serde_json::from_str(&body)
            .map_err(|e| Error::malformed(format!("parse response: {e}")))?;

        let annotated_image = base64::engine::general_purpose::STANDARD
            .decode(&parsed.som_image_base64)
            .map_err(|e| Error::malformed(format!("annotated image: {e}")))?;

        info!(
            elements = parsed.parsed_content_list.len(),
            latency = parsed.latency,
            "Screenshot parsed"
        );
        Ok(ParseOutcome {
            annotated_image,
            elements: parsed.parsed_content_list,
            latency: parsed.latency,
        })
    }
}

#[derive(Debug, Serialize)]
struct ParseRequest<'a> {
    base64_image: &'a str,
    params: &'a VisionParams,
}

#[derive(Debug, Deserialize)]
struct ParseResponse {
    som_image_base64: String,
    #[serde(default)]
    parsed_content_list: Vec<ParsedElement>,
    #[serde(default)]
    latency: f64,
}
