//! Structured refinement over a chat-completion endpoint.
//!
//! Sends a document plus an instruction prompt and asks the model for a JSON
//! object reply. The endpoint enforces JSON output through its response
//! format switch; a reply that still is not valid JSON is malformed.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ensure_success, Error, Result};

/// Client for the chat-completion refinement endpoint.
#[derive(Debug, Clone)]
pub struct RefineClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl RefineClient {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    /// Extract a structured record from a document.
    ///
    /// `prompt` carries the extraction instructions, `document` the source
    /// text. The reply is parsed as a JSON value; non-JSON model output is a
    /// malformed response.
    pub async fn extract_structured(
        &self,
        prompt: &str,
        document: &str,
    ) -> Result<serde_json::Value> {
        info!(
            model = %self.model,
            prompt_len = prompt.len(),
            document_len = document.len(),
            "Requesting structured extraction"
        );

        let request = CompletionRequest {
            model: &self.model,
            messages: vec![
                WireMessage {
                    role: "system",
                    content: prompt,
                },
                WireMessage {
                    role: "user",
                    content: document,
                },
            ],
            response_format: ResponseFormat {
                kind: "json_object",
            },
            stream: false,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let body = response.text().await?;
        let completion: CompletionResponse = serde_json::from_str(&body)
            .map_err(|e| Error::malformed(format!("completion response: {e}")))?;

        let content = completion
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| Error::malformed("completion response has no choices"))?;

        debug!(reply_len = content.len(), "Parsing structured reply");
        serde_json::from_str(content)
            .map_err(|e| Error::malformed(format!("model reply is not valid JSON: {e}")))
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    response_format: ResponseFormat,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}
