//! Service endpoints and credentials.

use crate::extract::PollPolicy;

/// Configuration for the remote services.
///
/// Endpoint defaults match the hosted services; the vision service defaults
/// to a local instance. Credentials come from the environment and are empty
/// when unset.
#[derive(Debug, Clone)]
pub struct Config {
    /// Document-extraction service base URL.
    pub extraction_url: String,
    pub extraction_token: String,
    /// Hosted assistant service base URL.
    pub assistant_url: String,
    pub assistant_api_key: String,
    /// Chat-completion endpoint used for structured refinement.
    pub refine_url: String,
    pub refine_api_key: String,
    pub refine_model: String,
    /// Screen-parsing vision service base URL.
    pub vision_url: String,
    /// Polling bounds for extraction jobs. A bound is always enforced; there
    /// is no unbounded mode.
    pub poll: PollPolicy,
}

impl Config {
    /// Load configuration from the environment or use defaults.
    pub fn load_or_default() -> Self {
        Self {
            extraction_url: env_or("BENCHTOP_EXTRACTION_URL", "https://mineru.net/api/v4"),
            extraction_token: env_or("BENCHTOP_EXTRACTION_TOKEN", ""),
            assistant_url: env_or(
                "BENCHTOP_ASSISTANT_URL",
                "https://dashscope.aliyuncs.com/api/v1",
            ),
            assistant_api_key: env_or("BENCHTOP_ASSISTANT_API_KEY", ""),
            refine_url: env_or("BENCHTOP_REFINE_URL", "https://api.deepseek.com/v1"),
            refine_api_key: env_or("BENCHTOP_REFINE_API_KEY", ""),
            refine_model: env_or("BENCHTOP_REFINE_MODEL", "deepseek-chat"),
            vision_url: env_or("BENCHTOP_VISION_URL", "http://localhost:8000"),
            poll: PollPolicy::default(),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
