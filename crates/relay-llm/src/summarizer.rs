use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::{debug, instrument};

use relay_core::analysis::{SummarizeError, SummaryRequest, Summarizer};

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

const SYSTEM_PROMPT: &str = "You summarize design documents exported from a design tool. \
Describe the layout, the main components and any notable styling in a few short paragraphs.";

#[derive(Clone)]
pub struct SummarizerConfig {
    pub api_key: SecretString,
    pub model: String,
    pub max_tokens: u32,
    /// Override for tests and proxies.
    pub api_url: String,
}

impl SummarizerConfig {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            api_key,
            model: DEFAULT_MODEL.into(),
            max_tokens: 1024,
            api_url: API_URL.into(),
        }
    }
}

impl std::fmt::Debug for SummarizerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummarizerConfig")
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("api_url", &self.api_url)
            .finish()
    }
}

/// Summarizer backed by the Anthropic Messages API (non-streaming).
pub struct AnthropicSummarizer {
    client: Client,
    config: SummarizerConfig,
}

impl AnthropicSummarizer {
    pub fn new(config: SummarizerConfig) -> Result<Self, SummarizeError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SummarizeError::Network(e.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }
}

/// Build the Messages API request body for one summary.
pub fn build_request_body(model: &str, max_tokens: u32, request: &SummaryRequest) -> Value {
    let mut prompt = String::new();
    if let Some(instructions) = request.instructions.as_deref().filter(|s| !s.is_empty()) {
        prompt.push_str(instructions);
        prompt.push_str("\n\n");
    }
    prompt.push_str(&request.content);

    json!({
        "model": model,
        "max_tokens": max_tokens,
        "system": SYSTEM_PROMPT,
        "messages": [
            { "role": "user", "content": prompt }
        ]
    })
}

/// Concatenate the text blocks of a Messages API response.
pub fn extract_text(response: &Value) -> Result<String, SummarizeError> {
    let text: String = response["content"]
        .as_array()
        .map(|blocks| {
            blocks
                .iter()
                .filter(|b| b["type"] == "text")
                .filter_map(|b| b["text"].as_str())
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        Err(SummarizeError::EmptyResponse)
    } else {
        Ok(text)
    }
}

fn classify_status(status: u16, body: String) -> SummarizeError {
    match status {
        401 | 403 => SummarizeError::AuthenticationFailed(body),
        _ => SummarizeError::Provider { status, body },
    }
}

#[async_trait]
impl Summarizer for AnthropicSummarizer {
    #[instrument(skip_all, fields(model = %self.config.model, content_len = request.content.len()))]
    async fn summarize(&self, request: SummaryRequest) -> Result<String, SummarizeError> {
        let body = build_request_body(&self.config.model, self.config.max_tokens, &request);

        let resp = self
            .client
            .post(&self.config.api_url)
            .header("x-api-key", self.config.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .header("accept", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| SummarizeError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        let parsed: Value = resp
            .json()
            .await
            .map_err(|e| SummarizeError::Network(e.to_string()))?;
        let text = extract_text(&parsed)?;
        debug!(summary_len = text.len(), "summary received");
        Ok(text)
    }
}
