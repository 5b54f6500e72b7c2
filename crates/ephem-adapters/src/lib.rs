//! Generation client: prompt construction, the text-generation seam, an
//! OpenAI chat-completions backend and strict parsing of its output.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ephem_core::{Category, GenerationCandidate, PublicationKey};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "ephem-adapters";

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("generation request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("generation service returned http {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("generation service returned no completion text")]
    EmptyResponse,
    #[error("failed to parse model response as JSON ({reason}): {raw}")]
    MalformedJson { reason: String, raw: String },
    #[error("model response is missing required field `{field}`: {raw}")]
    MissingField { field: &'static str, raw: String },
    #[error("invalid source_url {url:?}: must start with http:// or https://")]
    InvalidSourceUrl { url: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// The external generative service: prompt in, raw text out.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(&self, prompt: &str) -> Result<String, GenerationError>;
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            model: DEFAULT_OPENAI_MODEL.to_string(),
            temperature: 0.8,
            timeout: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// `POST {base_url}/chat/completions` with a single user message.
///
/// 429, 5xx, connect errors and timeouts are retried with capped exponential
/// backoff; any other status fails immediately with the response body.
#[derive(Debug)]
pub struct OpenAiChatGenerator {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiChatGenerator {
    pub fn new(config: OpenAiConfig) -> Result<Self, GenerationError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .map_err(GenerationError::Client)?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl TextGenerator for OpenAiChatGenerator {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, prompt: &str) -> Result<String, GenerationError> {
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": self.config.temperature,
        });
        let url = self.endpoint();
        let backoff = self.config.backoff;
        let span = info_span!("chat_completion", model = %self.config.model);

        async move {
            for attempt in 0..=backoff.max_retries {
                let resp = self
                    .client
                    .post(&url)
                    .bearer_auth(&self.config.api_key)
                    .json(&body)
                    .send()
                    .await;

                match resp {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            let parsed: ChatCompletionResponse = resp.json().await?;
                            return parsed
                                .choices
                                .into_iter()
                                .next()
                                .and_then(|choice| choice.message.content)
                                .map(|content| content.trim().to_string())
                                .filter(|content| !content.is_empty())
                                .ok_or(GenerationError::EmptyResponse);
                        }

                        let text = resp.text().await.unwrap_or_default();
                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < backoff.max_retries
                        {
                            warn!(status = status.as_u16(), attempt, "retrying generation request");
                            tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(GenerationError::HttpStatus {
                            status: status.as_u16(),
                            body: text,
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < backoff.max_retries
                        {
                            warn!(error = %err, attempt, "retrying generation request");
                            tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(GenerationError::Request(err));
                    }
                }
            }
            // The final attempt always returns from inside the loop.
            Err(GenerationError::EmptyResponse)
        }
        .instrument(span)
        .await
    }
}

/// Builds the instruction sent to the model. A pure function of its inputs.
pub fn build_prompt(day: u32, month_name: &str, current_year: i32, categories: &[&str]) -> String {
    let categories = categories.join(", ");
    format!(
        r#"Generate a HISTORICAL event (from a past year, NOT current year {current_year}) that occurred on {month_name} {day}.

The event should be:
- A real, verifiable historical event from technology, science, or computing
- From a PAST year (before {current_year}). Important: NOT from year {current_year}.
- Include the specific year it happened
- Include who discovered/founded/created it (person or organization)
- Include why it was important or its impact

IMPORTANT - Category MUST be ONE OF: {categories}

Respond in JSON format ONLY (no markdown, no explanation):
{{
  "title": "Event Title (5-10 words, include the year)",
  "description": "3-4 sentences with: (1) The event description, (2) Who was involved (person/organization), (3) Historical year (e.g., 'In 1997...'), (4) Why it mattered/impact. Maximum 300 characters.",
  "category": "TECH",
  "source_url": "A real, verifiable Wikipedia or historical URL for this event"
}}

Requirements:
- The event MUST have occurred on {month_name} {day} of ANY PAST YEAR (not {current_year})
- The event MUST be verifiable and historically accurate
- The description MUST mention the year it happened
- The description MUST mention the person(s) or organization involved
- The description MUST explain why it was important
- The category MUST be one of: {categories}
- Return ONLY valid JSON, nothing else."#
    )
}

pub fn has_http_scheme(url: &str) -> bool {
    let lower = url.trim().to_ascii_lowercase();
    (lower.starts_with("http://") && lower.len() > "http://".len())
        || (lower.starts_with("https://") && lower.len() > "https://".len())
}

#[derive(Debug, Deserialize)]
struct RawCandidate {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    source_url: Option<String>,
}

/// Strictly parses model output. Only surrounding whitespace is tolerated;
/// category is passed through untouched for the normalizer.
pub fn parse_candidate(raw: &str) -> Result<GenerationCandidate, GenerationError> {
    let parsed: RawCandidate =
        serde_json::from_str(raw.trim()).map_err(|err| GenerationError::MalformedJson {
            reason: err.to_string(),
            raw: raw.to_string(),
        })?;

    let required = |value: Option<String>, field: &'static str| {
        value
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| GenerationError::MissingField {
                field,
                raw: raw.to_string(),
            })
    };

    let title = required(parsed.title, "title")?;
    let description = required(parsed.description, "description")?;
    let category = required(parsed.category, "category")?;
    let source_url = required(parsed.source_url, "source_url")?;
    if !has_http_scheme(&source_url) {
        return Err(GenerationError::InvalidSourceUrl { url: source_url });
    }

    Ok(GenerationCandidate {
        title,
        description,
        category,
        source_url,
    })
}

/// Asks the injected [`TextGenerator`] for a candidate on a publication day.
#[derive(Clone)]
pub struct GenerationClient {
    generator: Arc<dyn TextGenerator>,
}

impl GenerationClient {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }

    pub fn model_name(&self) -> &str {
        self.generator.model_name()
    }

    pub async fn generate(
        &self,
        key: &PublicationKey,
        current_year: i32,
    ) -> Result<GenerationCandidate, GenerationError> {
        let prompt = build_prompt(key.day(), key.month_name(), current_year, &Category::labels());
        debug!(%key, model = self.generator.model_name(), "requesting ephemeris from model");
        let raw = self.generator.complete(&prompt).await?;
        parse_candidate(&raw)
    }
}
