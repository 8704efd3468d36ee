//! Score oracle contract + OpenAI-compatible chat completion client.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "ojt-oracle";

pub const SYSTEM_PROMPT: &str = "You are a placement assistant for an on-the-job training program. \
Rate how well the student fits the job posting on a scale from 0 to 100. \
Reply with only the integer and nothing else.";

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} from {url}")]
    HttpStatus { status: u16, url: String },
    #[error("oracle returned no completion text")]
    EmptyResponse,
    #[error("no integer score in oracle response {raw:?}")]
    NoScore { raw: String },
    #[error("{0}")]
    Message(String),
}

/// Turns a (job text, student text) pair into a 0..=100 fit score.
#[async_trait]
pub trait ScoreOracle: Send + Sync {
    async fn score(&self, job_text: &str, student_text: &str) -> Result<u8, OracleError>;
}

pub fn clamp_score(value: i64) -> u8 {
    value.clamp(0, 100) as u8
}

/// First run of ASCII digits. A `-` directly before it is a sign only when it
/// opens the reply or follows something other than a letter or digit, so
/// `"Score-85"` reads as 85. Runs too long for an i64 saturate.
fn first_integer(text: &str) -> Option<i64> {
    let bytes = text.as_bytes();
    let start = bytes.iter().position(|b| b.is_ascii_digit())?;
    let end = bytes[start..]
        .iter()
        .position(|b| !b.is_ascii_digit())
        .map(|len| start + len)
        .unwrap_or(bytes.len());
    let magnitude = text[start..end].parse::<i64>().unwrap_or(i64::MAX);
    let negative = start > 0
        && bytes[start - 1] == b'-'
        && (start == 1 || !bytes[start - 2].is_ascii_alphanumeric());
    Some(if negative { -magnitude } else { magnitude })
}

pub fn parse_score(raw: &str) -> Result<u8, OracleError> {
    first_integer(raw)
        .map(clamp_score)
        .ok_or_else(|| OracleError::NoScore {
            raw: raw.to_string(),
        })
}

pub fn user_prompt(job_text: &str, student_text: &str) -> String {
    format!("Job posting:\n{job_text}\n\nStudent profile:\n{student_text}\n\nFit score (0-100):")
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
    if err.is_timeout() || err.is_connect() {
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
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Sum of every sleep the retry loop can take.
    pub fn total_delay(&self) -> Duration {
        (0..self.max_retries)
            .map(|attempt| self.delay_for_attempt(attempt))
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}

#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.0,
            max_tokens: 5,
            timeout: Duration::from_secs(8),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl OracleConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let api_key = std::env::var("OPENAI_API_KEY")
            .context("OPENAI_API_KEY must be set for the chat completion oracle")?;
        Ok(Self {
            base_url: std::env::var("OPENAI_BASE_URL").unwrap_or(defaults.base_url),
            api_key,
            model: std::env::var("OJT_ORACLE_MODEL").unwrap_or(defaults.model),
            temperature: defaults.temperature,
            max_tokens: env_parse("OJT_ORACLE_MAX_TOKENS").unwrap_or(defaults.max_tokens),
            timeout: env_parse("OJT_ORACLE_HTTP_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            backoff: BackoffPolicy {
                max_retries: env_parse("OJT_ORACLE_MAX_RETRIES")
                    .unwrap_or(defaults.backoff.max_retries),
                ..defaults.backoff
            },
        })
    }

    /// Longest a single `complete` call can take when every attempt times out.
    pub fn worst_case_latency(&self) -> Duration {
        let attempts = u32::try_from(self.backoff.max_retries.saturating_add(1)).unwrap_or(u32::MAX);
        self.timeout
            .saturating_mul(attempts)
            .saturating_add(self.backoff.total_delay())
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: u32,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug)]
pub struct ChatCompletionOracle {
    client: reqwest::Client,
    config: OracleConfig,
}

impl ChatCompletionOracle {
    pub fn new(config: OracleConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &OracleConfig {
        &self.config
    }

    /// Send one system + user exchange and return the raw completion text.
    pub async fn complete(&self, system: &str, user: &str) -> Result<String, OracleError> {
        let url = self.config.completions_url();
        let body = ChatRequest {
            model: &self.config.model,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
        };
        let backoff = self.config.backoff;
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=backoff.max_retries {
            let resp_result = self
                .client
                .post(&url)
                .bearer_auth(&self.config.api_key)
                .json(&body)
                .send()
                .await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let parsed: ChatResponse = resp.json().await?;
                        return parsed
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|choice| choice.message.content)
                            .ok_or(OracleError::EmptyResponse);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        warn!(status = status.as_u16(), attempt, "oracle call failed; retrying");
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(OracleError::HttpStatus {
                        status: status.as_u16(),
                        url: url.clone(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        warn!(error = %err, attempt, "oracle request error; retrying");
                        last_request_error = Some(err);
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(OracleError::Request(err));
                }
            }
        }

        Err(last_request_error
            .map(OracleError::Request)
            .unwrap_or_else(|| OracleError::Message("oracle retry loop exhausted".to_string())))
    }
}

#[async_trait]
impl ScoreOracle for ChatCompletionOracle {
    async fn score(&self, job_text: &str, student_text: &str) -> Result<u8, OracleError> {
        let raw = self
            .complete(SYSTEM_PROMPT, &user_prompt(job_text, student_text))
            .await?;
        debug!(raw = %raw, "oracle completion");
        parse_score(&raw)
    }
}
