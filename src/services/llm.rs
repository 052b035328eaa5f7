use async_trait::async_trait;
use log::debug;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;

use crate::core::config::{HostedConfig, HostedProvider};

const OPENAI_DEFAULT_URL: &str = "https://api.openai.com/v1";
const OPENAI_DEFAULT_MODEL: &str = "gpt-4o-mini";
const GEMINI_DEFAULT_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const GEMINI_DEFAULT_MODEL: &str = "gemini-2.5-flash";

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("No API key set for provider: {provider}")]
    NoApiKey { provider: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Rate limited (retry after: {})", .retry_after.as_deref().unwrap_or("unknown"))]
    RateLimited { retry_after: Option<String> },

    #[error("Quota exhausted: {message}")]
    QuotaExhausted { message: String },

    #[error("API returned error: {status}: {message}")]
    ApiResponse { status: u16, message: String },

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Response carried no text (finish reason: {finish_reason})")]
    EmptyResponse { finish_reason: String },
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
}

/// Rate-limit headers some providers attach to every response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit_requests: Option<String>,
    pub limit_tokens: Option<String>,
    pub remaining_requests: Option<String>,
    pub remaining_tokens: Option<String>,
    pub reset_requests: Option<String>,
    pub reset_tokens: Option<String>,
}

impl RateLimitHeaders {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
        };
        Self {
            limit_requests: get("x-ratelimit-limit-requests"),
            limit_tokens: get("x-ratelimit-limit-tokens"),
            remaining_requests: get("x-ratelimit-remaining-requests"),
            remaining_tokens: get("x-ratelimit-remaining-tokens"),
            reset_requests: get("x-ratelimit-reset-requests"),
            reset_tokens: get("x-ratelimit-reset-tokens"),
        }
    }
}

/// Optional bookkeeping about a response. Nothing depends on it.
#[derive(Debug, Clone, Default)]
pub struct ResponseDiagnostics {
    pub response_id: Option<String>,
    pub model: Option<String>,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
    pub rate_limit: RateLimitHeaders,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub finish_reason: Option<String>,
    pub diagnostics: ResponseDiagnostics,
}

#[async_trait]
pub trait LlmClient: Send + Sync + Debug {
    fn provider(&self) -> &'static str;
    fn model(&self) -> &str;
    async fn complete(&self, request: &ChatRequest) -> Result<Completion, LlmError>;

    /// Sends one tiny request to check key, endpoint and model.
    async fn test_connection(&self) -> Result<(), LlmError> {
        let request = ChatRequest {
            system: "Eres un asistente útil.".to_string(),
            user: "Di 'Hola' en una palabra.".to_string(),
            max_tokens: 32,
            temperature: 0.0,
            top_p: None,
            top_k: None,
        };
        self.complete(&request).await.map(|_| ())
    }
}

pub fn create_llm(config: &HostedConfig) -> Result<Box<dyn LlmClient>, LlmError> {
    let provider = match config.provider {
        HostedProvider::Openai => "openai",
        HostedProvider::Gemini => "gemini",
    };
    let api_key = config.api_key().ok_or_else(|| LlmError::NoApiKey {
        provider: provider.to_string(),
    })?;
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_seconds))
        .build()?;

    match config.provider {
        HostedProvider::Openai => Ok(Box::new(OpenAiClient::new(
            http,
            api_key,
            config.model.as_deref(),
            config.base_url.as_deref(),
        ))),
        HostedProvider::Gemini => Ok(Box::new(GeminiClient::new(
            http,
            api_key,
            config.model.as_deref(),
            config.base_url.as_deref(),
        ))),
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: Option<ErrorBody>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default, rename = "type")]
    error_type: Option<String>,
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default)]
    status: Option<String>,
}

/// Maps a failed HTTP exchange to the error taxonomy, telling rate limits
/// apart from exhausted quota.
fn classify_error(status: u16, headers: &HeaderMap, body: &str) -> LlmError {
    let parsed = serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .and_then(|e| e.error);

    let message = parsed
        .as_ref()
        .and_then(|e| e.message.clone())
        .unwrap_or_else(|| body.trim().to_string());

    if status == 429 {
        let markers = parsed
            .as_ref()
            .map(|e| {
                let code = match &e.code {
                    Some(serde_json::Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                format!(
                    "{} {} {} {}",
                    e.error_type.as_deref().unwrap_or(""),
                    code,
                    e.status.as_deref().unwrap_or(""),
                    message
                )
                .to_lowercase()
            })
            .unwrap_or_default();

        if markers.contains("quota") {
            return LlmError::QuotaExhausted { message };
        }
        let retry_after = headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        return LlmError::RateLimited { retry_after };
    }

    LlmError::ApiResponse { status, message }
}

// --- OpenAI ---

#[derive(Debug)]
pub struct OpenAiClient {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(
        client: reqwest::Client,
        api_key: &str,
        model: Option<&str>,
        base_url: Option<&str>,
    ) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.unwrap_or(OPENAI_DEFAULT_MODEL).to_string(),
            base_url: base_url
                .unwrap_or(OPENAI_DEFAULT_URL)
                .trim_end_matches('/')
                .to_string(),
            client,
        }
    }

    pub fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Serialize)]
struct OpenAiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    id: Option<String>,
    model: Option<String>,
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessageResponse,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiMessageResponse {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    total_tokens: Option<u32>,
}

fn parse_openai(body: &str, rate_limit: RateLimitHeaders) -> Result<Completion, LlmError> {
    let result: OpenAiResponse = serde_json::from_str(body)
        .map_err(|e| LlmError::Parse(format!("{}. Body: {}", e, body)))?;

    let usage = result.usage;
    let diagnostics = ResponseDiagnostics {
        response_id: result.id,
        model: result.model,
        prompt_tokens: usage.as_ref().and_then(|u| u.prompt_tokens),
        completion_tokens: usage.as_ref().and_then(|u| u.completion_tokens),
        total_tokens: usage.as_ref().and_then(|u| u.total_tokens),
        rate_limit,
    };

    let choice = result
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::Parse("OpenAI response has no choices".to_string()))?;
    let finish_reason = choice.finish_reason;
    let text = choice.message.content.unwrap_or_default().trim().to_string();
    if text.is_empty() {
        return Err(LlmError::EmptyResponse {
            finish_reason: finish_reason.unwrap_or_else(|| "unknown".to_string()),
        });
    }

    Ok(Completion {
        text,
        finish_reason,
        diagnostics,
    })
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn provider(&self) -> &'static str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ChatRequest) -> Result<Completion, LlmError> {
        let body = OpenAiRequest {
            model: &self.model,
            messages: vec![
                OpenAiMessage {
                    role: "system",
                    content: &request.system,
                },
                OpenAiMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
        };

        let resp = self
            .client
            .post(self.chat_completions_url())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(classify_error(status.as_u16(), &headers, &text));
        }

        let completion = parse_openai(&text, RateLimitHeaders::from_headers(&headers))?;
        debug!("OpenAI diagnostics: {:?}", completion.diagnostics);
        Ok(completion)
    }
}

// --- Gemini ---

#[derive(Debug)]
pub struct GeminiClient {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl GeminiClient {
    pub fn new(
        client: reqwest::Client,
        api_key: &str,
        model: Option<&str>,
        base_url: Option<&str>,
    ) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.unwrap_or(GEMINI_DEFAULT_MODEL).to_string(),
            base_url: base_url
                .unwrap_or(GEMINI_DEFAULT_URL)
                .trim_end_matches('/')
                .to_string(),
            client,
        }
    }
}

#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    system_instruction: GeminiSystemInstruction,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    usage_metadata: Option<GeminiUsage>,
    model_version: Option<String>,
    response_id: Option<String>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContentResponse>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Deserialize)]
struct GeminiPartResponse {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    prompt_token_count: Option<u32>,
    candidates_token_count: Option<u32>,
    total_token_count: Option<u32>,
}

/// Closes a story cut off by the token limit: drop the dangling sentence when
/// the last period sits in the final 30%, else just add a period.
fn close_truncated(text: &str) -> String {
    let text = text.trim();
    if crate::utils::text::ends_with_terminal_punctuation(text) {
        return text.to_string();
    }
    match text.rfind('.') {
        Some(idx) if idx as f64 > text.len() as f64 * 0.7 => text[..=idx].to_string(),
        _ => format!("{}.", text),
    }
}

fn parse_gemini(body: &str) -> Result<Completion, LlmError> {
    let result: GeminiResponse = serde_json::from_str(body)
        .map_err(|e| LlmError::Parse(format!("{}. Body: {}", e, body)))?;

    let usage = result.usage_metadata;
    let diagnostics = ResponseDiagnostics {
        response_id: result.response_id,
        model: result.model_version,
        prompt_tokens: usage.as_ref().and_then(|u| u.prompt_token_count),
        completion_tokens: usage.as_ref().and_then(|u| u.candidates_token_count),
        total_tokens: usage.as_ref().and_then(|u| u.total_token_count),
        rate_limit: RateLimitHeaders::default(),
    };

    let candidate = result
        .candidates
        .and_then(|c| c.into_iter().next())
        .ok_or_else(|| LlmError::Parse("Gemini returned no candidates".to_string()))?;

    let finish_reason = candidate
        .finish_reason
        .unwrap_or_else(|| "UNKNOWN".to_string());
    let text = candidate
        .content
        .map(|c| {
            c.parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
        .trim()
        .to_string();

    if text.is_empty() {
        return Err(LlmError::EmptyResponse { finish_reason });
    }

    let text = match finish_reason.as_str() {
        "STOP" => text,
        "MAX_TOKENS" => {
            log::warn!("Gemini output truncated by the token limit, closing last sentence");
            close_truncated(&text)
        }
        other => {
            log::warn!("Gemini finish reason {}, using the text it produced", other);
            text
        }
    };

    Ok(Completion {
        text,
        finish_reason: Some(finish_reason),
        diagnostics,
    })
}

#[async_trait]
impl LlmClient for GeminiClient {
    fn provider(&self) -> &'static str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ChatRequest) -> Result<Completion, LlmError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);

        let body = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart {
                    text: request.user.clone(),
                }],
            }],
            system_instruction: GeminiSystemInstruction {
                parts: vec![GeminiPart {
                    text: request.system.clone(),
                }],
            },
            generation_config: GeminiGenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
                top_p: request.top_p,
                top_k: request.top_k,
            },
        };

        // Key travels in a header so it never shows up in error URLs.
        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(classify_error(status.as_u16(), &headers, &text));
        }

        let completion = parse_gemini(&text)?;
        debug!("Gemini diagnostics: {:?}", completion.diagnostics);
        Ok(completion)
    }
}
