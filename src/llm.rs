use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::{DebugConfig, LlmConfig};
use crate::prompt::ReviewPrompt;

/// Structured failure from the provider exchange. `message` is always safe
/// to show in a PR comment; `code` carries the provider's machine-readable
/// error identifier when one was present in the response body.
#[derive(Debug, Clone)]
pub struct ModelError {
    pub message: String,
    pub code: Option<String>,
}

impl ModelError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} (code: {code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ModelError {}

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub temperature: f64,
    pub max_output_tokens: u32,
}

trait ModelClient {
    fn complete(&self, request: &ModelRequest) -> Result<String, ModelError>;
}

struct OpenAiApiClient {
    client: Client,
    base_url: String,
    api_key: String,
}

struct AnthropicApiClient {
    client: Client,
    base_url: String,
    api_key: String,
}

struct GeminiApiClient {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiChatCompletionsResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiAssistantMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiAssistantMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessagesResponse {
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiGenerateContentResponse {
    candidates: Option<Vec<GeminiCandidate>>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    parts: Option<Vec<GeminiPart>>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    text: Option<String>,
}

/// One synchronous request/response exchange with the configured provider.
/// No retries; the caller decides what a failure means.
pub fn request_review(
    config: &LlmConfig,
    debug: &DebugConfig,
    prompt: &ReviewPrompt,
) -> Result<String, ModelError> {
    let request = ModelRequest {
        model: config.model.clone(),
        system_prompt: prompt.system_prompt.clone(),
        user_prompt: prompt.user_prompt.clone(),
        temperature: config.temperature,
        max_output_tokens: config.max_output_tokens,
    };

    let outcome = dispatch(config, &request);
    if debug.log_raw_response {
        let _ = write_exchange_artifacts(debug, &request, &outcome);
    }

    outcome
}

fn dispatch(config: &LlmConfig, request: &ModelRequest) -> Result<String, ModelError> {
    match config.provider.as_str() {
        "openai-api" | "openai-compatible" => OpenAiApiClient::new(config)?.complete(request),
        "anthropic-api" => AnthropicApiClient::new(config)?.complete(request),
        "gemini-api" => GeminiApiClient::new(config)?.complete(request),
        other => Err(ModelError::new(format!(
            "unsupported llm.provider '{other}'; expected openai-api, anthropic-api, gemini-api, or openai-compatible"
        ))),
    }
}

/// Resolve the credential from the configured environment variable. Used as
/// a pre-flight check before any context is collected.
pub fn provider_api_key(config: &LlmConfig) -> anyhow::Result<String> {
    let key_env = config.api_key_env.as_str();
    let value = std::env::var(key_env)
        .with_context(|| format!("{key_env} is required for provider '{}'", config.provider))?;
    if value.trim().is_empty() {
        anyhow::bail!(
            "{key_env} is set but empty for provider '{}'",
            config.provider
        );
    }
    Ok(value)
}

fn provider_base_url(config: &LlmConfig) -> String {
    let configured = config.base_url.trim();
    if !configured.is_empty() {
        return configured.to_string();
    }

    match config.provider.as_str() {
        "anthropic-api" => "https://api.anthropic.com/v1".to_string(),
        "gemini-api" => "https://generativelanguage.googleapis.com/v1beta".to_string(),
        _ => "https://api.openai.com/v1".to_string(),
    }
}

fn is_loopback_base_url(base_url: &str) -> bool {
    base_url.contains("://127.0.0.1")
        || base_url.contains("://localhost")
        || base_url.contains("://[::1]")
}

fn http_client(timeout_secs: u64, base_url: &str) -> Result<Client, ModelError> {
    let mut builder = Client::builder().timeout(Duration::from_secs(timeout_secs.max(1)));
    if is_loopback_base_url(base_url) {
        builder = builder.no_proxy();
    }
    builder
        .build()
        .map_err(|err| ModelError::new(format!("failed to build provider HTTP client: {err}")))
}

fn client_parts(config: &LlmConfig) -> Result<(Client, String, String), ModelError> {
    let base_url = provider_base_url(config);
    let api_key = provider_api_key(config).map_err(|err| ModelError::new(format!("{err:#}")))?;
    let client = http_client(config.provider_timeout_secs, &base_url)?;
    Ok((client, base_url, api_key))
}

/// Pull the provider's error detail out of a non-2xx body. API error
/// payloads carry `{"error": {"message": ..., "code"/"type": ...}}`; when
/// the body is not that shape the truncated body itself is the message.
fn api_error_from_body(status: reqwest::StatusCode, body: &str) -> ModelError {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        let detail = value.get("error").unwrap_or(&value);
        let message = detail
            .get("message")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|m| !m.is_empty());
        let code = detail
            .get("code")
            .and_then(Value::as_str)
            .or_else(|| detail.get("type").and_then(Value::as_str))
            .map(str::to_string);

        if let Some(message) = message {
            return ModelError {
                message: format!("provider returned HTTP {status}: {message}"),
                code,
            };
        }
    }

    ModelError::new(format!(
        "provider returned HTTP {status}: {}",
        truncate_text(body, 300)
    ))
}

impl OpenAiApiClient {
    fn new(config: &LlmConfig) -> Result<Self, ModelError> {
        let (client, base_url, api_key) = client_parts(config)?;
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }
}

impl ModelClient for OpenAiApiClient {
    fn complete(&self, request: &ModelRequest) -> Result<String, ModelError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": request.model,
                "temperature": request.temperature,
                "max_tokens": request.max_output_tokens,
                "messages": [
                    {
                        "role": "system",
                        "content": request.system_prompt
                    },
                    {
                        "role": "user",
                        "content": request.user_prompt
                    }
                ]
            }))
            .send()
            .map_err(|err| {
                ModelError::new(format!("failed to call OpenAI-compatible API: {err}"))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(api_error_from_body(status, &body));
        }

        let parsed: OpenAiChatCompletionsResponse = response.json().map_err(|err| {
            ModelError::new(format!("failed to decode chat completions response: {err}"))
        })?;

        // Empty content is passed through; the normalizer's empty-response
        // fallback owns that case.
        Ok(parsed
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default())
    }
}

impl AnthropicApiClient {
    fn new(config: &LlmConfig) -> Result<Self, ModelError> {
        let (client, base_url, api_key) = client_parts(config)?;
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }
}

impl ModelClient for AnthropicApiClient {
    fn complete(&self, request: &ModelRequest) -> Result<String, ModelError> {
        let url = format!("{}/messages", self.base_url.trim_end_matches('/'));

        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.api_key)
                .map_err(|_| ModelError::new("invalid anthropic api key header"))?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));

        let response = self
            .client
            .post(&url)
            .headers(headers)
            .json(&json!({
                "model": request.model,
                "system": request.system_prompt,
                "temperature": request.temperature,
                "max_tokens": request.max_output_tokens,
                "messages": [
                    {"role": "user", "content": request.user_prompt}
                ]
            }))
            .send()
            .map_err(|err| {
                ModelError::new(format!("failed to call Anthropic Messages API: {err}"))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(api_error_from_body(status, &body));
        }

        let parsed: AnthropicMessagesResponse = response.json().map_err(|err| {
            ModelError::new(format!("failed to decode Anthropic messages response: {err}"))
        })?;

        let text = parsed
            .content
            .into_iter()
            .filter(|c| c.kind == "text")
            .filter_map(|c| c.text)
            .collect::<Vec<_>>()
            .join("\n");

        if text.trim().is_empty() {
            return Err(ModelError::new("Anthropic API returned no text content"));
        }

        Ok(text)
    }
}

impl GeminiApiClient {
    fn new(config: &LlmConfig) -> Result<Self, ModelError> {
        let (client, base_url, api_key) = client_parts(config)?;
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }
}

impl ModelClient for GeminiApiClient {
    fn complete(&self, request: &ModelRequest) -> Result<String, ModelError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url.trim_end_matches('/'),
            request.model,
            self.api_key
        );

        let response = self
            .client
            .post(&url)
            .json(&json!({
                "systemInstruction": {
                    "parts": [
                        {"text": request.system_prompt}
                    ]
                },
                "contents": [
                    {
                        "role": "user",
                        "parts": [{"text": request.user_prompt}]
                    }
                ],
                "generationConfig": {
                    "temperature": request.temperature,
                    "maxOutputTokens": request.max_output_tokens
                }
            }))
            .send()
            .map_err(|err| ModelError::new(format!("failed to call Gemini API: {err}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(api_error_from_body(status, &body));
        }

        let parsed: GeminiGenerateContentResponse = response
            .json()
            .map_err(|err| ModelError::new(format!("failed to decode Gemini response: {err}")))?;

        let text = parsed
            .candidates
            .unwrap_or_default()
            .into_iter()
            .flat_map(|candidate| {
                candidate
                    .content
                    .and_then(|content| content.parts)
                    .unwrap_or_default()
            })
            .filter_map(|part| part.text)
            .collect::<Vec<_>>()
            .join("\n");

        if text.trim().is_empty() {
            return Err(ModelError::new("Gemini API returned no text content"));
        }

        Ok(text)
    }
}

fn write_exchange_artifacts(
    debug: &DebugConfig,
    request: &ModelRequest,
    outcome: &Result<String, ModelError>,
) -> anyhow::Result<()> {
    let dir = PathBuf::from(&debug.artifact_dir);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create debug artifact dir {}", dir.display()))?;

    fs::write(
        dir.join("request.prompt.txt"),
        format!("{}\n\n{}", request.system_prompt, request.user_prompt),
    )?;
    match outcome {
        Ok(raw) => fs::write(dir.join("response.raw.txt"), raw)?,
        Err(error) => fs::write(dir.join("response.error.txt"), format!("{error}\n"))?,
    }

    Ok(())
}

pub fn truncate_text(value: &str, max_len: usize) -> String {
    if max_len == 0 {
        return String::new();
    }

    if value.chars().count() <= max_len {
        return value.to_string();
    }

    let mut out = value
        .chars()
        .take(max_len.saturating_sub(3))
        .collect::<String>();
    out.push_str("...");
    out
}
