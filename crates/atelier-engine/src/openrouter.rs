use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use atelier_contracts::errors::BackendError;
use atelier_contracts::models::ModelCategory;
use atelier_contracts::sessions::TurnRole;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::header::RETRY_AFTER;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::backend::{truncate_text, BackendRequest, ImageResult, ModelBackend};

pub const DEFAULT_API_BASE: &str = "https://openrouter.ai/api/v1";
const APP_REFERER: &str = "http://localhost";
const APP_TITLE: &str = "Atelier";

/// Chat-completions backend that asks image-capable models for an image.
pub struct OpenRouterBackend {
    api_base: String,
    api_key: String,
    http: reqwest::Client,
}

impl OpenRouterBackend {
    pub fn new(
        api_key: impl Into<String>,
        api_base: Option<&str>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build OpenRouter HTTP client")?;
        Ok(Self {
            api_base: api_base
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            api_key: api_key.into(),
            http,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }
}

#[async_trait]
impl ModelBackend for OpenRouterBackend {
    fn name(&self) -> &str {
        "openrouter"
    }

    async fn generate(&self, request: &BackendRequest) -> Result<ImageResult, BackendError> {
        if self.api_key.trim().is_empty() {
            return Err(BackendError::Auth {
                message: "No API key configured".to_string(),
            });
        }
        let payload = build_payload(request);
        let endpoint = self.endpoint();
        debug!(
            request_id = %request.request_id,
            model = %request.model_id,
            references = request.references.len(),
            history = request.history.len(),
            "posting chat completion"
        );

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .header("HTTP-Referer", APP_REFERER)
            .header("X-Title", APP_TITLE)
            .json(&payload)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status().as_u16();
        let retry_after_s = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());
        let body = response.text().await.map_err(classify_transport)?;

        if !(200..300).contains(&status) {
            return Err(classify_status(status, retry_after_s, &body));
        }
        let parsed: Value = serde_json::from_str(&body).map_err(|err| {
            BackendError::server(format!("OpenRouter returned invalid JSON payload: {err}"))
        })?;
        parse_completion(&parsed, request.category)
    }
}

pub(crate) fn build_payload(request: &BackendRequest) -> Value {
    let mut messages: Vec<Value> = request
        .history
        .iter()
        .map(|message| match message.role {
            TurnRole::User => json!({
                "role": "user",
                "content": [{"type": "text", "text": message.text}],
            }),
            TurnRole::Assistant => json!({
                "role": "assistant",
                "content": message.text,
            }),
        })
        .collect();

    let mut content = vec![json!({"type": "text", "text": request.prompt})];
    for reference in &request.references {
        content.push(json!({
            "type": "image_url",
            "image_url": {"url": reference.data_url},
        }));
    }
    messages.push(json!({"role": "user", "content": content}));

    let modalities = match request.category {
        ModelCategory::Conversational => json!(["image", "text"]),
        ModelCategory::ImageOnly => json!(["image"]),
    };
    let mut payload = Map::new();
    payload.insert("model".to_string(), json!(request.model_id));
    payload.insert("modalities".to_string(), modalities);
    payload.insert("messages".to_string(), Value::Array(messages));

    let mut image_config = Map::new();
    if let Some(ratio) = request.aspect_ratio.as_deref().filter(|v| !v.is_empty()) {
        image_config.insert("aspect_ratio".to_string(), json!(ratio));
    }
    if let Some(size) = request.resolution.as_deref().filter(|v| !v.is_empty()) {
        image_config.insert("image_size".to_string(), json!(size));
    }
    if !image_config.is_empty() {
        payload.insert("image_config".to_string(), Value::Object(image_config));
    }
    Value::Object(payload)
}

pub(crate) fn classify_status(status: u16, retry_after_s: Option<u64>, body: &str) -> BackendError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|parsed| {
            parsed
                .get("error")
                .and_then(|error| error.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| truncate_text(body.trim(), 200));

    match status {
        401 => BackendError::Auth {
            message: "Invalid API key.".to_string(),
        },
        402 => BackendError::Credits {
            message: "Insufficient credits on the OpenRouter account.".to_string(),
        },
        429 => BackendError::RateLimited {
            message: "Rate limited. Please wait and try again.".to_string(),
            retry_after_s,
        },
        400 => {
            let lower = message.to_ascii_lowercase();
            if ["safety", "content", "policy"]
                .iter()
                .any(|needle| lower.contains(needle))
            {
                BackendError::ContentPolicy {
                    message: "The prompt was flagged by the model's content policy.".to_string(),
                }
            } else {
                BackendError::ServerError {
                    message: format!("Bad request: {message}"),
                    status: Some(status),
                }
            }
        }
        413 => BackendError::ServerError {
            message: "Request too large. Try a shorter prompt or smaller image.".to_string(),
            status: Some(status),
        },
        502 | 503 => BackendError::Unavailable {
            message: format!("Server error ({status}). The model may be temporarily unavailable."),
        },
        _ => BackendError::ServerError {
            message: format!("Unexpected error ({status}): {message}"),
            status: Some(status),
        },
    }
}

fn classify_transport(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        return BackendError::Timeout {
            message: format!("request timed out: {err}"),
        };
    }
    if err.is_connect() {
        return BackendError::Network {
            message: format!("unable to connect to OpenRouter: {err}"),
        };
    }
    BackendError::server(format!("OpenRouter request failed: {err}"))
}

pub(crate) fn parse_completion(
    payload: &Value,
    category: ModelCategory,
) -> Result<ImageResult, BackendError> {
    let message = payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .ok_or_else(|| BackendError::server("No choices in response"))?;

    let from_images = message
        .get("images")
        .and_then(Value::as_array)
        .and_then(|images| images.first())
        .and_then(|image| image.get("image_url"))
        .and_then(|url| url.get("url"))
        .and_then(Value::as_str);
    let from_content = || {
        message
            .get("content")
            .and_then(Value::as_array)
            .and_then(|parts| {
                parts.iter().find_map(|part| {
                    (part.get("type").and_then(Value::as_str) == Some("image_url"))
                        .then(|| part.get("image_url").and_then(|u| u.get("url")))
                        .flatten()
                        .and_then(Value::as_str)
                        .filter(|url| url.starts_with("data:image/"))
                })
            })
    };
    let url = from_images
        .or_else(from_content)
        .ok_or_else(|| BackendError::server("No image returned by model"))?;
    let (mime_type, bytes) = decode_data_url(url)?;

    let text_response = if category.is_conversational() {
        match message.get("content") {
            Some(Value::String(text)) => Some(text.trim().to_string()),
            Some(Value::Array(parts)) => Some(
                parts
                    .iter()
                    .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|part| part.get("text").and_then(Value::as_str))
                    .filter(|text| !text.is_empty())
                    .collect::<Vec<&str>>()
                    .join(" ")
                    .trim()
                    .to_string(),
            ),
            _ => None,
        }
        .filter(|text| !text.is_empty())
    } else {
        None
    };

    Ok(ImageResult {
        bytes,
        mime_type,
        text_response,
        usage: payload.get("usage").filter(|usage| !usage.is_null()).cloned(),
    })
}

fn decode_data_url(url: &str) -> Result<(String, Vec<u8>), BackendError> {
    let invalid = || BackendError::server("Invalid image data in response");
    let rest = url.strip_prefix("data:").ok_or_else(invalid)?;
    let (header, data) = rest.split_once(',').ok_or_else(invalid)?;
    if !header.starts_with("image/") {
        return Err(invalid());
    }
    let mime_type = header.split(';').next().unwrap_or("image/png").to_string();
    let bytes = BASE64
        .decode(data.trim().as_bytes())
        .map_err(|err| BackendError::server(format!("image base64 decode failed: {err}")))?;
    Ok((mime_type, bytes))
}
