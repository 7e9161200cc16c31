use std::io::Cursor;

use async_trait::async_trait;
use atelier_contracts::errors::BackendError;
use atelier_contracts::models::ModelCategory;
use atelier_contracts::sessions::{Branch, TurnRole};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::token_usage::estimate_tokens;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceImage {
    pub image_id: String,
    pub data_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryMessage {
    pub role: TurnRole,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub request_id: String,
    pub model_id: String,
    pub category: ModelCategory,
    pub prompt: String,
    pub history: Vec<HistoryMessage>,
    pub aspect_ratio: Option<String>,
    pub resolution: Option<String>,
    /// Primary reference first, then any additional references.
    pub references: Vec<ReferenceImage>,
}

impl BackendRequest {
    pub fn reference_ids(&self) -> Vec<&str> {
        self.references
            .iter()
            .map(|reference| reference.image_id.as_str())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ImageResult {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub text_response: Option<String>,
    pub usage: Option<Value>,
}

#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn name(&self) -> &str;
    async fn generate(&self, request: &BackendRequest) -> Result<ImageResult, BackendError>;
}

/// Prior turns of a branch as chat messages; assistant turns contribute
/// their text (possibly empty) so role alternation is preserved.
pub fn build_history(branch: &Branch) -> Vec<HistoryMessage> {
    branch
        .turns
        .iter()
        .filter_map(|turn| match turn.role {
            TurnRole::User => turn
                .prompt
                .as_deref()
                .filter(|prompt| !prompt.is_empty())
                .map(|prompt| HistoryMessage {
                    role: TurnRole::User,
                    text: prompt.to_string(),
                }),
            TurnRole::Assistant => Some(HistoryMessage {
                role: TurnRole::Assistant,
                text: turn.text_response.clone().unwrap_or_default(),
            }),
        })
        .collect()
}

/// Offline backend: a solid PNG whose colour is a hash of the prompt.
#[derive(Debug, Clone)]
pub struct DryrunBackend {
    width: u32,
    height: u32,
}

impl Default for DryrunBackend {
    fn default() -> Self {
        Self::new(256, 256)
    }
}

impl DryrunBackend {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
        }
    }
}

#[async_trait]
impl ModelBackend for DryrunBackend {
    fn name(&self) -> &str {
        "dryrun"
    }

    async fn generate(&self, request: &BackendRequest) -> Result<ImageResult, BackendError> {
        let bytes = render_solid_png(self.width, self.height, &request.prompt, &request.model_id)
            .map_err(|err| BackendError::server(format!("dryrun render failed: {err}")))?;
        let text_response = request.category.is_conversational().then(|| {
            format!(
                "Dryrun render {} for: {}",
                short_id(&request.prompt, request.history.len() as u64),
                truncate_text(&request.prompt, 80)
            )
        });
        Ok(ImageResult {
            bytes,
            mime_type: "image/png".to_string(),
            text_response,
            usage: Some(json!({
                "prompt_tokens": estimate_tokens(&request.prompt),
                "completion_tokens": 0,
                "references": request.references.len(),
            })),
        })
    }
}

pub(crate) fn render_solid_png(
    width: u32,
    height: u32,
    prompt: &str,
    salt: &str,
) -> anyhow::Result<Vec<u8>> {
    let (r, g, b) = color_from_prompt(prompt, salt);
    let image = RgbImage::from_pixel(width, height, Rgb([r, g, b]));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image).write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}

fn color_from_prompt(prompt: &str, salt: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(salt.as_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn short_id(prompt: &str, idx: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(idx.to_be_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..4])
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
