use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::{BackendError, EngineError, EngineResult};

/// Product ceiling for variations in one batch, also the in-flight call cap.
pub const MAX_VARIATIONS: usize = 4;
pub const MIN_COMPOSE_SOURCES: usize = 2;
pub const MAX_COMPOSE_SOURCES: usize = 5;

pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default)]
    pub aspect_ratio: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub style_preset: Option<String>,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    /// 0 follows the prompt freely, 100 stays as close to the references as possible.
    #[serde(default)]
    pub image_weight: Option<u8>,
    /// Caller-uploaded primary reference.
    #[serde(default)]
    pub reference_image_id: Option<String>,
    #[serde(default)]
    pub style_reference_id: Option<String>,
    #[serde(default)]
    pub character_reference_ids: Vec<String>,
}

impl GenerationParams {
    pub fn has_references(&self) -> bool {
        self.reference_image_id.is_some()
            || self.style_reference_id.is_some()
            || !self.character_reference_ids.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub request_id: String,
    pub prompt: String,
    pub model_id: String,
    /// Explicit per-variation models, honoured only for multi-model batches.
    #[serde(default)]
    pub model_ids: Vec<String>,
    #[serde(default = "default_variations")]
    pub variations: usize,
    #[serde(default)]
    pub multi_model: bool,
    #[serde(default)]
    pub params: GenerationParams,
    #[serde(default)]
    pub batch_id: Option<String>,
}

fn default_variations() -> usize {
    1
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            request_id: new_request_id(),
            prompt: prompt.into(),
            model_id: model_id.into(),
            model_ids: Vec::new(),
            variations: 1,
            multi_model: false,
            params: GenerationParams::default(),
            batch_id: None,
        }
    }

    pub fn with_variations(mut self, variations: usize) -> Self {
        self.variations = variations;
        self
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.prompt.trim().is_empty() {
            return Err(EngineError::InvalidRequest("prompt is empty".to_string()));
        }
        if self.variations == 0 || self.variations > MAX_VARIATIONS {
            return Err(EngineError::InvalidRequest(format!(
                "variations must be between 1 and {MAX_VARIATIONS}, got {}",
                self.variations
            )));
        }
        if let Some(weight) = self.params.image_weight {
            if weight > 100 {
                return Err(EngineError::InvalidRequest(format!(
                    "image weight must be between 0 and 100, got {weight}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub request_id: String,
    pub variation_index: usize,
    pub model_id: String,
    pub prompt: String,
    pub image_id: String,
    pub image_url: Option<String>,
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub text_response: Option<String>,
    #[serde(default)]
    pub usage: Option<Value>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VariationOutcome {
    Completed { result: GenerationResult },
    Failed { error: BackendError },
}

impl VariationOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariationReport {
    pub index: usize,
    pub model_id: String,
    pub outcome: VariationOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: String,
    pub request_id: String,
    pub total_requested: usize,
    pub total_completed: usize,
    /// Ordered by variation index regardless of completion order.
    pub variations: Vec<VariationReport>,
    pub cancelled: bool,
}

impl BatchResult {
    pub fn successes(&self) -> impl Iterator<Item = &GenerationResult> {
        self.variations.iter().filter_map(|report| match &report.outcome {
            VariationOutcome::Completed { result } => Some(result),
            VariationOutcome::Failed { .. } => None,
        })
    }

    pub fn failures(&self) -> impl Iterator<Item = (usize, &BackendError)> {
        self.variations.iter().filter_map(|report| match &report.outcome {
            VariationOutcome::Failed { error } => Some((report.index, error)),
            VariationOutcome::Completed { .. } => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub estimated_tokens: u64,
    pub context_limit: u64,
    pub usage_ratio: f64,
    pub near_limit: bool,
}

/// One conversational edit against a session's active branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRequest {
    pub request_id: String,
    pub session_id: String,
    pub prompt: String,
    /// Switches the session to this model from this turn on.
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub params: GenerationParams,
}

impl TurnRequest {
    pub fn new(session_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            request_id: new_request_id(),
            session_id: session_id.into(),
            prompt: prompt.into(),
            model_id: None,
            params: GenerationParams::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskEditRequest {
    pub request_id: String,
    /// When set, the edit is committed to this session's active branch.
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
    pub image_id: String,
    /// Base64 PNG, optionally wrapped in a `data:` URL. White marks the region.
    pub mask_b64: String,
    pub prompt: String,
    #[serde(default)]
    pub region_description: Option<String>,
    #[serde(default)]
    pub params: GenerationParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposeSource {
    pub image_id: String,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposeRequest {
    pub request_id: String,
    pub prompt: String,
    pub model_id: String,
    pub sources: Vec<ComposeSource>,
    #[serde(default)]
    pub params: GenerationParams,
}

impl ComposeRequest {
    pub fn validate(&self) -> EngineResult<()> {
        let count = self.sources.len();
        if !(MIN_COMPOSE_SOURCES..=MAX_COMPOSE_SOURCES).contains(&count) {
            return Err(EngineError::InvalidRequest(format!(
                "compose needs {MIN_COMPOSE_SOURCES} to {MAX_COMPOSE_SOURCES} source images, got {count}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;

    fn completed(index: usize) -> VariationReport {
        VariationReport {
            index,
            model_id: "m".to_string(),
            outcome: VariationOutcome::Completed {
                result: GenerationResult {
                    request_id: format!("r-{index}"),
                    variation_index: index,
                    model_id: "m".to_string(),
                    prompt: "p".to_string(),
                    image_id: format!("img-{index}"),
                    image_url: None,
                    thumbnail_url: None,
                    text_response: None,
                    usage: None,
                    attempts: 1,
                    created_at: Utc::now(),
                },
            },
        }
    }

    #[test]
    fn request_validation_bounds_variations() {
        let base = GenerationRequest::new("a castle", "m");
        assert!(base.validate().is_ok());
        assert!(base.clone().with_variations(4).validate().is_ok());
        assert!(base.clone().with_variations(0).validate().is_err());
        assert!(base.clone().with_variations(5).validate().is_err());

        let blank = GenerationRequest::new("   ", "m");
        assert!(matches!(
            blank.validate(),
            Err(EngineError::InvalidRequest(_))
        ));
    }

    #[test]
    fn request_defaults_fill_missing_fields() -> anyhow::Result<()> {
        let parsed: GenerationRequest = serde_json::from_value(json!({
            "request_id": "r1",
            "prompt": "a fox",
            "model_id": "m"
        }))?;
        assert_eq!(parsed.variations, 1);
        assert!(!parsed.multi_model);
        assert!(parsed.model_ids.is_empty());
        assert_eq!(parsed.params, GenerationParams::default());
        Ok(())
    }

    #[test]
    fn batch_result_splits_successes_and_failures() -> anyhow::Result<()> {
        let batch = BatchResult {
            batch_id: "b".to_string(),
            request_id: "r".to_string(),
            total_requested: 3,
            total_completed: 2,
            variations: vec![
                completed(0),
                VariationReport {
                    index: 1,
                    model_id: "m".to_string(),
                    outcome: VariationOutcome::Failed {
                        error: BackendError::ContentPolicy {
                            message: "flagged".to_string(),
                        },
                    },
                },
                completed(2),
            ],
            cancelled: false,
        };
        assert_eq!(batch.successes().count(), 2);
        let failures: Vec<usize> = batch.failures().map(|(index, _)| index).collect();
        assert_eq!(failures, vec![1]);

        let value = serde_json::to_value(&batch)?;
        assert_eq!(value["variations"][1]["outcome"]["status"], json!("failed"));
        assert_eq!(
            value["variations"][1]["outcome"]["error"]["error_type"],
            json!("content_policy")
        );
        Ok(())
    }

    #[test]
    fn compose_requires_two_to_five_sources() {
        let source = |id: &str| ComposeSource {
            image_id: id.to_string(),
            label: None,
        };
        let mut request = ComposeRequest {
            request_id: new_request_id(),
            prompt: "merge".to_string(),
            model_id: "m".to_string(),
            sources: vec![source("a")],
            params: GenerationParams::default(),
        };
        assert!(request.validate().is_err());
        request.sources.push(source("b"));
        assert!(request.validate().is_ok());
        request.sources.extend(["c", "d", "e", "f"].map(source));
        assert!(request.validate().is_err());
    }
}
