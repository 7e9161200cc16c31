use super::registry::{ModelRegistry, ModelSpec, DEFAULT_MODEL_ID};
use crate::errors::{EngineError, EngineResult};

const FLAGSHIP_MODEL_ID: &str = "google/gemini-3-pro-image-preview";

/// Preferred substitutes, best first, for a model that is unavailable.
const FALLBACKS: &[(&str, &[&str])] = &[
    (
        "google/gemini-3-pro-image-preview",
        &["google/gemini-2.5-flash-image", "openai/gpt-5-image"],
    ),
    ("openai/gpt-5-image", &["google/gemini-3-pro-image-preview"]),
    (
        "google/gemini-2.5-flash-image",
        &["google/gemini-3-pro-image-preview", "openai/gpt-5-image"],
    ),
    ("black-forest-labs/flux.2-max", &["bytedance-seed/seedream-4.5"]),
    ("bytedance-seed/seedream-4.5", &["black-forest-labs/flux.2-max"]),
];

/// A model picked on the caller's behalf, with the reason shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    /// The model the caller asked for, when this selection replaces it.
    pub requested: Option<String>,
    pub reason: String,
}

/// What the next generation needs; drives [`ModelSelector::recommend`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecommendationContext {
    pub text_in_image: bool,
    pub style_preset: Option<String>,
    pub resolution: Option<String>,
    pub character_references: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: ModelRegistry) -> Self {
        Self { registry }
    }

    /// First matching rule wins: text in image, product photography, 4K
    /// output, character references; otherwise the default model.
    pub fn recommend(&self, context: &RecommendationContext) -> EngineResult<ModelSelection> {
        let flagship_reason = if context.text_in_image {
            Some("Best text rendering for text inside images")
        } else if context.style_preset.as_deref() == Some("product_photography") {
            Some("Highest fidelity for product photography with fine-grained control")
        } else if context
            .resolution
            .as_deref()
            .is_some_and(|resolution| resolution.eq_ignore_ascii_case("4k"))
        {
            Some("Confirmed 4K output support")
        } else if context.character_references {
            Some("Best identity preservation, up to 5 subjects")
        } else {
            None
        };

        if let Some(reason) = flagship_reason {
            if let Some(model) = self.registry.get(FLAGSHIP_MODEL_ID) {
                return Ok(ModelSelection {
                    model: model.clone(),
                    requested: None,
                    reason: reason.to_string(),
                });
            }
        }
        let model = self
            .registry
            .get(DEFAULT_MODEL_ID)
            .or_else(|| self.registry.list().next())
            .ok_or_else(|| EngineError::not_found("any model in the catalog"))?;
        Ok(ModelSelection {
            model: model.clone(),
            requested: None,
            reason: "Best cost-to-quality ratio, fast and inexpensive".to_string(),
        })
    }

    /// Substitute for `unavailable_id`, if the catalog has one.
    pub fn fallback_for(&self, unavailable_id: &str) -> Option<ModelSelection> {
        let unavailable = self.registry.get(unavailable_id)?;
        let (_, candidates) = FALLBACKS.iter().find(|(id, _)| *id == unavailable_id)?;
        let model = candidates.iter().find_map(|id| self.registry.get(id))?;
        Some(ModelSelection {
            model: model.clone(),
            requested: Some(unavailable_id.to_string()),
            reason: format!(
                "{} is temporarily unavailable. {} offers similar capabilities.",
                unavailable.name, model.name
            ),
        })
    }

    /// Strict lookup used by the engine.
    pub fn require(&self, model_id: &str) -> EngineResult<&ModelSpec> {
        self.registry
            .get(model_id)
            .ok_or_else(|| EngineError::not_found(format!("model {model_id}")))
    }

    /// Model id for each variation slot of a batch.
    ///
    /// - single model: `selected` repeated
    /// - multi model with an explicit list matching `variations`: that list
    /// - otherwise `selected` first, then the rest of the catalog in order,
    ///   cycled and truncated to `variations`
    pub fn resolve_batch_models(
        &self,
        selected: &str,
        explicit: &[String],
        variations: usize,
        multi_model: bool,
    ) -> EngineResult<Vec<String>> {
        self.require(selected)?;
        if !multi_model {
            return Ok(vec![selected.to_string(); variations]);
        }
        if !explicit.is_empty() && explicit.len() == variations {
            for model_id in explicit {
                self.require(model_id)?;
            }
            return Ok(explicit.to_vec());
        }

        let mut pool = vec![selected.to_string()];
        pool.extend(
            self.registry
                .list()
                .filter(|model| model.id != selected)
                .map(|model| model.id.clone()),
        );
        Ok(pool.into_iter().cycle().take(variations).collect())
    }
}
