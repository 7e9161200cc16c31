use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MODEL_ID: &str = "google/gemini-2.5-flash-image";

/// Conversational models keep multi-turn context; image-only models are single shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelCategory {
    Conversational,
    ImageOnly,
}

impl ModelCategory {
    pub fn is_conversational(self) -> bool {
        self == Self::Conversational
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Conversational => "conversational",
            Self::ImageOnly => "image_only",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub category: ModelCategory,
    pub modalities: Vec<String>,
    pub strengths: String,
    pub context_window: Option<u64>,
}

impl ModelSpec {
    pub fn supports(&self, modality: &str) -> bool {
        self.modalities.iter().any(|item| item == modality)
    }

    pub fn is_conversational(&self) -> bool {
        self.category.is_conversational()
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, id: &str) -> Option<&ModelSpec> {
        self.models.get(id)
    }

    /// Catalog order is the order models were registered.
    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn by_category(&self, category: ModelCategory) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.category == category)
            .cloned()
            .collect()
    }

    pub fn category_of(&self, id: &str) -> Option<ModelCategory> {
        self.get(id).map(|model| model.category)
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |id: &str,
                      name: &str,
                      provider: &str,
                      category: ModelCategory,
                      strengths: &str| {
        let (modalities, context_window): (&[&str], Option<u64>) = match category {
            ModelCategory::Conversational => (&["image", "text"], Some(128_000)),
            ModelCategory::ImageOnly => (&["image"], None),
        };
        map.insert(
            id.to_string(),
            ModelSpec {
                id: id.to_string(),
                name: name.to_string(),
                provider: provider.to_string(),
                category,
                modalities: modalities.iter().map(|item| (*item).to_string()).collect(),
                strengths: strengths.to_string(),
                context_window,
            },
        );
    };

    insert(
        DEFAULT_MODEL_ID,
        "Gemini 2.5 Flash",
        "Google",
        ModelCategory::Conversational,
        "Fast, cost-effective, multi-image blending, character consistency",
    );
    insert(
        "google/gemini-3-pro-image-preview",
        "Gemini 3 Pro",
        "Google",
        ModelCategory::Conversational,
        "Highest fidelity, identity preservation, text rendering, 4K output",
    );
    insert(
        "openai/gpt-5-image",
        "GPT-5 Image",
        "OpenAI",
        ModelCategory::Conversational,
        "Strong instruction following, text rendering, detailed editing",
    );
    insert(
        "black-forest-labs/flux.2-max",
        "Flux.2 Max",
        "Black Forest Labs",
        ModelCategory::ImageOnly,
        "Top-tier image quality, prompt understanding, editing consistency",
    );
    insert(
        "bytedance-seed/seedream-4.5",
        "Seedream 4.5",
        "ByteDance",
        ModelCategory::ImageOnly,
        "Subject detail preservation, portrait refinement, visual aesthetics",
    );

    map
}
