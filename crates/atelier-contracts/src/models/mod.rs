mod registry;
mod selectors;

pub use registry::{ModelCategory, ModelRegistry, ModelSpec, DEFAULT_MODEL_ID};
pub use selectors::{ModelSelection, ModelSelector, RecommendationContext};
