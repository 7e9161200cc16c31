use atelier_contracts::generation::GenerationParams;
use atelier_contracts::models::ModelCategory;

pub const STYLE_PRESETS: &[(&str, &str)] = &[
    ("none", ""),
    (
        "photorealistic",
        "Photorealistic, shot on a professional DSLR camera, natural lighting, sharp focus, high detail",
    ),
    (
        "cinematic",
        "Cinematic still, dramatic lighting, shallow depth of field, film grain, anamorphic lens",
    ),
    ("anime", "Anime style, cel-shaded, vibrant colors, clean linework"),
    (
        "watercolor",
        "Watercolor painting, soft edges, visible brush strokes, pigment bleeding",
    ),
    (
        "oil_painting",
        "Oil painting, textured canvas, visible impasto brushwork, rich color depth",
    ),
    (
        "line_art",
        "Clean line art, black ink on white paper, precise linework, no shading",
    ),
    (
        "flat_illustration",
        "Flat vector illustration, bold colors, clean shapes, minimal shading",
    ),
    (
        "isometric",
        "Isometric 3D illustration, clean geometry, consistent lighting, technical precision",
    ),
    (
        "pixel_art",
        "Pixel art, retro gaming aesthetic, limited color palette, crisp pixels",
    ),
    (
        "3d_render",
        "3D render, physically-based rendering, studio lighting, smooth surfaces",
    ),
    (
        "product_photography",
        "Professional product photography, white background, studio lighting, commercial quality",
    ),
];

const CHARACTER_REFERENCE_INSTRUCTION: &str = "Use the provided reference image(s) to maintain consistent appearance for the subject. Preserve facial features, body proportions, clothing details, and distinguishing characteristics";
const STYLE_REFERENCE_INSTRUCTION: &str = "Adopt the visual style, color palette, lighting, and artistic technique of the provided style reference image. Do not replicate the subject matter of the reference";

pub fn style_suffix(preset: &str) -> Option<&'static str> {
    let key = preset.trim().to_ascii_lowercase();
    STYLE_PRESETS
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, suffix)| *suffix)
        .filter(|suffix| !suffix.is_empty())
}

pub fn is_known_style(preset: &str) -> bool {
    let key = preset.trim().to_ascii_lowercase();
    STYLE_PRESETS.iter().any(|(name, _)| *name == key)
}

/// Maps the 0-100 reference weight onto prompt framing.
pub fn image_weight_instruction(weight: u8, category: ModelCategory) -> &'static str {
    let conversational = category.is_conversational();
    match weight {
        0..=25 if conversational => "Use the reference image only as loose inspiration. Focus primarily on the text prompt. The reference is a general mood guide, not a strict template.",
        0..=25 => "Loosely reference the provided image. Prioritize the text prompt over visual similarity to the reference.",
        26..=40 if conversational => "Take moderate inspiration from the reference image while following the text prompt closely. Borrow general composition and color mood from the reference.",
        26..=40 => "Moderately reference the provided image. Follow the text prompt but incorporate the reference's general composition.",
        41..=60 if conversational => "Balance the reference image and the text prompt equally. Maintain the reference's overall composition and style while incorporating the prompted changes.",
        41..=60 => "Balance the reference image and text prompt. Maintain similar composition and visual elements from the reference.",
        61..=75 if conversational => "Closely follow the reference image. Make only the changes described in the text prompt. Preserve most visual elements, colors, and composition from the reference.",
        61..=75 => "Closely follow the reference image. Preserve most visual elements and composition. Apply only the changes described in the prompt.",
        _ if conversational => "Reproduce the reference image as closely as possible, applying only minimal changes as described in the text prompt. Preserve details, colors, lighting, composition, and style from the reference.",
        _ => "Reproduce the reference image as closely as possible with only the prompted modifications. Maintain all visual details from the reference.",
    }
}

/// Final prompt: character and style reference framing, the user's words
/// untouched, preset suffix, exclusions, then the weight directive.
pub fn build_prompt(
    user_prompt: &str,
    params: &GenerationParams,
    category: ModelCategory,
    has_references: bool,
) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !params.character_reference_ids.is_empty() {
        parts.push(CHARACTER_REFERENCE_INSTRUCTION.to_string());
    }
    if params.style_reference_id.is_some() {
        parts.push(STYLE_REFERENCE_INSTRUCTION.to_string());
    }
    parts.push(user_prompt.trim().to_string());

    if let Some(suffix) = params.style_preset.as_deref().and_then(style_suffix) {
        parts.push(suffix.to_string());
    }

    if let Some(negative) = params
        .negative_prompt
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        parts.push(if category.is_conversational() {
            format!("Do NOT include the following in the generated image: {negative}")
        } else {
            format!("Avoid: {negative}")
        });
    }

    if let Some(weight) = params.image_weight {
        if has_references || params.has_references() {
            parts.push(image_weight_instruction(weight, category).to_string());
        }
    }

    parts.join(". ")
}

pub fn compose_prompt(
    labels: &[String],
    user_prompt: &str,
    image_weight: Option<u8>,
    category: ModelCategory,
) -> String {
    let mut instruction = "Compose the provided images into a single cohesive image.".to_string();
    let labelled: Vec<String> = labels
        .iter()
        .map(|label| label.trim())
        .filter(|label| !label.is_empty())
        .map(|label| format!("Image labeled '{label}'"))
        .collect();
    if !labelled.is_empty() {
        instruction.push_str(&format!(" Source images: {}.", labelled.join(", ")));
    }
    let mut prompt = format!("{instruction} {}", user_prompt.trim());
    if let Some(weight) = image_weight {
        prompt.push_str(". ");
        prompt.push_str(image_weight_instruction(weight, category));
    }
    prompt
}
