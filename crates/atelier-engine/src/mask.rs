use std::io::Cursor;

use anyhow::{Context, Result};
use atelier_contracts::models::ModelCategory;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageFormat, Rgb, RgbImage};

const REGION_NAMES: [[&str; 3]; 3] = [
    ["top-left", "top-center", "top-right"],
    ["center-left", "center", "center-right"],
    ["bottom-left", "bottom-center", "bottom-right"],
];
const COVERAGE_THRESHOLD: f64 = 0.15;
const MASKED_LUMA: u8 = 128;
const FILL_COLOR: [u8; 3] = [128, 128, 128];

/// Decodes a base64 PNG mask, accepting a `data:` URL prefix.
pub fn decode_mask(mask_b64: &str) -> Result<GrayImage> {
    let payload = match mask_b64.split_once(',') {
        Some((_, data)) => data,
        None => mask_b64,
    };
    let raw = BASE64
        .decode(payload.trim().as_bytes())
        .context("mask base64 decode failed")?;
    let image = image::load_from_memory(&raw).context("mask is not a readable image")?;
    Ok(image.to_luma8())
}

/// Names the cells of a 3x3 grid where the mask covers more than 15%.
pub fn describe_mask_region(mask: &GrayImage) -> String {
    let (width, height) = mask.dimensions();
    let (cell_w, cell_h) = (width / 3, height / 3);
    let mut regions: Vec<&str> = Vec::new();

    for (row, names) in REGION_NAMES.iter().enumerate() {
        for (col, name) in names.iter().enumerate() {
            let x0 = col as u32 * cell_w;
            let y0 = row as u32 * cell_h;
            let x1 = (x0 + cell_w).min(width);
            let y1 = (y0 + cell_h).min(height);
            let total = u64::from(x1.saturating_sub(x0)) * u64::from(y1.saturating_sub(y0));
            if total == 0 {
                continue;
            }
            let mut covered = 0u64;
            for y in y0..y1 {
                for x in x0..x1 {
                    if mask.get_pixel(x, y)[0] > MASKED_LUMA {
                        covered += 1;
                    }
                }
            }
            if covered as f64 / total as f64 > COVERAGE_THRESHOLD {
                regions.push(*name);
            }
        }
    }

    match regions.len() {
        0 => "a small area".to_string(),
        n if n >= 7 => "most of the image".to_string(),
        1 => format!("the {} area", regions[0]),
        _ => format!("the {} areas", regions.join(", ")),
    }
}

pub fn build_mask_prompt(prompt: &str, region: &str, category: ModelCategory) -> String {
    let prompt = prompt.trim();
    if category.is_conversational() {
        format!(
            "Edit only {region} of the image. In that region: {prompt}. Keep all other areas exactly as they are. Do not modify anything outside the specified region."
        )
    } else {
        format!(
            "The marked/blank region in the image needs to be filled. Fill the blank area with: {prompt}. Seamlessly blend the filled content with the surrounding image. Do not modify any area that already has content."
        )
    }
}

/// Blends a neutral fill into `source` wherever the mask is white, so an
/// image-only model can see what to regenerate. Returns PNG bytes.
pub fn composite_mask(source: &[u8], mask: &GrayImage) -> Result<Vec<u8>> {
    let source = image::load_from_memory(source)
        .context("source image is not readable")?
        .to_rgb8();
    let (width, height) = source.dimensions();
    let mask = if mask.dimensions() == (width, height) {
        mask.clone()
    } else {
        image::imageops::resize(mask, width, height, FilterType::Lanczos3)
    };

    let mut out = RgbImage::new(width, height);
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let alpha = f32::from(mask.get_pixel(x, y)[0]) / 255.0;
        let base = source.get_pixel(x, y);
        let mut blended = [0u8; 3];
        for (channel, value) in blended.iter_mut().enumerate() {
            let mixed =
                f32::from(FILL_COLOR[channel]) * alpha + f32::from(base[channel]) * (1.0 - alpha);
            *value = mixed.round().clamp(0.0, 255.0) as u8;
        }
        *pixel = Rgb(blended);
    }

    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(out)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("failed to encode composited image")?;
    Ok(bytes)
}
