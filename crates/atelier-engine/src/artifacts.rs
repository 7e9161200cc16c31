use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::warn;
use uuid::Uuid;

const THUMBNAIL_EDGE: u32 = 256;
const KNOWN_EXTENSIONS: &[(&str, &str)] = &[
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("webp", "image/webp"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredImage {
    pub image_id: String,
    pub image_url: String,
    pub thumbnail_url: Option<String>,
    pub mime_type: String,
}

/// Where generated images and uploaded references live.
pub trait ImageStore: Send + Sync {
    fn save(&self, project_id: &str, bytes: &[u8], mime_type: &str) -> Result<StoredImage>;
    fn locate(&self, project_id: &str, image_id: &str) -> Result<Option<StoredImage>>;
    fn read(&self, project_id: &str, image_id: &str) -> Result<Option<Vec<u8>>>;

    fn data_url(&self, project_id: &str, image_id: &str) -> Result<Option<String>> {
        let Some(stored) = self.locate(project_id, image_id)? else {
            return Ok(None);
        };
        let Some(bytes) = self.read(project_id, image_id)? else {
            return Ok(None);
        };
        Ok(Some(format!(
            "data:{};base64,{}",
            stored.mime_type,
            BASE64.encode(bytes)
        )))
    }

    fn import_file(&self, project_id: &str, path: &Path) -> Result<StoredImage> {
        let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        self.save(project_id, &bytes, mime_for_path(path))
    }
}

/// `<root>/projects/<project>/images/<id>.<ext>` plus `thumbnails/<id>_thumb.png`.
#[derive(Debug, Clone)]
pub struct FsImageStore {
    root: PathBuf,
}

impl FsImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn images_dir(&self, project_id: &str) -> PathBuf {
        self.root.join("projects").join(project_id).join("images")
    }

    fn thumbnails_dir(&self, project_id: &str) -> PathBuf {
        self.images_dir(project_id).join("thumbnails")
    }

    fn find(&self, project_id: &str, image_id: &str) -> Option<(PathBuf, &'static str)> {
        if image_id.contains(['/', '\\']) || image_id.contains("..") {
            return None;
        }
        let dir = self.images_dir(project_id);
        KNOWN_EXTENSIONS.iter().find_map(|(ext, mime)| {
            let path = dir.join(format!("{image_id}.{ext}"));
            path.is_file().then_some((path, *mime))
        })
    }
}

impl ImageStore for FsImageStore {
    fn save(&self, project_id: &str, bytes: &[u8], mime_type: &str) -> Result<StoredImage> {
        let dir = self.images_dir(project_id);
        fs::create_dir_all(&dir).with_context(|| format!("failed creating {}", dir.display()))?;
        let image_id = Uuid::new_v4().simple().to_string();
        let ext = extension_for_mime(mime_type);
        let path = dir.join(format!("{image_id}.{ext}"));
        fs::write(&path, bytes).with_context(|| format!("failed writing {}", path.display()))?;

        let thumbnail_url = match write_thumbnail(&self.thumbnails_dir(project_id), &image_id, bytes) {
            Ok(thumb) => Some(thumb.display().to_string()),
            Err(err) => {
                warn!(image_id = %image_id, error = %format!("{err:#}"), "thumbnail skipped");
                None
            }
        };
        Ok(StoredImage {
            image_id,
            image_url: path.display().to_string(),
            thumbnail_url,
            mime_type: mime_for_extension(ext).to_string(),
        })
    }

    fn locate(&self, project_id: &str, image_id: &str) -> Result<Option<StoredImage>> {
        let Some((path, mime)) = self.find(project_id, image_id) else {
            return Ok(None);
        };
        let thumb = self
            .thumbnails_dir(project_id)
            .join(format!("{image_id}_thumb.png"));
        Ok(Some(StoredImage {
            image_id: image_id.to_string(),
            image_url: path.display().to_string(),
            thumbnail_url: thumb.is_file().then(|| thumb.display().to_string()),
            mime_type: mime.to_string(),
        }))
    }

    fn read(&self, project_id: &str, image_id: &str) -> Result<Option<Vec<u8>>> {
        let Some((path, _)) = self.find(project_id, image_id) else {
            return Ok(None);
        };
        let bytes = fs::read(&path).with_context(|| format!("failed reading {}", path.display()))?;
        Ok(Some(bytes))
    }
}

fn write_thumbnail(dir: &Path, image_id: &str, bytes: &[u8]) -> Result<PathBuf> {
    let decoded = image::load_from_memory(bytes).context("image bytes did not decode")?;
    fs::create_dir_all(dir).with_context(|| format!("failed creating {}", dir.display()))?;
    let path = dir.join(format!("{image_id}_thumb.png"));
    decoded
        .thumbnail(THUMBNAIL_EDGE, THUMBNAIL_EDGE)
        .save(&path)
        .with_context(|| format!("failed to save {}", path.display()))?;
    Ok(path)
}

fn extension_for_mime(mime_type: &str) -> &'static str {
    match mime_type.trim().to_ascii_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        _ => "png",
    }
}

fn mime_for_extension(ext: &str) -> &'static str {
    KNOWN_EXTENSIONS
        .iter()
        .find(|(known, _)| *known == ext)
        .map(|(_, mime)| *mime)
        .unwrap_or("image/png")
}

fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    mime_for_extension(&ext)
}
