use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use atelier_contracts::sessions::Session;
use tempfile::NamedTempFile;
use tracing::warn;

/// Persistence for whole session documents.
pub trait SessionStorage: Send + Sync {
    fn load(&self, session_id: &str) -> Result<Option<Session>>;
    fn save(&self, session: &Session) -> Result<()>;
    fn delete(&self, session_id: &str) -> Result<bool>;
    fn list(&self) -> Result<Vec<Session>>;
}

/// One pretty JSON document per session under
/// `<root>/projects/<project>/conversations/<session_id>.json`.
#[derive(Debug, Clone)]
pub struct JsonFileStorage {
    root: PathBuf,
}

impl JsonFileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn projects_dir(&self) -> PathBuf {
        self.root.join("projects")
    }

    fn conversations_dir(&self, project_id: &str) -> PathBuf {
        self.projects_dir().join(project_id).join("conversations")
    }

    fn conversation_dirs(&self) -> Result<Vec<PathBuf>> {
        let projects = self.projects_dir();
        if !projects.is_dir() {
            return Ok(Vec::new());
        }
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&projects)
            .with_context(|| format!("failed listing {}", projects.display()))?
        {
            let dir = entry?.path().join("conversations");
            if dir.is_dir() {
                dirs.push(dir);
            }
        }
        Ok(dirs)
    }

    fn find(&self, session_id: &str) -> Result<Option<PathBuf>> {
        if session_id.contains(['/', '\\']) || session_id.contains("..") {
            return Ok(None);
        }
        let file_name = format!("{session_id}.json");
        Ok(self
            .conversation_dirs()?
            .into_iter()
            .map(|dir| dir.join(&file_name))
            .find(|path| path.is_file()))
    }
}

impl SessionStorage for JsonFileStorage {
    fn load(&self, session_id: &str) -> Result<Option<Session>> {
        let Some(path) = self.find(session_id)? else {
            return Ok(None);
        };
        read_session(&path).map(Some)
    }

    fn save(&self, session: &Session) -> Result<()> {
        let path = self
            .conversations_dir(&session.project_id)
            .join(format!("{}.json", session.session_id));
        atomic_write_json(&path, session)
    }

    fn delete(&self, session_id: &str) -> Result<bool> {
        let Some(path) = self.find(session_id)? else {
            return Ok(false);
        };
        fs::remove_file(&path).with_context(|| format!("failed removing {}", path.display()))?;
        Ok(true)
    }

    fn list(&self) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        for dir in self.conversation_dirs()? {
            for entry in fs::read_dir(&dir).with_context(|| format!("failed listing {}", dir.display()))? {
                let path = entry?.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                    continue;
                }
                match read_session(&path) {
                    Ok(session) => sessions.push(session),
                    Err(err) => {
                        warn!(path = %path.display(), error = %format!("{err:#}"), "skipping unreadable session")
                    }
                }
            }
        }
        Ok(sessions)
    }
}

fn read_session(path: &Path) -> Result<Session> {
    let raw = fs::read_to_string(path).with_context(|| format!("failed reading {}", path.display()))?;
    let session: Session = serde_json::from_str(&raw)
        .with_context(|| format!("invalid session document {}", path.display()))?;
    session
        .validate()
        .with_context(|| format!("inconsistent session document {}", path.display()))?;
    Ok(session)
}

/// Temp file in the target directory, then rename over the destination.
fn atomic_write_json(path: &Path, session: &Session) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("failed creating {}", parent.display()))?;
    let mut tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("failed creating temp file in {}", parent.display()))?;
    serde_json::to_writer_pretty(&mut tmp, session)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("failed to persist {}", path.display()))?;
    Ok(())
}
