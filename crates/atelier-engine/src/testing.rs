use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use atelier_contracts::errors::BackendError;
use atelier_contracts::sessions::Session;
use serde_json::json;

use crate::backend::{render_solid_png, BackendRequest, ImageResult, ModelBackend};
use crate::storage::SessionStorage;

#[derive(Debug, Default)]
pub(crate) struct MemoryStorage {
    sessions: Mutex<HashMap<String, Session>>,
    failing: AtomicBool,
}

impl MemoryStorage {
    pub(crate) fn fail_saves(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl SessionStorage for MemoryStorage {
    fn load(&self, session_id: &str) -> anyhow::Result<Option<Session>> {
        let sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        Ok(sessions.get(session_id).cloned())
    }

    fn save(&self, session: &Session) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("disk full");
        }
        let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        sessions.insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    fn delete(&self, session_id: &str) -> anyhow::Result<bool> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        Ok(sessions.remove(session_id).is_some())
    }

    fn list(&self) -> anyhow::Result<Vec<Session>> {
        let sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        Ok(sessions.values().cloned().collect())
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Step {
    Ok { delay: Duration },
    Err(BackendError),
    Hang,
}

impl Step {
    pub(crate) fn ok() -> Self {
        Self::Ok {
            delay: Duration::ZERO,
        }
    }

    pub(crate) fn after(delay_ms: u64) -> Self {
        Self::Ok {
            delay: Duration::from_millis(delay_ms),
        }
    }
}

/// Backend whose answers are scripted per request id; unscripted calls succeed.
#[derive(Debug, Default)]
pub(crate) struct ScriptedBackend {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<BackendRequest>>,
}

impl ScriptedBackend {
    pub(crate) fn script(&self, request_id: &str, steps: Vec<Step>) {
        let mut scripts = self.scripts.lock().unwrap_or_else(|p| p.into_inner());
        scripts.insert(request_id.to_string(), steps.into());
    }

    pub(crate) fn calls(&self) -> Vec<BackendRequest> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub(crate) fn calls_for(&self, request_id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.request_id == request_id)
            .count()
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &BackendRequest) -> Result<ImageResult, BackendError> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(request.clone());
        let step = self
            .scripts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get_mut(&request.request_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(Step::ok);

        match step {
            Step::Ok { delay } => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let bytes = render_solid_png(4, 4, &request.prompt, &request.model_id)
                    .map_err(|err| BackendError::server(err.to_string()))?;
                Ok(ImageResult {
                    bytes,
                    mime_type: "image/png".to_string(),
                    text_response: request
                        .category
                        .is_conversational()
                        .then(|| format!("reply to {}", request.prompt)),
                    usage: Some(json!({"request_id": request.request_id})),
                })
            }
            Step::Err(err) => Err(err),
            Step::Hang => std::future::pending().await,
        }
    }
}
